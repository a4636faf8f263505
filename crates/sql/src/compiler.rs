//! Execution of temporal DDL plans.
//!
//! The compiler turns each relational DDL operation into its coordinated
//! plan (see [`crate::ddl`]) and runs the plan inside a single
//! transaction, so partial failure leaves no half-built temporal schema.
//! Operations against tables the cache does not know as temporal
//! delegate to the plain `public`-schema implementation.
//!
//! Each operation checks its own connection out of the pool and builds a
//! fresh [`SchemaRouter`] for it, so search_path state is per-connection
//! and concurrent operations never observe each other's path changes.

use std::time::Instant;

use sqlx::{PgConnection, PgPool};
use tracing::debug;

use chronopg_core::types::{ColumnDefinition, ColumnSpec, IndexDefinition, IndexSpec, TableSpec};
use chronopg_core::{TemporalError, TemporalResult};

use crate::cache::TemporalCache;
use crate::ddl;
use crate::observe;
use crate::router::{Nesting, SchemaRouter};
use crate::{HISTORY_SCHEMA, PUBLIC_SCHEMA, TEMPORAL_SCHEMA};

const COLUMNS_SQL: &str = "SELECT column_name, data_type, is_nullable, column_default \
     FROM information_schema.columns \
    WHERE table_schema = current_schema() AND table_name = $1 \
    ORDER BY ordinal_position";

const PRIMARY_KEY_SQL: &str = "SELECT a.attname \
     FROM pg_index i \
     JOIN pg_class c ON c.oid = i.indrelid \
     JOIN pg_namespace n ON n.oid = c.relnamespace \
     JOIN pg_attribute a ON a.attrelid = c.oid AND a.attnum = ANY(i.indkey) \
    WHERE i.indisprimary AND n.nspname = current_schema() AND c.relname = $1";

const INDEXES_SQL: &str = "SELECT indexname, indexdef \
     FROM pg_indexes \
    WHERE schemaname = current_schema() AND tablename = $1 \
    ORDER BY indexname";

/// Compiles and executes temporal DDL against one engine.
#[derive(Debug)]
pub struct SchemaCompiler {
    pool: PgPool,
    cache: TemporalCache,
}

impl SchemaCompiler {
    /// A compiler over the given pool and cache handle.
    pub fn new(pool: PgPool, cache: TemporalCache) -> Self {
        Self { pool, cache }
    }

    /// Create a table. With `temporal`, the full coordinated plan runs:
    /// current table, inherited history table, indexes, view, and the
    /// three INSTEAD rules. A temporal table without a primary key fails
    /// before any DDL executes.
    pub async fn create_table(&self, spec: &TableSpec, temporal: bool) -> TemporalResult<()> {
        let started = Instant::now();

        if !temporal {
            sqlx::query(&ddl::create_plain_table(spec))
                .execute(&self.pool)
                .await?;
            observe::record_ddl("create_table", &spec.name, started.elapsed());
            return Ok(());
        }

        let pk = spec
            .primary_key
            .as_deref()
            .ok_or_else(|| TemporalError::PrimaryKeyRequired(spec.name.clone()))?;

        debug!(table = %spec.name, "creating temporal table");
        let mut tx = self.pool.begin().await?;
        for statement in ddl::create_table_plan(spec, pk) {
            sqlx::query(&statement).execute(&mut *tx).await?;
        }
        tx.commit().await?;

        self.cache.insert(&spec.name);
        observe::record_ddl("create_table", &spec.name, started.elapsed());
        Ok(())
    }

    /// Rename a table, its primary-key sequences and its view.
    pub async fn rename_table(&self, old: &str, new: &str) -> TemporalResult<()> {
        let started = Instant::now();
        let mut tx = self.pool.begin().await?;

        if !self.cache.is_temporal_on(&mut *tx, old).await? {
            sqlx::query(&ddl::rename_plain_table(old, new))
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            observe::record_ddl("rename_table", new, started.elapsed());
            return Ok(());
        }

        let router = SchemaRouter::new();
        let (pk, _) = self.current_layout(&router, &mut *tx, old).await?;
        for statement in ddl::rename_table_plan(old, new, &pk) {
            sqlx::query(&statement).execute(&mut *tx).await?;
        }
        tx.commit().await?;

        self.cache.rename(old, new);
        observe::record_ddl("rename_table", new, started.elapsed());
        Ok(())
    }

    /// Drop a table; for temporal tables the CASCADE removes the history
    /// table, the view and the rules in one stroke.
    pub async fn drop_table(&self, table: &str) -> TemporalResult<()> {
        let started = Instant::now();
        let mut tx = self.pool.begin().await?;

        if !self.cache.is_temporal_on(&mut *tx, table).await? {
            sqlx::query(&ddl::drop_plain_table(table))
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            self.cache.remove(table);
            observe::record_ddl("drop_table", table, started.elapsed());
            return Ok(());
        }

        sqlx::query(&ddl::drop_table_cascade(table))
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        self.cache.remove(table);
        observe::record_ddl("drop_table", table, started.elapsed());
        Ok(())
    }

    /// Add a column; the history table inherits it, and the view and
    /// rules are rebuilt because their bodies embed the column list.
    pub async fn add_column(&self, table: &str, column: &ColumnSpec) -> TemporalResult<()> {
        let started = Instant::now();
        let mut tx = self.pool.begin().await?;

        if !self.cache.is_temporal_on(&mut *tx, table).await? {
            sqlx::query(&ddl::add_column(PUBLIC_SCHEMA, table, column))
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            observe::record_ddl("add_column", table, started.elapsed());
            return Ok(());
        }

        sqlx::query(&ddl::add_column(TEMPORAL_SCHEMA, table, column))
            .execute(&mut *tx)
            .await?;
        let router = SchemaRouter::new();
        self.rebuild_view_and_rules(&router, &mut *tx, table).await?;
        tx.commit().await?;

        observe::record_ddl("add_column", table, started.elapsed());
        Ok(())
    }

    /// Rename a column and rebuild the view and rules.
    pub async fn rename_column(&self, table: &str, old: &str, new: &str) -> TemporalResult<()> {
        let started = Instant::now();
        let mut tx = self.pool.begin().await?;

        if !self.cache.is_temporal_on(&mut *tx, table).await? {
            sqlx::query(&ddl::rename_column(PUBLIC_SCHEMA, table, old, new))
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            observe::record_ddl("rename_column", table, started.elapsed());
            return Ok(());
        }

        // The view column set changes name, so the view cannot be
        // replaced in place.
        sqlx::query(&ddl::drop_view(table)).execute(&mut *tx).await?;
        sqlx::query(&ddl::rename_column(TEMPORAL_SCHEMA, table, old, new))
            .execute(&mut *tx)
            .await?;
        let router = SchemaRouter::new();
        self.recreate_view_and_rules(&router, &mut *tx, table).await?;
        tx.commit().await?;

        observe::record_ddl("rename_column", table, started.elapsed());
        Ok(())
    }

    /// Change a column's type. Destructive for the view: it is dropped,
    /// the alteration runs under the `temporal` search_path, and the
    /// view and rules are recreated.
    pub async fn change_column(
        &self,
        table: &str,
        column: &str,
        sql_type: &str,
    ) -> TemporalResult<()> {
        let statement = ddl::change_column_type(table, column, sql_type);
        self.destructive_alter("change_column", table, statement)
            .await
    }

    /// Drop a column; destructive for the view, like
    /// [`change_column`](Self::change_column).
    pub async fn remove_column(&self, table: &str, column: &str) -> TemporalResult<()> {
        let statement = ddl::remove_column(table, column);
        self.destructive_alter("remove_column", table, statement)
            .await
    }

    /// Set or drop a column default. The rules do not embed defaults, so
    /// they are left untouched.
    pub async fn change_column_default(
        &self,
        table: &str,
        column: &str,
        default: Option<&str>,
    ) -> TemporalResult<()> {
        let started = Instant::now();
        let schema = self.schema_for(table).await?;
        sqlx::query(&ddl::change_column_default(&schema, table, column, default))
            .execute(&self.pool)
            .await?;
        observe::record_ddl("change_column_default", table, started.elapsed());
        Ok(())
    }

    /// Set or drop a NOT NULL constraint; rules unaffected.
    pub async fn change_column_null(
        &self,
        table: &str,
        column: &str,
        nullable: bool,
    ) -> TemporalResult<()> {
        let started = Instant::now();
        let schema = self.schema_for(table).await?;
        sqlx::query(&ddl::change_column_null(&schema, table, column, nullable))
            .execute(&self.pool)
            .await?;
        observe::record_ddl("change_column_null", table, started.elapsed());
        Ok(())
    }

    /// Create an index on the current table and mirror it on the history
    /// table with any UNIQUE flag stripped: uniqueness cannot hold
    /// across multiple versions of the same logical row.
    pub async fn add_index(&self, table: &str, index: &IndexSpec) -> TemporalResult<()> {
        let started = Instant::now();
        let mut tx = self.pool.begin().await?;

        if !self.cache.is_temporal_on(&mut *tx, table).await? {
            sqlx::query(&ddl::create_index(PUBLIC_SCHEMA, table, index, false))
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            observe::record_ddl("add_index", table, started.elapsed());
            return Ok(());
        }

        sqlx::query(&ddl::create_index(TEMPORAL_SCHEMA, table, index, false))
            .execute(&mut *tx)
            .await?;
        sqlx::query(&ddl::create_index(HISTORY_SCHEMA, table, index, true))
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        observe::record_ddl("add_index", table, started.elapsed());
        Ok(())
    }

    /// Drop an index from both schemas.
    pub async fn remove_index(&self, table: &str, name: &str) -> TemporalResult<()> {
        let started = Instant::now();
        let mut tx = self.pool.begin().await?;

        if !self.cache.is_temporal_on(&mut *tx, table).await? {
            sqlx::query(&ddl::drop_index(PUBLIC_SCHEMA, name))
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            observe::record_ddl("remove_index", table, started.elapsed());
            return Ok(());
        }

        sqlx::query(&ddl::drop_index(TEMPORAL_SCHEMA, name))
            .execute(&mut *tx)
            .await?;
        sqlx::query(&ddl::drop_index(HISTORY_SCHEMA, name))
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        observe::record_ddl("remove_index", table, started.elapsed());
        Ok(())
    }

    /// Column definitions as the caller sees them: for temporal tables
    /// the query is redirected to the `temporal` schema (the stock
    /// introspection queries resolve through `current_schema()`), so the
    /// history table's system columns never leak through.
    pub async fn column_definitions(&self, table: &str) -> TemporalResult<Vec<ColumnDefinition>> {
        let mut conn = self.pool.acquire().await?;
        let temporal = self.cache.is_temporal_on(&mut *conn, table).await?;
        if temporal {
            let router = SchemaRouter::new();
            let t = table.to_string();
            router
                .on_schema(&mut *conn, TEMPORAL_SCHEMA, Nesting::Ignore, move |c| {
                    Box::pin(async move { fetch_columns(c, &t).await })
                })
                .await
        } else {
            fetch_columns(&mut *conn, table).await
        }
    }

    /// The primary-key column name, if any.
    pub async fn primary_key(&self, table: &str) -> TemporalResult<Option<String>> {
        let mut conn = self.pool.acquire().await?;
        let temporal = self.cache.is_temporal_on(&mut *conn, table).await?;
        if temporal {
            let router = SchemaRouter::new();
            let t = table.to_string();
            router
                .on_schema(&mut *conn, TEMPORAL_SCHEMA, Nesting::Ignore, move |c| {
                    Box::pin(async move { fetch_primary_key(c, &t).await })
                })
                .await
        } else {
            fetch_primary_key(&mut *conn, table).await
        }
    }

    /// Indexes of the current table.
    pub async fn indexes(&self, table: &str) -> TemporalResult<Vec<IndexDefinition>> {
        let mut conn = self.pool.acquire().await?;
        let temporal = self.cache.is_temporal_on(&mut *conn, table).await?;
        if temporal {
            let router = SchemaRouter::new();
            let t = table.to_string();
            router
                .on_schema(&mut *conn, TEMPORAL_SCHEMA, Nesting::Ignore, move |c| {
                    Box::pin(async move { fetch_indexes(c, &t).await })
                })
                .await
        } else {
            fetch_indexes(&mut *conn, table).await
        }
    }

    /// The cache handle this compiler maintains.
    pub fn cache(&self) -> &TemporalCache {
        &self.cache
    }

    async fn schema_for(&self, table: &str) -> TemporalResult<String> {
        let temporal = self.cache.is_temporal(&self.pool, table).await?;
        Ok(if temporal {
            TEMPORAL_SCHEMA.to_string()
        } else {
            PUBLIC_SCHEMA.to_string()
        })
    }

    /// Drop the view, run one in-schema alteration against the current
    /// table, recreate the view and rules — all in one transaction.
    async fn destructive_alter(
        &self,
        operation: &str,
        table: &str,
        statement: String,
    ) -> TemporalResult<()> {
        let started = Instant::now();
        let mut tx = self.pool.begin().await?;
        let router = SchemaRouter::new();

        if !self.cache.is_temporal_on(&mut *tx, table).await? {
            // The statement is schema-relative; point it at public.
            router
                .on_schema(&mut *tx, PUBLIC_SCHEMA, Nesting::Follow, move |c| {
                    Box::pin(async move {
                        sqlx::query(&statement).execute(&mut *c).await?;
                        Ok(())
                    })
                })
                .await?;
            tx.commit().await?;
            observe::record_ddl(operation, table, started.elapsed());
            return Ok(());
        }

        sqlx::query(&ddl::drop_view(table)).execute(&mut *tx).await?;
        router
            .on_schema(&mut *tx, TEMPORAL_SCHEMA, Nesting::Follow, move |c| {
                Box::pin(async move {
                    sqlx::query(&statement).execute(&mut *c).await?;
                    Ok(())
                })
            })
            .await?;
        self.recreate_view_and_rules(&router, &mut *tx, table).await?;
        tx.commit().await?;

        observe::record_ddl(operation, table, started.elapsed());
        Ok(())
    }

    /// Drop and recreate the view and its rules from the current layout.
    async fn rebuild_view_and_rules(
        &self,
        router: &SchemaRouter,
        conn: &mut PgConnection,
        table: &str,
    ) -> TemporalResult<()> {
        sqlx::query(&ddl::drop_view(table)).execute(&mut *conn).await?;
        self.recreate_view_and_rules(router, conn, table).await
    }

    async fn recreate_view_and_rules(
        &self,
        router: &SchemaRouter,
        conn: &mut PgConnection,
        table: &str,
    ) -> TemporalResult<()> {
        let (pk, columns) = self.current_layout(router, conn, table).await?;
        let non_key: Vec<String> = columns.into_iter().filter(|c| *c != pk).collect();

        sqlx::query(&ddl::create_view(table)).execute(&mut *conn).await?;
        for statement in ddl::rules(table, &pk, &non_key) {
            sqlx::query(&statement).execute(&mut *conn).await?;
        }
        Ok(())
    }

    /// The current table's primary key and column names, read under the
    /// `temporal` search_path.
    async fn current_layout(
        &self,
        router: &SchemaRouter,
        conn: &mut PgConnection,
        table: &str,
    ) -> TemporalResult<(String, Vec<String>)> {
        let t = table.to_string();
        router
            .on_schema(conn, TEMPORAL_SCHEMA, Nesting::Follow, move |c| {
                Box::pin(async move {
                    let pk = fetch_primary_key(c, &t)
                        .await?
                        .ok_or_else(|| TemporalError::PrimaryKeyRequired(t.clone()))?;
                    let columns = fetch_columns(c, &t)
                        .await?
                        .into_iter()
                        .map(|column| column.name)
                        .collect();
                    Ok((pk, columns))
                })
            })
            .await
    }
}

async fn fetch_columns(
    conn: &mut PgConnection,
    table: &str,
) -> TemporalResult<Vec<ColumnDefinition>> {
    let rows: Vec<(String, String, String, Option<String>)> = sqlx::query_as(COLUMNS_SQL)
        .bind(table)
        .fetch_all(&mut *conn)
        .await?;

    Ok(rows
        .into_iter()
        .map(|(name, sql_type, is_nullable, default)| ColumnDefinition {
            name,
            sql_type,
            nullable: is_nullable == "YES",
            default,
        })
        .collect())
}

async fn fetch_primary_key(conn: &mut PgConnection, table: &str) -> TemporalResult<Option<String>> {
    let pk: Option<String> = sqlx::query_scalar(PRIMARY_KEY_SQL)
        .bind(table)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(pk)
}

async fn fetch_indexes(conn: &mut PgConnection, table: &str) -> TemporalResult<Vec<IndexDefinition>> {
    let rows: Vec<(String, String)> = sqlx::query_as(INDEXES_SQL)
        .bind(table)
        .fetch_all(&mut *conn)
        .await?;

    Ok(rows
        .into_iter()
        .map(|(name, definition)| IndexDefinition {
            unique: definition.starts_with("CREATE UNIQUE"),
            name,
            definition,
        })
        .collect())
}
