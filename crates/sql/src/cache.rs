//! Engine-scoped cache of which logical tables are temporal.
//!
//! Populated by the schema compiler at DDL time and consulted by the
//! query rewriter at compile time. Entries are stable between DDL
//! events; a rewrite racing a concurrent DDL either sees the pre-DDL
//! schema or fails on a missing relation, which PostgreSQL reports.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use sqlx::postgres::Postgres;
use sqlx::{Executor, PgConnection, PgPool};
use tracing::trace;

use chronopg_core::TemporalResult;

use crate::{HISTORY_SCHEMA, TEMPORAL_SCHEMA};

const PROBE_SQL: &str = "SELECT EXISTS (\
       SELECT 1 FROM pg_class c JOIN pg_namespace n ON n.oid = c.relnamespace \
        WHERE n.nspname = $1 AND c.relname = $3) \
   AND EXISTS (\
       SELECT 1 FROM pg_class c JOIN pg_namespace n ON n.oid = c.relnamespace \
        WHERE n.nspname = $2 AND c.relname = $3)";

const PRIME_SQL: &str = "SELECT c.relname FROM pg_class c \
     JOIN pg_namespace n ON n.oid = c.relnamespace \
    WHERE n.nspname = $1 AND c.relkind = 'r' \
    INTERSECT \
    SELECT c.relname FROM pg_class c \
     JOIN pg_namespace n ON n.oid = c.relnamespace \
    WHERE n.nspname = $2 AND c.relkind = 'r'";

/// Process-wide mapping from logical table name to "is temporal".
///
/// Clones share the underlying map; hand a clone to every compiler and
/// rewriter instead of reaching for a global.
#[derive(Debug, Clone, Default)]
pub struct TemporalCache {
    inner: Arc<RwLock<HashMap<String, bool>>>,
}

impl TemporalCache {
    /// Record a table as temporal (after a successful `create_table`).
    pub fn insert(&self, name: &str) {
        self.inner.write().unwrap().insert(name.to_string(), true);
    }

    /// Forget a table (after `drop_table`).
    pub fn remove(&self, name: &str) {
        self.inner.write().unwrap().remove(name);
    }

    /// Carry an entry across a rename, atomically for readers.
    pub fn rename(&self, old: &str, new: &str) {
        let mut map = self.inner.write().unwrap();
        let temporal = map.remove(old).unwrap_or(false);
        map.insert(new.to_string(), temporal);
    }

    /// Memoized flag, without touching the database.
    pub fn lookup(&self, name: &str) -> Option<bool> {
        self.inner.read().unwrap().get(name).copied()
    }

    /// Whether the table is temporal; the miss path verifies that both
    /// physical tables exist.
    pub async fn is_temporal(&self, pool: &PgPool, name: &str) -> TemporalResult<bool> {
        if let Some(flag) = self.lookup(name) {
            return Ok(flag);
        }
        let flag = probe(pool, name).await?;
        self.store(name, flag);
        Ok(flag)
    }

    /// [`is_temporal`](Self::is_temporal) over an already-acquired
    /// connection, for use inside DDL transactions.
    pub async fn is_temporal_on(
        &self,
        conn: &mut PgConnection,
        name: &str,
    ) -> TemporalResult<bool> {
        if let Some(flag) = self.lookup(name) {
            return Ok(flag);
        }
        let flag = probe(&mut *conn, name).await?;
        self.store(name, flag);
        Ok(flag)
    }

    /// Bulk-load every table present in both reserved schemas. Returns
    /// the number of entries loaded.
    pub async fn prime(&self, pool: &PgPool) -> TemporalResult<usize> {
        let names: Vec<String> = sqlx::query_scalar(PRIME_SQL)
            .bind(TEMPORAL_SCHEMA)
            .bind(HISTORY_SCHEMA)
            .fetch_all(pool)
            .await?;
        let count = names.len();
        let mut map = self.inner.write().unwrap();
        for name in names {
            map.insert(name, true);
        }
        Ok(count)
    }

    fn store(&self, name: &str, flag: bool) {
        trace!(table = name, temporal = flag, "caching temporal flag");
        self.inner.write().unwrap().insert(name.to_string(), flag);
    }
}

async fn probe<'e, E>(executor: E, name: &str) -> TemporalResult<bool>
where
    E: Executor<'e, Database = Postgres>,
{
    let flag: bool = sqlx::query_scalar(PROBE_SQL)
        .bind(TEMPORAL_SCHEMA)
        .bind(HISTORY_SCHEMA)
        .bind(name)
        .fetch_one(executor)
        .await?;
    Ok(flag)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_lookup() {
        let cache = TemporalCache::default();
        assert_eq!(cache.lookup("foos"), None);
        cache.insert("foos");
        assert_eq!(cache.lookup("foos"), Some(true));
    }

    #[test]
    fn remove_forgets() {
        let cache = TemporalCache::default();
        cache.insert("foos");
        cache.remove("foos");
        assert_eq!(cache.lookup("foos"), None);
    }

    #[test]
    fn rename_carries_the_flag() {
        let cache = TemporalCache::default();
        cache.insert("foos");
        cache.rename("foos", "bars");
        assert_eq!(cache.lookup("foos"), None);
        assert_eq!(cache.lookup("bars"), Some(true));
    }

    #[test]
    fn clones_share_state() {
        let cache = TemporalCache::default();
        let other = cache.clone();
        cache.insert("foos");
        assert_eq!(other.lookup("foos"), Some(true));
    }
}
