//! As-of query rewriting.
//!
//! `as_of(T)` over a temporal entity builds a read-only relation whose
//! base is a CTE named after the entity's logical table, reading the
//! versions valid at `T` from the history table. The relation carries
//! the temporal context, so every temporal table joined afterwards is
//! rewritten the same way at SQL-emission time.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::debug;

use chronopg_core::quoting::quote_ident;
use chronopg_core::TemporalResult;
use chronopg_sql::TemporalCache;

use crate::history::{EntityDescriptor, HistoryRow};
use crate::relation::{history_at, JoinKind, Relation};

/// The reattachable portion of a scope: its WHERE and ORDER fragments.
///
/// When a caller supplies a scope, only these fragments are merged into
/// the rewritten query; JOIN, GROUP and HAVING fragments of the original
/// scope are dropped.
#[derive(Debug, Clone, Default)]
pub struct AsOfScope {
    /// WHERE predicates, ANDed
    pub wheres: Vec<String>,
    /// ORDER BY expressions
    pub order: Vec<String>,
}

impl AsOfScope {
    /// An empty scope.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a WHERE predicate.
    pub fn filter(mut self, predicate: impl Into<String>) -> Self {
        self.wheres.push(predicate.into());
        self
    }

    /// Add an ORDER BY expression.
    pub fn order_by(mut self, expr: impl Into<String>) -> Self {
        self.order.push(expr.into());
        self
    }
}

/// A default scope attached to an entity: either fixed fragments, or a
/// deferred constructor invoked each time a query is built.
#[derive(Debug, Clone)]
pub enum DefaultScope {
    /// Fragments applied as-is
    Fixed(AsOfScope),
    /// Invoked at query-build time
    Deferred(fn() -> AsOfScope),
}

impl DefaultScope {
    fn resolve(&self) -> AsOfScope {
        match self {
            DefaultScope::Fixed(scope) => scope.clone(),
            DefaultScope::Deferred(build) => build(),
        }
    }
}

/// An as-of query: an entity, an instant, and the relation being built.
#[derive(Debug, Clone)]
pub struct AsOfQuery {
    entity: EntityDescriptor,
    at: DateTime<Utc>,
    relation: Relation,
}

impl AsOfQuery {
    /// Build the rewritten base relation.
    ///
    /// The relation starts unscoped over the live entity — its default
    /// scopes may reference the public view whose rewrite the CTE
    /// replaces — and the supplied scope's WHERE/ORDER fragments (or,
    /// absent one, the entity's default scopes, deferred ones invoked
    /// first) are then reattached.
    pub fn new(entity: &EntityDescriptor, at: DateTime<Utc>, scope: Option<&AsOfScope>) -> Self {
        let mut relation = Relation::from_table(&entity.table)
            .with_cte(&entity.table, history_at(&entity.table, at))
            .read_at(at);

        let scopes: Vec<AsOfScope> = match scope {
            Some(explicit) => vec![explicit.clone()],
            None => entity.default_scopes.iter().map(DefaultScope::resolve).collect(),
        };
        for scope in scopes {
            for predicate in scope.wheres {
                relation = relation.filter(predicate);
            }
            for expr in scope.order {
                relation = relation.order_by(expr);
            }
        }

        debug!(table = %entity.table, at = %at, "as-of query");
        Self {
            entity: entity.clone(),
            at,
            relation,
        }
    }

    /// The instant this query reads at.
    pub fn at(&self) -> DateTime<Utc> {
        self.at
    }

    /// Join another logical table; temporal ones are rewritten at
    /// emission time.
    pub fn join(mut self, kind: JoinKind, table: impl Into<String>, on: impl Into<String>) -> Self {
        self.relation = self.relation.join(kind, table, on);
        self
    }

    /// Add a WHERE predicate.
    pub fn filter(mut self, predicate: impl Into<String>) -> Self {
        self.relation = self.relation.filter(predicate);
        self
    }

    /// Add an ORDER BY expression.
    pub fn order_by(mut self, expr: impl Into<String>) -> Self {
        self.relation = self.relation.order_by(expr);
        self
    }

    /// Add a projection expression.
    pub fn select(mut self, expr: impl Into<String>) -> Self {
        self.relation = self.relation.select(expr);
        self
    }

    /// The underlying relation.
    pub fn relation(&self) -> &Relation {
        &self.relation
    }

    /// Emit the rewritten SQL.
    pub fn to_sql(&self, cache: &TemporalCache) -> String {
        self.relation.to_sql(cache)
    }

    /// Fetch every version valid at the instant.
    pub async fn fetch_all(
        &self,
        pool: &PgPool,
        cache: &TemporalCache,
    ) -> TemporalResult<Vec<HistoryRow>> {
        let sql = self.row_relation().to_sql(cache);
        Ok(sqlx::query_as(&sql).fetch_all(pool).await?)
    }

    /// Fetch one record by logical id, as it was at the instant.
    pub async fn find(
        &self,
        pool: &PgPool,
        cache: &TemporalCache,
        rid: i64,
    ) -> TemporalResult<Option<HistoryRow>> {
        let t = quote_ident(&self.entity.table);
        let pk = quote_ident(&self.entity.primary_key);
        let sql = self
            .row_relation()
            .filter(format!("{t}.{pk} = {rid}"))
            .to_sql(cache);
        Ok(sqlx::query_as(&sql).fetch_optional(pool).await?)
    }

    /// The relation with the standard row projection: system columns,
    /// the logical id as `rid`, the query instant as `as_of_time`, and
    /// the whole row as JSON.
    fn row_relation(&self) -> Relation {
        let t = quote_ident(&self.entity.table);
        let pk = quote_ident(&self.entity.primary_key);
        self.relation.clone().select(format!(
            "{t}.\"hid\", {t}.{pk} AS \"rid\", {t}.\"valid_from\", {t}.\"valid_to\", \
             {t}.\"recorded_at\", {t}.\"as_of_time\", to_jsonb({t}) AS \"data\""
        ))
    }
}

const AGGREGATE_FUNCTIONS: &[&str] = &[
    "min",
    "max",
    "sum",
    "count",
    "avg",
    "stddev",
    "stddev_pop",
    "stddev_samp",
    "variance",
    "var_pop",
    "var_samp",
    "corr",
    "regr_avgx",
    "regr_avgy",
    "regr_count",
    "regr_intercept",
    "regr_r2",
    "regr_slope",
    "regr_sxx",
    "regr_sxy",
    "regr_syy",
    "bit_and",
    "bit_or",
    "bool_and",
    "bool_or",
    "array_agg",
    "string_agg",
    "xmlagg",
    "every",
];

fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// Whether a select list invokes an aggregate function.
///
/// A token scan: each known aggregate name must stand on its own word
/// boundary and be followed (spaces allowed) by an opening parenthesis.
/// Walking a parsed AST would be more precise, but this layer only needs
/// to decide whether to suppress its implicit ordering and `as_of_time`
/// projection.
pub fn contains_aggregate(select_list: &str) -> bool {
    let lower = select_list.to_ascii_lowercase();
    let bytes = lower.as_bytes();

    for name in AGGREGATE_FUNCTIONS {
        let mut start = 0;
        while let Some(found) = lower[start..].find(name) {
            let begin = start + found;
            let end = begin + name.len();

            let boundary_before = begin == 0 || !is_word_byte(bytes[begin - 1]);
            let mut cursor = end;
            while cursor < bytes.len() && bytes[cursor] == b' ' {
                cursor += 1;
            }
            let call_after = cursor < bytes.len() && bytes[cursor] == b'(';
            let boundary_after = end == bytes.len() || !is_word_byte(bytes[end]);

            if boundary_before && boundary_after && call_after {
                return true;
            }
            start = begin + 1;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use chronopg_core::time;

    fn t0() -> DateTime<Utc> {
        time::parse_utc("2024-03-01 12:00:00.000000").unwrap()
    }

    fn entity() -> EntityDescriptor {
        EntityDescriptor::new("foos")
    }

    #[test]
    fn base_query_reads_through_the_cte() {
        let cache = TemporalCache::default();
        cache.insert("foos");

        let sql = entity().as_of(t0()).to_sql(&cache);
        assert!(sql.starts_with("WITH \"foos\" AS ("));
        assert!(sql.contains("FROM \"history\".\"foos\""));
        assert!(sql.contains("FROM \"foos\""));
        assert!(sql.contains("timestamp '2024-03-01 12:00:00.000000'"));
    }

    #[test]
    fn explicit_scope_reattaches_where_and_order_only() {
        let cache = TemporalCache::default();
        cache.insert("foos");

        let scope = AsOfScope::new()
            .filter("\"foos\".\"name\" = 'a'")
            .order_by("\"foos\".\"name\"");
        let sql = entity().as_of_scoped(t0(), &scope).to_sql(&cache);

        assert!(sql.contains("WHERE \"foos\".\"name\" = 'a'"));
        assert!(sql.contains("ORDER BY \"foos\".\"name\""));
    }

    #[test]
    fn default_scopes_apply_without_an_explicit_one() {
        let cache = TemporalCache::default();
        cache.insert("foos");

        let entity = entity()
            .default_scope(DefaultScope::Fixed(
                AsOfScope::new().filter("\"foos\".\"archived\" = FALSE"),
            ))
            .default_scope(DefaultScope::Deferred(|| {
                AsOfScope::new().order_by("\"foos\".\"id\"")
            }));

        let sql = entity.as_of(t0()).to_sql(&cache);
        assert!(sql.contains("\"archived\" = FALSE"));
        assert!(sql.contains("ORDER BY \"foos\".\"id\""));

        // An explicit scope replaces the defaults.
        let sql = entity
            .as_of_scoped(t0(), &AsOfScope::new().filter("1 = 1"))
            .to_sql(&cache);
        assert!(!sql.contains("archived"));
    }

    #[test]
    fn joined_temporal_tables_are_rewritten() {
        let cache = TemporalCache::default();
        cache.insert("books");
        cache.insert("authors");

        let sql = EntityDescriptor::new("books")
            .as_of(t0())
            .join(
                JoinKind::Inner,
                "authors",
                "\"authors\".\"id\" = \"books\".\"author_id\"",
            )
            .to_sql(&cache);

        assert_eq!(sql.matches(" AS (").count(), 2);
    }

    #[test]
    fn aggregate_names_are_detected() {
        for positive in [
            "COUNT(*)",
            "count( * ) AS versions",
            "sum(amount)",
            "array_agg(name ORDER BY id)",
            "regr_slope(y, x)",
            "id, MAX(valid_to)",
        ] {
            assert!(contains_aggregate(positive), "expected aggregate: {positive}");
        }
    }

    #[test]
    fn plain_columns_are_not_aggregates() {
        for negative in [
            "id, name",
            "counter",
            "account(",
            "max_width",
            "mymax(x)",
            "summary, avg_cost",
        ] {
            assert!(!contains_aggregate(negative), "not an aggregate: {negative}");
        }
    }
}
