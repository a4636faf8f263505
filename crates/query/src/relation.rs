//! A minimal read-only relation builder.
//!
//! This is the seam between the engine and whatever maps rows to
//! objects: the as-of layer decorates a `Relation` with a temporal
//! context, and `to_sql` performs the transitive rewrite — a single
//! pass over the join list that gives every joined table the temporal
//! cache knows its own "history at T" CTE.

use chrono::{DateTime, Utc};

use chronopg_core::quoting::{quote_ident, quote_qualified, quote_timestamp};
use chronopg_sql::{observe, TemporalCache, HISTORY_SCHEMA};

/// Join flavor; the engine emits only these two.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    /// `JOIN`
    Inner,
    /// `LEFT OUTER JOIN`
    LeftOuter,
}

impl JoinKind {
    fn sql(self) -> &'static str {
        match self {
            JoinKind::Inner => "JOIN",
            JoinKind::LeftOuter => "LEFT OUTER JOIN",
        }
    }
}

/// One join source in a relation.
#[derive(Debug, Clone)]
pub struct Join {
    /// Join flavor
    pub kind: JoinKind,
    /// Logical name of the joined table
    pub table: String,
    /// Raw ON condition (identifiers already quoted by the caller)
    pub on: String,
}

/// A composable read-only query over one logical table.
#[derive(Debug, Clone)]
pub struct Relation {
    table: String,
    ctes: Vec<(String, String)>,
    projections: Vec<String>,
    joins: Vec<Join>,
    wheres: Vec<String>,
    order: Vec<String>,
    limit: Option<i64>,
    at: Option<DateTime<Utc>>,
}

impl Relation {
    /// A bare relation over a logical table.
    pub fn from_table(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            ctes: Vec::new(),
            projections: Vec::new(),
            joins: Vec::new(),
            wheres: Vec::new(),
            order: Vec::new(),
            limit: None,
            at: None,
        }
    }

    /// The relation's logical table.
    pub fn table(&self) -> &str {
        &self.table
    }

    /// The temporal context, when one is attached.
    pub fn at(&self) -> Option<DateTime<Utc>> {
        self.at
    }

    /// Attach a named CTE. Names are unique; a second CTE with the same
    /// name is ignored.
    pub fn with_cte(mut self, name: impl Into<String>, body: impl Into<String>) -> Self {
        let name = name.into();
        if !self.ctes.iter().any(|(n, _)| *n == name) {
            self.ctes.push((name, body.into()));
        }
        self
    }

    /// Attach the temporal context consulted by the join rewrite.
    pub fn read_at(mut self, at: DateTime<Utc>) -> Self {
        self.at = Some(at);
        self
    }

    /// Add a projection expression; without any, the relation selects
    /// the base table's whole rows.
    pub fn select(mut self, expr: impl Into<String>) -> Self {
        self.projections.push(expr.into());
        self
    }

    /// Join another logical table.
    pub fn join(mut self, kind: JoinKind, table: impl Into<String>, on: impl Into<String>) -> Self {
        self.joins.push(Join {
            kind,
            table: table.into(),
            on: on.into(),
        });
        self
    }

    /// Add a WHERE predicate (ANDed).
    pub fn filter(mut self, predicate: impl Into<String>) -> Self {
        self.wheres.push(predicate.into());
        self
    }

    /// Add an ORDER BY expression.
    pub fn order_by(mut self, expr: impl Into<String>) -> Self {
        self.order.push(expr.into());
        self
    }

    /// Cap the row count.
    pub fn limit(mut self, n: i64) -> Self {
        self.limit = Some(n);
        self
    }

    /// Emit SQL. When a temporal context is attached, every joined
    /// table the cache knows as temporal gains a `history at T` CTE in
    /// one pass; CTE names are unique per logical table.
    pub fn to_sql(&self, cache: &TemporalCache) -> String {
        let mut ctes = self.ctes.clone();
        if let Some(at) = self.at {
            for join in &self.joins {
                if cache.lookup(&join.table) == Some(true)
                    && !ctes.iter().any(|(n, _)| *n == join.table)
                {
                    ctes.push((join.table.clone(), history_at(&join.table, at)));
                }
            }
            observe::record_rewrite(&self.table, ctes.len());
        }

        let mut sql = String::new();
        if !ctes.is_empty() {
            let rendered: Vec<String> = ctes
                .iter()
                .map(|(name, body)| format!("{} AS (\n{}\n)", quote_ident(name), body))
                .collect();
            sql.push_str("WITH ");
            sql.push_str(&rendered.join(",\n"));
            sql.push('\n');
        }

        let projections = if self.projections.is_empty() {
            format!("{}.*", quote_ident(&self.table))
        } else {
            self.projections.join(", ")
        };
        sql.push_str(&format!(
            "SELECT {projections}\nFROM {}",
            quote_ident(&self.table)
        ));

        for join in &self.joins {
            sql.push_str(&format!(
                "\n{} {} ON {}",
                join.kind.sql(),
                quote_ident(&join.table),
                join.on
            ));
        }

        if !self.wheres.is_empty() {
            sql.push_str(&format!("\nWHERE {}", self.wheres.join(" AND ")));
        }
        if !self.order.is_empty() {
            sql.push_str(&format!("\nORDER BY {}", self.order.join(", ")));
        }
        if let Some(limit) = self.limit {
            sql.push_str(&format!("\nLIMIT {limit}"));
        }
        sql
    }
}

/// The "history at T" subquery: every version whose half-open validity
/// interval covers the instant, with the instant itself projected as
/// `as_of_time`.
pub fn history_at(table: &str, at: DateTime<Utc>) -> String {
    let ts = timestamp_literal(at);
    format!(
        "SELECT {t}.*, {ts} AS \"as_of_time\"\n\
         FROM {history}\n\
         WHERE {ts} >= \"valid_from\" AND {ts} < \"valid_to\"",
        t = quote_ident(table),
        history = quote_qualified(HISTORY_SCHEMA, table),
    )
}

/// A typed timestamp literal in the canonical microsecond form.
pub fn timestamp_literal(at: DateTime<Utc>) -> String {
    format!("timestamp {}", quote_timestamp(at))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chronopg_core::time;

    fn t0() -> DateTime<Utc> {
        time::parse_utc("2024-03-01 12:00:00.000000").unwrap()
    }

    #[test]
    fn bare_relation_selects_whole_rows() {
        let cache = TemporalCache::default();
        let sql = Relation::from_table("foos").to_sql(&cache);
        assert_eq!(sql, "SELECT \"foos\".*\nFROM \"foos\"");
    }

    #[test]
    fn history_at_covers_the_instant() {
        let sql = history_at("foos", t0());
        assert!(sql.contains("FROM \"history\".\"foos\""));
        assert!(sql.contains("timestamp '2024-03-01 12:00:00.000000' >= \"valid_from\""));
        assert!(sql.contains("< \"valid_to\""));
        assert!(sql.contains("AS \"as_of_time\""));
    }

    #[test]
    fn temporal_joins_gain_ctes() {
        let cache = TemporalCache::default();
        cache.insert("books");
        cache.insert("authors");

        let sql = Relation::from_table("books")
            .with_cte("books", history_at("books", t0()))
            .read_at(t0())
            .join(
                JoinKind::Inner,
                "authors",
                "\"authors\".\"id\" = \"books\".\"author_id\"",
            )
            .to_sql(&cache);

        assert_eq!(sql.matches(" AS (").count(), 2);
        assert!(sql.starts_with("WITH \"books\" AS ("));
        assert!(sql.contains("\"authors\" AS ("));
        assert!(sql.contains("JOIN \"authors\" ON"));
    }

    #[test]
    fn non_temporal_joins_pass_through() {
        let cache = TemporalCache::default();
        cache.insert("books");

        let sql = Relation::from_table("books")
            .with_cte("books", history_at("books", t0()))
            .read_at(t0())
            .join(
                JoinKind::LeftOuter,
                "publishers",
                "\"publishers\".\"id\" = \"books\".\"publisher_id\"",
            )
            .to_sql(&cache);

        assert_eq!(sql.matches(" AS (").count(), 1);
        assert!(sql.contains("LEFT OUTER JOIN \"publishers\""));
    }

    #[test]
    fn cte_names_are_unique_per_table() {
        let cache = TemporalCache::default();
        cache.insert("books");
        cache.insert("authors");

        let sql = Relation::from_table("books")
            .with_cte("books", history_at("books", t0()))
            .read_at(t0())
            .join(JoinKind::Inner, "authors", "a")
            .join(JoinKind::LeftOuter, "authors", "b")
            .to_sql(&cache);

        assert_eq!(sql.matches("\"authors\" AS (").count(), 1);
    }

    #[test]
    fn without_context_no_rewrite_happens() {
        let cache = TemporalCache::default();
        cache.insert("authors");

        let sql = Relation::from_table("books")
            .join(JoinKind::Inner, "authors", "a")
            .to_sql(&cache);

        assert!(!sql.contains("WITH"));
    }

    #[test]
    fn filters_order_and_limit_compose() {
        let cache = TemporalCache::default();
        let sql = Relation::from_table("foos")
            .filter("\"foos\".\"name\" = 'a'")
            .filter("\"foos\".\"id\" > 10")
            .order_by("\"foos\".\"id\"")
            .limit(5)
            .to_sql(&cache);

        assert!(sql.contains("WHERE \"foos\".\"name\" = 'a' AND \"foos\".\"id\" > 10"));
        assert!(sql.ends_with("ORDER BY \"foos\".\"id\"\nLIMIT 5"));
    }
}
