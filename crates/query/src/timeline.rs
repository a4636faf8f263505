//! Enumeration of the instants at which an object graph changed.
//!
//! For a record (and its temporal `belongs_to`/`has_one` associations),
//! every `valid_from` and `valid_to` of every source relation is
//! unnested into one sorted, distinct set of UTC instants. Associations
//! are joined LEFT OUTER, so a record with no associated row still
//! contributes its own change instants.

use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::PgPool;
use tracing::warn;

use chronopg_core::quoting::{quote_ident, quote_naive_timestamp, quote_qualified};
use chronopg_core::{time, TemporalResult};
use chronopg_sql::ddl::UTC_NOW;
use chronopg_sql::{Nesting, SchemaRouter, TemporalCache, HISTORY_SCHEMA, PUBLIC_SCHEMA};

use crate::history::EntityDescriptor;

/// Association flavors the enumerator follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssociationKind {
    /// The entity holds the foreign key to the target.
    BelongsTo,
    /// The target holds the foreign key to the entity.
    HasOne,
}

/// One association of the calling entity.
#[derive(Debug, Clone)]
pub struct Association {
    /// Association flavor
    pub kind: AssociationKind,
    /// The associated entity
    pub target: EntityDescriptor,
    /// The foreign-key column (on the entity for `BelongsTo`, on the
    /// target for `HasOne`)
    pub foreign_key: String,
    /// Polymorphic associations have no single target table and are
    /// skipped
    pub polymorphic: bool,
}

impl Association {
    /// A `belongs_to` association: the entity carries the foreign key.
    pub fn belongs_to(target: EntityDescriptor, foreign_key: impl Into<String>) -> Self {
        Self {
            kind: AssociationKind::BelongsTo,
            target,
            foreign_key: foreign_key.into(),
            polymorphic: false,
        }
    }

    /// A `has_one` association: the target carries the foreign key.
    pub fn has_one(target: EntityDescriptor, foreign_key: impl Into<String>) -> Self {
        Self {
            kind: AssociationKind::HasOne,
            target,
            foreign_key: foreign_key.into(),
            polymorphic: false,
        }
    }

    /// Mark the association polymorphic (excluded from enumeration).
    pub fn polymorphic(mut self) -> Self {
        self.polymorphic = true;
        self
    }
}

/// Scope of one enumeration call.
struct Enumeration<'a> {
    entity: &'a EntityDescriptor,
    entity_temporal: bool,
    eligible: Vec<&'a Association>,
    record: Option<(i64, Option<NaiveDateTime>)>,
}

impl Enumeration<'_> {
    /// The full query, or `None` when no source relation is temporal.
    ///
    /// Executed under the `history` search_path, so unqualified names
    /// resolve to the history tables; a non-temporal calling entity is
    /// qualified to `public` so its view is still found there.
    fn to_sql(&self) -> Option<String> {
        let base = quote_ident(&self.entity.table);

        let mut items = Vec::new();
        if self.entity_temporal {
            items.push(format!("{base}.\"valid_from\""));
            items.push(format!("{base}.\"valid_to\""));
        }
        for association in &self.eligible {
            let alias = quote_ident(&association.target.table);
            items.push(format!("{alias}.\"valid_from\""));
            items.push(format!("{alias}.\"valid_to\""));
        }
        if items.is_empty() {
            return None;
        }

        let from = if self.entity_temporal {
            base.clone()
        } else {
            format!(
                "{} {base}",
                quote_qualified(PUBLIC_SCHEMA, &self.entity.table)
            )
        };

        let mut joins = String::new();
        for association in &self.eligible {
            let alias = quote_ident(&association.target.table);
            let on = match association.kind {
                AssociationKind::BelongsTo => format!(
                    "{alias}.{} = {base}.{}",
                    quote_ident(&association.target.primary_key),
                    quote_ident(&association.foreign_key),
                ),
                AssociationKind::HasOne => format!(
                    "{alias}.{} = {base}.{}",
                    quote_ident(&association.foreign_key),
                    quote_ident(&self.entity.primary_key),
                ),
            };
            joins.push_str(&format!("\nLEFT OUTER JOIN {alias} ON {on}"));
        }

        let scope = match &self.record {
            Some((rid, _)) => format!(
                "\nWHERE {base}.{} = {rid}",
                quote_ident(&self.entity.primary_key)
            ),
            None => String::new(),
        };

        let mut filters = vec![
            "q.ts IS NOT NULL".to_string(),
            format!("q.ts < {UTC_NOW}"),
        ];
        if let Some((_, Some(lower))) = &self.record {
            filters.push(format!("q.ts >= {}", quote_naive_timestamp(*lower)));
        }

        Some(format!(
            "SELECT q.ts::text FROM (\n\
               SELECT DISTINCT UNNEST(ARRAY[{items}]) AS ts\n\
               FROM {from}{joins}{scope}\n\
             ) q\n\
             WHERE {filters}\n\
             ORDER BY q.ts",
            items = items.join(", "),
            filters = filters.join(" AND "),
        ))
    }
}

/// The sorted distinct set of change instants for an entity, optionally
/// scoped to one record.
///
/// The query runs on its own pooled connection with its own
/// [`SchemaRouter`], so the history-schema switch never leaks into
/// concurrent work. Values PostgreSQL returns that fail to parse as
/// timestamps are filtered out with a warning rather than failing the
/// call.
pub async fn timestamps(
    pool: &PgPool,
    cache: &TemporalCache,
    entity: &EntityDescriptor,
    associations: &[Association],
    record_id: Option<i64>,
) -> TemporalResult<Vec<DateTime<Utc>>> {
    let entity_temporal = cache.is_temporal(pool, &entity.table).await?;

    let mut eligible = Vec::new();
    for association in associations {
        if association.polymorphic {
            continue;
        }
        if cache.is_temporal(pool, &association.target.table).await? {
            eligible.push(association);
        }
    }

    let record = match record_id {
        Some(rid) if entity_temporal => {
            let lower: Option<NaiveDateTime> = sqlx::query_scalar(&format!(
                "SELECT MIN(\"valid_from\") FROM {} WHERE {} = $1",
                quote_qualified(HISTORY_SCHEMA, &entity.table),
                quote_ident(&entity.primary_key),
            ))
            .bind(rid)
            .fetch_one(pool)
            .await?;
            Some((rid, lower))
        }
        Some(rid) => Some((rid, None)),
        None => None,
    };

    let enumeration = Enumeration {
        entity,
        entity_temporal,
        eligible,
        record,
    };
    let Some(sql) = enumeration.to_sql() else {
        return Ok(Vec::new());
    };

    let mut conn = pool.acquire().await?;
    let router = SchemaRouter::new();
    let raw: Vec<String> = router
        .on_schema(&mut *conn, HISTORY_SCHEMA, Nesting::Follow, move |c| {
            Box::pin(async move { Ok(sqlx::query_scalar(&sql).fetch_all(&mut *c).await?) })
        })
        .await?;

    let mut instants = Vec::with_capacity(raw.len());
    for value in raw {
        match time::parse_utc(&value) {
            Ok(instant) => instants.push(instant),
            Err(_) => warn!(value = %value, "skipping unparsable change instant"),
        }
    }
    Ok(instants)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn authors() -> EntityDescriptor {
        EntityDescriptor::new("authors")
    }

    fn books() -> EntityDescriptor {
        EntityDescriptor::new("books")
    }

    #[test]
    fn temporal_entity_with_association() {
        let association = Association::belongs_to(authors(), "author_id");
        let enumeration = Enumeration {
            entity: &books(),
            entity_temporal: true,
            eligible: vec![&association],
            record: None,
        };
        let sql = enumeration.to_sql().unwrap();

        assert!(sql.contains("UNNEST(ARRAY[\"books\".\"valid_from\", \"books\".\"valid_to\", \"authors\".\"valid_from\", \"authors\".\"valid_to\"])"));
        assert!(sql.contains("LEFT OUTER JOIN \"authors\" ON \"authors\".\"id\" = \"books\".\"author_id\""));
        assert!(sql.contains("q.ts IS NOT NULL"));
        assert!(sql.contains("q.ts < timezone('UTC', now())"));
        assert!(sql.ends_with("ORDER BY q.ts"));
    }

    #[test]
    fn record_scope_adds_filter_and_lower_bound() {
        let lower = chronopg_core::time::parse_utc("2024-01-01 00:00:00").unwrap();
        let enumeration = Enumeration {
            entity: &books(),
            entity_temporal: true,
            eligible: vec![],
            record: Some((42, Some(lower.naive_utc()))),
        };
        let sql = enumeration.to_sql().unwrap();

        assert!(sql.contains("WHERE \"books\".\"id\" = 42"));
        assert!(sql.contains("q.ts >= '2024-01-01 00:00:00.000000'"));
    }

    #[test]
    fn non_temporal_entity_is_qualified_to_public() {
        let association = Association::has_one(authors(), "book_id");
        let enumeration = Enumeration {
            entity: &books(),
            entity_temporal: false,
            eligible: vec![&association],
            record: None,
        };
        let sql = enumeration.to_sql().unwrap();

        assert!(sql.contains("FROM \"public\".\"books\" \"books\""));
        assert!(sql.contains("\"authors\".\"book_id\" = \"books\".\"id\""));
        assert!(!sql.contains("\"books\".\"valid_from\""));
    }

    #[test]
    fn nothing_temporal_yields_no_query() {
        let enumeration = Enumeration {
            entity: &books(),
            entity_temporal: false,
            eligible: vec![],
            record: None,
        };
        assert!(enumeration.to_sql().is_none());
    }

    #[test]
    fn polymorphic_marker() {
        let association = Association::belongs_to(authors(), "author_id").polymorphic();
        assert!(association.polymorphic);
    }
}
