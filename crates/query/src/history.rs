//! The history companion of a temporal entity.
//!
//! For a live entity described by an [`EntityDescriptor`], the
//! [`HistoryEntity`] reads `history.<table>`: each row is one version of
//! a logical record. Versions expose the history surrogate `hid` as
//! their identity and keep the logical id reachable as `rid`, so upper
//! layers can treat versions as first-class objects while still knowing
//! which record they belong to.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::{FromRow, PgPool};

use chronopg_core::quoting::{quote_ident, quote_qualified};
use chronopg_core::{time, TemporalError, TemporalResult};
use chronopg_sql::ddl::UTC_NOW;
use chronopg_sql::{TemporalCache, HISTORY_SCHEMA, PUBLIC_SCHEMA};

use crate::as_of::{contains_aggregate, AsOfQuery, AsOfScope, DefaultScope};

/// Describes a live temporal entity: its logical table, primary-key
/// column, and the default scopes its queries normally carry.
#[derive(Debug, Clone)]
pub struct EntityDescriptor {
    /// Logical table name
    pub table: String,
    /// Primary-key column
    pub primary_key: String,
    /// Scopes applied when an as-of query is built without an explicit
    /// scope
    pub default_scopes: Vec<DefaultScope>,
}

impl EntityDescriptor {
    /// A descriptor with the conventional `id` primary key.
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            primary_key: "id".to_string(),
            default_scopes: Vec::new(),
        }
    }

    /// Override the primary-key column.
    pub fn primary_key(mut self, column: impl Into<String>) -> Self {
        self.primary_key = column.into();
        self
    }

    /// Attach a default scope.
    pub fn default_scope(mut self, scope: DefaultScope) -> Self {
        self.default_scopes.push(scope);
        self
    }

    /// An as-of query over this entity at the given instant, carrying
    /// the entity's default scopes.
    pub fn as_of(&self, at: DateTime<Utc>) -> AsOfQuery {
        AsOfQuery::new(self, at, None)
    }

    /// An as-of query with an explicit scope. Only the scope's WHERE and
    /// ORDER fragments are reattached; JOIN, GROUP and HAVING fragments
    /// of the original scope are dropped.
    pub fn as_of_scoped(&self, at: DateTime<Utc>, scope: &AsOfScope) -> AsOfQuery {
        AsOfQuery::new(self, at, Some(scope))
    }
}

/// One version of a logical record.
///
/// `id()` returns the history surrogate so that equality and caching in
/// generic collections treat each version as its own object; `rid()`
/// returns the logical record's key.
#[derive(Debug, Clone, FromRow)]
pub struct HistoryRow {
    hid: i64,
    rid: i64,
    valid_from: NaiveDateTime,
    valid_to: NaiveDateTime,
    recorded_at: NaiveDateTime,
    as_of_time: NaiveDateTime,
    data: JsonValue,
}

impl HistoryRow {
    /// The row's identity: the history surrogate key.
    pub fn id(&self) -> i64 {
        self.hid
    }

    /// The history surrogate key.
    pub fn hid(&self) -> i64 {
        self.hid
    }

    /// The logical record's primary key.
    pub fn rid(&self) -> i64 {
        self.rid
    }

    /// Start of validity, inclusive.
    pub fn valid_from(&self) -> DateTime<Utc> {
        time::as_utc(self.valid_from)
    }

    /// End of validity, exclusive.
    pub fn valid_to(&self) -> DateTime<Utc> {
        time::as_utc(self.valid_to)
    }

    /// When the system learned of this version.
    pub fn recorded_at(&self) -> DateTime<Utc> {
        time::as_utc(self.recorded_at)
    }

    /// The timestamp context the row was read at: the query's instant,
    /// or `LEAST(valid_to, now())` when read without one.
    pub fn as_of_time(&self) -> DateTime<Utc> {
        time::as_utc(self.as_of_time)
    }

    /// Whether this is the open current version.
    pub fn is_open(&self) -> bool {
        self.valid_to == time::end_of_time()
    }

    /// The version's attributes, as captured at write time.
    pub fn attributes(&self) -> &JsonValue {
        &self.data
    }

    /// One attribute by name.
    pub fn attribute(&self, name: &str) -> Option<&JsonValue> {
        self.data.get(name)
    }

    /// Deleting a version is never allowed.
    pub fn destroy(&self) -> TemporalResult<()> {
        Err(TemporalError::ReadOnlyRecord)
    }
}

/// The history companion of a temporal entity.
#[derive(Debug, Clone)]
pub struct HistoryEntity {
    parent: EntityDescriptor,
}

impl HistoryEntity {
    /// A companion for the given descriptor, without verifying the
    /// physical layout.
    pub fn new(parent: EntityDescriptor) -> Self {
        Self { parent }
    }

    /// A companion that verifies the table is actually temporal, so
    /// misregistered entities fail early instead of at first query.
    pub async fn for_table(
        pool: &PgPool,
        cache: &TemporalCache,
        parent: EntityDescriptor,
    ) -> TemporalResult<Self> {
        if !cache.is_temporal(pool, &parent.table).await? {
            return Err(TemporalError::non_temporal_table(&parent.table));
        }
        Ok(Self { parent })
    }

    /// The parent entity's descriptor.
    pub fn parent(&self) -> &EntityDescriptor {
        &self.parent
    }

    fn alias(&self) -> String {
        quote_ident(&self.parent.table)
    }

    fn source(&self) -> String {
        format!(
            "{} {}",
            quote_qualified(HISTORY_SCHEMA, &self.parent.table),
            self.alias()
        )
    }

    fn pk(&self) -> String {
        quote_ident(&self.parent.primary_key)
    }

    /// The standard projection: system columns, the logical id aliased
    /// as `rid`, a per-row `as_of_time`, and the whole row as JSON.
    fn projection(&self) -> String {
        let t = self.alias();
        let pk = self.pk();
        format!(
            "{t}.\"hid\", {t}.{pk} AS \"rid\", {t}.\"valid_from\", {t}.\"valid_to\", \
             {t}.\"recorded_at\", LEAST({t}.\"valid_to\", {UTC_NOW}) AS \"as_of_time\", \
             to_jsonb({t}) AS \"data\""
        )
    }

    fn select(&self, tail: &str) -> String {
        format!("SELECT {} FROM {} {tail}", self.projection(), self.source())
    }

    /// The complete history of one logical record, oldest change first.
    pub async fn of(&self, pool: &PgPool, rid: i64) -> TemporalResult<Vec<HistoryRow>> {
        let t = self.alias();
        let sql = self.select(&format!(
            "WHERE {t}.{pk} = $1 ORDER BY {t}.\"recorded_at\", {t}.\"hid\"",
            pk = self.pk()
        ));
        Ok(sqlx::query_as(&sql).bind(rid).fetch_all(pool).await?)
    }

    /// The complete history of one record with a caller-supplied select
    /// list. When the list contains an aggregate, the implicit ordering
    /// and `as_of_time` projection are suppressed so the aggregate's
    /// shape survives.
    pub async fn of_with_select(
        &self,
        pool: &PgPool,
        rid: i64,
        select_list: &str,
    ) -> TemporalResult<Vec<JsonValue>> {
        let t = self.alias();
        let pk = self.pk();
        let inner = if contains_aggregate(select_list) {
            format!(
                "SELECT {select_list} FROM {} WHERE {t}.{pk} = $1",
                self.source()
            )
        } else {
            format!(
                "SELECT {select_list}, LEAST({t}.\"valid_to\", {UTC_NOW}) AS \"as_of_time\" \
                 FROM {} WHERE {t}.{pk} = $1 ORDER BY {t}.\"recorded_at\", {t}.\"hid\"",
                self.source()
            )
        };
        let sql = format!("SELECT to_jsonb(q) FROM ({inner}) q");
        Ok(sqlx::query_scalar(&sql).bind(rid).fetch_all(pool).await?)
    }

    /// The entire history table, read-only, in recording order.
    pub async fn all(&self, pool: &PgPool) -> TemporalResult<Vec<HistoryRow>> {
        let t = self.alias();
        let sql = self.select(&format!("ORDER BY {t}.\"recorded_at\", {t}.\"hid\""));
        Ok(sqlx::query_as(&sql).fetch_all(pool).await?)
    }

    /// The earliest version of a record.
    pub async fn first(&self, pool: &PgPool, rid: i64) -> TemporalResult<Option<HistoryRow>> {
        self.boundary(pool, rid, "ASC").await
    }

    /// The latest version of a record.
    pub async fn last(&self, pool: &PgPool, rid: i64) -> TemporalResult<Option<HistoryRow>> {
        self.boundary(pool, rid, "DESC").await
    }

    async fn boundary(
        &self,
        pool: &PgPool,
        rid: i64,
        direction: &str,
    ) -> TemporalResult<Option<HistoryRow>> {
        let t = self.alias();
        let sql = self.select(&format!(
            "WHERE {t}.{pk} = $1 ORDER BY {t}.\"valid_from\" {direction} LIMIT 1",
            pk = self.pk()
        ));
        Ok(sqlx::query_as(&sql).bind(rid).fetch_optional(pool).await?)
    }

    /// The version immediately preceding this one: adjacent on
    /// `valid_to = row.valid_from`. Nothing precedes a version whose
    /// validity starts at the canonical beginning.
    pub async fn pred(&self, pool: &PgPool, row: &HistoryRow) -> TemporalResult<Option<HistoryRow>> {
        if row.valid_from <= time::beginning_of_time() {
            return Ok(None);
        }
        let t = self.alias();
        let sql = self.select(&format!(
            "WHERE {t}.{pk} = $1 AND {t}.\"valid_to\" = $2 LIMIT 1",
            pk = self.pk()
        ));
        Ok(sqlx::query_as(&sql)
            .bind(row.rid)
            .bind(row.valid_from)
            .fetch_optional(pool)
            .await?)
    }

    /// The version immediately following this one: adjacent on
    /// `valid_from = row.valid_to`. The open current version has no
    /// successor.
    pub async fn succ(&self, pool: &PgPool, row: &HistoryRow) -> TemporalResult<Option<HistoryRow>> {
        if row.valid_to >= time::end_of_time() {
            return Ok(None);
        }
        let t = self.alias();
        let sql = self.select(&format!(
            "WHERE {t}.{pk} = $1 AND {t}.\"valid_from\" = $2 LIMIT 1",
            pk = self.pk()
        ));
        Ok(sqlx::query_as(&sql)
            .bind(row.rid)
            .bind(row.valid_to)
            .fetch_optional(pool)
            .await?)
    }

    /// The current live row of a record, if it still exists.
    pub async fn record(&self, pool: &PgPool, rid: i64) -> TemporalResult<Option<JsonValue>> {
        let t = self.alias();
        let sql = format!(
            "SELECT to_jsonb({t}) FROM {} {t} WHERE {t}.{} = $1",
            quote_qualified(PUBLIC_SCHEMA, &self.parent.table),
            self.pk(),
        );
        Ok(sqlx::query_scalar(&sql).bind(rid).fetch_optional(pool).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_defaults() {
        let entity = EntityDescriptor::new("foos");
        assert_eq!(entity.primary_key, "id");
        assert!(entity.default_scopes.is_empty());
    }

    #[test]
    fn destroy_is_refused() {
        let row = HistoryRow {
            hid: 7,
            rid: 1,
            valid_from: time::beginning_of_time(),
            valid_to: time::end_of_time(),
            recorded_at: time::beginning_of_time(),
            as_of_time: time::beginning_of_time(),
            data: JsonValue::Null,
        };
        assert!(matches!(row.destroy(), Err(TemporalError::ReadOnlyRecord)));
        assert_eq!(row.id(), 7);
        assert_eq!(row.rid(), 1);
        assert!(row.is_open());
    }
}
