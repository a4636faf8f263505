//! Administrative amendment of a history row's validity period.
//!
//! Intended for data migration. The engine does not re-validate the
//! interval beyond what PostgreSQL's constraints already enforce.

use chrono::{DateTime, FixedOffset, NaiveDateTime};
use sqlx::PgPool;
use tracing::debug;

use chronopg_core::quoting::quote_qualified;
use chronopg_core::{TemporalError, TemporalResult};

use crate::HISTORY_SCHEMA;

/// Validate that both endpoints are tagged UTC and strip the zone for
/// storage.
pub fn validate_period(
    valid_from: DateTime<FixedOffset>,
    valid_to: DateTime<FixedOffset>,
) -> TemporalResult<(NaiveDateTime, NaiveDateTime)> {
    for (field, instant) in [("valid_from", &valid_from), ("valid_to", &valid_to)] {
        if instant.offset().local_minus_utc() != 0 {
            return Err(TemporalError::non_utc_timestamp(format!(
                "{field} = {instant}"
            )));
        }
    }
    Ok((valid_from.naive_utc(), valid_to.naive_utc()))
}

/// Rewrite the `[valid_from, valid_to)` interval of the history row
/// identified by `hid`. Returns the number of rows touched (zero when no
/// such row exists).
pub async fn amend_period(
    pool: &PgPool,
    table: &str,
    hid: i64,
    valid_from: DateTime<FixedOffset>,
    valid_to: DateTime<FixedOffset>,
) -> TemporalResult<u64> {
    let (from, to) = validate_period(valid_from, valid_to)?;

    let sql = format!(
        "UPDATE {} SET \"valid_from\" = $1, \"valid_to\" = $2 WHERE \"hid\" = $3",
        quote_qualified(HISTORY_SCHEMA, table),
    );
    let result = sqlx::query(&sql)
        .bind(from)
        .bind(to)
        .bind(hid)
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        debug!(table, hid, "amendment matched no history row");
    }
    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn accepts_utc_endpoints() {
        let utc = FixedOffset::east_opt(0).unwrap();
        let from = utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let to = utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let (f, t) = validate_period(from, to).unwrap();
        assert!(f < t);
    }

    #[test]
    fn rejects_zoned_endpoints() {
        let utc = FixedOffset::east_opt(0).unwrap();
        let cet = FixedOffset::east_opt(3600).unwrap();
        let from = cet.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let to = utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        assert!(matches!(
            validate_period(from, to),
            Err(TemporalError::NonUtcTimestamp(_))
        ));
    }
}
