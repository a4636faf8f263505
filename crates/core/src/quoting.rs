//! SQL identifier and literal quoting.
//!
//! Every identifier and literal the engine splices into generated SQL
//! passes through these helpers; no caller-supplied text is concatenated
//! raw.

use chrono::{DateTime, NaiveDateTime, Utc};

use crate::time;

/// Quote a schema, table or column name as a PostgreSQL identifier.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote a `schema.name` pair.
pub fn quote_qualified(schema: &str, name: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(name))
}

/// Quote a string value as a PostgreSQL literal.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Quote a UTC instant as a literal in the canonical microsecond form.
pub fn quote_timestamp(instant: DateTime<Utc>) -> String {
    quote_literal(&time::format_utc(instant))
}

/// Quote a zone-less stored instant as a literal.
pub fn quote_naive_timestamp(instant: NaiveDateTime) -> String {
    quote_literal(&time::format_naive(instant))
}
