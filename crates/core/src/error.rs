//! Error types shared across the chronopg engine.

use thiserror::Error;

/// Result type for engine operations.
pub type TemporalResult<T> = Result<T, TemporalError>;

/// Errors raised by the temporal engine.
///
/// DDL errors abort the enclosing transaction, undoing partial schema
/// changes; query-rewrite errors propagate to the caller without side
/// effects.
#[derive(Error, Debug)]
pub enum TemporalError {
    /// The backend is not PostgreSQL >= 9.0.
    #[error("Unsupported database: {0} (PostgreSQL >= 9.0 is required)")]
    UnsupportedDatabase(String),

    /// An entity was registered against a table whose physical layout is
    /// not temporal.
    #[error("Table '{0}' is not temporal")]
    NonTemporalTable(String),

    /// A temporal table was declared without a primary key.
    #[error("Temporal table '{0}' requires a primary key")]
    PrimaryKeyRequired(String),

    /// Input string did not match `YYYY-MM-DD HH:MM:SS[.ffffff]`.
    #[error("Malformed timestamp: '{0}'")]
    MalformedTimestamp(String),

    /// An amendment endpoint carried a non-UTC offset.
    #[error("Timestamp must be UTC: {0}")]
    NonUtcTimestamp(String),

    /// Delete attempt against a history row.
    #[error("History rows are read-only")]
    ReadOnlyRecord,

    /// Engine configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Database driver error.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl TemporalError {
    /// Create an unsupported-database error.
    pub fn unsupported_database(detail: impl Into<String>) -> Self {
        Self::UnsupportedDatabase(detail.into())
    }

    /// Create a non-temporal-table error.
    pub fn non_temporal_table(table: impl Into<String>) -> Self {
        Self::NonTemporalTable(table.into())
    }

    /// Create a malformed-timestamp error.
    pub fn malformed_timestamp(input: impl Into<String>) -> Self {
        Self::MalformedTimestamp(input.into())
    }

    /// Create a non-UTC-timestamp error.
    pub fn non_utc_timestamp(detail: impl Into<String>) -> Self {
        Self::NonUtcTimestamp(detail.into())
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}
