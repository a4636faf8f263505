//! chronopg-core
//!
//! Core building blocks for the chronopg temporal engine: the error
//! taxonomy, UTC timestamp conversions, SQL identifier/literal quoting,
//! and the table/column/index specification types consumed by the schema
//! compiler.

#![warn(missing_docs)]

pub mod error;
pub mod quoting;
pub mod time;
pub mod types;

pub use error::{TemporalError, TemporalResult};
