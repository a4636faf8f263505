//! chronopg-sql
//!
//! The temporal schema layer: given ordinary table-definition operations,
//! the compiler in this crate emits a coordinated set of PostgreSQL
//! objects — a current-state table under the `temporal` schema, an
//! inherited history table under the `history` schema, a presentation
//! view under `public`, and three INSTEAD rewrite rules — that together
//! implement bitemporal SCD Type-2 semantics at the storage layer.
//!
//! # Physical layout
//!
//! For a logical table `foos`:
//! - `temporal.foos` — current state, owns the primary-key sequence
//! - `history.foos` — INHERITS `temporal.foos`, adds `hid`, `valid_from`,
//!   `valid_to`, `recorded_at`, a timeline CHECK and a GiST exclusion
//!   constraint forbidding overlapping validity for the same record
//! - `public.foos` — `SELECT * FROM ONLY temporal.foos`, with INSTEAD
//!   rules rewriting INSERT/UPDATE/DELETE into coordinated writes
//!
//! Writes against the view close the open history row
//! (`valid_to = now()`) before inserting the replacement; `now()` is
//! evaluated once per statement, so the closed row's `valid_to` equals
//! the new row's `valid_from` and the half-open intervals tile with no
//! gap.

#![warn(missing_docs)]

pub mod amend;
pub mod cache;
pub mod compiler;
pub mod connection;
pub mod ddl;
pub mod observe;
pub mod router;

pub use cache::TemporalCache;
pub use compiler::SchemaCompiler;
pub use connection::{ConnectOptions, TemporalEngine};
pub use router::{Nesting, SchemaRouter};

/// Schema holding the current-state tables.
pub const TEMPORAL_SCHEMA: &str = "temporal";

/// Schema holding the versioned history tables.
pub const HISTORY_SCHEMA: &str = "history";

/// Schema holding the presentation views (and non-temporal tables).
pub const PUBLIC_SCHEMA: &str = "public";
