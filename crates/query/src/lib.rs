//! chronopg-query
//!
//! The time-machine layer over chronopg temporal tables: a relation
//! builder whose SQL emission rewrites temporal sources into
//! "history at T" CTEs, a history companion for navigating a record's
//! versions, and an enumerator of the instants at which an object graph
//! changed.
//!
//! Reads never touch the presentation views once a timestamp is in
//! play: the rewriter reads from `history.<table>` through a CTE named
//! after the logical table, and every joined table the temporal cache
//! knows gets its own CTE, so the whole object graph is reconstructed at
//! the requested instant.

#![warn(missing_docs)]

pub mod as_of;
pub mod history;
pub mod relation;
pub mod timeline;

pub use as_of::{AsOfQuery, AsOfScope, DefaultScope};
pub use history::{EntityDescriptor, HistoryEntity, HistoryRow};
pub use relation::{Join, JoinKind, Relation};
pub use timeline::{timestamps, Association, AssociationKind};
