//! Local Nix store support for cachenix
//!
//! Keeps the store database consistent across a cache restore by merging
//! snapshots taken before and after extraction, and bounds the store size
//! with a garbage collection trigger.

#![expect(
    clippy::missing_errors_doc,
    reason = "Error documentation to be added incrementally"
)]

pub mod database;
pub mod error;
pub mod gc;
pub mod merge;
pub mod reconcile;

pub use database::{DEFAULT_STORE_DB, StoreDatabase, integrity_check};
pub use error::{Result, StoreError};
pub use gc::{GcOutcome, NixStoreCli, StoreCollector, collect_garbage, parse_gc_max};
pub use merge::{MergeStats, STORE_SCHEMA, merge_snapshots};
pub use reconcile::{PendingMerge, Reconciler};
