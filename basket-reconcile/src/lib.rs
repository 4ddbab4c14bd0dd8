//! BASKET Reconcile
//!
//! Pure functions that fold a fresh scrape into the cached product set for
//! a query and decide whether the result differs enough to push to clients.
//! No I/O and no clock: callers pass `now`.

mod matching;
pub mod merge;
pub mod rebuild;
pub mod sort;

pub use merge::{merge, reconcile, ReconcileOutcome, Reconciliation};
pub use rebuild::{should_rebuild, RebuildDecision, RebuildReason};
pub use sort::sort_by_price;
