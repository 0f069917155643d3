//! Run-state reconciliation for pipeline updates.
//!
//! Provides:
//! - `RunTree` - Stage / job / step tree seeded from a snapshot
//! - `RunStateReconciler` - Folds partial `pipeline_update` messages into the tree

pub mod reconciler;
pub mod tree;

pub use reconciler::{ApplyOutcome, Attachment, RunStateReconciler};
pub use tree::RunTree;
