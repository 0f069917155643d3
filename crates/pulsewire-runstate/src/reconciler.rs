//! Folds partial pipeline updates into a run tree.
//!
//! Updates address one node by `(stage, job?, step?)` display names and carry
//! only the fields that changed. The tree's shape comes from a
//! `pipeline_snapshot`; updates never add or remove nodes, and updates for
//! names the tree does not know are dropped.

use std::sync::{Arc, PoisonError, RwLock};

use chrono::DateTime;
use pulsewire_core::{
    Message, Payload, PipelineSnapshot, PipelineUpdate, Registry, RunNode, RunStatus,
    Subscription,
};
use tokio::sync::watch;

use crate::tree::RunTree;

/// Result of applying one update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The addressed node was updated.
    Applied,
    /// No node matches the update's names.
    Unmatched,
    /// The update belongs to a different run than the seeded tree.
    ForeignRun,
}

/// Shared run-state reconciler.
///
/// Cloning yields another handle to the same tree. Every applied change
/// bumps a revision counter observers can watch.
#[derive(Debug, Clone)]
pub struct RunStateReconciler {
    tree: Arc<RwLock<RunTree>>,
    revision: Arc<watch::Sender<u64>>,
}

impl Default for RunStateReconciler {
    fn default() -> Self {
        Self::new()
    }
}

impl RunStateReconciler {
    /// Create a reconciler with an empty tree.
    #[must_use]
    pub fn new() -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            tree: Arc::new(RwLock::new(RunTree::default())),
            revision: Arc::new(revision),
        }
    }

    /// Replace the whole tree with `snapshot`.
    pub fn seed(&self, snapshot: PipelineSnapshot) {
        let tree = RunTree::from_snapshot(snapshot);
        tracing::debug!(run_id = ?tree.run_id, stages = tree.stages.len(), "Seeding run tree");
        *self.tree.write().unwrap_or_else(PoisonError::into_inner) = tree;
        self.bump();
    }

    /// Merge one update into the tree.
    pub fn apply(&self, update: &PipelineUpdate) -> ApplyOutcome {
        let outcome = {
            let mut tree = self.tree.write().unwrap_or_else(PoisonError::into_inner);
            if let (Some(seeded), Some(run)) = (&tree.run_id, &update.run_id) {
                if seeded != run {
                    tracing::debug!(
                        seeded = %seeded,
                        run = %run,
                        "Dropping update for another run"
                    );
                    return ApplyOutcome::ForeignRun;
                }
            }
            if update.step.is_some() && update.job.is_none() {
                ApplyOutcome::Unmatched
            } else {
                match tree.find_mut(&update.stage, update.job.as_deref(), update.step.as_deref()) {
                    Some(node) => {
                        merge(node, update);
                        ApplyOutcome::Applied
                    }
                    None => ApplyOutcome::Unmatched,
                }
            }
        };

        if outcome == ApplyOutcome::Applied {
            self.bump();
        } else {
            tracing::debug!(
                stage = %update.stage,
                job = ?update.job,
                step = ?update.step,
                "Dropping update for unknown node"
            );
        }
        outcome
    }

    /// Decode and apply a `pipeline_update` or `pipeline_snapshot` message.
    /// Other message types are ignored and report `Unmatched`.
    ///
    /// # Errors
    /// Returns error if the payload does not match the message type.
    pub fn apply_message(&self, message: &Message) -> Result<ApplyOutcome, serde_json::Error> {
        match message.kind.as_str() {
            kind if kind == PipelineUpdate::TYPE => Ok(self.apply(&message.decode_payload()?)),
            kind if kind == PipelineSnapshot::TYPE => {
                self.seed(message.decode_payload()?);
                Ok(ApplyOutcome::Applied)
            }
            _ => Ok(ApplyOutcome::Unmatched),
        }
    }

    /// Feed snapshots and updates dispatched by `registry` into this
    /// reconciler until the returned attachment is dropped.
    pub fn attach(&self, registry: &Registry) -> Attachment {
        let reconciler = self.clone();
        let snapshots = registry
            .subscribe_typed::<PipelineSnapshot, _>(move |snapshot| reconciler.seed(snapshot));
        let reconciler = self.clone();
        let updates = registry.subscribe_typed::<PipelineUpdate, _>(move |update| {
            reconciler.apply(&update);
        });
        Attachment {
            _snapshots: snapshots,
            _updates: updates,
        }
    }

    /// Copy of the current tree.
    #[must_use]
    pub fn snapshot(&self) -> RunTree {
        self.tree
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Copy of one node.
    #[must_use]
    pub fn node(&self, stage: &str, job: Option<&str>, step: Option<&str>) -> Option<RunNode> {
        self.tree
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .find(stage, job, step)
            .cloned()
    }

    /// Number of changes applied so far, seeds included.
    #[must_use]
    pub fn revision(&self) -> u64 {
        *self.revision.borrow()
    }

    /// Receiver notified after every applied change.
    #[must_use]
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    fn bump(&self) {
        self.revision.send_modify(|r| *r += 1);
    }
}

/// Registry subscriptions held by an attached reconciler.
#[must_use = "dropping the attachment detaches the reconciler"]
#[derive(Debug)]
pub struct Attachment {
    _snapshots: Subscription,
    _updates: Subscription,
}

fn merge(node: &mut RunNode, update: &PipelineUpdate) {
    let was_running = node.status == RunStatus::Running;
    if let Some(status) = update.status {
        node.status = status;
    }
    if let Some(start) = &update.start_time {
        node.start_time = Some(start.clone());
    }
    if let Some(end) = &update.end_time {
        node.end_time = Some(end.clone());
    }

    if let Some(progress) = update.progress {
        let progress = progress.min(100);
        // Progress only moves forward within one running period.
        node.progress = if was_running && node.status == RunStatus::Running {
            node.progress.max(progress)
        } else {
            progress
        };
    }

    if node.status.is_terminal() {
        node.progress = 100;
    }

    if let Some(duration) = update.duration {
        node.duration = Some(duration);
    } else if node.status.is_terminal() {
        if let Some(derived) = elapsed_seconds(node.start_time.as_deref(), node.end_time.as_deref())
        {
            node.duration = Some(derived);
        }
    }
}

fn elapsed_seconds(start: Option<&str>, end: Option<&str>) -> Option<u64> {
    let start = DateTime::parse_from_rfc3339(start?).ok()?;
    let end = DateTime::parse_from_rfc3339(end?).ok()?;
    u64::try_from((end - start).num_seconds()).ok()
}
