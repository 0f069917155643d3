//! Pipeline run tree.

use pulsewire_core::{PipelineSnapshot, RunNode};
use serde::{Deserialize, Serialize};

/// Stage / job / step tree of one pipeline run.
///
/// Nodes are addressed by name at each level. When a level holds two nodes
/// with the same name, lookups resolve to the first one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunTree {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(default)]
    pub stages: Vec<RunNode>,
}

impl RunTree {
    #[must_use]
    pub fn from_snapshot(snapshot: PipelineSnapshot) -> Self {
        Self {
            run_id: snapshot.run_id,
            stages: snapshot.stages,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    #[must_use]
    pub fn stage(&self, name: &str) -> Option<&RunNode> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Node at `stage`, `stage/job` or `stage/job/step`.
    ///
    /// A step is only looked up when a job is given.
    #[must_use]
    pub fn find(&self, stage: &str, job: Option<&str>, step: Option<&str>) -> Option<&RunNode> {
        let stage = self.stage(stage)?;
        let Some(job) = job else {
            return Some(stage);
        };
        let job = stage.child(job)?;
        match step {
            Some(step) => job.child(step),
            None => Some(job),
        }
    }

    pub(crate) fn find_mut(
        &mut self,
        stage: &str,
        job: Option<&str>,
        step: Option<&str>,
    ) -> Option<&mut RunNode> {
        let stage = self.stages.iter_mut().find(|s| s.name == stage)?;
        let Some(job) = job else {
            return Some(stage);
        };
        let job = stage.child_mut(job)?;
        match step {
            Some(step) => job.child_mut(step),
            None => Some(job),
        }
    }
}
