//! Typed application payloads.
//!
//! The envelope keeps the payload as raw JSON so unknown message types still
//! flow through the registry. Consumers that know a type decode it through
//! [`Payload`] or match on [`AppMessage`].

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;

use crate::message::Message;

/// A payload bound to one message type.
pub trait Payload: Serialize + DeserializeOwned {
    /// Wire `type` carrying this payload.
    const TYPE: &'static str;

    /// Wrap this payload in an unstamped envelope.
    ///
    /// # Errors
    /// Returns error if serialization fails.
    fn to_message(&self) -> Result<Message, serde_json::Error> {
        Message::from_payload(Self::TYPE, self)
    }
}

/// Status of a run node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    #[default]
    Pending,
    Running,
    Success,
    Failure,
    Cancelled,
}

impl RunStatus {
    /// No further progress is expected once a node reaches a terminal status.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failure | Self::Cancelled)
    }
}

/// One node of a run tree: a stage, a job or a step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunNode {
    pub name: String,
    #[serde(default)]
    pub status: RunStatus,
    /// Percent complete, 0 to 100.
    #[serde(default, deserialize_with = "progress::deserialize")]
    pub progress: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<String>,
    /// Seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
    #[serde(default, alias = "jobs", alias = "steps")]
    pub children: Vec<RunNode>,
}

impl RunNode {
    /// Create a pending node without children.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Builder helper for snapshots and tests.
    #[must_use]
    pub fn with_children(mut self, children: Vec<Self>) -> Self {
        self.children = children;
        self
    }

    /// First child with the given name.
    #[must_use]
    pub fn child(&self, name: &str) -> Option<&Self> {
        self.children.iter().find(|c| c.name == name)
    }

    /// Mutable variant of [`RunNode::child`].
    pub fn child_mut(&mut self, name: &str) -> Option<&mut Self> {
        self.children.iter_mut().find(|c| c.name == name)
    }
}

/// Incremental status change for one node of a pipeline run.
///
/// `stage` is always present; `job` and `step` narrow the target.
/// Absent fields leave the node's current value untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    pub stage: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<RunStatus>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "progress::deserialize_option"
    )]
    pub progress: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
}

impl PipelineUpdate {
    /// Stage-level update.
    #[must_use]
    pub fn stage(stage: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            ..Self::default()
        }
    }

    /// Narrow the target to a job of the stage.
    #[must_use]
    pub fn job(mut self, job: impl Into<String>) -> Self {
        self.job = Some(job.into());
        self
    }

    /// Narrow the target to a step of the job.
    #[must_use]
    pub fn step(mut self, step: impl Into<String>) -> Self {
        self.step = Some(step.into());
        self
    }

    #[must_use]
    pub fn status(mut self, status: RunStatus) -> Self {
        self.status = Some(status);
        self
    }

    #[must_use]
    pub fn progress(mut self, progress: u8) -> Self {
        self.progress = Some(progress);
        self
    }
}

impl Payload for PipelineUpdate {
    const TYPE: &'static str = "pipeline_update";
}

/// Full shape of a pipeline run, used to seed a reconciler.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineSnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(default)]
    pub stages: Vec<RunNode>,
}

impl Payload for PipelineSnapshot {
    const TYPE: &'static str = "pipeline_snapshot";
}

/// A single infrastructure measurement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InfraMetric {
    pub host: String,
    pub metric: String,
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

impl Payload for InfraMetric {
    const TYPE: &'static str = "infrastructure_update";
}

/// A repository event such as a push or merge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitActivity {
    pub repository: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Payload for GitActivity {
    const TYPE: &'static str = "git_activity";
}

/// Lenient percent decoding: any JSON number is rounded and clamped to
/// 0..=100, so a fractional or out-of-range progress never rejects the rest
/// of the payload.
mod progress {
    use serde::{Deserialize, Deserializer};

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub(super) fn clamp(value: f64) -> u8 {
        if value.is_nan() {
            return 0;
        }
        // Clamped into 0..=100 before the cast.
        value.round().clamp(0.0, 100.0) as u8
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u8, D::Error> {
        f64::deserialize(deserializer).map(clamp)
    }

    pub(super) fn deserialize_option<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<u8>, D::Error> {
        Ok(Option::<f64>::deserialize(deserializer)?.map(clamp))
    }
}

/// Application messages keyed by their wire type.
#[derive(Debug, Clone, PartialEq)]
pub enum AppMessage {
    PipelineUpdate(PipelineUpdate),
    PipelineSnapshot(PipelineSnapshot),
    InfrastructureUpdate(InfraMetric),
    GitActivity(GitActivity),
    /// A type this crate has no schema for, passed through untouched.
    Other { kind: String, payload: Value },
}

impl AppMessage {
    /// Decode the envelope into its typed variant.
    ///
    /// # Errors
    /// Returns error if a known type carries a payload of the wrong shape.
    pub fn decode(message: &Message) -> Result<Self, serde_json::Error> {
        Ok(match message.kind.as_str() {
            PipelineUpdate::TYPE => Self::PipelineUpdate(message.decode_payload()?),
            PipelineSnapshot::TYPE => Self::PipelineSnapshot(message.decode_payload()?),
            InfraMetric::TYPE => Self::InfrastructureUpdate(message.decode_payload()?),
            GitActivity::TYPE => Self::GitActivity(message.decode_payload()?),
            other => Self::Other {
                kind: other.to_string(),
                payload: message.payload.clone(),
            },
        })
    }

    /// Wire type of this message.
    #[must_use]
    pub fn kind(&self) -> &str {
        match self {
            Self::PipelineUpdate(_) => PipelineUpdate::TYPE,
            Self::PipelineSnapshot(_) => PipelineSnapshot::TYPE,
            Self::InfrastructureUpdate(_) => InfraMetric::TYPE,
            Self::GitActivity(_) => GitActivity::TYPE,
            Self::Other { kind, .. } => kind,
        }
    }

    /// Convert back into an unstamped envelope.
    ///
    /// # Errors
    /// Returns error if serialization fails.
    pub fn into_message(self) -> Result<Message, serde_json::Error> {
        match self {
            Self::PipelineUpdate(p) => p.to_message(),
            Self::PipelineSnapshot(p) => p.to_message(),
            Self::InfrastructureUpdate(p) => p.to_message(),
            Self::GitActivity(p) => p.to_message(),
            Self::Other { kind, payload } => Ok(Message::new(kind, payload)),
        }
    }
}
