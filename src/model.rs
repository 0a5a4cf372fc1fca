//! Wire data model for a dispatch: job specs, build/source descriptors,
//! status, PVC phases, and outbound event records.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One asynchronous job submission, as handed to the Task Dispatcher.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobSpec {
    pub job_id: String,
    pub job_name: String,
    pub job_token: String,
    pub source: SourceDescriptor,
    pub build: BuildDescriptor,
    pub resources: ResourceRequest,
    pub pvc_id: String,
    #[serde(default)]
    pub first_pipeline_step: bool,
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub conf: BTreeMap<String, String>,
    #[serde(default)]
    pub secrets: BTreeMap<String, String>,
    #[serde(default)]
    pub force_build: bool,
    pub command: String,
}

/// Either a git remote pinned to a ref, or an object-store archive.
///
/// The wire shape carries a single `source_url` string; the scheme
/// prefix `s3accjobstore://` selects the S3 variant, matching the
/// original's `git_repo.startswith("s3accjobstore://")` dispatch.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceDescriptor {
    Git { url: String, git_ref: String },
    S3 { object_store_url: String },
}

pub const S3_SCHEME_PREFIX: &str = "s3accjobstore://";

impl SourceDescriptor {
    pub fn parse(source_url: &str, git_ref: &str) -> Self {
        if let Some(rest) = source_url.strip_prefix(S3_SCHEME_PREFIX) {
            SourceDescriptor::S3 {
                object_store_url: rest.to_string(),
            }
        } else {
            SourceDescriptor::Git {
                url: source_url.to_string(),
                git_ref: git_ref.to_string(),
            }
        }
    }

    /// The raw string used for tag normalization and fetch dispatch.
    pub fn raw_url(&self) -> &str {
        match self {
            SourceDescriptor::Git { url, .. } => url,
            SourceDescriptor::S3 { object_store_url } => object_store_url,
        }
    }

    pub fn git_ref(&self) -> Option<&str> {
        match self {
            SourceDescriptor::Git { git_ref, .. } => Some(git_ref),
            SourceDescriptor::S3 { .. } => None,
        }
    }
}

/// Exactly one of `dockerfile` or `base_stack` must be set — enforced
/// by the builder (see `image::builder`), not by this shape, because
/// the wire format mirrors the original's two independently-optional
/// kwargs.
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct BuildDescriptor {
    pub dockerfile: Option<String>,
    pub base_stack: Option<BaseStack>,
}

/// Closed enumeration of predefined Dockerfile templates.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum BaseStack {
    #[serde(rename = "PYTHON3_7")]
    Python37,
    #[serde(rename = "R4_4")]
    R44,
    #[serde(rename = "GAMS40_1__R4_0")]
    Gams401R40,
}

impl BaseStack {
    /// The suffix of `Dockerfile.<suffix>` in the predefined-stacks template dir.
    pub fn template_suffix(&self) -> &'static str {
        match self {
            BaseStack::Python37 => "PYTHON3_7",
            BaseStack::R44 => "R4_4",
            BaseStack::Gams401R40 => "GAMS40_1__R4_0",
        }
    }
}

impl fmt::Display for BaseStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.template_suffix())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub memory: String,
    pub cpu: String,
    pub ephemeral_storage: String,
    pub workflow_storage: String,
    pub timeout_sec: i64,
}

/// Finite job-status set, transitions explicit at known program points.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobStatus {
    Preparing,
    Processing,
    Done,
    Error,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Preparing => "PREPARING",
            JobStatus::Processing => "PROCESSING",
            JobStatus::Done => "DONE",
            JobStatus::Error => "ERROR",
        }
    }
}

/// PVC phases traversed during its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PvcPhase {
    Absent,
    Pending,
    Bound,
    Released,
    Lost,
}

impl PvcPhase {
    pub fn from_k8s_phase(phase: Option<&str>) -> Self {
        match phase {
            Some("Bound") => PvcPhase::Bound,
            Some("Lost") => PvcPhase::Lost,
            Some("Released") => PvcPhase::Released,
            Some(_) | None => PvcPhase::Pending,
        }
    }
}

/// One durable log chunk handed to the control plane.
#[derive(Clone, Debug)]
pub struct LogChunk {
    pub filename: String,
    pub bytes: Vec<u8>,
}

/// Outbound cluster-event payload posted to the control-plane webhook.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventRecord {
    pub timestamp: DateTime<Utc>,
    pub uid: String,
    pub reason: String,
    pub message: String,
    pub kind: String,
    pub involved_object_name: String,
    pub task_id: String,
}

impl EventRecord {
    /// Derive `task_id` from the involved object's kind/name, or `None`
    /// if the kind isn't one that carries a meaningful task identity.
    ///
    /// Pod names are `<task_id>-<suffix>`; Job names are the task id
    /// itself; anything else is dropped.
    pub fn derive_task_id(kind: &str, involved_object_name: &str) -> Option<String> {
        match kind {
            "Pod" => involved_object_name
                .rsplit_once('-')
                .map(|(prefix, _suffix)| prefix.to_string()),
            "Job" => Some(involved_object_name.to_string()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_descriptor_detects_s3_scheme() {
        let s = SourceDescriptor::parse("s3accjobstore://bucket/archive.zip", "ignored");
        assert_eq!(
            s,
            SourceDescriptor::S3 {
                object_store_url: "bucket/archive.zip".to_string()
            }
        );
    }

    #[test]
    fn source_descriptor_detects_git() {
        let s = SourceDescriptor::parse("https://git.example/org/repo.git", "v1.2.3");
        assert_eq!(
            s,
            SourceDescriptor::Git {
                url: "https://git.example/org/repo.git".to_string(),
                git_ref: "v1.2.3".to_string(),
            }
        );
    }

    #[test]
    fn pod_task_id_strips_final_suffix() {
        assert_eq!(
            EventRecord::derive_task_id("Pod", "abc-xyz-randsuffix"),
            Some("abc-xyz".to_string())
        );
    }

    #[test]
    fn job_task_id_is_the_name() {
        assert_eq!(
            EventRecord::derive_task_id("Job", "task-123"),
            Some("task-123".to_string())
        );
    }

    #[test]
    fn other_kinds_are_dropped() {
        assert_eq!(EventRecord::derive_task_id("ConfigMap", "whatever"), None);
    }
}
