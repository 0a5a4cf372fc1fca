//! Error taxonomy for the wkube dispatcher core.
//!
//! One variant per entry in the spec's error table. `is_retriable`
//! tells callers (the task-entry wrapper, the job launcher) which
//! failures are eligible for a local retry versus a hard failure that
//! must surface as `update_job_status(ERROR)`.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, DispatchError>;

#[derive(Error, Debug)]
pub enum DispatchError {
    /// Job spec violates an invariant (e.g. neither dockerfile nor base_stack).
    #[error("invalid job spec: {0}")]
    BadSpec(String),

    /// Git or S3 source fetch failed.
    #[error("failed to fetch source: {0}")]
    SourceFetch(String),

    /// External OCI build command exited non-zero.
    #[error("image build failed: {0}")]
    BuildFailed(String),

    /// External OCI push command exited non-zero.
    #[error("image push failed: {0}")]
    PushFailed(String),

    /// Job or Secret already existed at create time.
    #[error("conflict creating {kind} {name}")]
    Conflict { kind: &'static str, name: String },

    /// Pod stayed Pending past the retry bound.
    #[error("pod for job {0} stuck Pending")]
    PodPendingStuck(String),

    /// Pod phase settled on Failed.
    #[error("pod for job {0} failed")]
    PodFailed(String),

    /// More than one pod matched `job-name=<job_name>`.
    #[error("invariant violated: {0}")]
    Invariant(String),

    /// PVC entered the Lost phase.
    #[error("PVC {0} is lost")]
    InfrastructureLost(String),

    /// Control plane declared the job unhealthy mid-stream.
    #[error("job health lost")]
    HealthLost,

    /// Task executor delivered a soft-deadline signal.
    #[error("soft timeout")]
    SoftTimeout,

    /// Transient failure that the task registration should retry.
    #[error("retry needed: {0}")]
    RetryNeeded(String),

    /// Required environment configuration was missing or malformed.
    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("HTTP request error: {0}")]
    ReqwestError(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl DispatchError {
    /// Whether the task-level retry boundary should requeue the task.
    ///
    /// Mirrors the teacher's `Error::is_retriable()` used by its
    /// controller `error_policy`; here the caller is the task-entry
    /// wrapper rather than a `kube::runtime::Controller`.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            DispatchError::Conflict { .. }
                | DispatchError::PodPendingStuck(_)
                | DispatchError::PodFailed(_)
                | DispatchError::RetryNeeded(_)
        )
    }

    /// Short label identifying the error variant, used by the
    /// `wkube_dispatches_failed_total` metric (see `metrics.rs`).
    pub fn kind_label(&self) -> &'static str {
        match self {
            DispatchError::BadSpec(_) => "BadSpec",
            DispatchError::SourceFetch(_) => "SourceFetch",
            DispatchError::BuildFailed(_) => "BuildFailed",
            DispatchError::PushFailed(_) => "PushFailed",
            DispatchError::Conflict { .. } => "Conflict",
            DispatchError::PodPendingStuck(_) => "PodPendingStuck",
            DispatchError::PodFailed(_) => "PodFailed",
            DispatchError::Invariant(_) => "Invariant",
            DispatchError::InfrastructureLost(_) => "InfrastructureLost",
            DispatchError::HealthLost => "HealthLost",
            DispatchError::SoftTimeout => "SoftTimeout",
            DispatchError::RetryNeeded(_) => "RetryNeeded",
            DispatchError::ConfigError(_) => "ConfigError",
            DispatchError::KubeError(_) => "KubeError",
            DispatchError::ReqwestError(_) => "ReqwestError",
            DispatchError::IoError(_) => "IoError",
            DispatchError::SerializationError(_) => "SerializationError",
        }
    }
}
