//! wkube-dispatcher: image-build, PVC, and job-dispatch engine for the
//! wkube task executor.
//!
//! This crate owns everything between "a job spec arrived" and "a pod
//! is running with an agent-puller image and the control plane knows
//! about it": deterministic image materialization and builds, PVC
//! lifecycle, job manifest assembly and launch, pod-status monitoring,
//! remote log capture, and the periodic reconciliation loops that keep
//! the cluster's PVCs and the control plane's job bookkeeping in sync.
//!
//! The task executor/broker that decides *which* jobs to dispatch and
//! *when* is out of scope; this crate exposes [`dispatch::dispatch`] as
//! the entry point such a caller would invoke per job.

pub mod config;
pub mod control_plane;
pub mod dispatch;
pub mod error;
pub mod event_watcher;
pub mod image;
pub mod job;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod model;
pub mod periodic;
pub mod pvc;
#[cfg(feature = "rest-api")]
pub mod rest_api;
pub mod streamer;
pub mod task_entry;
pub mod telemetry;
pub mod worker_pool;

pub use crate::config::DispatcherConfig;
pub use crate::dispatch::dispatch;
pub use crate::error::{DispatchError, Result};
