//! Job submission with conflict-retry, and pod-phase monitoring.
//!
//! Grounded on `dispatch_build_and_push.py`'s `launch_k8_job` /
//! `monitor_pod_status`: create the Job; on 409 Conflict, delete with
//! foreground propagation and retry once after a 5s sleep; after
//! creation, poll for exactly one pod with `job-name=<job_name>`; then
//! poll pod phase every 3s.

use std::time::Duration;

use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, ListParams, Preconditions, PostParams, PropagationPolicy};
use kube::Client;
use tracing::{info, warn};

use crate::error::{DispatchError, Result};

const POD_APPEARANCE_POLL: Duration = Duration::from_secs(5);
const POD_PHASE_POLL: Duration = Duration::from_secs(3);
const CONFLICT_RETRY_DELAY: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PodOutcome {
    Running,
    Succeeded,
    Failed,
}

fn foreground_delete_params() -> DeleteParams {
    DeleteParams {
        propagation_policy: Some(PropagationPolicy::Foreground),
        preconditions: Some(Preconditions::default()),
        ..Default::default()
    }
}

pub struct JobLauncher {
    client: Client,
    namespace: String,
}

impl JobLauncher {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    fn jobs(&self) -> Api<Job> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    /// Create the Job, retrying once on Conflict: delete the existing
    /// Job with foreground propagation, sleep 5s, recreate.
    pub async fn submit(&self, job: &Job) -> Result<()> {
        let name = job
            .metadata
            .name
            .clone()
            .ok_or_else(|| DispatchError::BadSpec("job manifest missing a name".to_string()))?;

        match self.jobs().create(&PostParams::default(), job).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 409 => {
                warn!(job_name = %name, "job already exists, deleting and retrying");
                self.jobs()
                    .delete(&name, &foreground_delete_params())
                    .await
                    .map_err(DispatchError::KubeError)?;
                tokio::time::sleep(CONFLICT_RETRY_DELAY).await;
                self.jobs()
                    .create(&PostParams::default(), job)
                    .await
                    .map_err(DispatchError::KubeError)?;
                Ok(())
            }
            Err(e) => Err(DispatchError::KubeError(e)),
        }
    }

    /// Poll for pods labeled `job-name=<job_name>` until exactly one
    /// appears; fail with `Invariant` if more than one is ever seen.
    pub async fn wait_for_single_pod(&self, job_name: &str) -> Result<String> {
        let lp = ListParams::default().labels(&format!("job-name={job_name}"));
        loop {
            let list = self.pods().list(&lp).await?;
            match list.items.len() {
                0 => tokio::time::sleep(POD_APPEARANCE_POLL).await,
                1 => {
                    return list.items[0]
                        .metadata
                        .name
                        .clone()
                        .ok_or_else(|| DispatchError::Invariant("pod has no name".to_string()))
                }
                n => {
                    return Err(DispatchError::Invariant(format!(
                        "expected exactly one pod for job {job_name}, found {n}"
                    )))
                }
            }
        }
    }

    /// Poll the pod's phase every 3s. Resolves on `Running` or
    /// `Succeeded`; on `Failed`, deletes the Job (foreground) and
    /// returns `PodFailed` so the caller can schedule a task-level
    /// retry. `Pending` is tolerated indefinitely — the cluster's
    /// `activeDeadlineSeconds` is the only bound.
    pub async fn monitor(&self, job_name: &str, pod_name: &str) -> Result<PodOutcome> {
        loop {
            let pod = self.pods().get(pod_name).await?;
            let phase = pod
                .status
                .as_ref()
                .and_then(|s| s.phase.as_deref())
                .unwrap_or("Pending");
            match phase {
                "Running" => return Ok(PodOutcome::Running),
                "Succeeded" => return Ok(PodOutcome::Succeeded),
                "Failed" => {
                    info!(job_name, pod_name, "pod failed, deleting job");
                    self.jobs()
                        .delete(job_name, &foreground_delete_params())
                        .await
                        .map_err(DispatchError::KubeError)?;
                    return Err(DispatchError::PodFailed(job_name.to_string()));
                }
                _ => tokio::time::sleep(POD_PHASE_POLL).await,
            }
        }
    }

    /// Fetch the logs of the pod's main container, surfaced to the log
    /// stream on a Failed phase per §4.3.
    pub async fn pod_logs(&self, pod_name: &str, container: &str) -> Result<String> {
        let params = kube::api::LogParams {
            container: Some(container.to_string()),
            ..Default::default()
        };
        Ok(self.pods().logs(pod_name, &params).await?)
    }

    pub async fn delete_job(&self, job_name: &str) -> Result<()> {
        match self.jobs().delete(job_name, &foreground_delete_params()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(DispatchError::KubeError(e)),
        }
    }
}
