//! PVC lifecycle management: create, wait-bound, delete, and orphan
//! classification for the periodic sweep.
//!
//! Grounded on the teacher's `controller::resources::{ensure_pvc,
//! delete_pvc}` (`get`-then-create-on-404, delete-tolerating-404
//! pattern) and on spec.md §4.2 / `periodic_tasks.py`'s
//! `delete_orphan_pvcs` for the orphan-sweep semantics.

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::time::Duration;

use futures::TryStreamExt;
use k8s_openapi::api::core::v1::{Pod, PersistentVolumeClaim, PersistentVolumeClaimSpec};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams, Preconditions, PropagationPolicy};
use kube::Client;
use serde_json::json;
use tracing::{info, warn};

use crate::error::{DispatchError, Result};
use crate::model::PvcPhase;

pub struct PvcManager {
    client: Client,
    namespace: String,
}

impl PvcManager {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    fn api(&self) -> Api<PersistentVolumeClaim> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    pub async fn get(&self, pvc_id: &str) -> Result<Option<PersistentVolumeClaim>> {
        match self.api().get(pvc_id).await {
            Ok(pvc) => Ok(Some(pvc)),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(None),
            Err(e) => Err(DispatchError::KubeError(e)),
        }
    }

    pub async fn create(&self, pvc_id: &str, size: &str, storage_class: Option<&str>) -> Result<()> {
        let mut requests = BTreeMap::new();
        requests.insert("storage".to_string(), Quantity(size.to_string()));

        let pvc = PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(pvc_id.to_string()),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                storage_class_name: storage_class.map(str::to_string),
                resources: Some(k8s_openapi::api::core::v1::VolumeResourceRequirements {
                    requests: Some(requests),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            status: None,
        };

        self.api().create(&PostParams::default(), &pvc).await?;
        Ok(())
    }

    /// Finalizer-safe delete: patch `metadata.finalizers=null`, then
    /// delete with `gracePeriodSeconds=0`. Errors are logged, never
    /// propagated — callers (the periodic sweep) treat this as
    /// best-effort.
    pub async fn delete(&self, pvc_id: &str) {
        let api = self.api();
        let patch = json!({ "metadata": { "finalizers": null } });
        if let Err(e) = api
            .patch(pvc_id, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            if !matches!(&e, kube::Error::Api(a) if a.code == 404) {
                warn!(pvc_id, error = %e, "failed to clear PVC finalizers");
            }
        }

        let dp = DeleteParams {
            grace_period_seconds: Some(0),
            ..Default::default()
        };
        match api.delete(pvc_id, &dp).await {
            Ok(_) => info!(pvc_id, "deleted PVC"),
            Err(kube::Error::Api(e)) if e.code == 404 => {}
            Err(e) => warn!(pvc_id, error = %e, "failed to delete PVC"),
        }
    }

    /// Poll until the PVC is absent (used by the first-pipeline-step
    /// delete-before-recreate path).
    pub async fn wait_absent(&self, pvc_id: &str, poll: Duration) -> Result<()> {
        loop {
            if self.get(pvc_id).await?.is_none() {
                return Ok(());
            }
            tokio::time::sleep(poll).await;
        }
    }

    /// Poll `.status.phase` until `Bound`; `Lost` fails with
    /// `InfrastructureLost`. No total timeout — the caller bounds this
    /// with its own cancellation (the job's `activeDeadlineSeconds`).
    pub async fn wait_bound(&self, pvc_id: &str, poll: Duration) -> Result<()> {
        loop {
            let pvc = self
                .get(pvc_id)
                .await?
                .ok_or_else(|| DispatchError::Invariant(format!("PVC {pvc_id} disappeared while waiting for Bound")))?;
            let phase = pvc.status.as_ref().and_then(|s| s.phase.as_deref());
            match PvcPhase::from_k8s_phase(phase) {
                PvcPhase::Bound => return Ok(()),
                PvcPhase::Lost => return Err(DispatchError::InfrastructureLost(pvc_id.to_string())),
                _ => tokio::time::sleep(poll).await,
            }
        }
    }

    /// Names of every PVC currently referenced by a pod's
    /// `persistentVolumeClaim.claimName`, regardless of pod phase.
    pub async fn bound_claim_names(&self) -> Result<HashSet<String>> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
        let list = pods.list(&ListParams::default()).await?;
        let mut names = HashSet::new();
        for pod in list.items {
            if let Some(spec) = pod.spec {
                for volume in spec.volumes.unwrap_or_default() {
                    if let Some(claim) = volume.persistent_volume_claim {
                        names.insert(claim.claim_name);
                    }
                }
            }
        }
        Ok(names)
    }

    pub async fn list_all_names(&self) -> Result<Vec<String>> {
        let list = self.api().list(&ListParams::default()).await?;
        Ok(list.items.into_iter().filter_map(|p| p.metadata.name).collect())
    }

    /// Delete the pod(s) still referencing `pvc_id`, foreground
    /// propagation, before the PVC itself is removed.
    pub async fn delete_referencing_pods(&self, pvc_id: &str) -> Result<()> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
        let list = pods.list(&ListParams::default()).await?;
        let dp = DeleteParams {
            propagation_policy: Some(PropagationPolicy::Foreground),
            preconditions: Some(Preconditions::default()),
            ..Default::default()
        };
        for pod in list.items {
            let references = pod
                .spec
                .as_ref()
                .and_then(|s| s.volumes.as_ref())
                .map(|vs| {
                    vs.iter()
                        .any(|v| v.persistent_volume_claim.as_ref().map(|c| c.claim_name.as_str()) == Some(pvc_id))
                })
                .unwrap_or(false);
            if references {
                if let Some(name) = pod.metadata.name {
                    let _ = pods.delete(&name, &dp).await;
                }
            }
        }
        Ok(())
    }
}

/// Candidates for the orphan sweep: every PVC not referenced by any
/// pod (see Open Question 1 resolution in DESIGN.md — "bound to a
/// non-Running pod" is folded into "candidate", not excluded).
pub fn orphan_candidates(all_names: &[String], bound: &HashSet<String>) -> Vec<String> {
    all_names
        .iter()
        .filter(|n| !bound.contains(n.as_str()))
        .cloned()
        .collect()
}

/// Submit candidates to the control plane's pending-filter RPC in
/// batches of 500, returning the full pending set across all batches.
pub async fn filter_pending_in_batches<F, Fut>(candidates: &[String], mut filter: F) -> Result<HashSet<String>>
where
    F: FnMut(Vec<String>) -> Fut,
    Fut: std::future::Future<Output = Result<Vec<String>>>,
{
    let mut pending = HashSet::new();
    for batch in candidates.chunks(500) {
        let still_pending = filter(batch.to_vec()).await?;
        pending.extend(still_pending);
    }
    Ok(pending)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orphan_candidates_excludes_bound() {
        let all = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let mut bound = HashSet::new();
        bound.insert("a".to_string());
        let candidates = orphan_candidates(&all, &bound);
        assert_eq!(candidates, vec!["b".to_string(), "c".to_string()]);
    }
}
