//! Node resolution for pod affinity: explicit `node_id` pin, or
//! discovery from an existing pod already carrying `pvc_id=<pvc_id>`.

use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams};
use kube::Client;

use crate::error::Result;

/// Resolve the node a job should be pinned to: the explicit pin if
/// given, otherwise the node of any existing pod labeled with the same
/// `pvc_id` (so later pipeline steps colocate with earlier ones on the
/// same node for data locality).
pub async fn resolve_node(
    client: &Client,
    namespace: &str,
    node_id: Option<&str>,
    pvc_id: &str,
) -> Result<Option<String>> {
    if let Some(explicit) = node_id {
        return Ok(Some(explicit.to_string()));
    }

    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
    let lp = ListParams::default().labels(&format!("pvc_id={pvc_id}"));
    let list = pods.list(&lp).await?;
    for pod in list.items {
        if let Some(node_name) = pod.spec.and_then(|s| s.node_name) {
            return Ok(Some(node_name));
        }
    }
    Ok(None)
}
