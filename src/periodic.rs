//! Scheduled reconciliation loops: orphan-PVC garbage collection and
//! the stalled-job sweep.
//!
//! Grounded on `periodic_tasks.py`'s `delete_orphan_pvcs` /
//! `update_stalled_jobs_status`, and on the teacher's
//! `carbon_aware::scheduler::start_refresh_loop` for the
//! `tokio::spawn` + `interval.tick()` scheduling shape (logged
//! failures that don't abort the loop).

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::control_plane::WebhookClient;
use crate::pvc::{filter_pending_in_batches, orphan_candidates, PvcManager};

const ORPHAN_SWEEP_INTERVAL: Duration = Duration::from_secs(15 * 60);
const STALLED_JOB_SWEEP_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// One pass of the orphan-PVC sweep: enumerate pods and PVCs, compute
/// the bound set, submit non-bound candidates to the control plane's
/// pending-filter RPC in batches of 500, and delete everything not in
/// the pending subset (deleting any referencing pod first, foreground
/// propagation — tolerated here for the case where a pod attached
/// after the bound-set snapshot was taken).
pub async fn run_orphan_sweep_once(pvcs: &PvcManager, webhook: &WebhookClient) {
    let (all_names, bound) = match tokio::try_join!(pvcs.list_all_names(), pvcs.bound_claim_names()) {
        Ok(pair) => pair,
        Err(e) => {
            warn!(error = %e, "orphan sweep: failed to list PVCs/pods");
            return;
        }
    };

    let candidates = orphan_candidates(&all_names, &bound);
    if candidates.is_empty() {
        return;
    }

    let pending = match filter_pending_in_batches(&candidates, |batch| async {
        webhook.filter_pending_pvcs(&batch).await
    })
    .await
    {
        Ok(p) => p,
        Err(e) => {
            warn!(error = %e, "orphan sweep: filter-pending-pvcs RPC failed");
            return;
        }
    };

    for name in &candidates {
        if pending.contains(name) {
            continue;
        }
        if let Err(e) = pvcs.delete_referencing_pods(name).await {
            warn!(pvc = %name, error = %e, "orphan sweep: failed to delete referencing pods");
        }
        info!(pvc = %name, "orphan sweep: deleting PVC");
        pvcs.delete(name).await;
        #[cfg(feature = "metrics")]
        crate::metrics::inc_pvc_sweep_deletion();
    }
}

/// One pass of the stalled-job sweep: ask the control plane to mark
/// stalled jobs, surfacing any HTTP error as a log line (the sweep
/// itself is fire-and-forget on a timer, so errors don't abort the
/// loop).
pub async fn run_stalled_job_sweep_once(webhook: &WebhookClient) {
    if let Err(e) = webhook.update_stalled_jobs_status().await {
        warn!(error = %e, "stalled-job sweep: update_stalled_jobs_status failed");
    }
}

/// Spawn both periodic loops as background tasks. Returns their join
/// handles so `main` can hold them for the life of the process.
pub fn spawn_periodic_loops(
    pvcs: Arc<PvcManager>,
    webhook: Arc<WebhookClient>,
) -> (tokio::task::JoinHandle<()>, tokio::task::JoinHandle<()>) {
    let orphan_pvcs = pvcs.clone();
    let orphan_webhook = webhook.clone();
    let orphan_handle = tokio::spawn(async move {
        let mut interval = tokio::time::interval(ORPHAN_SWEEP_INTERVAL);
        loop {
            interval.tick().await;
            run_orphan_sweep_once(&orphan_pvcs, &orphan_webhook).await;
        }
    });

    let stalled_webhook = webhook;
    let stalled_handle = tokio::spawn(async move {
        let mut interval = tokio::time::interval(STALLED_JOB_SWEEP_INTERVAL);
        loop {
            interval.tick().await;
            run_stalled_job_sweep_once(&stalled_webhook).await;
        }
    });

    (orphan_handle, stalled_handle)
}
