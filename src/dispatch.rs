//! Task Dispatcher: the sequential control flow for one dispatch.
//!
//! Grounded on spec.md §2's control-flow summary and
//! `dispatch_build_and_push.py`'s top-level task body: resolve/build
//! the image, ensure the PVC, submit the job, monitor the first pod.
//! Runs sequentially within one task invocation; the task executor
//! (out of scope, §1) is responsible for running many of these
//! concurrently.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::config::DispatcherConfig;
use crate::error::{DispatchError, Result};
use crate::image::{ensure_default_registry_secret, ensure_user_registry_secret, ImageBuilder};
use crate::job::{build_job_manifest, resolve_node, JobLauncher, PodOutcome};
use crate::model::JobSpec;
use crate::pvc::PvcManager;
use crate::task_entry::{CaptureSink, TaskEntry, TaskKind};

const PVC_POLL: Duration = Duration::from_secs(5);

/// One step's scratch-storage size request; `workflow_storage` on the
/// spec carries the same string-quantity shape PVC `create` expects.
fn pvc_size(spec: &JobSpec) -> &str {
    &spec.resources.workflow_storage
}

/// Run a full build-and-launch dispatch for `spec`. Returns once the
/// pod has reached `Running`/`Succeeded` (streaming continues via the
/// in-pod agent) or surfaces a terminal `DispatchError`.
pub async fn dispatch(
    cfg: &DispatcherConfig,
    kube_client: kube::Client,
    image_builder: &ImageBuilder,
    spec: JobSpec,
) -> Result<String> {
    let entry = TaskEntry::start(
        &cfg.control_plane_base_url,
        &spec.job_token,
        format!("{}-", spec.job_id),
        TaskKind::BuildAndLaunch,
    )
    .await?;

    let sink = entry.capture_sink();
    let soft_timeout = std::future::pending::<()>();

    let pvcs = PvcManager::new(kube_client.clone(), cfg.cluster_namespace.clone());
    let launcher = JobLauncher::new(kube_client.clone(), cfg.cluster_namespace.clone());
    let tag_slot: Arc<tokio::sync::Mutex<Option<String>>> = Arc::new(tokio::sync::Mutex::new(None));

    #[cfg(feature = "metrics")]
    crate::metrics::inc_dispatch_started();

    let body = {
        let tag_slot = tag_slot.clone();
        async move {
            let tag =
                run_build_and_launch(cfg, &kube_client, image_builder, &pvcs, &launcher, &spec, &sink).await?;
            *tag_slot.lock().await = Some(tag);
            if let Some(err) = sink.take_error() {
                return Err(err);
            }
            Ok(())
        }
    };

    // DONE on success is set by `TaskEntry::finish` iff `build_only_task`
    // (matching the original's `wkube_capture_log` polarity); a normal
    // build-and-launch task is left un-DONE, the in-pod agent finalizes
    // it once the job completes.
    let result = entry.run(soft_timeout, body, cfg.build_only_task).await;

    #[cfg(feature = "metrics")]
    match &result {
        Ok(()) => crate::metrics::inc_dispatch_succeeded(),
        Err(e) => crate::metrics::inc_dispatch_failed(e.kind_label()),
    }

    result?;

    tag_slot
        .lock()
        .await
        .clone()
        .ok_or_else(|| DispatchError::Invariant("dispatch finished without an image tag".to_string()))
}

#[allow(clippy::too_many_arguments)]
async fn run_build_and_launch(
    cfg: &DispatcherConfig,
    kube_client: &kube::Client,
    image_builder: &ImageBuilder,
    pvcs: &PvcManager,
    launcher: &JobLauncher,
    spec: &JobSpec,
    sink: &CaptureSink,
) -> Result<String> {
    let tag = {
        let mut line_sink = sink.closure();
        image_builder
            .build(cfg, &spec.source, &spec.build, spec.force_build, &mut line_sink)
            .await?
    };
    if let Some(e) = sink.take_error() {
        return Err(e);
    }

    ensure_pvc(cfg, pvcs, spec).await?;

    let default_secret = ensure_default_registry_secret(
        kube_client,
        &cfg.cluster_namespace,
        &cfg.image_registry_url,
        &cfg.image_registry_user,
        &cfg.image_registry_password,
    )
    .await?;
    let mut pull_secrets = vec![default_secret];
    if let (Some(server), Some(user), Some(pass), Some(email)) = (
        spec.secrets.get("registry_server"),
        spec.secrets.get("registry_user"),
        spec.secrets.get("registry_pass"),
        spec.secrets.get("registry_email"),
    ) {
        let name = ensure_user_registry_secret(kube_client, &cfg.cluster_namespace, server, user, pass, email).await?;
        pull_secrets.push(name);
    }

    let node = resolve_node(kube_client, &cfg.cluster_namespace, spec.node_id.as_deref(), &spec.pvc_id).await?;

    let job = build_job_manifest(
        spec,
        &tag,
        &cfg.agent_image,
        &cfg.control_plane_base_url,
        node.as_deref(),
        &pull_secrets,
        &cfg.cluster_namespace,
    );

    launcher.submit(&job).await?;
    let pod_name = launcher.wait_for_single_pod(&spec.job_name).await?;

    match launcher.monitor(&spec.job_name, &pod_name).await? {
        PodOutcome::Running | PodOutcome::Succeeded => {
            info!(job_name = %spec.job_name, "job launched");
        }
        PodOutcome::Failed => unreachable!("monitor() surfaces Failed as an Err, not Ok"),
    }

    Ok(tag)
}

/// First-pipeline-step PVC semantics: delete and wait absent before
/// recreating; otherwise wait for an existing PVC to reach Bound.
async fn ensure_pvc(cfg: &DispatcherConfig, pvcs: &PvcManager, spec: &JobSpec) -> Result<()> {
    let storage_class = cfg.storage_class.as_deref();
    let existing = pvcs.get(&spec.pvc_id).await?;
    if spec.first_pipeline_step {
        if existing.is_some() {
            pvcs.delete(&spec.pvc_id).await;
            pvcs.wait_absent(&spec.pvc_id, PVC_POLL).await?;
        }
        pvcs.create(&spec.pvc_id, pvc_size(spec), storage_class).await?;
        pvcs.wait_bound(&spec.pvc_id, PVC_POLL).await?;
    } else {
        if existing.is_none() {
            warn!(pvc_id = %spec.pvc_id, "non-first pipeline step found no existing PVC; creating one");
            pvcs.create(&spec.pvc_id, pvc_size(spec), storage_class).await?;
        }
        pvcs.wait_bound(&spec.pvc_id, PVC_POLL).await?;
    }
    Ok(())
}
