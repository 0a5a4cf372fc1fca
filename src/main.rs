//! wkube-dispatcher entry point.
//!
//! Starts the cluster event watcher and the periodic reconciliation
//! loops, and, when built with the `rest-api` feature, an admin server
//! exposing `/healthz` and `/metrics`. The task executor/broker that
//! actually calls [`wkube_dispatcher::dispatch`] per job is out of
//! scope for this binary; it is the library's public entry point for
//! such a caller to embed.

use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use wkube_dispatcher::config::DispatcherConfig;
use wkube_dispatcher::control_plane::WebhookClient;
use wkube_dispatcher::error::{DispatchError, Result};
use wkube_dispatcher::pvc::PvcManager;
use wkube_dispatcher::{event_watcher, periodic, telemetry};

async fn build_kube_client(cfg: &DispatcherConfig) -> Result<kube::Client> {
    match &cfg.cluster_kubeconfig_b64 {
        Some(encoded) => {
            use base64::Engine;
            let raw = base64::engine::general_purpose::STANDARD
                .decode(encoded)
                .map_err(|e| DispatchError::ConfigError(format!("CLUSTER_KUBECONFIG_B64 is not valid base64: {e}")))?;
            let text = String::from_utf8(raw)
                .map_err(|e| DispatchError::ConfigError(format!("CLUSTER_KUBECONFIG_B64 is not valid UTF-8: {e}")))?;
            let kubeconfig = kube::config::Kubeconfig::from_yaml(&text)
                .map_err(|e| DispatchError::ConfigError(format!("CLUSTER_KUBECONFIG_B64 is not a valid kubeconfig: {e}")))?;
            let options = kube::config::KubeConfigOptions::default();
            let config = kube::Config::from_custom_kubeconfig(kubeconfig, &options)
                .await
                .map_err(|e| DispatchError::ConfigError(format!("failed to build client config: {e}")))?;
            Ok(kube::Client::try_from(config)?)
        }
        None => Ok(kube::Client::try_default().await?),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init();

    let cfg = DispatcherConfig::parse();
    info!(
        namespace = %cfg.cluster_namespace,
        "starting wkube-dispatcher v{}",
        env!("CARGO_PKG_VERSION")
    );

    let kube_client = build_kube_client(&cfg).await?;
    info!("connected to Kubernetes cluster");

    let pvcs = Arc::new(PvcManager::new(kube_client.clone(), cfg.cluster_namespace.clone()));
    let webhook = Arc::new(WebhookClient::new(
        cfg.control_plane_base_url.clone(),
        cfg.control_plane_app_token.clone(),
    ));

    let (orphan_handle, stalled_handle) = periodic::spawn_periodic_loops(pvcs, webhook.clone());

    let watcher_namespace = cfg.cluster_namespace.clone();
    let watcher_client = kube_client.clone();
    let watcher_webhook = (*webhook).clone();
    let watcher_handle = tokio::spawn(async move {
        event_watcher::run(watcher_client, &watcher_namespace, watcher_webhook).await;
    });

    #[cfg(feature = "rest-api")]
    let admin_handle = {
        let addr = std::net::SocketAddr::from(([0, 0, 0, 0], 8080));
        tokio::spawn(async move {
            if let Err(e) = wkube_dispatcher::rest_api::run_server(addr).await {
                error!(error = %e, "admin REST API server exited");
            }
        })
    };

    tokio::select! {
        res = orphan_handle => {
            if let Err(e) = res {
                error!(error = %e, "orphan-PVC sweep task panicked");
            }
        }
        res = stalled_handle => {
            if let Err(e) = res {
                error!(error = %e, "stalled-job sweep task panicked");
            }
        }
        res = watcher_handle => {
            if let Err(e) = res {
                error!(error = %e, "event watcher task panicked");
            }
            info!("event watcher stopped; shutting down");
        }
    }

    #[cfg(feature = "rest-api")]
    admin_handle.abort();

    Ok(())
}
