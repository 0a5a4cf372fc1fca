//! Prometheus metrics for the dispatcher core.
//!
//! Grounded on the teacher's `controller::metrics` module
//! (`prometheus-client` + `once_cell::Lazy` registry, `Family`-keyed
//! counters). This is ambient observability carried regardless of the
//! spec's Non-goals — see SPEC_FULL.md §2.
//!
//! # Exported metrics
//! - `wkube_dispatch_started_total` / `_succeeded_total` / `_failed_total`
//! - `wkube_image_cache_hits_total` / `_misses_total`
//! - `wkube_pvc_sweep_deletions_total`
//! - `wkube_log_chunks_flushed_total`
//! - `wkube_webhook_posts_total`

use std::sync::atomic::AtomicU64;

use once_cell::sync::Lazy;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct DispatchLabels {
    pub job_name: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OutcomeLabels {
    pub outcome: String,
}

pub static DISPATCHES_STARTED_TOTAL: Lazy<Counter<u64, AtomicU64>> = Lazy::new(Counter::default);
pub static DISPATCHES_SUCCEEDED_TOTAL: Lazy<Counter<u64, AtomicU64>> = Lazy::new(Counter::default);
pub static DISPATCHES_FAILED_TOTAL: Lazy<Family<OutcomeLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);
pub static IMAGE_CACHE_HITS_TOTAL: Lazy<Counter<u64, AtomicU64>> = Lazy::new(Counter::default);
pub static IMAGE_CACHE_MISSES_TOTAL: Lazy<Counter<u64, AtomicU64>> = Lazy::new(Counter::default);
pub static PVC_SWEEP_DELETIONS_TOTAL: Lazy<Counter<u64, AtomicU64>> = Lazy::new(Counter::default);
pub static LOG_CHUNKS_FLUSHED_TOTAL: Lazy<Counter<u64, AtomicU64>> = Lazy::new(Counter::default);
pub static WEBHOOK_POSTS_TOTAL: Lazy<Counter<u64, AtomicU64>> = Lazy::new(Counter::default);

pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let mut registry = Registry::default();

    registry.register(
        "wkube_dispatches_started_total",
        "Total number of dispatch invocations started",
        DISPATCHES_STARTED_TOTAL.clone(),
    );
    registry.register(
        "wkube_dispatches_succeeded_total",
        "Total number of dispatches that reached Running/Succeeded",
        DISPATCHES_SUCCEEDED_TOTAL.clone(),
    );
    registry.register(
        "wkube_dispatches_failed_total",
        "Total number of dispatches that failed, labeled by error kind",
        DISPATCHES_FAILED_TOTAL.clone(),
    );
    registry.register(
        "wkube_image_cache_hits_total",
        "Total number of image builds skipped because the tag already existed",
        IMAGE_CACHE_HITS_TOTAL.clone(),
    );
    registry.register(
        "wkube_image_cache_misses_total",
        "Total number of image builds that ran because the tag was absent or force_build was set",
        IMAGE_CACHE_MISSES_TOTAL.clone(),
    );
    registry.register(
        "wkube_pvc_sweep_deletions_total",
        "Total number of PVCs deleted by the periodic orphan sweep",
        PVC_SWEEP_DELETIONS_TOTAL.clone(),
    );
    registry.register(
        "wkube_log_chunks_flushed_total",
        "Total number of log chunks flushed to the control plane",
        LOG_CHUNKS_FLUSHED_TOTAL.clone(),
    );
    registry.register(
        "wkube_webhook_posts_total",
        "Total number of cluster-event webhook POSTs issued",
        WEBHOOK_POSTS_TOTAL.clone(),
    );

    registry
});

pub fn inc_dispatch_started() {
    DISPATCHES_STARTED_TOTAL.inc();
}

pub fn inc_dispatch_succeeded() {
    DISPATCHES_SUCCEEDED_TOTAL.inc();
}

pub fn inc_dispatch_failed(outcome: &str) {
    DISPATCHES_FAILED_TOTAL
        .get_or_create(&OutcomeLabels {
            outcome: outcome.to_string(),
        })
        .inc();
}

pub fn inc_image_cache_hit() {
    IMAGE_CACHE_HITS_TOTAL.inc();
}

pub fn inc_image_cache_miss() {
    IMAGE_CACHE_MISSES_TOTAL.inc();
}

pub fn inc_pvc_sweep_deletion() {
    PVC_SWEEP_DELETIONS_TOTAL.inc();
}

pub fn inc_log_chunk_flushed() {
    LOG_CHUNKS_FLUSHED_TOTAL.inc();
}

pub fn inc_webhook_post() {
    WEBHOOK_POSTS_TOTAL.inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_registers_without_panicking() {
        let _ = &*REGISTRY;
    }

    #[test]
    fn counters_increment() {
        inc_dispatch_started();
        inc_dispatch_succeeded();
        inc_dispatch_failed("PodFailed");
        inc_image_cache_hit();
        inc_image_cache_miss();
        inc_pvc_sweep_deletion();
        inc_log_chunk_flushed();
        inc_webhook_post();
    }
}
