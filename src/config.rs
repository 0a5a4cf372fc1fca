//! Process configuration.
//!
//! Environment-derived configuration is loaded once at process start
//! into an immutable snapshot and handed to every component as a
//! parameter (`Arc<DispatcherConfig>`); nothing here is consulted as a
//! process-global afterwards. Variable names are the closed set from
//! the spec's external-interfaces section.

use clap::Parser;

#[derive(Parser, Clone, Debug)]
#[command(name = "wkube-dispatcher", about = "wkube task dispatcher core")]
pub struct DispatcherConfig {
    /// Broker URL for the task executor (opaque to this crate; only read so it
    /// can be logged at startup and passed through to the executor wiring).
    #[arg(long, env = "BROKER_URL")]
    pub broker_url: String,

    #[arg(long, env = "CONTROL_PLANE_BASE_URL")]
    pub control_plane_base_url: String,

    /// App-level bearer used for the event-watcher webhook and periodic loops;
    /// distinct from the per-job token carried in each `JobSpec`.
    #[arg(long, env = "CONTROL_PLANE_APP_TOKEN")]
    pub control_plane_app_token: String,

    #[arg(long, env = "IMAGE_REGISTRY_URL")]
    pub image_registry_url: String,

    #[arg(long, env = "IMAGE_REGISTRY_TAG_PREFIX", default_value = "")]
    pub image_registry_tag_prefix: String,

    #[arg(long, env = "IMAGE_REGISTRY_USER")]
    pub image_registry_user: String,

    #[arg(long, env = "IMAGE_REGISTRY_PASSWORD")]
    pub image_registry_password: String,

    #[arg(long, env = "JOBSTORE_S3_ENDPOINT")]
    pub jobstore_s3_endpoint: Option<String>,

    #[arg(long, env = "JOBSTORE_S3_API_KEY")]
    pub jobstore_s3_api_key: Option<String>,

    #[arg(long, env = "JOBSTORE_S3_SECRET_KEY")]
    pub jobstore_s3_secret_key: Option<String>,

    #[arg(long, env = "JOBSTORE_S3_REGION", default_value = "eu-central-1")]
    pub jobstore_s3_region: String,

    #[arg(long, env = "JOBSTORE_S3_BUCKET")]
    pub jobstore_s3_bucket: Option<String>,

    /// Base64-encoded kubeconfig JSON; when absent, `kube::Client::try_default`
    /// (in-cluster / local kubeconfig discovery) is used instead.
    #[arg(long, env = "CLUSTER_KUBECONFIG_B64")]
    pub cluster_kubeconfig_b64: Option<String>,

    #[arg(long, env = "CLUSTER_NAMESPACE", default_value = "wkube")]
    pub cluster_namespace: String,

    #[arg(long, env = "STORAGE_CLASS")]
    pub storage_class: Option<String>,

    #[arg(
        long,
        env = "AGENT_IMAGE",
        default_value = "registry.example.org/wkube/agent-puller:latest"
    )]
    pub agent_image: String,

    #[arg(long, env = "BUILD_ONLY_TASK", default_value_t = false)]
    pub build_only_task: bool,
}

impl DispatcherConfig {
    pub fn image_pull_creds(&self) -> (&str, &str) {
        (&self.image_registry_user, &self.image_registry_password)
    }

    /// Shared project cache tag `buildah bud` reads/writes layers
    /// from/to (`--cache-from`/`--cache-to`), one per registry/prefix
    /// pair so unrelated projects sharing a registry don't cross-pollute
    /// layer caches.
    pub fn build_cache_tag(&self) -> String {
        format!(
            "{}/{}wkube-build-cache:latest",
            self.image_registry_url, self.image_registry_tag_prefix
        )
    }
}
