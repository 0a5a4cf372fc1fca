//! OCI image build orchestration.
//!
//! Grounded on `dispatch_build_and_push.py`'s `OCIImageBuilder.__call__`:
//! probe the registry, materialize sources, resolve the Dockerfile,
//! build, push, clean up, and always sweep the scratch directory tree.

use std::path::{Path, PathBuf};

use tokio::process::Command;
use tracing::info;

use crate::config::DispatcherConfig;
use crate::error::{DispatchError, Result};
use crate::model::{BaseStack, BuildDescriptor, SourceDescriptor};

use super::registry;
use super::source;
use super::tag::compute_image_tag;

/// Directory holding the `Dockerfile.<STACK>` templates for predefined
/// base stacks, mirroring `PREDEFINED_STACKS_FOLDER`.
pub const PREDEFINED_STACKS_DIR: &str = "predefined_stacks";

pub struct ImageBuilder {
    http: reqwest::Client,
    builder_root: PathBuf,
}

impl ImageBuilder {
    pub fn new(builder_root: impl Into<PathBuf>) -> Self {
        Self {
            http: reqwest::Client::new(),
            builder_root: builder_root.into(),
        }
    }

    /// Public contract: resolve or build the image, returning its tag.
    pub async fn build(
        &self,
        cfg: &DispatcherConfig,
        source_desc: &SourceDescriptor,
        build: &BuildDescriptor,
        force: bool,
        sink: &mut dyn FnMut(&str),
    ) -> Result<String> {
        validate_build_descriptor(build)?;

        // The tag's commit-hash component for Git sources is only
        // knowable after cloning; probe first with the ref-literal
        // form, matching the original (which never resolves a commit
        // at all and tags purely off the ref).
        let provisional_tag = compute_image_tag(
            &cfg.image_registry_url,
            &cfg.image_registry_tag_prefix,
            source_desc,
            build,
            None,
        );

        if !force && self.tag_exists(cfg, &provisional_tag).await? {
            info!(tag = %provisional_tag, "image already present, skipping build");
            #[cfg(feature = "metrics")]
            crate::metrics::inc_image_cache_hit();
            return Ok(provisional_tag);
        }

        tokio::fs::create_dir_all(&self.builder_root).await?;
        let workdir = source::new_build_dir(&self.builder_root);
        let result = self
            .build_in_workdir(cfg, source_desc, build, force, &workdir, sink)
            .await;
        source::sweep_stale_dirs(&self.builder_root).await;
        let _ = tokio::fs::remove_dir_all(&workdir).await;
        result
    }

    async fn build_in_workdir(
        &self,
        cfg: &DispatcherConfig,
        source_desc: &SourceDescriptor,
        build: &BuildDescriptor,
        force: bool,
        workdir: &Path,
        sink: &mut dyn FnMut(&str),
    ) -> Result<String> {
        let resolved_commit = source::materialize(&self.http, source_desc, workdir, sink).await?;

        let tag = compute_image_tag(
            &cfg.image_registry_url,
            &cfg.image_registry_tag_prefix,
            source_desc,
            build,
            resolved_commit.as_deref(),
        );

        if !force && self.tag_exists(cfg, &tag).await? {
            info!(tag = %tag, "image already present after source resolution, skipping build");
            #[cfg(feature = "metrics")]
            crate::metrics::inc_image_cache_hit();
            return Ok(tag);
        }

        #[cfg(feature = "metrics")]
        crate::metrics::inc_image_cache_miss();

        let dockerfile_path = self.resolve_dockerfile(workdir, build).await?;

        self.run_build(cfg, workdir, &dockerfile_path, &tag, force, sink)
            .await?;
        self.push(cfg, &tag, sink).await?;
        self.clean_up(&tag, sink).await;

        Ok(tag)
    }

    async fn resolve_dockerfile(&self, workdir: &Path, build: &BuildDescriptor) -> Result<PathBuf> {
        if let Some(explicit) = &build.dockerfile {
            let path = workdir.join(explicit);
            if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
                return Err(DispatchError::BadSpec(format!(
                    "{} does not exist in the fetched source",
                    path.display()
                )));
            }
            return Ok(path);
        }
        if let Some(stack) = build.base_stack {
            return self.predefined_dockerfile(stack);
        }
        // Unreachable once `validate_build_descriptor` has run, but
        // kept so this function stands on its own invariant.
        Err(DispatchError::BadSpec(
            "neither dockerfile nor base_stack supplied".to_string(),
        ))
    }

    fn predefined_dockerfile(&self, stack: BaseStack) -> Result<PathBuf> {
        let path = Path::new(PREDEFINED_STACKS_DIR).join(format!("Dockerfile.{}", stack.template_suffix()));
        Ok(path)
    }

    async fn tag_exists(&self, cfg: &DispatcherConfig, tag: &str) -> Result<bool> {
        let (user, password) = cfg.image_pull_creds();
        let status = Command::new("skopeo")
            .args([
                "inspect",
                "--tls-verify=false",
                "--creds",
                &format!("{user}:{password}"),
                &format!("docker://{tag}"),
            ])
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .await?;
        Ok(status.success())
    }

    async fn run_build(
        &self,
        cfg: &DispatcherConfig,
        workdir: &Path,
        dockerfile: &Path,
        tag: &str,
        force: bool,
        sink: &mut dyn FnMut(&str),
    ) -> Result<()> {
        let cache_tag = cfg.build_cache_tag();
        let mut args = vec![
            "bud".to_string(),
            "--isolation".to_string(),
            "chroot".to_string(),
            "--layers".to_string(),
            "--cache-from".to_string(),
            cache_tag.clone(),
            "--cache-to".to_string(),
            cache_tag,
        ];
        if force {
            args.push("--no-cache".to_string());
        }
        args.extend([
            "-t".to_string(),
            tag.to_string(),
            "-f".to_string(),
            dockerfile.display().to_string(),
            workdir.display().to_string(),
        ]);
        self.login(cfg, sink).await?;
        run_forwarding(Command::new("buildah").args(&args), sink)
            .await
            .map_err(|e| DispatchError::BuildFailed(e.to_string()))
    }

    async fn login(&self, cfg: &DispatcherConfig, sink: &mut dyn FnMut(&str)) -> Result<()> {
        let (user, password) = cfg.image_pull_creds();
        run_forwarding(
            Command::new("buildah").args([
                "login",
                "--tls-verify=false",
                &format!("--username={user}"),
                &format!("--password={password}"),
                &cfg.image_registry_url,
            ]),
            sink,
        )
        .await
        .map_err(|e| DispatchError::PushFailed(format!("registry login failed: {e}")))
    }

    async fn push(&self, cfg: &DispatcherConfig, tag: &str, sink: &mut dyn FnMut(&str)) -> Result<()> {
        self.login(cfg, sink).await?;
        run_forwarding(
            Command::new("buildah").args(["push", "--tls-verify=false", tag]),
            sink,
        )
        .await
        .map_err(|e| DispatchError::PushFailed(e.to_string()))
    }

    async fn clean_up(&self, tag: &str, sink: &mut dyn FnMut(&str)) {
        let _ = run_forwarding(Command::new("buildah").args(["rmi", tag]), sink).await;
        let _ = run_forwarding(Command::new("buildah").args(["rmi", "-p"]), sink).await;
    }
}

/// Exactly one of `dockerfile` or `base_stack` must be supplied.
fn validate_build_descriptor(build: &BuildDescriptor) -> Result<()> {
    match (&build.dockerfile, &build.base_stack) {
        (None, None) => Err(DispatchError::BadSpec(
            "either dockerfile or base_stack must be present".to_string(),
        )),
        (Some(_), Some(_)) => Err(DispatchError::BadSpec(
            "exactly one of dockerfile or base_stack may be present, not both".to_string(),
        )),
        _ => Ok(()),
    }
}

async fn run_forwarding(command: &mut Command, sink: &mut dyn FnMut(&str)) -> std::result::Result<(), String> {
    source::run_and_forward(command, sink).await.map_err(|e| e.to_string())
}

pub use registry::{ensure_default_registry_secret, ensure_user_registry_secret};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_missing_build_descriptor() {
        let build = BuildDescriptor {
            dockerfile: None,
            base_stack: None,
        };
        assert!(validate_build_descriptor(&build).is_err());
    }

    #[test]
    fn accepts_dockerfile_only() {
        let build = BuildDescriptor {
            dockerfile: Some("Dockerfile".to_string()),
            base_stack: None,
        };
        assert!(validate_build_descriptor(&build).is_ok());
    }

    #[test]
    fn rejects_both_dockerfile_and_base_stack() {
        let build = BuildDescriptor {
            dockerfile: Some("Dockerfile".to_string()),
            base_stack: Some(BaseStack::Python37),
        };
        assert!(validate_build_descriptor(&build).is_err());
    }
}
