//! Deterministic image tag computation.
//!
//! Format (bit-exact): `<registry>/<prefix><normalized_source>-<dockerfile_hash7>:<commit_hash7>`.

use sha2::{Digest, Sha256};

use crate::model::{BuildDescriptor, SourceDescriptor, S3_SCHEME_PREFIX};

/// Strip scheme, `www.`, and trailing `.git`/`.zip` from a source URL.
pub fn normalize_source(raw: &str) -> String {
    let mut s = raw;
    for scheme in ["https://", "http://"] {
        if let Some(rest) = s.strip_prefix(scheme) {
            s = rest;
            break;
        }
    }
    if let Some(rest) = s.strip_prefix(S3_SCHEME_PREFIX) {
        s = rest;
    }
    let s = s.strip_prefix("www.").unwrap_or(s);
    let s = s.strip_suffix(".git").unwrap_or(s);
    let s = s.strip_suffix(".zip").unwrap_or(s);
    s.replace('/', "-")
}

fn short_digest(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    hex::encode(digest)[..7].to_string()
}

/// The 7-char digest of whichever build descriptor field is set.
pub fn dockerfile_hash(build: &BuildDescriptor) -> String {
    let seed = match (&build.dockerfile, &build.base_stack) {
        (Some(path), _) => path.clone(),
        (None, Some(stack)) => stack.to_string(),
        (None, None) => String::new(),
    };
    short_digest(&seed)
}

/// The 7-char commit hash: a resolved Git commit prefix, or the literal
/// ref for S3 archives (S3 sources carry no independent ref).
pub fn commit_hash(source: &SourceDescriptor, resolved_git_commit: Option<&str>) -> String {
    match source {
        SourceDescriptor::Git { git_ref, .. } => resolved_git_commit
            .map(|c| c.chars().take(7).collect())
            .unwrap_or_else(|| git_ref.chars().take(7).collect()),
        SourceDescriptor::S3 { object_store_url } => {
            object_store_url.chars().take(7).collect()
        }
    }
}

pub fn compute_image_tag(
    registry: &str,
    registry_prefix: &str,
    source: &SourceDescriptor,
    build: &BuildDescriptor,
    resolved_git_commit: Option<&str>,
) -> String {
    let normalized = normalize_source(source.raw_url());
    let dhash = dockerfile_hash(build);
    let chash = commit_hash(source, resolved_git_commit);
    format!("{registry}/{registry_prefix}{normalized}-{dhash}:{chash}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BaseStack;

    fn git(url: &str, r: &str) -> SourceDescriptor {
        SourceDescriptor::Git {
            url: url.to_string(),
            git_ref: r.to_string(),
        }
    }

    #[test]
    fn tag_is_pure_function_of_inputs() {
        let source = git("https://git.example/org/repo.git", "v1.2.3");
        let build = BuildDescriptor {
            dockerfile: Some("Dockerfile.prod".to_string()),
            base_stack: None,
        };
        let a = compute_image_tag("registry.example", "acc/", &source, &build, Some("abcdef0123"));
        let b = compute_image_tag("registry.example", "acc/", &source, &build, Some("abcdef0123"));
        assert_eq!(a, b);
        assert!(a.starts_with("registry.example/acc/git.example-org-repo-"));
        assert!(a.ends_with(":abcdef0"));
    }

    #[test]
    fn normalize_strips_scheme_www_and_suffix() {
        assert_eq!(
            normalize_source("https://www.git.example/org/repo.git"),
            "git.example-org-repo"
        );
    }

    #[test]
    fn normalize_handles_s3_scheme() {
        assert_eq!(
            normalize_source("s3accjobstore://bucket/archive.zip"),
            "bucket-archive"
        );
    }

    #[test]
    fn base_stack_changes_dockerfile_hash() {
        let a = dockerfile_hash(&BuildDescriptor {
            dockerfile: None,
            base_stack: Some(BaseStack::Python37),
        });
        let b = dockerfile_hash(&BuildDescriptor {
            dockerfile: None,
            base_stack: Some(BaseStack::R44),
        });
        assert_ne!(a, b);
        assert_eq!(a.len(), 7);
    }

    #[test]
    fn s3_commit_hash_uses_object_store_url() {
        let source = SourceDescriptor::S3 {
            object_store_url: "bucket/archive.zip".to_string(),
        };
        assert_eq!(commit_hash(&source, None), "bucket/");
    }
}
