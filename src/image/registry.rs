//! Registry credential plumbing: default and user-supplied pull secrets.
//!
//! Grounded on `registries.py`'s `DEFAULT_REGISTRIES` /
//! `create_user_registry_secret` / `create_b64_default_secret_json`.
//! MD5 is replaced with `sha2::Sha256` since the crate already carries
//! `sha2` for the image-tag digest and has no MD5 dependency.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::error::Result;

/// Name under which the default registry's credentials are stored;
/// matches the original's single `DEFAULT_REGISTRIES` key.
pub const DEFAULT_REGISTRY_SECRET_NAME: &str = "jobstore";

fn docker_config_json(server: &str, username: &str, password: &str, email: &str) -> String {
    let mut auth = json!({ "username": username, "password": password });
    if !email.is_empty() {
        auth["email"] = json!(email);
    }
    json!({ "auths": { server: auth } }).to_string()
}

/// Deterministic secret name for a user-supplied registry: identical
/// credentials collapse to the same secret name, so repeated jobs
/// against the same registry reuse one Secret instead of creating
/// duplicates.
pub fn user_registry_secret_name(server: &str, username: &str, password: &str, email: &str) -> String {
    let seed = format!("{server}-{username}-{password}-{email}");
    hex::encode(Sha256::digest(seed.as_bytes()))[..32].to_string()
}

async fn ensure_secret(client: &Client, namespace: &str, name: &str, dockerconfigjson_b64: &str) -> Result<()> {
    let api: Api<Secret> = Api::namespaced(client.clone(), namespace);
    let mut data = BTreeMap::new();
    data.insert(
        ".dockerconfigjson".to_string(),
        k8s_openapi::ByteString(BASE64.decode(dockerconfigjson_b64).unwrap_or_default()),
    );
    let secret = Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        type_: Some("kubernetes.io/dockerconfigjson".to_string()),
        data: Some(data),
        ..Default::default()
    };
    api.patch(
        name,
        &PatchParams::apply("wkube-dispatcher").force(),
        &Patch::Apply(&secret),
    )
    .await?;
    Ok(())
}

/// Ensure the cluster-wide default registry secret exists.
pub async fn ensure_default_registry_secret(
    client: &Client,
    namespace: &str,
    server: &str,
    username: &str,
    password: &str,
) -> Result<String> {
    let b64 = BASE64.encode(docker_config_json(server, username, password, ""));
    ensure_secret(client, namespace, DEFAULT_REGISTRY_SECRET_NAME, &b64).await?;
    Ok(DEFAULT_REGISTRY_SECRET_NAME.to_string())
}

/// Ensure a user-supplied registry secret exists, returning its name.
pub async fn ensure_user_registry_secret(
    client: &Client,
    namespace: &str,
    server: &str,
    username: &str,
    password: &str,
    email: &str,
) -> Result<String> {
    let name = user_registry_secret_name(server, username, password, email);
    let b64 = BASE64.encode(docker_config_json(server, username, password, email));
    ensure_secret(client, namespace, &name, &b64).await?;
    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_credentials_deduplicate() {
        let a = user_registry_secret_name("s", "u", "p", "e");
        let b = user_registry_secret_name("s", "u", "p", "e");
        assert_eq!(a, b);
    }

    #[test]
    fn different_credentials_differ() {
        let a = user_registry_secret_name("s", "u", "p", "e");
        let b = user_registry_secret_name("s", "u", "p2", "e");
        assert_ne!(a, b);
    }
}
