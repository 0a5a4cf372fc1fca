//! Job manifest assembly.
//!
//! Grounded on `dispatch_build_and_push.py`'s `launch_k8_job`, which
//! builds an init container (agent puller) + main container (shell
//! that `exec`s the agent against the user command) with env layered
//! `JOB_ID`/`ACC_JOB_TOKEN`/`ACC_JOB_GATEWAY_SERVER`, then `conf`, then
//! `secret` (secrets last so they can override `conf`).

use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::{Job, JobSpec as K8sJobSpec};
use k8s_openapi::api::core::v1::{
    Affinity, Container, EmptyDirVolumeSource, EnvVar, LocalObjectReference, NodeAffinity,
    NodeSelector, NodeSelectorRequirement, NodeSelectorTerm, PodSpec, PodTemplateSpec,
    ResourceRequirements, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use crate::model::{JobSpec, ResourceRequest};

const AGENT_VOLUME: &str = "agent";
const AGENT_MOUNT: &str = "/mnt/agent";
const DATA_VOLUME: &str = "data";
const DATA_MOUNT: &str = "/mnt/data";

/// Shell-escape a command for embedding inside a double-quoted
/// argument: only `"` needs escaping, matching the original's
/// `command.replace('"', '\\"')`.
fn shell_escape_double_quotes(command: &str) -> String {
    command.replace('"', "\\\"")
}

fn resource_list(r: &ResourceRequest) -> BTreeMap<String, Quantity> {
    let mut map = BTreeMap::new();
    map.insert("memory".to_string(), Quantity(r.memory.clone()));
    map.insert("cpu".to_string(), Quantity(r.cpu.clone()));
    map.insert(
        "ephemeral-storage".to_string(),
        Quantity(r.ephemeral_storage.clone()),
    );
    map
}

fn env_vars(
    job_id: &str,
    job_token: &str,
    gateway_server: &str,
    conf: &BTreeMap<String, String>,
    secrets: &BTreeMap<String, String>,
) -> Vec<EnvVar> {
    let mut env = vec![
        EnvVar {
            name: "JOB_ID".to_string(),
            value: Some(job_id.to_string()),
            ..Default::default()
        },
        EnvVar {
            name: "ACC_JOB_TOKEN".to_string(),
            value: Some(job_token.to_string()),
            ..Default::default()
        },
        EnvVar {
            name: "ACC_JOB_GATEWAY_SERVER".to_string(),
            value: Some(gateway_server.to_string()),
            ..Default::default()
        },
    ];
    for (k, v) in conf {
        env.push(EnvVar {
            name: k.clone(),
            value: Some(v.clone()),
            ..Default::default()
        });
    }
    // Secrets last: later entries with the same name win when the
    // kubelet materializes the container env, so secrets can override
    // a conf entry of the same name.
    for (k, v) in secrets {
        env.push(EnvVar {
            name: k.clone(),
            value: Some(v.clone()),
            ..Default::default()
        });
    }
    env
}

fn affinity(node_name: Option<&str>) -> Option<Affinity> {
    let node_name = node_name?;
    Some(Affinity {
        node_affinity: Some(NodeAffinity {
            required_during_scheduling_ignored_during_execution: Some(NodeSelector {
                node_selector_terms: vec![NodeSelectorTerm {
                    match_expressions: Some(vec![NodeSelectorRequirement {
                        key: "kubernetes.io/hostname".to_string(),
                        operator: "In".to_string(),
                        values: Some(vec![node_name.to_string()]),
                    }]),
                    match_fields: None,
                }],
            }),
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Build the Job manifest for one dispatch.
///
/// `image_pull_secret_names` is the caller-resolved union of the
/// default registry secret and any user-supplied registry secret
/// (§4.3: "default registry secret ∪ user-supplied").
#[allow(clippy::too_many_arguments)]
pub fn build_job_manifest(
    spec: &JobSpec,
    image_tag: &str,
    agent_image: &str,
    gateway_server: &str,
    node_name: Option<&str>,
    image_pull_secret_names: &[String],
    namespace: &str,
) -> Job {
    let mut labels = BTreeMap::new();
    labels.insert("pvc_id".to_string(), spec.pvc_id.clone());

    let mut pod_labels = BTreeMap::new();
    pod_labels.insert("app".to_string(), spec.job_name.clone());
    pod_labels.insert("pvc_id".to_string(), spec.pvc_id.clone());

    let escaped_command = shell_escape_double_quotes(&spec.command);
    let main_command = format!(
        "/mnt/agent/agent exec \"{escaped_command}\""
    );

    let init_container = Container {
        name: "agent-puller".to_string(),
        image: Some(agent_image.to_string()),
        command: Some(vec!["sh".to_string(), "-c".to_string()]),
        args: Some(vec![format!(
            "(curl -sSL -o /mnt/agent/agent {agent_image} || wget -O /mnt/agent/agent {agent_image}) && chmod +x /mnt/agent/agent"
        )]),
        volume_mounts: Some(vec![VolumeMount {
            name: AGENT_VOLUME.to_string(),
            mount_path: AGENT_MOUNT.to_string(),
            ..Default::default()
        }]),
        ..Default::default()
    };

    let main_container = Container {
        name: "main".to_string(),
        image: Some(image_tag.to_string()),
        command: Some(vec!["sh".to_string(), "-c".to_string()]),
        args: Some(vec![main_command]),
        env: Some(env_vars(
            &spec.job_id,
            &spec.job_token,
            gateway_server,
            &spec.conf,
            &spec.secrets,
        )),
        resources: Some(ResourceRequirements {
            limits: Some(resource_list(&spec.resources)),
            requests: Some(resource_list(&spec.resources)),
            ..Default::default()
        }),
        volume_mounts: Some(vec![
            VolumeMount {
                name: DATA_VOLUME.to_string(),
                mount_path: DATA_MOUNT.to_string(),
                ..Default::default()
            },
            VolumeMount {
                name: AGENT_VOLUME.to_string(),
                mount_path: AGENT_MOUNT.to_string(),
                ..Default::default()
            },
        ]),
        ..Default::default()
    };

    let volumes = vec![
        Volume {
            name: DATA_VOLUME.to_string(),
            persistent_volume_claim: Some(
                k8s_openapi::api::core::v1::PersistentVolumeClaimVolumeSource {
                    claim_name: spec.pvc_id.clone(),
                    read_only: Some(false),
                },
            ),
            ..Default::default()
        },
        Volume {
            name: AGENT_VOLUME.to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        },
    ];

    let image_pull_secrets = if image_pull_secret_names.is_empty() {
        None
    } else {
        Some(
            image_pull_secret_names
                .iter()
                .map(|name| LocalObjectReference {
                    name: Some(name.clone()),
                })
                .collect(),
        )
    };

    let pod_spec = PodSpec {
        init_containers: Some(vec![init_container]),
        containers: vec![main_container],
        volumes: Some(volumes),
        restart_policy: Some("Never".to_string()),
        image_pull_secrets,
        affinity: affinity(node_name),
        ..Default::default()
    };

    Job {
        metadata: ObjectMeta {
            name: Some(spec.job_name.clone()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        spec: Some(K8sJobSpec {
            backoff_limit: Some(0),
            active_deadline_seconds: Some(spec.resources.timeout_sec),
            ttl_seconds_after_finished: Some(0),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(pod_labels),
                    ..Default::default()
                }),
                spec: Some(pod_spec),
            },
            selector: Some(LabelSelector::default()),
            ..Default::default()
        }),
        status: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BuildDescriptor, SourceDescriptor};

    fn sample_spec() -> JobSpec {
        JobSpec {
            job_id: "job-1".to_string(),
            job_name: "job-1".to_string(),
            job_token: "tok".to_string(),
            source: SourceDescriptor::Git {
                url: "https://git.example/org/repo.git".to_string(),
                git_ref: "main".to_string(),
            },
            build: BuildDescriptor {
                dockerfile: Some("Dockerfile".to_string()),
                base_stack: None,
            },
            resources: ResourceRequest {
                memory: "1Gi".to_string(),
                cpu: "1".to_string(),
                ephemeral_storage: "2Gi".to_string(),
                workflow_storage: "10Gi".to_string(),
                timeout_sec: 3600,
            },
            pvc_id: "pipeline-1".to_string(),
            first_pipeline_step: false,
            node_id: None,
            conf: BTreeMap::new(),
            secrets: BTreeMap::new(),
            force_build: false,
            command: r#"echo "hi""#.to_string(),
        }
    }

    #[test]
    fn escapes_double_quotes_in_command() {
        assert_eq!(
            shell_escape_double_quotes(r#"echo "hi""#),
            r#"echo \"hi\""#
        );
    }

    #[test]
    fn sets_backoff_and_deadline_and_ttl() {
        let spec = sample_spec();
        let job = build_job_manifest(&spec, "tag:latest", "agent:latest", "gw:443", None, &[], "wkube");
        let jspec = job.spec.unwrap();
        assert_eq!(jspec.backoff_limit, Some(0));
        assert_eq!(jspec.active_deadline_seconds, Some(3600));
        assert_eq!(jspec.ttl_seconds_after_finished, Some(0));
    }

    #[test]
    fn secrets_override_conf_by_appearing_last() {
        let mut spec = sample_spec();
        spec.conf.insert("FOO".to_string(), "conf-value".to_string());
        spec.secrets.insert("FOO".to_string(), "secret-value".to_string());
        let env = env_vars(&spec.job_id, &spec.job_token, "gw", &spec.conf, &spec.secrets);
        let positions: Vec<&str> = env.iter().map(|e| e.name.as_str()).collect();
        let first_foo = positions.iter().position(|n| *n == "FOO").unwrap();
        let last_foo = positions.iter().rposition(|n| *n == "FOO").unwrap();
        assert!(last_foo > first_foo, "secret FOO must appear after conf FOO");
        assert_eq!(env[last_foo].value.as_deref(), Some("secret-value"));
    }

    #[test]
    fn pins_affinity_when_node_resolved() {
        let spec = sample_spec();
        let job = build_job_manifest(&spec, "tag:latest", "agent:latest", "gw:443", Some("node-a"), &[], "wkube");
        let affinity = job
            .spec
            .unwrap()
            .template
            .spec
            .unwrap()
            .affinity
            .expect("affinity must be set when a node is resolved");
        let terms = affinity
            .node_affinity
            .unwrap()
            .required_during_scheduling_ignored_during_execution
            .unwrap()
            .node_selector_terms;
        assert_eq!(terms.len(), 1);
    }

    #[test]
    fn no_affinity_when_node_unresolved() {
        let spec = sample_spec();
        let job = build_job_manifest(&spec, "tag:latest", "agent:latest", "gw:443", None, &[], "wkube");
        assert!(job.spec.unwrap().template.spec.unwrap().affinity.is_none());
    }
}
