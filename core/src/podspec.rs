use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Capabilities, Container, EnvFromSource, EnvVar as K8sEnvVar, KeyToPath,
    LocalObjectReference, Pod, PodSecurityContext, PodSpec, SeccompProfile,
    SecretEnvSource, SecretVolumeSource, SecurityContext, Volume, VolumeMount,
};
use kube::api::ObjectMeta;

use crate::dns::{sanitize_dns_label, suffix};
use kocao_common::{annotations, labels};
use kocao_types::HarnessRunSpec;

const WORKSPACE_VOLUME: &str = "workspace";
const WORKSPACE_MOUNT_PATH: &str = "/workspace";
const GIT_AUTH_VOLUME: &str = "git-auth";
const GIT_AUTH_MOUNT_PATH: &str = "/var/run/secrets/kocao/git";
const AGENT_OAUTH_VOLUME: &str = "agent-oauth";
const CONTAINER_NAME: &str = "harness";

/// Derives a human-readable pod name. With a display name:
/// `<sanitized-display-name>-<last 5 chars of run name>` (max 63 chars).
/// Without one: `<sanitized-run-name>-pod`.
pub fn derive_pod_name(run_name: &str, session_display_name: Option<&str>) -> String {
    if let Some(display) = session_display_name.filter(|d| !d.is_empty()) {
        let mut name = format!("{}-{}", sanitize_dns_label(display), suffix(run_name, 5));
        if name.len() > 63 {
            name.truncate(63);
            name = name.trim_matches('-').to_string();
        }
        return name;
    }
    let mut prefix = sanitize_dns_label(run_name);
    if prefix.len() > 59 {
        prefix.truncate(59);
        prefix = prefix.trim_matches('-').to_string();
        if prefix.is_empty() {
            prefix = "run".to_string();
        }
    }
    format!("{prefix}-pod")
}

pub struct PodSpecInputs<'a> {
    pub run_name: &'a str,
    pub namespace: &'a str,
    pub spec: &'a HarnessRunSpec,
    pub workspace_pvc_name: Option<&'a str>,
    pub session_display_name: Option<&'a str>,
    pub spec_hash: String,
}

/// Builds a hardened, non-root `Pod` for a `HarnessRun`.
pub fn build_harness_pod(inputs: &PodSpecInputs) -> Pod {
    let spec = inputs.spec;
    let run_as_non_root = true;
    let allow_privilege_escalation = false;
    let uid = 10001;
    let gid = 10001;
    let seccomp = SeccompProfile {
        type_: "RuntimeDefault".to_string(),
        ..Default::default()
    };

    let mut pod_labels = BTreeMap::new();
    pod_labels.insert(labels::APP_NAME.to_string(), "kocao-harness".to_string());
    pod_labels.insert(
        labels::MANAGED_BY.to_string(),
        "kocao-control-plane-operator".to_string(),
    );
    pod_labels.insert(labels::RUN_NAME.to_string(), inputs.run_name.to_string());
    if let Some(session_name) = spec.workspace_session_name.as_ref().filter(|s| !s.is_empty()) {
        pod_labels.insert(labels::SESSION_NAME.to_string(), session_name.clone());
    }
    if let Some(display) = inputs.session_display_name.filter(|d| !d.is_empty()) {
        pod_labels.insert(labels::DISPLAY_NAME.to_string(), display.to_string());
    }

    let name = derive_pod_name(inputs.run_name, inputs.session_display_name);

    let mut env = Vec::with_capacity(spec.env.len() + 6);
    env.push(K8sEnvVar {
        name: "KOCAO_REPO_URL".to_string(),
        value: Some(spec.repo_url.clone()),
        ..Default::default()
    });
    if let Some(rev) = spec.repo_revision.as_ref().filter(|r| !r.is_empty()) {
        env.push(K8sEnvVar {
            name: "KOCAO_REPO_REVISION".to_string(),
            value: Some(rev.clone()),
            ..Default::default()
        });
    }
    for (name, value) in [
        ("KOCAO_WORKSPACE_DIR", WORKSPACE_MOUNT_PATH),
        ("KOCAO_REPO_DIR", "/workspace/repo"),
        ("GIT_TERMINAL_PROMPT", "0"),
    ] {
        env.push(K8sEnvVar {
            name: name.to_string(),
            value: Some(value.to_string()),
            ..Default::default()
        });
    }
    for e in &spec.env {
        if e.name.trim().starts_with("KOCAO_") {
            // Reserved for the operator/harness contract; user overrides are dropped.
            continue;
        }
        env.push(K8sEnvVar {
            name: e.name.clone(),
            value: Some(e.value.clone()),
            ..Default::default()
        });
    }

    let workspace_volume_source = match inputs.workspace_pvc_name.filter(|n| !n.trim().is_empty()) {
        Some(pvc) => k8s_openapi::api::core::v1::VolumeSource {
            persistent_volume_claim: Some(
                k8s_openapi::api::core::v1::PersistentVolumeClaimVolumeSource {
                    claim_name: pvc.to_string(),
                    read_only: None,
                },
            ),
            ..Default::default()
        },
        None => k8s_openapi::api::core::v1::VolumeSource {
            empty_dir: Some(Default::default()),
            ..Default::default()
        },
    };
    let mut volumes = vec![Volume {
        name: WORKSPACE_VOLUME.to_string(),
        volume_source: workspace_volume_source,
    }];
    let mut volume_mounts = vec![VolumeMount {
        name: WORKSPACE_VOLUME.to_string(),
        mount_path: WORKSPACE_MOUNT_PATH.to_string(),
        ..Default::default()
    }];

    if let Some(git_auth) = spec.git_auth.as_ref().filter(|g| !g.secret_name.is_empty()) {
        let token_key = git_auth
            .token_key
            .clone()
            .filter(|k| !k.is_empty())
            .unwrap_or_else(|| "token".to_string());
        let mut items = vec![KeyToPath {
            key: token_key,
            path: "token".to_string(),
            ..Default::default()
        }];
        if let Some(username_key) = git_auth.username_key.clone().filter(|k| !k.is_empty()) {
            items.push(KeyToPath {
                key: username_key,
                path: "username".to_string(),
                ..Default::default()
            });
        }
        volumes.push(Volume {
            name: GIT_AUTH_VOLUME.to_string(),
            volume_source: k8s_openapi::api::core::v1::VolumeSource {
                secret: Some(SecretVolumeSource {
                    secret_name: Some(git_auth.secret_name.clone()),
                    items: Some(items),
                    ..Default::default()
                }),
                ..Default::default()
            },
        });
        volume_mounts.push(VolumeMount {
            name: GIT_AUTH_VOLUME.to_string(),
            mount_path: GIT_AUTH_MOUNT_PATH.to_string(),
            read_only: Some(true),
            ..Default::default()
        });
        env.push(K8sEnvVar {
            name: "GIT_ASKPASS".to_string(),
            value: Some("/usr/local/bin/kocao-git-askpass".to_string()),
            ..Default::default()
        });
        env.push(K8sEnvVar {
            name: "KOCAO_GIT_TOKEN_FILE".to_string(),
            value: Some(format!("{GIT_AUTH_MOUNT_PATH}/token")),
            ..Default::default()
        });
        if git_auth.username_key.as_ref().is_some_and(|k| !k.is_empty()) {
            env.push(K8sEnvVar {
                name: "KOCAO_GIT_USERNAME_FILE".to_string(),
                value: Some(format!("{GIT_AUTH_MOUNT_PATH}/username")),
                ..Default::default()
            });
        }
    }

    let mut env_from = None;
    if let Some(agent_auth) = spec.agent_auth.as_ref() {
        if let Some(secret_name) = agent_auth
            .api_key_secret_name
            .clone()
            .filter(|s| !s.is_empty())
        {
            env_from = Some(vec![EnvFromSource {
                secret_ref: Some(SecretEnvSource {
                    local_object_reference: LocalObjectReference { name: secret_name },
                    optional: Some(true),
                }),
                ..Default::default()
            }]);
        }
        if let Some(secret_name) = agent_auth
            .oauth_secret_name
            .clone()
            .filter(|s| !s.is_empty())
        {
            volumes.push(Volume {
                name: AGENT_OAUTH_VOLUME.to_string(),
                volume_source: k8s_openapi::api::core::v1::VolumeSource {
                    secret: Some(SecretVolumeSource {
                        secret_name: Some(secret_name),
                        default_mode: Some(0o600),
                        optional: Some(true),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            });
            // No explicit `items` list: the secret is projected whole and each
            // agent CLI's sub-path mount resolves to an empty file if its key
            // is absent, so the pod still starts with a partially populated
            // secret.
            volume_mounts.push(VolumeMount {
                name: AGENT_OAUTH_VOLUME.to_string(),
                mount_path: "/home/kocao/.local/share/opencode/auth.json".to_string(),
                sub_path: Some("opencode-auth.json".to_string()),
                read_only: Some(true),
                ..Default::default()
            });
            volume_mounts.push(VolumeMount {
                name: AGENT_OAUTH_VOLUME.to_string(),
                mount_path: "/home/kocao/.codex/auth.json".to_string(),
                sub_path: Some("codex-auth.json".to_string()),
                read_only: Some(true),
                ..Default::default()
            });
        }
    }

    let working_dir = spec
        .working_dir
        .clone()
        .filter(|w| !w.is_empty())
        .unwrap_or_else(|| WORKSPACE_MOUNT_PATH.to_string());

    let container = Container {
        name: CONTAINER_NAME.to_string(),
        image: Some(spec.image.clone()),
        command: if spec.command.is_empty() {
            None
        } else {
            Some(spec.command.clone())
        },
        args: if spec.args.is_empty() {
            None
        } else {
            Some(spec.args.clone())
        },
        working_dir: Some(working_dir),
        env: Some(env),
        env_from,
        volume_mounts: Some(volume_mounts),
        security_context: Some(SecurityContext {
            run_as_non_root: Some(run_as_non_root),
            run_as_user: Some(uid),
            run_as_group: Some(gid),
            allow_privilege_escalation: Some(allow_privilege_escalation),
            capabilities: Some(Capabilities {
                drop: Some(vec!["ALL".to_string()]),
                ..Default::default()
            }),
            seccomp_profile: Some(seccomp.clone()),
            ..Default::default()
        }),
        ..Default::default()
    };

    let mut annotations_map = BTreeMap::new();
    annotations_map.insert(annotations::SPEC_HASH.to_string(), inputs.spec_hash.clone());
    annotations_map.insert(
        annotations::CREATED_BY.to_string(),
        "kocao-control-plane-operator".to_string(),
    );

    Pod {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(inputs.namespace.to_string()),
            labels: Some(pod_labels),
            annotations: Some(annotations_map),
            ..Default::default()
        },
        spec: Some(PodSpec {
            security_context: Some(PodSecurityContext {
                run_as_non_root: Some(run_as_non_root),
                fs_group: Some(gid),
                seccomp_profile: Some(seccomp),
                ..Default::default()
            }),
            restart_policy: Some("Never".to_string()),
            containers: vec![container],
            volumes: Some(volumes),
            ..Default::default()
        }),
        status: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kocao_types::HarnessRunSpec;

    fn base_spec() -> HarnessRunSpec {
        HarnessRunSpec {
            workspace_session_name: Some("session-a".to_string()),
            repo_url: "https://example.com/repo.git".to_string(),
            image: "ghcr.io/example/harness:latest".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn pod_name_uses_display_name_and_run_suffix_when_available() {
        let name = derive_pod_name("harnessrun-abc12345", Some("elegant-galileo"));
        assert_eq!(name, "elegant-galileo-45");
    }

    #[test]
    fn pod_name_falls_back_to_legacy_pod_suffix() {
        let name = derive_pod_name("my-run", None);
        assert_eq!(name, "my-run-pod");
    }

    #[test]
    fn pod_name_never_exceeds_63_characters() {
        let long_display = "x".repeat(100);
        let name = derive_pod_name("run-with-a-long-name-00000", Some(&long_display));
        assert!(name.len() <= 63);
    }

    #[test]
    fn kocao_prefixed_user_env_is_dropped() {
        let mut spec = base_spec();
        spec.env = vec![
            kocao_types::EnvVar {
                name: "KOCAO_SNEAKY".to_string(),
                value: "x".to_string(),
            },
            kocao_types::EnvVar {
                name: "MY_VAR".to_string(),
                value: "y".to_string(),
            },
        ];
        let pod = build_harness_pod(&PodSpecInputs {
            run_name: "run-a",
            namespace: "default",
            spec: &spec,
            workspace_pvc_name: Some("session-a-workspace"),
            session_display_name: None,
            spec_hash: "deadbeef".to_string(),
        });
        let env = pod.spec.unwrap().containers[0].env.clone().unwrap();
        assert!(!env.iter().any(|e| e.name == "KOCAO_SNEAKY"));
        assert!(env.iter().any(|e| e.name == "MY_VAR"));
    }

    #[test]
    fn security_context_is_hardened() {
        let spec = base_spec();
        let pod = build_harness_pod(&PodSpecInputs {
            run_name: "run-a",
            namespace: "default",
            spec: &spec,
            workspace_pvc_name: None,
            session_display_name: None,
            spec_hash: "deadbeef".to_string(),
        });
        let pod_spec = pod.spec.unwrap();
        let sc = pod_spec.security_context.unwrap();
        assert_eq!(sc.run_as_non_root, Some(true));
        assert_eq!(sc.fs_group, Some(10001));
        let container_sc = pod_spec.containers[0].security_context.clone().unwrap();
        assert_eq!(container_sc.run_as_user, Some(10001));
        assert_eq!(container_sc.allow_privilege_escalation, Some(false));
        assert_eq!(
            container_sc.capabilities.unwrap().drop,
            Some(vec!["ALL".to_string()])
        );
    }

    #[test]
    fn missing_workspace_pvc_falls_back_to_empty_dir() {
        let spec = base_spec();
        let pod = build_harness_pod(&PodSpecInputs {
            run_name: "run-a",
            namespace: "default",
            spec: &spec,
            workspace_pvc_name: None,
            session_display_name: None,
            spec_hash: "deadbeef".to_string(),
        });
        let volumes = pod.spec.unwrap().volumes.unwrap();
        let workspace = volumes.iter().find(|v| v.name == WORKSPACE_VOLUME).unwrap();
        assert!(workspace.empty_dir.is_some());
    }

    #[test]
    fn agent_oauth_secret_mounts_both_cli_subpaths() {
        let mut spec = base_spec();
        spec.agent_auth = Some(kocao_types::AgentAuthSpec {
            api_key_secret_name: None,
            oauth_secret_name: Some("agent-oauth-secret".to_string()),
        });
        let pod = build_harness_pod(&PodSpecInputs {
            run_name: "run-a",
            namespace: "default",
            spec: &spec,
            workspace_pvc_name: None,
            session_display_name: None,
            spec_hash: "deadbeef".to_string(),
        });
        let mounts = pod.spec.unwrap().containers[0].volume_mounts.clone().unwrap();
        assert!(mounts.iter().any(|m| m.mount_path.ends_with("opencode/auth.json")));
        assert!(mounts.iter().any(|m| m.mount_path.ends_with(".codex/auth.json")));
    }
}
