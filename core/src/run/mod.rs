use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{Api, DeleteParams};
use kube::runtime::{controller::Action, watcher, Controller};
use kube::{Client, Resource, ResourceExt};
use owo_colors::OwoColorize;
use tokio_util::sync::CancellationToken;

use kocao_common::{conditions as cond_names, hash_spec, FINALIZER_NAME};
use kocao_types::{HarnessRun, HarnessRunPhase, HarnessRunSpec, HarnessRunStatus, WorkspaceSession};

use crate::conditions::{condition, set_condition};
use crate::egress::{ensure_run_egress_network_policy, github_egress_cidrs_from_env, normalize_egress_mode};
use crate::patch::{ensure_finalizer, patch_metadata, patch_status, remove_finalizer, HasStatus};
use crate::podspec::{build_harness_pod, derive_pod_name, PodSpecInputs};
use crate::Error;

impl HasStatus<HarnessRunStatus> for HarnessRun {
    fn status_mut(&mut self) -> &mut HarnessRunStatus {
        self.status.get_or_insert_with(Default::default)
    }
}

const FATAL_WAITING_REASONS: &[&str] = &[
    "ImagePullBackOff",
    "ErrImagePull",
    "ErrImageNeverPull",
    "InvalidImageName",
    "CreateContainerConfigError",
    "CreateContainerError",
    "RunContainerError",
    "CreateSandboxError",
    "RegistryUnavailable",
];

struct ContextData {
    client: Client,
}

/// Runs the `HarnessRun` controller until `shutdown` fires.
pub async fn run(client: Client, shutdown: CancellationToken) {
    println!("{}", "starting HarnessRun controller".green());
    let api: Api<HarnessRun> = Api::all(client.clone());
    let context = Arc::new(ContextData { client });
    let controller = Controller::new(api, watcher::Config::default())
        .run(reconcile, on_error, context)
        .for_each(|result| async move {
            if let Err(e) = result {
                eprintln!("{} {e}", "run reconcile error:".red());
            }
        });
    tokio::select! {
        _ = controller => {}
        _ = shutdown.cancelled() => {
            println!("{}", "HarnessRun controller shutting down".yellow());
        }
    }
}

fn on_error(_instance: Arc<HarnessRun>, error: &Error, _context: Arc<ContextData>) -> Action {
    eprintln!("{} {error}", "run reconcile failed:".red());
    Action::requeue(Duration::from_secs(5))
}

async fn reconcile(instance: Arc<HarnessRun>, context: Arc<ContextData>) -> Result<Action, Error> {
    let client = context.client.clone();
    let name = instance.name_any();
    let namespace = instance
        .namespace()
        .ok_or_else(|| Error::UserInput("HarnessRun must be namespaced".to_string()))?;

    if instance.metadata.deletion_timestamp.is_some() {
        return reconcile_deleting(client, &instance, &name, &namespace).await;
    }

    let meta_changed = !instance
        .metadata
        .finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|f| f == FINALIZER_NAME));
    let instance = if meta_changed {
        Arc::new(
            patch_metadata(client.clone(), &instance, |obj| {
                ensure_finalizer(obj.metadata.finalizers.get_or_insert_with(Vec::new), FINALIZER_NAME);
            })
            .await?,
        )
    } else {
        instance
    };

    if let Some(status) = instance.status.as_ref()
        && status.phase.is_terminal()
    {
        return handle_ttl(client, &instance, status).await;
    }

    let session = match instance.spec.workspace_session_name.as_deref() {
        Some(session_name) => {
            let sessions: Api<WorkspaceSession> = Api::namespaced(client.clone(), &namespace);
            match sessions.get_opt(session_name).await? {
                Some(s) => Some(s),
                None => {
                    fail(client, &instance, format!("workspace session '{session_name}' not found")).await?;
                    return Ok(Action::requeue(Duration::from_secs(2)));
                }
            }
        }
        None => None,
    };

    if let Some(reason) = validate_spec(&instance.spec) {
        fail(client, &instance, reason).await?;
        return Ok(Action::requeue(Duration::from_secs(30)));
    }

    let pod_name = derive_pod_name(&name, session.as_ref().and_then(|s| s.spec.display_name.as_deref()));
    let pods: Api<Pod> = Api::namespaced(client.clone(), &namespace);

    match pods.get_opt(&pod_name).await? {
        None => {
            create_pod(client.clone(), &namespace, &name, &instance, session.as_ref()).await?;
            if !instance
                .status
                .as_ref()
                .is_some_and(|s| s.phase == HarnessRunPhase::Starting && s.pod_name.as_deref() == Some(pod_name.as_str()))
            {
                patch_status(client, &instance, |status| {
                    status.phase = HarnessRunPhase::Starting;
                    status.pod_name = Some(pod_name.clone());
                    status.message = Some("pod created".to_string());
                    status.observed_generation = instance.metadata.generation;
                })
                .await?;
            }
            Ok(Action::requeue(Duration::from_secs(5)))
        }
        Some(pod) => observe_pod(client, &instance, &pod_name, &pod).await,
    }
}

async fn reconcile_deleting(
    client: Client,
    instance: &HarnessRun,
    name: &str,
    namespace: &str,
) -> Result<Action, Error> {
    let pod_name = instance
        .status
        .as_ref()
        .and_then(|s| s.pod_name.clone())
        .unwrap_or_else(|| derive_pod_name(name, None));

    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
    match pods.delete(&pod_name, &DeleteParams::default()).await {
        Ok(_) => return Ok(Action::requeue(Duration::from_millis(500))),
        Err(kube::Error::Api(ae)) if ae.code == 404 => {}
        Err(e) => return Err(Error::from(e)),
    }

    patch_metadata(client, instance, |obj| {
        remove_finalizer(obj.metadata.finalizers.get_or_insert_with(Vec::new), FINALIZER_NAME);
    })
    .await?;
    Ok(Action::await_change())
}

/// Checks `repoURL`/`image`/`gitAuth` independently so the run fails with the
/// first violated rule's specific message rather than a generic one.
fn validate_spec(spec: &HarnessRunSpec) -> Option<String> {
    if spec.repo_url.trim().is_empty() {
        return Some("repoURL required".to_string());
    }
    if !spec.repo_url.starts_with("https://") {
        return Some("repoURL must be an https:// URL".to_string());
    }
    if spec.image.trim().is_empty() {
        return Some("image required".to_string());
    }
    if let Some(git_auth) = spec.git_auth.as_ref()
        && git_auth.secret_name.trim().is_empty()
    {
        return Some("gitAuth.secretName required".to_string());
    }
    None
}

async fn fail(client: Client, instance: &HarnessRun, message: String) -> Result<(), Error> {
    patch_status(client, instance, |status| {
        status.phase = HarnessRunPhase::Failed;
        status.message = Some(message.clone());
        status.finished_at = Some(now());
        status.observed_generation = instance.metadata.generation;
        set_condition(&mut status.conditions, condition(cond_names::FAILED, true, "Failed", &message, now()));
    })
    .await?;
    Ok(())
}

async fn create_pod(
    client: Client,
    namespace: &str,
    run_name: &str,
    instance: &HarnessRun,
    session: Option<&WorkspaceSession>,
) -> Result<(), Error> {
    let inputs = PodSpecInputs {
        run_name,
        namespace,
        spec: &instance.spec,
        workspace_pvc_name: session.and_then(|s| s.status.as_ref()).and_then(|s| s.pvc_name.as_deref()),
        session_display_name: session.and_then(|s| s.spec.display_name.as_deref()),
        spec_hash: hash_spec(&instance.spec),
    };
    let mut pod = build_harness_pod(&inputs);
    pod.metadata.owner_references = Some(vec![instance.controller_owner_ref(&()).expect("owner ref")]);

    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
    match pods.create(&Default::default(), &pod).await {
        Ok(_) => {}
        Err(kube::Error::Api(ae)) if ae.code == 409 => {}
        Err(e) => return Err(Error::from(e)),
    }

    let mode = normalize_egress_mode(&instance.spec.egress_mode);
    let cidrs = github_egress_cidrs_from_env();
    ensure_run_egress_network_policy(
        client,
        namespace,
        instance.controller_owner_ref(&()).expect("owner ref"),
        run_name,
        mode,
        &cidrs,
    )
    .await
}

fn unschedulable_reason(pod: &Pod) -> Option<String> {
    let cond = pod
        .status
        .as_ref()?
        .conditions
        .as_ref()?
        .iter()
        .find(|c| c.type_ == "PodScheduled")?;
    if cond.status == "False" && cond.reason.as_deref() == Some("Unschedulable") {
        Some(format!("pod is unschedulable: {}", cond.message.as_deref().unwrap_or("unspecified")))
    } else {
        None
    }
}

fn fatal_container_reason(pod: &Pod) -> Option<String> {
    let statuses = pod.status.as_ref()?.container_statuses.as_ref()?;
    for cs in statuses {
        let Some(waiting) = cs.state.as_ref().and_then(|s| s.waiting.as_ref()) else {
            continue;
        };
        let reason = waiting.reason.as_deref().unwrap_or("");
        if reason == "CrashLoopBackOff" {
            return Some(format!("container '{}' is in CrashLoopBackOff", cs.name));
        }
        if FATAL_WAITING_REASONS.contains(&reason) {
            return Some(format!("container '{}' is in unrecoverable waiting state: {reason}", cs.name));
        }
    }
    None
}

async fn observe_pod(client: Client, instance: &HarnessRun, pod_name: &str, pod: &Pod) -> Result<Action, Error> {
    if let Some(reason) = unschedulable_reason(pod) {
        patch_status(client, instance, |status| {
            status.phase = HarnessRunPhase::Failed;
            status.message = Some(reason.clone());
            status.finished_at = Some(now());
            status.observed_generation = instance.metadata.generation;
            set_condition(&mut status.conditions, condition(cond_names::FAILED, true, "Unschedulable", &reason, now()));
        })
        .await?;
        return Ok(Action::requeue(Duration::from_secs(30)));
    }

    if let Some(reason) = fatal_container_reason(pod) {
        patch_status(client, instance, |status| {
            status.phase = HarnessRunPhase::Failed;
            status.message = Some(reason.clone());
            status.finished_at = Some(now());
            status.observed_generation = instance.metadata.generation;
            set_condition(&mut status.conditions, condition(cond_names::FAILED, true, "ContainerError", &reason, now()));
        })
        .await?;
        return Ok(Action::requeue(Duration::from_secs(30)));
    }

    let pod_phase = pod.status.as_ref().and_then(|s| s.phase.as_deref()).unwrap_or("Pending");
    let mapped = match pod_phase {
        "Pending" => Some(HarnessRunPhase::Starting),
        "Running" => Some(HarnessRunPhase::Running),
        "Succeeded" => Some(HarnessRunPhase::Succeeded),
        "Failed" => Some(HarnessRunPhase::Failed),
        _ => None,
    };
    let Some(mapped) = mapped else {
        return Ok(Action::requeue(Duration::from_secs(10)));
    };

    let already = instance.status.as_ref().is_some_and(|s| s.phase == mapped && s.pod_name.as_deref() == Some(pod_name));
    if !already {
        let message = format!("pod is {pod_phase}");
        let (cond_name, ok) = match mapped {
            HarnessRunPhase::Running => (cond_names::RUNNING, true),
            HarnessRunPhase::Succeeded => (cond_names::SUCCEEDED, true),
            HarnessRunPhase::Failed => (cond_names::FAILED, true),
            _ => (cond_names::RUNNING, false),
        };
        patch_status(client, instance, |status| {
            status.phase = mapped;
            status.pod_name = Some(pod_name.to_string());
            status.message = Some(message.clone());
            status.observed_generation = instance.metadata.generation;
            if mapped.is_terminal() {
                status.finished_at = Some(now());
            }
            set_condition(&mut status.conditions, condition(cond_name, ok, "PodObserved", &message, now()));
        })
        .await?;
    }

    Ok(Action::requeue(Duration::from_secs(10)))
}

async fn handle_ttl(client: Client, instance: &HarnessRun, status: &HarnessRunStatus) -> Result<Action, Error> {
    let Some(finished_at) = status.finished_at.as_ref() else {
        return Ok(Action::requeue(Duration::from_secs(30)));
    };
    let ttl = Duration::from_secs(instance.spec.ttl_seconds_after_finished as u64);
    let elapsed = chrono::Utc::now()
        .signed_duration_since(finished_at.0)
        .to_std()
        .unwrap_or(Duration::ZERO);

    if elapsed >= ttl {
        let name = instance.name_any();
        let namespace = instance.namespace().unwrap_or_default();
        let runs: Api<HarnessRun> = Api::namespaced(client, &namespace);
        let _ = runs.delete(&name, &DeleteParams::default()).await;
        return Ok(Action::await_change());
    }
    Ok(Action::requeue(ttl - elapsed))
}

fn now() -> Time {
    Time(chrono::Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kocao_types::GitAuthSpec;

    fn base_spec() -> HarnessRunSpec {
        HarnessRunSpec {
            workspace_session_name: Some("session-a".to_string()),
            repo_url: "https://example.com/repo.git".to_string(),
            image: "ghcr.io/example/harness:latest".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn validate_spec_accepts_a_minimal_valid_spec() {
        assert_eq!(validate_spec(&base_spec()), None);
    }

    #[test]
    fn validate_spec_rejects_empty_repo_url() {
        let mut spec = base_spec();
        spec.repo_url = "".to_string();
        assert_eq!(validate_spec(&spec), Some("repoURL required".to_string()));
    }

    #[test]
    fn validate_spec_rejects_non_https_repo_url() {
        let mut spec = base_spec();
        spec.repo_url = "git://example.com/repo.git".to_string();
        assert_eq!(validate_spec(&spec), Some("repoURL must be an https:// URL".to_string()));
    }

    #[test]
    fn validate_spec_rejects_empty_image() {
        let mut spec = base_spec();
        spec.image = "".to_string();
        assert_eq!(validate_spec(&spec), Some("image required".to_string()));
    }

    #[test]
    fn validate_spec_rejects_git_auth_with_empty_secret_name() {
        let mut spec = base_spec();
        spec.git_auth = Some(GitAuthSpec {
            secret_name: "".to_string(),
            token_key: None,
            username_key: None,
        });
        assert_eq!(validate_spec(&spec), Some("gitAuth.secretName required".to_string()));
    }

    #[test]
    fn fatal_container_reason_detects_crash_loop_back_off() {
        use k8s_openapi::api::core::v1::{ContainerState, ContainerStateWaiting, ContainerStatus, PodStatus};
        let pod = Pod {
            status: Some(PodStatus {
                container_statuses: Some(vec![ContainerStatus {
                    name: "harness".to_string(),
                    state: Some(ContainerState {
                        waiting: Some(ContainerStateWaiting {
                            reason: Some("CrashLoopBackOff".to_string()),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(fatal_container_reason(&pod).unwrap().contains("CrashLoopBackOff"));
    }

    #[test]
    fn unschedulable_reason_reads_the_pod_scheduled_condition() {
        use k8s_openapi::api::core::v1::PodStatus;
        use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition as PodCondition;
        let pod = Pod {
            status: Some(PodStatus {
                conditions: Some(vec![PodCondition {
                    type_: "PodScheduled".to_string(),
                    status: "False".to_string(),
                    reason: Some("Unschedulable".to_string()),
                    message: Some("insufficient cpu".to_string()),
                    last_transition_time: now(),
                    observed_generation: None,
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(unschedulable_reason(&pod).unwrap().contains("insufficient cpu"));
    }
}
