use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, PersistentVolumeClaimSpec, ResourceRequirements};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{Api, ListParams, ObjectMeta};
use kube::runtime::{controller::Action, watcher, Controller};
use kube::{Client, Resource, ResourceExt};
use owo_colors::OwoColorize;
use tokio_util::sync::CancellationToken;

use kocao_common::{annotations, conditions as cond_names, labels, FINALIZER_NAME};
use kocao_types::{HarnessRun, WorkspaceSession, WorkspaceSessionPhase, WorkspaceSessionSpec, WorkspaceSessionStatus};

use crate::conditions::{condition, set_condition};
use crate::namegen::generate_unique;
use crate::patch::{ensure_finalizer, patch_metadata, patch_spec, patch_status, remove_finalizer, HasSpec, HasStatus};
use crate::Error;

impl HasStatus<WorkspaceSessionStatus> for WorkspaceSession {
    fn status_mut(&mut self) -> &mut WorkspaceSessionStatus {
        self.status.get_or_insert_with(Default::default)
    }
}

impl HasSpec<WorkspaceSessionSpec> for WorkspaceSession {
    fn spec_mut(&mut self) -> &mut WorkspaceSessionSpec {
        &mut self.spec
    }
}

fn pvc_name(session_name: &str) -> String {
    format!("{session_name}-workspace")
}

struct ContextData {
    client: Client,
}

/// Runs the `WorkspaceSession` controller until `shutdown` fires.
pub async fn run(client: Client, shutdown: CancellationToken) {
    println!("{}", "starting WorkspaceSession controller".green());
    let api: Api<WorkspaceSession> = Api::all(client.clone());
    let context = Arc::new(ContextData { client });
    let controller = Controller::new(api, watcher::Config::default())
        .run(reconcile, on_error, context)
        .for_each(|result| async move {
            if let Err(e) = result {
                eprintln!("{} {e}", "session reconcile error:".red());
            }
        });
    tokio::select! {
        _ = controller => {}
        _ = shutdown.cancelled() => {
            println!("{}", "WorkspaceSession controller shutting down".yellow());
        }
    }
}

fn on_error(_instance: Arc<WorkspaceSession>, error: &Error, _context: Arc<ContextData>) -> Action {
    eprintln!("{} {error}", "session reconcile failed:".red());
    Action::requeue(Duration::from_secs(5))
}

async fn reconcile(instance: Arc<WorkspaceSession>, context: Arc<ContextData>) -> Result<Action, Error> {
    let client = context.client.clone();
    let name = instance.name_any();
    let namespace = instance
        .namespace()
        .ok_or_else(|| Error::UserInput("WorkspaceSession must be namespaced".to_string()))?;

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

    let instance = if instance
        .spec
        .display_name
        .as_deref()
        .is_none_or(|d| d.is_empty())
    {
        let api: Api<WorkspaceSession> = Api::namespaced(client.clone(), &namespace);
        let siblings = api.list(&ListParams::default()).await?;
        let exists = |candidate: &str| {
            siblings.items.iter().any(|s| {
                s.name_any() != name && s.spec.display_name.as_deref() == Some(candidate)
            })
        };
        match generate_unique(exists) {
            Ok(display_name) => Arc::new(
                patch_spec(client.clone(), &instance, |spec: &mut WorkspaceSessionSpec| {
                    spec.display_name = Some(display_name);
                })
                .await?,
            ),
            Err(_) => {
                eprintln!("{}", "session reconcile: exhausted displayName uniqueness attempts".red());
                return Ok(Action::requeue(Duration::from_secs(5)));
            }
        }
    } else {
        instance
    };

    let pvc = pvc_name(&name);
    ensure_pvc(client.clone(), &namespace, &pvc, &instance).await?;

    let already_active = instance
        .status
        .as_ref()
        .is_some_and(|s| s.phase == WorkspaceSessionPhase::Active && s.pvc_name.as_deref() == Some(pvc.as_str()));
    if !already_active {
        patch_status(client, &instance, |status| {
            status.phase = WorkspaceSessionPhase::Active;
            status.pvc_name = Some(pvc.clone());
            status.message = Some("workspace volume is present".to_string());
            status.observed_generation = instance.metadata.generation;
            set_condition(
                &mut status.conditions,
                condition(cond_names::READY, true, "VolumeReady", "workspace volume is present", now()),
            );
        })
        .await?;
    }

    Ok(Action::requeue(Duration::from_secs(30)))
}

async fn reconcile_deleting(
    client: Client,
    instance: &WorkspaceSession,
    name: &str,
    namespace: &str,
) -> Result<Action, Error> {
    let runs: Api<HarnessRun> = Api::namespaced(client.clone(), namespace);
    let lp = ListParams::default().labels(&format!("{}={name}", labels::SESSION_NAME));
    let remaining = runs.list(&lp).await?;

    if !instance
        .status
        .as_ref()
        .is_some_and(|s| s.phase == WorkspaceSessionPhase::Terminating)
    {
        patch_status(client.clone(), instance, |status| {
            status.phase = WorkspaceSessionPhase::Terminating;
            status.message = Some(format!("deleting {} harness run(s)", remaining.items.len()));
        })
        .await?;
    }

    if !remaining.items.is_empty() {
        for run in &remaining.items {
            if run.metadata.deletion_timestamp.is_none()
                && let Some(run_name) = run.metadata.name.as_deref()
            {
                let _ = runs.delete(run_name, &Default::default()).await;
            }
        }
        return Ok(Action::requeue(Duration::from_millis(500)));
    }

    patch_metadata(client, instance, |obj| {
        remove_finalizer(obj.metadata.finalizers.get_or_insert_with(Vec::new), FINALIZER_NAME);
    })
    .await?;
    Ok(Action::await_change())
}

async fn ensure_pvc(client: Client, namespace: &str, pvc_name: &str, instance: &WorkspaceSession) -> Result<(), Error> {
    let api: Api<PersistentVolumeClaim> = Api::namespaced(client, namespace);
    if api.get_opt(pvc_name).await?.is_some() {
        return Ok(());
    }
    let mut requests = BTreeMap::new();
    requests.insert("storage".to_string(), Quantity(instance.spec.storage_size.clone()));
    let pvc = PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(pvc_name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([
                (labels::SESSION_NAME.to_string(), instance.name_any()),
                (labels::MANAGED_BY.to_string(), kocao_common::MANAGER_NAME.to_string()),
            ])),
            annotations: Some(BTreeMap::from([(
                annotations::CREATED_BY.to_string(),
                kocao_common::MANAGER_NAME.to_string(),
            )])),
            owner_references: Some(vec![instance.controller_owner_ref(&()).expect("owner ref")]),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            storage_class_name: instance.spec.storage_class_name.clone(),
            resources: Some(ResourceRequirements {
                requests: Some(requests),
                ..Default::default()
            }),
            ..Default::default()
        }),
        status: None,
    };
    match api.create(&Default::default(), &pvc).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(()),
        Err(e) => Err(Error::from(e)),
    }
}

fn now() -> Time {
    Time(chrono::Utc::now())
}
