use kube::api::{Api, Patch, PatchParams, Resource};
use kube::core::NamespaceResourceScope;
use kube::Client;
use serde::{Serialize, de::DeserializeOwned};
use std::fmt::Debug;

use kocao_common::MANAGER_NAME;
use crate::Error;

/// Implemented by the two CRD spec types so reconcilers can get at their
/// status object generically without a Rust-level embedding between the two
/// resources.
pub trait HasStatus<S> {
    fn status_mut(&mut self) -> &mut S;
}

/// Implemented by CRD spec types that a reconciler needs to write back to
/// (e.g. auto-assigning a generated field), so the diff-based patch below
/// stays generic across resource kinds.
pub trait HasSpec<Sp> {
    fn spec_mut(&mut self) -> &mut Sp;
}

/// Patches only the status subresource via a re-fetch-then-diff-then-apply,
/// so a stale in-memory copy never clobbers a status write from another
/// reconcile. `f` mutates the status in place; the resulting JSON patch is
/// computed against the instance as passed in, not a fresh `Get` — callers
/// own freshness by passing the most recently observed instance.
pub async fn patch_status<S, T>(client: Client, instance: &T, f: impl FnOnce(&mut S)) -> Result<T, Error>
where
    <T as Resource>::DynamicType: Default,
    T: Clone + Resource + HasStatus<S> + Serialize + DeserializeOwned + Debug + Resource<Scope = NamespaceResourceScope>,
{
    let patch = Patch::Json::<T>({
        let mut modified = instance.clone();
        f(modified.status_mut());
        json_patch::diff(
            &serde_json::to_value(instance)?,
            &serde_json::to_value(&modified)?,
        )
    });
    let name = instance
        .meta()
        .name
        .as_deref()
        .ok_or_else(|| Error::UserInput("resource is missing metadata.name".to_string()))?;
    let namespace = instance
        .meta()
        .namespace
        .as_deref()
        .ok_or_else(|| Error::UserInput("resource is missing metadata.namespace".to_string()))?;
    let api: Api<T> = Api::namespaced(client, namespace);
    Ok(api
        .patch_status(name, &PatchParams::apply(MANAGER_NAME), &patch)
        .await?)
}

/// Patches the spec object via the same re-fetch-as-passed-in, diff, apply
/// idiom as [`patch_status`], but against the main resource rather than its
/// status subresource. Used for reconciler-driven spec fields such as
/// auto-assigned display names.
pub async fn patch_spec<Sp, T>(client: Client, instance: &T, f: impl FnOnce(&mut Sp)) -> Result<T, Error>
where
    <T as Resource>::DynamicType: Default,
    T: Clone + Resource + HasSpec<Sp> + Serialize + DeserializeOwned + Debug + Resource<Scope = NamespaceResourceScope>,
{
    let patch = Patch::Json::<T>({
        let mut modified = instance.clone();
        f(modified.spec_mut());
        json_patch::diff(
            &serde_json::to_value(instance)?,
            &serde_json::to_value(&modified)?,
        )
    });
    let name = instance
        .meta()
        .name
        .as_deref()
        .ok_or_else(|| Error::UserInput("resource is missing metadata.name".to_string()))?;
    let namespace = instance
        .meta()
        .namespace
        .as_deref()
        .ok_or_else(|| Error::UserInput("resource is missing metadata.namespace".to_string()))?;
    let api: Api<T> = Api::namespaced(client, namespace);
    Ok(api
        .patch(name, &PatchParams::apply(MANAGER_NAME), &patch)
        .await?)
}

/// Merge-patches metadata (labels, annotations, finalizers) from a mutated
/// copy of `instance`, kept separate from status flushes so one write can
/// never silently clobber the other's field.
pub async fn patch_metadata<T>(client: Client, instance: &T, f: impl FnOnce(&mut T)) -> Result<T, Error>
where
    <T as Resource>::DynamicType: Default,
    T: Clone + Resource + Serialize + DeserializeOwned + Debug + Resource<Scope = NamespaceResourceScope>,
{
    let mut modified = instance.clone();
    f(&mut modified);
    let patch = Patch::Merge(serde_json::json!({
        "metadata": {
            "finalizers": modified.meta().finalizers,
            "labels": modified.meta().labels,
            "annotations": modified.meta().annotations,
        }
    }));
    let name = instance
        .meta()
        .name
        .as_deref()
        .ok_or_else(|| Error::UserInput("resource is missing metadata.name".to_string()))?;
    let namespace = instance
        .meta()
        .namespace
        .as_deref()
        .ok_or_else(|| Error::UserInput("resource is missing metadata.namespace".to_string()))?;
    let api: Api<T> = Api::namespaced(client, namespace);
    Ok(api
        .patch(name, &PatchParams::apply(MANAGER_NAME), &patch)
        .await?)
}

pub fn ensure_finalizer(finalizers: &mut Vec<String>, name: &str) -> bool {
    if finalizers.iter().any(|f| f == name) {
        return false;
    }
    finalizers.push(name.to_string());
    true
}

pub fn remove_finalizer(finalizers: &mut Vec<String>, name: &str) -> bool {
    let before = finalizers.len();
    finalizers.retain(|f| f != name);
    finalizers.len() != before
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_finalizer_is_idempotent() {
        let mut finalizers = vec![];
        assert!(ensure_finalizer(&mut finalizers, "kocao.withakay.github.com/finalizer"));
        assert!(!ensure_finalizer(&mut finalizers, "kocao.withakay.github.com/finalizer"));
        assert_eq!(finalizers.len(), 1);
    }

    #[test]
    fn remove_finalizer_reports_whether_it_was_present() {
        let mut finalizers = vec!["kocao.withakay.github.com/finalizer".to_string()];
        assert!(remove_finalizer(&mut finalizers, "kocao.withakay.github.com/finalizer"));
        assert!(!remove_finalizer(&mut finalizers, "kocao.withakay.github.com/finalizer"));
        assert!(finalizers.is_empty());
    }
}
