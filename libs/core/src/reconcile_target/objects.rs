//! Create/Update/Delete object operations (SPEC_FULL.md §4.2.3).

use json_patch::{Patch as JsonPatch, PatchOperation, ReplaceOperation};
use kube::api::{Api, DeleteParams, DynamicObject, Patch, PatchParams, Preconditions, PropagationPolicy};
use kube::discovery::ApiResource;
use kube::Client;

use crate::error::{is_conflict, Error, Result};
use reconciler_k8s_util::finalizer;

fn api_for(client: &Client, resource: &ApiResource, namespace: Option<&str>) -> Api<DynamicObject> {
    match namespace {
        Some(ns) => Api::namespaced_with(client.clone(), ns, resource),
        None => Api::all_with(client.clone(), resource),
    }
}

fn object_key(object: &DynamicObject) -> String {
    let kind = object.types.as_ref().map(|t| t.kind.as_str()).unwrap_or("?");
    match &object.metadata.namespace {
        Some(ns) => format!("{kind}/{ns}/{}", object.metadata.name.as_deref().unwrap_or("?")),
        None => format!("{kind}/{}", object.metadata.name.as_deref().unwrap_or("?")),
    }
}

/// Declares whether a GVK is a finalizer-gated installer type; these get
/// the reconciler's own finalizer so `is_deletion_allowed` can run before
/// the API server removes them out from under in-flight instances.
pub fn is_finalizer_gated(kind: &str) -> bool {
    matches!(kind, "CustomResourceDefinition" | "APIService")
}

/// Creates `object` against the target cluster. For a finalizer-gated
/// installer type the reconciler's finalizer is added before the call.
pub async fn create(
    client: &Client,
    resource: &ApiResource,
    reconciler_name: &str,
    mut object: DynamicObject,
) -> Result<DynamicObject> {
    if is_finalizer_gated(&object.types.as_ref().map(|t| t.kind.clone()).unwrap_or_default()) {
        finalizer::add(&mut object, reconciler_name);
    }
    let api = api_for(client, resource, object.metadata.namespace.as_deref());
    let params = kube::api::PostParams {
        field_manager: Some(reconciler_name.to_string()),
        ..Default::default()
    };
    api.create(&params, &object).await.map_err(Error::from)
}

/// Replaces `existing` with `desired`. Rejects a non-zero deletion
/// timestamp on `existing` as an internal-assertion error (SPEC_FULL.md
/// §4.2.3, §10.2): the driver's apply path never reaches here for objects
/// already being deleted.
pub async fn update(
    client: &Client,
    resource: &ApiResource,
    reconciler_name: &str,
    existing: &DynamicObject,
    mut desired: DynamicObject,
) -> Result<DynamicObject> {
    if existing.metadata.deletion_timestamp.is_some() {
        return Err(Error::assertion(format!(
            "{}: attempted update of an object already marked for deletion",
            object_key(existing)
        )));
    }
    desired.metadata.managed_fields = None;
    desired.metadata.resource_version = existing
        .metadata
        .resource_version
        .clone()
        .or_else(|| desired.metadata.resource_version.clone());
    desired.metadata.finalizers = existing.metadata.finalizers.clone();

    let api = api_for(client, resource, existing.metadata.namespace.as_deref());
    let name = existing
        .metadata
        .name
        .clone()
        .ok_or_else(|| Error::assertion("update target has no name"))?;
    let params = kube::api::PostParams {
        field_manager: Some(reconciler_name.to_string()),
        ..Default::default()
    };
    api.replace(&name, &params, &desired).await.map_err(Error::from)
}

/// Server-side apply with forced field ownership (`update-policy=ssa-merge`).
pub async fn apply_merge(
    client: &Client,
    resource: &ApiResource,
    reconciler_name: &str,
    object: &DynamicObject,
) -> Result<DynamicObject> {
    let name = object
        .metadata
        .name
        .clone()
        .ok_or_else(|| Error::assertion("apply target has no name"))?;
    let api = api_for(client, resource, object.metadata.namespace.as_deref());
    let params = PatchParams::apply(reconciler_name).force();
    api.patch(&name, &params, &Patch::Apply(object)).await.map_err(Error::from)
}

/// Preparation step for `update-policy=ssa-override` (SPEC_FULL.md §4.2 step
/// 13): strips every `managedFields` entry not already owned by this
/// reconciler, so the forced server-side-apply that follows reclaims fields
/// a prior field manager (e.g. `kubectl apply` or an earlier reconciler) is
/// still holding. A no-op JSON-patch when nothing needs reclaiming.
pub async fn reclaim_managed_fields(
    client: &Client,
    resource: &ApiResource,
    reconciler_name: &str,
    existing: &DynamicObject,
) -> Result<()> {
    let prior_owner_count = existing.metadata.managed_fields.as_ref().map_or(0, |f| f.len());
    let retained = retained_managed_fields(reconciler_name, existing.metadata.managed_fields.as_deref());
    if prior_owner_count == retained.len() {
        return Ok(());
    }

    let name = existing
        .metadata
        .name
        .clone()
        .ok_or_else(|| Error::assertion("reclaim target has no name"))?;
    let path = json_patch::jsonptr::PointerBuf::from_tokens(["metadata", "managedFields"]);
    let patch = JsonPatch(vec![PatchOperation::Replace(ReplaceOperation {
        path,
        value: serde_json::to_value(&retained)?,
    })]);

    let api = api_for(client, resource, existing.metadata.namespace.as_deref());
    let params = PatchParams {
        field_manager: Some(reconciler_name.to_string()),
        ..Default::default()
    };
    api.patch(&name, &params, &Patch::Json::<DynamicObject>(patch))
        .await
        .map_err(Error::from)?;
    Ok(())
}

fn retained_managed_fields(
    reconciler_name: &str,
    managed_fields: Option<&[k8s_openapi::apimachinery::pkg::apis::meta::v1::ManagedFieldsEntry]>,
) -> Vec<k8s_openapi::apimachinery::pkg::apis::meta::v1::ManagedFieldsEntry> {
    managed_fields
        .into_iter()
        .flatten()
        .filter(|f| f.manager.as_deref() == Some(reconciler_name))
        .cloned()
        .collect()
}

/// Deletes `existing` with background propagation and a resource-version
/// precondition. For a finalizer-gated installer type, re-checks that it
/// is no longer used before removing the reconciler's finalizer, retrying
/// once on a 409 conflict.
pub async fn delete(
    client: &Client,
    resource: &ApiResource,
    reconciler_name: &str,
    existing: &DynamicObject,
    still_in_use: impl Fn() -> bool,
) -> Result<()> {
    let name = existing
        .metadata
        .name
        .clone()
        .ok_or_else(|| Error::assertion("delete target has no name"))?;
    let api = api_for(client, resource, existing.metadata.namespace.as_deref());
    let params = DeleteParams {
        propagation_policy: Some(PropagationPolicy::Background),
        preconditions: existing.metadata.resource_version.clone().map(|rv| Preconditions {
            resource_version: Some(rv),
            uid: None,
        }),
        ..Default::default()
    };
    match api.delete(&name, &params).await {
        Ok(_) => {}
        Err(err) if crate::error::is_not_found(&err) => return Ok(()),
        Err(err) => return Err(Error::from(err)),
    }

    let kind = existing.types.as_ref().map(|t| t.kind.as_str()).unwrap_or_default();
    if !is_finalizer_gated(kind) {
        return Ok(());
    }
    if still_in_use() {
        return Err(Error::invalid_object(
            object_key(existing),
            "still has instances owned by another reconciler; finalizer left in place",
        ));
    }
    remove_finalizer_retrying(client, resource, reconciler_name, &name, existing.metadata.namespace.as_deref()).await
}

async fn remove_finalizer_retrying(
    client: &Client,
    resource: &ApiResource,
    reconciler_name: &str,
    name: &str,
    namespace: Option<&str>,
) -> Result<()> {
    let api = api_for(client, resource, namespace);
    for attempt in 0..2 {
        let Some(mut current) = api.get_opt(name).await.map_err(Error::from)? else {
            return Ok(());
        };
        if !finalizer::remove(&mut current, reconciler_name) {
            return Ok(());
        }
        let params = kube::api::PostParams {
            field_manager: Some(reconciler_name.to_string()),
            ..Default::default()
        };
        match api.replace(name, &params, &current).await {
            Ok(_) => return Ok(()),
            Err(err) if is_conflict(&err) && attempt == 0 => continue,
            Err(err) => return Err(Error::from(err)),
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn finalizer_gated_types_are_crds_and_apiservices() {
        assert!(is_finalizer_gated("CustomResourceDefinition"));
        assert!(is_finalizer_gated("APIService"));
        assert!(!is_finalizer_gated("ConfigMap"));
    }

    fn managed_field(manager: &str) -> k8s_openapi::apimachinery::pkg::apis::meta::v1::ManagedFieldsEntry {
        k8s_openapi::apimachinery::pkg::apis::meta::v1::ManagedFieldsEntry {
            manager: Some(manager.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn retained_managed_fields_keeps_only_this_reconciler() {
        let fields = vec![managed_field("kubectl-client-side-apply"), managed_field("my-reconciler"), managed_field("another-operator")];
        let retained = retained_managed_fields("my-reconciler", Some(&fields));
        assert_eq!(retained.len(), 1);
        assert_eq!(retained[0].manager.as_deref(), Some("my-reconciler"));
    }

    #[test]
    fn retained_managed_fields_empty_when_none_present() {
        assert!(retained_managed_fields("my-reconciler", None).is_empty());
    }
}
