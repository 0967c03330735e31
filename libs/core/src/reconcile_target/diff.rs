//! Inventory diff (SPEC_FULL.md §4.2 step 6).

use kube::api::{Api, DynamicObject};
use kube::discovery;
use kube::Client;

use crate::error::{Error, Result};
use crate::inventory::{AdoptionPolicy, GroupVersionKind, InventoryItem, ObjectKey, Phase};
use crate::reconcile_target::digest::digest_object;
use crate::reconcile_target::normalize::NormalizedObject;
use crate::status_analyzer::ObjectStatus;

pub struct DiffOutcome {
    pub inventory: Vec<InventoryItem>,
    /// True when at least one item was newly inserted; the caller must
    /// persist and return early before mutating the target cluster
    /// (invariant 1, SPEC_FULL.md §3).
    pub newly_added: bool,
}

/// `owner_id_label_key` is `<reconciler-name>/owner-id`; `current_owner_label`
/// is this component's own hashed owner-id, used to tell "already ours" apart
/// from "owned by someone/something else".
pub async fn diff(
    client: &Client,
    owner_id_label_key: &str,
    current_owner_label: &str,
    mut persisted: Vec<InventoryItem>,
    rendered: &[NormalizedObject],
    component_generation: i64,
) -> Result<DiffOutcome> {
    let mut newly_added = false;
    let mut seen_keys = Vec::with_capacity(rendered.len());

    for object in rendered {
        let key = object_key_of(object);
        let digest = digest_object(&object.object, object.policies.reconcile_policy, component_generation);

        if let Some(existing_item) = persisted.iter_mut().find(|item| item.matches(&key)) {
            let digest_changed = existing_item.digest != digest;
            refresh_item(existing_item, object, digest);
            if digest_changed {
                existing_item.phase = Phase::ScheduledForApplication;
                existing_item.status = Some(ObjectStatus::InProgress);
            }
        } else {
            let name = object.object.metadata.name.clone().unwrap_or_default();
            let existing = fetch_existing(client, &object.gvk, object.object.metadata.namespace.as_deref(), &name).await?;
            check_adoption(
                existing.as_ref(),
                owner_id_label_key,
                current_owner_label,
                object.policies.adoption_policy,
                &key.to_string(),
            )?;
            let mut item = new_item(object, digest);
            item.phase = Phase::ScheduledForApplication;
            item.status = Some(ObjectStatus::InProgress);
            persisted.push(item);
            newly_added = true;
        }
        seen_keys.push(key);
    }

    for item in persisted.iter_mut() {
        if !seen_keys.iter().any(|key| item.matches(key)) && item.digest != crate::inventory::DELETION_DIGEST {
            item.schedule_for_deletion();
        }
    }

    Ok(DiffOutcome { inventory: persisted, newly_added })
}

fn object_key_of(object: &NormalizedObject) -> ObjectKey {
    ObjectKey::new(
        object.gvk.group.clone(),
        object.gvk.kind.clone(),
        object.object.metadata.namespace.clone(),
        object.object.metadata.name.clone().unwrap_or_default(),
    )
}

fn new_item(object: &NormalizedObject, digest: String) -> InventoryItem {
    InventoryItem {
        group: object.gvk.group.clone(),
        version: object.gvk.version.clone(),
        kind: object.gvk.kind.clone(),
        namespace: object.object.metadata.namespace.clone(),
        name: object.object.metadata.name.clone().unwrap_or_default(),
        adoption_policy: object.policies.adoption_policy,
        reconcile_policy: object.policies.reconcile_policy,
        update_policy: object.policies.update_policy,
        delete_policy: object.policies.delete_policy,
        apply_order: object.policies.apply_order,
        purge_order: object.policies.purge_order,
        delete_order: object.policies.delete_order,
        managed_types: object.managed_types.clone(),
        digest,
        phase: Phase::ScheduledForApplication,
        status: None,
    }
}

fn refresh_item(item: &mut InventoryItem, object: &NormalizedObject, digest: String) {
    item.kind = object.gvk.kind.clone();
    item.version = object.gvk.version.clone();
    item.name = object.object.metadata.name.clone().unwrap_or_default();
    item.adoption_policy = object.policies.adoption_policy;
    item.reconcile_policy = object.policies.reconcile_policy;
    item.update_policy = object.policies.update_policy;
    item.delete_policy = object.policies.delete_policy;
    item.apply_order = object.policies.apply_order;
    item.purge_order = object.policies.purge_order;
    item.delete_order = object.policies.delete_order;
    item.managed_types = object.managed_types.clone();
    item.digest = digest;
}

/// Reads the live cluster object for first-insertion adoption checks.
/// A type discovery can't resolve yet (its own CRD is in the same rendered
/// set, not yet created) is treated as "does not exist" — there is nothing
/// to adopt a conflict against.
async fn fetch_existing(
    client: &Client,
    gvk: &GroupVersionKind,
    namespace: Option<&str>,
    name: &str,
) -> Result<Option<DynamicObject>> {
    let core_gvk = kube::core::GroupVersionKind::gvk(&gvk.group, &gvk.version, &gvk.kind);
    let Ok((resource, _)) = discovery::pinned_kind(client, &core_gvk).await else {
        return Ok(None);
    };
    let api: Api<DynamicObject> = match namespace {
        Some(ns) => Api::namespaced_with(client.clone(), ns, &resource),
        None => Api::all_with(client.clone(), &resource),
    };
    api.get_opt(name).await.map_err(Error::from)
}

fn check_adoption(
    existing: Option<&DynamicObject>,
    owner_id_label_key: &str,
    current_owner_label: &str,
    policy: AdoptionPolicy,
    key: &str,
) -> Result<()> {
    let Some(existing) = existing else { return Ok(()) };
    let label = existing.metadata.labels.as_ref().and_then(|l| l.get(owner_id_label_key));
    match label {
        None if matches!(policy, AdoptionPolicy::IfUnowned | AdoptionPolicy::Always) => Ok(()),
        None => Err(Error::invalid_object(
            key,
            "object exists without an owner-id label and adoption-policy forbids claiming it",
        )),
        Some(owner) if owner == current_owner_label => Ok(()),
        Some(owner) if matches!(policy, AdoptionPolicy::Always) => {
            let _ = owner;
            Ok(())
        }
        Some(owner) => Err(Error::invalid_object(key, format!("owner conflict; object is owned by {owner}"))),
    }
}
