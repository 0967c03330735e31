//! Apply/delete wave engine (SPEC_FULL.md §4.2).
//!
//! `apply` and `delete` both operate on a component's persisted inventory
//! and the manifest its generator renders, mutating the inventory in place
//! and reporting whether the pass reached a fully ready/empty state. The
//! driver is responsible for persisting the returned inventory regardless
//! of the readiness result — a pass that returns `ready=false` has usually
//! still made forward progress that must not be lost on the next attempt.

pub mod digest;
pub mod diff;
pub mod normalize;
mod objects;
mod waves;

use kube::api::{Api, DynamicObject};
use kube::discovery;
use kube::Client;

use crate::component::{Component, ManifestGenerator};
use crate::env::ReconcileEnv;
use crate::error::{Error, Result};
use crate::inventory::{GroupVersionKind, InventoryItem, ObjectKey, Phase, UpdatePolicy};
use crate::owner::{owner_id, owner_id_label};
use crate::status_analyzer::{self, ObjectStatus, StatusHint};
use normalize::NormalizedObject;

pub struct ApplyOutcome {
    pub ready: bool,
    pub inventory: Vec<InventoryItem>,
}

/// SPEC_FULL.md §4.2, steps 1-14.
pub async fn apply<C: Component>(
    env: &ReconcileEnv,
    generator: &dyn ManifestGenerator<C>,
    component: &C,
    reconciler_id: &str,
    namespace: &str,
    name: &str,
    persisted: Vec<InventoryItem>,
    create_missing_namespaces: bool,
) -> Result<ApplyOutcome> {
    let rendered = generator.generate(namespace, name, component.spec())?;
    let normalized = normalize::normalize(&env.target_client, &env.reconciler_name, namespace, rendered).await?;

    validate_invariants(&normalized)?;

    let owner_id_label_key = env.annotation_key("owner-id");
    let owner_id_annotation_key = owner_id_label_key.clone();
    let digest_annotation_key = env.annotation_key("digest");
    let unhashed_owner_id = owner_id(reconciler_id, namespace, name);
    let current_owner_label = owner_id_label(&unhashed_owner_id);

    let outcome = diff::diff(
        &env.target_client,
        &owner_id_label_key,
        &current_owner_label,
        persisted,
        &normalized,
        component.meta().generation.unwrap_or(0),
    )
    .await?;

    let mut inventory = waves::sort_for_teardown(outcome.inventory);

    if outcome.newly_added {
        return Ok(ApplyOutcome { ready: false, inventory });
    }

    let unready_after_delete = run_delete_waves(env, &mut inventory, &normalized).await?;
    if unready_after_delete {
        return Ok(ApplyOutcome { ready: false, inventory });
    }

    if create_missing_namespaces {
        create_missing_namespace_objects(env, &normalized).await?;
    }

    let is_managed_instance = |gvk: &GroupVersionKind| inventory.iter().any(|item| item.manages(gvk));
    let apply_ready = run_apply_waves(
        env,
        &mut inventory,
        normalized,
        &owner_id_annotation_key,
        &unhashed_owner_id,
        &digest_annotation_key,
        is_managed_instance,
    )
    .await?;

    Ok(ApplyOutcome {
        ready: apply_ready,
        inventory,
    })
}

/// Identical wave logic to the delete phase of `apply`, run until the
/// inventory is empty (SPEC_FULL.md §4.2.1).
pub async fn delete(env: &ReconcileEnv, mut inventory: Vec<InventoryItem>) -> Result<ApplyOutcome> {
    for item in inventory.iter_mut() {
        item.schedule_for_deletion();
    }
    let mut inventory = waves::sort_for_teardown(inventory);
    let unready = run_delete_waves(env, &mut inventory, &[]).await?;
    Ok(ApplyOutcome {
        ready: !unready && inventory.is_empty(),
        inventory,
    })
}

/// SPEC_FULL.md §4.2.2: blocks deletion of a CRD/APIService while any
/// instance not owned by this component still exists.
pub async fn is_deletion_allowed(env: &ReconcileEnv, current_owner_label: &str, inventory: &[InventoryItem]) -> Result<Option<String>> {
    for item in inventory {
        if !item.is_managed_type_declarer() {
            continue;
        }
        for decl in &item.managed_types {
            if let Some(blocker) = check_managed_type_usage(env, decl, current_owner_label).await? {
                return Ok(Some(format!("{} still has instances: {blocker}", item.key())));
            }
        }
    }
    Ok(None)
}

async fn check_managed_type_usage(env: &ReconcileEnv, decl: &GroupVersionKind, current_owner_label: &str) -> Result<Option<String>> {
    if decl.group.is_empty() || decl.version.is_empty() || decl.kind.is_empty() {
        // A wildcarded declaration can't be resolved to one concrete GVK to
        // list; the declarer's own instance accounting covers it instead.
        return Ok(None);
    }
    let core_gvk = kube::core::GroupVersionKind::gvk(&decl.group, &decl.version, &decl.kind);
    let Ok((resource, _)) = discovery::pinned_kind(&env.target_client, &core_gvk).await else {
        return Ok(None);
    };
    let api: Api<DynamicObject> = Api::all_with(env.target_client.clone(), &resource);
    let owner_label_key = env.annotation_key("owner-id");
    let selector = format!("{owner_label_key}!={current_owner_label}");
    let params = kube::api::ListParams::default().labels(&selector).limit(1);
    let list = api.list(&params).await.map_err(Error::from)?;
    Ok(list.items.first().map(|o| o.metadata.name.clone().unwrap_or_default()))
}

/// Invariants 2 and 3 (SPEC_FULL.md §3), checked before any mutation.
fn validate_invariants(objects: &[NormalizedObject]) -> Result<()> {
    for namespace_obj in objects.iter().filter(|o| o.gvk.kind == "Namespace" && o.gvk.group.is_empty()) {
        let Some(ns_name) = namespace_obj.object.metadata.name.as_deref() else {
            continue;
        };
        for member in objects.iter().filter(|o| o.object.metadata.namespace.as_deref() == Some(ns_name)) {
            if namespace_obj.policies.apply_order > member.policies.apply_order {
                return Err(Error::invalid_object(
                    ns_name,
                    "namespace apply-order must be <= every object placed inside it",
                ));
            }
            if namespace_obj.policies.delete_order < member.policies.delete_order {
                return Err(Error::invalid_object(
                    ns_name,
                    "namespace delete-order must be >= every object placed inside it",
                ));
            }
        }
    }
    Ok(())
}

async fn run_delete_waves(env: &ReconcileEnv, inventory: &mut Vec<InventoryItem>, normalized: &[NormalizedObject]) -> Result<bool> {
    let mut waves: Vec<Vec<usize>> = Vec::new();
    let mut last_order: Option<i16> = None;
    for (idx, item) in inventory.iter().enumerate() {
        match last_order {
            Some(order) if order == item.delete_order => waves.last_mut().unwrap().push(idx),
            _ => {
                waves.push(vec![idx]);
                last_order = Some(item.delete_order);
            }
        }
    }

    let mut gone = std::collections::HashSet::new();
    for wave in waves {
        // Namespaces sort last within a wave (`sort_for_teardown`), so by
        // construction every in-namespace sibling already precedes it here.
        let managed_remaining = wave
            .iter()
            .filter(|&&i| inventory[i].phase.is_deletion_pending() && is_instance_of_any_declarer(&inventory[i], inventory))
            .count();

        let mut wave_incomplete = false;
        for idx in wave {
            env.check_cancelled()?;
            let item_is_managed_instance = is_instance_of_any_declarer(&inventory[idx], inventory);
            let gated = managed_remaining > 0 && !item_is_managed_instance && inventory[idx].phase.is_deletion_pending();
            if gated {
                wave_incomplete = true;
                continue;
            }

            match inventory[idx].phase {
                Phase::ScheduledForDeletion => {
                    if inventory[idx].delete_policy.is_orphan() {
                        gone.insert(idx);
                        continue;
                    }
                    delete_one(env, &mut inventory[idx], normalized).await?;
                    inventory[idx].phase = Phase::Deleting;
                    wave_incomplete = true;
                }
                Phase::ScheduledForCompletion => {
                    delete_one(env, &mut inventory[idx], normalized).await?;
                    inventory[idx].phase = Phase::Completing;
                    wave_incomplete = true;
                }
                Phase::Deleting => {
                    if object_exists(env, &inventory[idx]).await? {
                        wave_incomplete = true;
                    } else {
                        gone.insert(idx);
                    }
                }
                Phase::Completing => {
                    if object_exists(env, &inventory[idx]).await? {
                        wave_incomplete = true;
                    } else {
                        inventory[idx].phase = Phase::Completed;
                    }
                }
                _ => {}
            }
        }

        if wave_incomplete {
            drop_gone(inventory, &gone);
            return Ok(true);
        }
    }

    drop_gone(inventory, &gone);
    Ok(false)
}

fn drop_gone(inventory: &mut Vec<InventoryItem>, gone: &std::collections::HashSet<usize>) {
    let mut idx = 0;
    inventory.retain(|_| {
        let keep = !gone.contains(&idx);
        idx += 1;
        keep
    });
}

fn is_instance_of_any_declarer(candidate: &InventoryItem, inventory: &[InventoryItem]) -> bool {
    let gvk = candidate.gvk();
    inventory.iter().any(|item| item.is_managed_type_declarer() && item.manages(&gvk))
}

async fn delete_one(env: &ReconcileEnv, item: &mut InventoryItem, normalized: &[NormalizedObject]) -> Result<()> {
    let gvk = item.gvk();
    let core_gvk = kube::core::GroupVersionKind::gvk(&gvk.group, &gvk.version, &gvk.kind);
    let Ok((resource, _)) = discovery::pinned_kind(&env.target_client, &core_gvk).await else {
        return Ok(());
    };
    let key = ObjectKey::new(gvk.group.clone(), gvk.kind.clone(), item.namespace.clone(), item.name.clone());
    let last_read = normalized.iter().find(|o| object_key_of(o) == key).map(|o| &o.object);
    let api: Api<DynamicObject> = match &item.namespace {
        Some(ns) => Api::namespaced_with(env.target_client.clone(), ns, &resource),
        None => Api::all_with(env.target_client.clone(), &resource),
    };
    let existing = match last_read {
        Some(obj) => obj.clone(),
        None => match api.get_opt(&item.name).await.map_err(Error::from)? {
            Some(obj) => obj,
            None => return Ok(()),
        },
    };
    objects::delete(&env.target_client, &resource, &env.reconciler_name, &existing, || false).await
}

async fn object_exists(env: &ReconcileEnv, item: &InventoryItem) -> Result<bool> {
    let gvk = item.gvk();
    let core_gvk = kube::core::GroupVersionKind::gvk(&gvk.group, &gvk.version, &gvk.kind);
    let Ok((resource, _)) = discovery::pinned_kind(&env.target_client, &core_gvk).await else {
        return Ok(false);
    };
    let api: Api<DynamicObject> = match &item.namespace {
        Some(ns) => Api::namespaced_with(env.target_client.clone(), ns, &resource),
        None => Api::all_with(env.target_client.clone(), &resource),
    };
    Ok(api.get_opt(&item.name).await.map_err(Error::from)?.is_some())
}

async fn create_missing_namespace_objects(env: &ReconcileEnv, normalized: &[NormalizedObject]) -> Result<()> {
    use k8s_openapi::api::core::v1::Namespace;
    let namespaces_api: Api<Namespace> = Api::all(env.target_client.clone());
    let mut seen = std::collections::HashSet::new();
    for object in normalized {
        let Some(ns) = object.object.metadata.namespace.as_deref() else {
            continue;
        };
        if !seen.insert(ns.to_string()) {
            continue;
        }
        if namespaces_api.get_opt(ns).await.map_err(Error::from)?.is_some() {
            continue;
        }
        let mut namespace = Namespace::default();
        namespace.metadata.name = Some(ns.to_string());
        match namespaces_api.create(&kube::api::PostParams::default(), &namespace).await {
            Ok(_) | Err(kube::Error::Api(_)) => {}
            Err(err) => return Err(Error::from(err)),
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn run_apply_waves(
    env: &ReconcileEnv,
    inventory: &mut [InventoryItem],
    normalized: Vec<NormalizedObject>,
    owner_id_annotation_key: &str,
    unhashed_owner_id: &str,
    digest_annotation_key: &str,
    is_managed_instance: impl Fn(&GroupVersionKind) -> bool,
) -> Result<bool> {
    let owner_label_key = owner_id_annotation_key.to_string();
    let owner_label_value = owner_id_label(unhashed_owner_id);
    let sorted = waves::sort_for_apply(normalized, &is_managed_instance);
    let waves = waves::group_by_apply_order(&sorted);

    let mut total_unready = 0usize;
    for wave in waves {
        let order = wave[0].policies.apply_order;
        let non_managed_ready = wave.iter().filter(|o| !is_managed_instance(&o.gvk)).all(|o| {
            let key = object_key_of(o);
            inventory.iter().find(|i| i.matches(&key)).is_some_and(|i| i.phase.is_terminal_ready())
        });

        let mut wave_unready = 0usize;
        for object in &wave {
            env.check_cancelled()?;
            let key = object_key_of(object);
            let item_idx = inventory.iter().position(|i| i.matches(&key));
            let Some(item_idx) = item_idx else { continue };
            if inventory[item_idx].phase.is_terminal_ready() {
                continue;
            }
            if is_managed_instance(&object.gvk) && !non_managed_ready {
                wave_unready += 1;
                continue;
            }

            let ready = apply_one(
                env,
                *object,
                &mut inventory[item_idx],
                &owner_label_key,
                &owner_label_value,
                unhashed_owner_id,
                digest_annotation_key,
            )
            .await?;
            if !ready {
                wave_unready += 1;
            }
        }

        total_unready += wave_unready;
        if wave_unready > 0 {
            return Ok(false);
        }

        let any_purged = evaluate_purge(inventory, order);
        if any_purged {
            return Ok(false);
        }
    }

    Ok(total_unready == 0)
}

fn evaluate_purge(inventory: &mut [InventoryItem], current_apply_order: i16) -> bool {
    let mut purged = false;
    for item in inventory.iter_mut() {
        if item.phase == Phase::Completed {
            continue;
        }
        if item.purge_order <= current_apply_order as i32 {
            item.phase = Phase::ScheduledForCompletion;
            purged = true;
        }
    }
    purged
}

#[allow(clippy::too_many_arguments)]
async fn apply_one(
    env: &ReconcileEnv,
    object: &NormalizedObject,
    item: &mut InventoryItem,
    owner_label_key: &str,
    owner_label_value: &str,
    unhashed_owner_id: &str,
    digest_annotation_key: &str,
) -> Result<bool> {
    let core_gvk = kube::core::GroupVersionKind::gvk(&object.gvk.group, &object.gvk.version, &object.gvk.kind);
    let (resource, _) = discovery::pinned_kind(&env.target_client, &core_gvk)
        .await
        .map_err(|e| Error::invalid_object(object_key_of(object).to_string(), format!("type not found in cluster: {e}")))?;

    let mut desired = object.object.clone();
    stamp_ownership(
        &mut desired,
        owner_label_key,
        owner_label_value,
        unhashed_owner_id,
        digest_annotation_key,
        &item.digest,
    );

    let name = desired.metadata.name.clone().unwrap_or_default();
    let api: Api<DynamicObject> = match &desired.metadata.namespace {
        Some(ns) => Api::namespaced_with(env.target_client.clone(), ns, &resource),
        None => Api::all_with(env.target_client.clone(), &resource),
    };
    let existing = api.get_opt(&name).await.map_err(Error::from)?;

    match existing {
        None => {
            objects::create(&env.target_client, &resource, &env.reconciler_name, desired).await?;
            item.phase = Phase::Creating;
            Ok(false)
        }
        Some(existing) if existing.metadata.deletion_timestamp.is_some() => {
            item.phase = Phase::Creating;
            Ok(false)
        }
        Some(existing) => {
            let stored_digest = existing
                .metadata
                .annotations
                .as_ref()
                .and_then(|a| a.get(digest_annotation_key))
                .cloned()
                .unwrap_or_default();
            if stored_digest != item.digest {
                match object.policies.update_policy.resolved() {
                    UpdatePolicy::Recreate => {
                        objects::delete(&env.target_client, &resource, &env.reconciler_name, &existing, || false).await?;
                        item.phase = Phase::Updating;
                        Ok(false)
                    }
                    UpdatePolicy::SsaMerge => {
                        objects::apply_merge(&env.target_client, &resource, &env.reconciler_name, &desired).await?;
                        item.phase = Phase::Updating;
                        Ok(false)
                    }
                    UpdatePolicy::SsaOverride => {
                        objects::reclaim_managed_fields(&env.target_client, &resource, &env.reconciler_name, &existing).await?;
                        objects::apply_merge(&env.target_client, &resource, &env.reconciler_name, &desired).await?;
                        item.phase = Phase::Updating;
                        Ok(false)
                    }
                    _ => {
                        objects::update(&env.target_client, &resource, &env.reconciler_name, &existing, desired).await?;
                        item.phase = Phase::Updating;
                        Ok(false)
                    }
                }
            } else {
                let hint = existing
                    .metadata
                    .annotations
                    .as_ref()
                    .and_then(|a| a.get(&format!("{}/status-hint", env.reconciler_name)))
                    .map(|raw| StatusHint::parse(raw))
                    .unwrap_or_default();
                let status = status_analyzer::analyze(&core_gvk, &existing.data, hint);
                item.status = Some(status);
                let ready = status == ObjectStatus::Current;
                if ready {
                    item.phase = Phase::Ready;
                }
                Ok(ready)
            }
        }
    }
}

fn stamp_ownership(
    object: &mut DynamicObject,
    owner_label_key: &str,
    owner_label_value: &str,
    unhashed_owner_id: &str,
    digest_annotation_key: &str,
    digest: &str,
) {
    object
        .metadata
        .labels
        .get_or_insert_with(Default::default)
        .insert(owner_label_key.to_string(), owner_label_value.to_string());
    let annotations = object.metadata.annotations.get_or_insert_with(Default::default);
    // Same key text as the label above, different map: the label carries the
    // hash (safe under Kubernetes' label-value charset), the annotation
    // carries the un-hashed value for diagnostics (see owner.rs).
    annotations.insert(owner_label_key.to_string(), unhashed_owner_id.to_string());
    annotations.insert(digest_annotation_key.to_string(), digest.to_string());
}

fn object_key_of(object: &NormalizedObject) -> ObjectKey {
    ObjectKey::new(
        object.gvk.group.clone(),
        object.gvk.kind.clone(),
        object.object.metadata.namespace.clone(),
        object.object.metadata.name.clone().unwrap_or_default(),
    )
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::inventory::{AdoptionPolicy, DeletePolicy, ReconcilePolicy, UpdatePolicy};
    use kube::api::{ObjectMeta, TypeMeta};
    use normalize::ObjectPolicies;
    use serde_json::json;

    fn item(kind: &str, name: &str, managed_types: Vec<GroupVersionKind>) -> InventoryItem {
        InventoryItem {
            group: "".into(),
            version: "v1".into(),
            kind: kind.into(),
            namespace: Some("default".into()),
            name: name.into(),
            adoption_policy: AdoptionPolicy::default(),
            reconcile_policy: ReconcilePolicy::default(),
            update_policy: UpdatePolicy::default(),
            delete_policy: DeletePolicy::default(),
            apply_order: 0,
            purge_order: 32768,
            delete_order: 0,
            managed_types,
            digest: "x".into(),
            phase: Phase::Ready,
            status: None,
        }
    }

    fn normalized(kind: &str, group: &str, ns: Option<&str>, name: &str, apply_order: i16, delete_order: i16) -> NormalizedObject {
        NormalizedObject {
            object: DynamicObject {
                types: Some(TypeMeta {
                    api_version: if group.is_empty() { "v1".into() } else { format!("{group}/v1") },
                    kind: kind.into(),
                }),
                metadata: ObjectMeta {
                    name: Some(name.into()),
                    namespace: ns.map(String::from),
                    ..Default::default()
                },
                data: json!({}),
            },
            gvk: GroupVersionKind::new(group, "v1", kind),
            scope: discovery::Scope::Namespaced,
            policies: ObjectPolicies {
                adoption_policy: AdoptionPolicy::default(),
                reconcile_policy: ReconcilePolicy::default(),
                update_policy: UpdatePolicy::default(),
                delete_policy: DeletePolicy::default(),
                apply_order,
                purge_order: 32768,
                delete_order,
            },
            managed_types: vec![],
        }
    }

    #[test]
    fn validate_invariants_rejects_member_apply_order_below_namespace() {
        let ns = normalized("Namespace", "", None, "prod", 5, 0);
        let member = normalized("ConfigMap", "", Some("prod"), "cm", 0, 0);
        assert!(validate_invariants(&[ns, member]).is_err());
    }

    #[test]
    fn validate_invariants_rejects_member_delete_order_above_namespace() {
        let ns = normalized("Namespace", "", None, "prod", 0, 0);
        let member = normalized("ConfigMap", "", Some("prod"), "cm", 0, 5);
        assert!(validate_invariants(&[ns, member]).is_err());
    }

    #[test]
    fn validate_invariants_accepts_consistent_ordering() {
        let ns = normalized("Namespace", "", None, "prod", 0, 10);
        let member = normalized("ConfigMap", "", Some("prod"), "cm", 5, 5);
        assert!(validate_invariants(&[ns, member]).is_ok());
    }

    #[test]
    fn is_instance_of_any_declarer_true_for_managed_kind() {
        let declarer = item("CustomResourceDefinition", "widgets.x.io", vec![GroupVersionKind::new("x.io", "v1", "Widget")]);
        let mut widget = item("Widget", "w1", vec![]);
        widget.group = "x.io".into();
        let inventory = vec![declarer, widget.clone()];
        assert!(is_instance_of_any_declarer(&widget, &inventory));
    }

    #[test]
    fn is_instance_of_any_declarer_false_when_unmanaged() {
        let declarer = item("CustomResourceDefinition", "widgets.x.io", vec![GroupVersionKind::new("x.io", "v1", "Widget")]);
        let cm = item("ConfigMap", "cm", vec![]);
        let inventory = vec![declarer, cm.clone()];
        assert!(!is_instance_of_any_declarer(&cm, &inventory));
    }

    #[test]
    fn evaluate_purge_schedules_completion_at_or_before_current_order() {
        let mut inventory = vec![item("Job", "seed", vec![])];
        inventory[0].purge_order = 5;
        assert!(evaluate_purge(&mut inventory, 5));
        assert_eq!(inventory[0].phase, Phase::ScheduledForCompletion);
    }

    #[test]
    fn evaluate_purge_leaves_later_purge_order_untouched() {
        let mut inventory = vec![item("Job", "seed", vec![])];
        inventory[0].purge_order = 10;
        assert!(!evaluate_purge(&mut inventory, 5));
        assert_eq!(inventory[0].phase, Phase::Ready);
    }

    #[test]
    fn evaluate_purge_skips_already_completed_items() {
        let mut inventory = vec![item("Job", "seed", vec![])];
        inventory[0].purge_order = 0;
        inventory[0].phase = Phase::Completed;
        assert!(!evaluate_purge(&mut inventory, 5));
        assert_eq!(inventory[0].phase, Phase::Completed);
    }

    #[test]
    fn stamp_ownership_writes_hashed_label_and_unhashed_annotation() {
        let mut object = DynamicObject {
            types: Some(TypeMeta {
                api_version: "v1".into(),
                kind: "ConfigMap".into(),
            }),
            metadata: ObjectMeta {
                name: Some("cm".into()),
                ..Default::default()
            },
            data: json!({}),
        };
        stamp_ownership(&mut object, "app/owner-id", "hashed-value", "my-reconciler/default/cm", "app/digest", "d1");

        let labels = object.metadata.labels.unwrap();
        assert_eq!(labels.get("app/owner-id"), Some(&"hashed-value".to_string()));

        let annotations = object.metadata.annotations.unwrap();
        assert_eq!(annotations.get("app/owner-id"), Some(&"my-reconciler/default/cm".to_string()));
        assert_eq!(annotations.get("app/digest"), Some(&"d1".to_string()));
    }

    #[test]
    fn drop_gone_removes_only_indexed_entries() {
        let mut inventory = vec![item("ConfigMap", "a", vec![]), item("ConfigMap", "b", vec![]), item("ConfigMap", "c", vec![])];
        let gone: std::collections::HashSet<usize> = [1].into_iter().collect();
        drop_gone(&mut inventory, &gone);
        assert_eq!(inventory.len(), 2);
        assert_eq!(inventory[0].name, "a");
        assert_eq!(inventory[1].name, "c");
    }
}
