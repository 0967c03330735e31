//! Wave ordering for teardown and apply (SPEC_FULL.md §4.2 steps 8, 12).

use crate::inventory::{GroupVersionKind, InventoryItem};
use crate::reconcile_target::normalize::NormalizedObject;

/// Sorts inventory by `DeleteOrder` descending, then by a type-priority tie
/// break (plain objects first, managed-type declarers next, namespaces
/// last) — both the persistence order and the teardown order.
pub fn sort_for_teardown(mut items: Vec<InventoryItem>) -> Vec<InventoryItem> {
    items.sort_by(|a, b| {
        b.delete_order
            .cmp(&a.delete_order)
            .then_with(|| teardown_rank(a).cmp(&teardown_rank(b)))
    });
    items
}

fn teardown_rank(item: &InventoryItem) -> u8 {
    if item.group.is_empty() && item.kind == "Namespace" {
        2
    } else if item.is_managed_type_declarer() {
        1
    } else {
        0
    }
}

/// Groups already-sorted-by-`sort_for_teardown` inventory into contiguous
/// `DeleteOrder` waves, preserving sort order within each wave.
pub fn group_by_delete_order(items: &[InventoryItem]) -> Vec<Vec<&InventoryItem>> {
    group_by(items, |item| item.delete_order)
}

/// Sorts rendered objects by `ApplyOrder` ascending; within a wave, objects
/// that are instances of a managed type (per `is_managed_instance`) sort
/// after plain objects, so a CRD/APIService's own API is up before its
/// instances are created.
pub fn sort_for_apply(
    mut objects: Vec<NormalizedObject>,
    is_managed_instance: impl Fn(&GroupVersionKind) -> bool,
) -> Vec<NormalizedObject> {
    objects.sort_by(|a, b| {
        a.policies
            .apply_order
            .cmp(&b.policies.apply_order)
            .then_with(|| is_managed_instance(&a.gvk).cmp(&is_managed_instance(&b.gvk)))
    });
    objects
}

pub fn group_by_apply_order(objects: &[NormalizedObject]) -> Vec<Vec<&NormalizedObject>> {
    group_by(objects, |object| object.policies.apply_order)
}

fn group_by<T, K: PartialEq>(items: &[T], key: impl Fn(&T) -> K) -> Vec<Vec<&T>> {
    let mut waves: Vec<Vec<&T>> = Vec::new();
    for item in items {
        match waves.last_mut() {
            Some(wave) if key(wave[0]) == key(item) => wave.push(item),
            _ => waves.push(vec![item]),
        }
    }
    waves
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::inventory::{AdoptionPolicy, DeletePolicy, Phase, ReconcilePolicy, UpdatePolicy};

    fn item(name: &str, kind: &str, delete_order: i16, managed_types: Vec<GroupVersionKind>) -> InventoryItem {
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
            delete_order,
            managed_types,
            digest: "x".into(),
            phase: Phase::Ready,
            status: None,
        }
    }

    #[test]
    fn sort_for_teardown_orders_delete_order_descending() {
        let items = vec![item("a", "ConfigMap", 0, vec![]), item("b", "ConfigMap", 5, vec![])];
        let sorted = sort_for_teardown(items);
        assert_eq!(sorted[0].name, "b");
        assert_eq!(sorted[1].name, "a");
    }

    #[test]
    fn sort_for_teardown_places_namespace_last_within_wave() {
        let mut ns = item("prod", "Namespace", 0, vec![]);
        ns.group = "".into();
        let cm = item("a", "ConfigMap", 0, vec![]);
        let sorted = sort_for_teardown(vec![ns, cm]);
        assert_eq!(sorted[0].kind, "ConfigMap");
        assert_eq!(sorted[1].kind, "Namespace");
    }

    #[test]
    fn sort_for_teardown_places_managed_type_declarer_before_namespace_after_plain() {
        let plain = item("cm", "ConfigMap", 0, vec![]);
        let crd = item("widgets.x.io", "CustomResourceDefinition", 0, vec![GroupVersionKind::new("x.io", "v1", "Widget")]);
        let ns = item("prod", "Namespace", 0, vec![]);
        let sorted = sort_for_teardown(vec![ns, crd, plain]);
        assert_eq!(sorted[0].kind, "ConfigMap");
        assert_eq!(sorted[1].kind, "CustomResourceDefinition");
        assert_eq!(sorted[2].kind, "Namespace");
    }

    #[test]
    fn group_by_delete_order_groups_contiguous_equal_keys() {
        let items = vec![item("a", "ConfigMap", 5, vec![]), item("b", "ConfigMap", 5, vec![]), item("c", "ConfigMap", 0, vec![])];
        let sorted = sort_for_teardown(items);
        let groups = group_by_delete_order(&sorted);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].len(), 2);
        assert_eq!(groups[1].len(), 1);
    }
}
