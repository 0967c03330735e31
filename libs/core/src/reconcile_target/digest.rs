//! Per-object digest computation (SPEC_FULL.md §4.2 step 5).

use kube::api::DynamicObject;
use sha2::{Digest as _, Sha256};

use crate::inventory::{ReconcilePolicy, ONCE_DIGEST};

/// Volatile metadata the API server fills in that must not affect the
/// digest of a rendered object (it was never part of what the generator
/// produced).
const VOLATILE_METADATA_KEYS: &[&str] = &[
    "resourceVersion",
    "uid",
    "generation",
    "creationTimestamp",
    "managedFields",
    "selfLink",
    "ownerReferences",
];

/// `sha256hex(canonical JSON of object)`, suffixed per `reconcile-policy`
/// (SPEC_FULL.md §4.2 step 5). `serde_json::Map` iterates in key order by
/// default (no `preserve_order` feature enabled), which is already the
/// canonical form the digest needs.
pub fn digest_object(object: &DynamicObject, reconcile_policy: ReconcilePolicy, component_generation: i64) -> String {
    if reconcile_policy == ReconcilePolicy::Once {
        return ONCE_DIGEST.to_string();
    }

    let mut value = serde_json::to_value(object).unwrap_or(serde_json::Value::Null);
    if let Some(metadata) = value.get_mut("metadata").and_then(serde_json::Value::as_object_mut) {
        for key in VOLATILE_METADATA_KEYS {
            metadata.remove(*key);
        }
        if let Some(annotations) = metadata.get_mut("annotations").and_then(serde_json::Value::as_object_mut) {
            annotations.retain(|k, _| !k.contains("/owner-id") && !k.contains("/digest"));
        }
    }
    // Status is not part of desired state and must not perturb the digest.
    if let Some(obj) = value.as_object_mut() {
        obj.remove("status");
    }

    let bytes = serde_json::to_vec(&value).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let hex_digest = hex::encode(hasher.finalize());

    if reconcile_policy == ReconcilePolicy::OnObjectOrComponentChange {
        format!("{hex_digest}@{component_generation}")
    } else {
        hex_digest
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use kube::api::{ObjectMeta, TypeMeta};
    use serde_json::json;

    fn object(name: &str, data: serde_json::Value) -> DynamicObject {
        DynamicObject {
            types: Some(TypeMeta {
                api_version: "v1".into(),
                kind: "ConfigMap".into(),
            }),
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some("default".into()),
                ..Default::default()
            },
            data,
        }
    }

    #[test]
    fn digest_is_stable_for_equal_objects() {
        let a = object("foo", json!({"data": {"k": "v"}}));
        let b = object("foo", json!({"data": {"k": "v"}}));
        assert_eq!(
            digest_object(&a, ReconcilePolicy::OnObjectChange, 1),
            digest_object(&b, ReconcilePolicy::OnObjectChange, 1)
        );
    }

    #[test]
    fn digest_changes_with_content() {
        let a = object("foo", json!({"data": {"k": "v"}}));
        let b = object("foo", json!({"data": {"k": "v2"}}));
        assert_ne!(
            digest_object(&a, ReconcilePolicy::OnObjectChange, 1),
            digest_object(&b, ReconcilePolicy::OnObjectChange, 1)
        );
    }

    #[test]
    fn digest_ignores_volatile_metadata() {
        let mut a = object("foo", json!({"data": {"k": "v"}}));
        let mut b = a.clone();
        a.metadata.resource_version = Some("1".into());
        b.metadata.resource_version = Some("999".into());
        assert_eq!(
            digest_object(&a, ReconcilePolicy::OnObjectChange, 1),
            digest_object(&b, ReconcilePolicy::OnObjectChange, 1)
        );
    }

    #[test]
    fn on_object_or_component_change_suffixes_generation() {
        let a = object("foo", json!({}));
        let d1 = digest_object(&a, ReconcilePolicy::OnObjectOrComponentChange, 1);
        let d2 = digest_object(&a, ReconcilePolicy::OnObjectOrComponentChange, 2);
        assert_ne!(d1, d2);
        assert!(d1.ends_with("@1"));
    }

    #[test]
    fn once_policy_is_the_sentinel_regardless_of_content() {
        let a = object("foo", json!({"data": {"k": "v"}}));
        let b = object("foo", json!({"data": {"k": "different"}}));
        assert_eq!(digest_object(&a, ReconcilePolicy::Once, 1), ONCE_DIGEST);
        assert_eq!(digest_object(&b, ReconcilePolicy::Once, 5), ONCE_DIGEST);
    }
}
