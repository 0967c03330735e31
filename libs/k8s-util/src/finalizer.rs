//! Finalizer helpers shared by the reconciler driver and the reconcile
//! target's CRD/APIService handling.

use kube::Resource;

pub fn contains<T: Resource>(obj: &T, finalizer: &str) -> bool {
    obj.meta()
        .finalizers
        .as_ref()
        .is_some_and(|finalizers| finalizers.iter().any(|f| f == finalizer))
}

/// Adds `finalizer` if absent. Returns whether the list was actually
/// modified, so callers can decide whether an update call is needed.
pub fn add<T: Resource>(obj: &mut T, finalizer: &str) -> bool {
    if contains(obj, finalizer) {
        return false;
    }
    obj.meta_mut()
        .finalizers
        .get_or_insert_with(Vec::new)
        .push(finalizer.to_string());
    true
}

/// Removes `finalizer` if present. Returns whether the list was modified.
pub fn remove<T: Resource>(obj: &mut T, finalizer: &str) -> bool {
    let Some(finalizers) = obj.meta_mut().finalizers.as_mut() else {
        return false;
    };
    let before = finalizers.len();
    finalizers.retain(|f| f != finalizer);
    finalizers.len() != before
}

#[cfg(test)]
mod test {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;
    use kube::api::ObjectMeta;

    fn cm(finalizers: Option<Vec<String>>) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                finalizers,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn add_creates_list_when_absent() {
        let mut obj = cm(None);
        assert!(add(&mut obj, "reconciler"));
        assert!(contains(&obj, "reconciler"));
    }

    #[test]
    fn add_is_idempotent() {
        let mut obj = cm(Some(vec!["reconciler".into()]));
        assert!(!add(&mut obj, "reconciler"));
        assert_eq!(obj.meta().finalizers.as_ref().unwrap().len(), 1);
    }

    #[test]
    fn remove_drops_only_matching_entry() {
        let mut obj = cm(Some(vec!["reconciler".into(), "other".into()]));
        assert!(remove(&mut obj, "reconciler"));
        assert_eq!(obj.meta().finalizers.as_ref().unwrap(), &vec!["other".to_string()]);
    }

    #[test]
    fn remove_on_absent_list_is_a_noop() {
        let mut obj = cm(None);
        assert!(!remove(&mut obj, "reconciler"));
    }
}
