//! Maps a Kubernetes object's `status` to a coarse readiness verdict
//! (SPEC_FULL.md §4.5), the way `kstatus`-style tooling does, with per-GVK
//! overrides.
//!
//! The analyzer is deliberately generic over `serde_json::Value` rather than
//! concrete `k8s_openapi` types: the reconcile target only ever has
//! `DynamicObject`s in hand (SPEC_FULL.md §4.2 step 2 normalises *types*, not
//! the object representation), and most objects it manages were not
//! generated by this crate.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::inventory::GroupVersionKind;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ObjectStatus {
    Current,
    InProgress,
    Failed,
    Terminating,
    NotFound,
    Unknown,
}

/// Parsed form of the `status-hint` annotation (csv of tokens).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatusHint {
    pub has_observed_generation: bool,
    pub has_ready_condition: bool,
}

impl StatusHint {
    pub fn parse(raw: &str) -> Self {
        let mut hint = StatusHint::default();
        for token in raw.split(',').map(str::trim) {
            match token {
                "has-observed-generation" => hint.has_observed_generation = true,
                "has-ready-condition" => hint.has_ready_condition = true,
                _ => {}
            }
        }
        hint
    }
}

/// Compute the readiness status of a rendered object given its observed
/// cluster state as raw JSON (`metadata` + `status`, as returned by the
/// `DynamicObject` API). `gvk` selects per-type overrides.
pub fn analyze(gvk: &GroupVersionKind, object: &Value, hint: StatusHint) -> ObjectStatus {
    if object.pointer("/metadata/deletionTimestamp").is_some() {
        return ObjectStatus::Terminating;
    }

    if is_job(gvk) {
        return analyze_job(object);
    }

    let mut effective = object.clone();
    if hint.has_observed_generation && effective.pointer("/status/observedGeneration").is_none() {
        if let Some(generation) = effective.pointer("/metadata/generation").cloned() {
            inject(&mut effective, "/status/observedGeneration", generation);
        }
    }
    if hint.has_ready_condition && find_condition(&effective, "Ready").is_none() {
        inject_ready_condition(&mut effective, "True");
    }

    analyze_generic(&effective)
}

fn is_job(gvk: &GroupVersionKind) -> bool {
    gvk.group == "batch" && gvk.kind == "Job"
}

/// Override: a batch Job is `InProgress` until one of its conditions is
/// `Complete=True` or `Failed=True` (SPEC_FULL.md §4.5).
fn analyze_job(object: &Value) -> ObjectStatus {
    let conditions = object
        .pointer("/status/conditions")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    for condition in &conditions {
        let type_ = condition.get("type").and_then(Value::as_str).unwrap_or_default();
        let status = condition.get("status").and_then(Value::as_str).unwrap_or_default();
        if type_ == "Failed" && status == "True" {
            return ObjectStatus::Failed;
        }
        if type_ == "Complete" && status == "True" {
            return ObjectStatus::Current;
        }
    }
    ObjectStatus::InProgress
}

fn analyze_generic(object: &Value) -> ObjectStatus {
    // observedGeneration lagging metadata.generation means the controller
    // for this object hasn't caught up yet.
    if let (Some(generation), Some(observed)) = (
        object.pointer("/metadata/generation").and_then(Value::as_i64),
        object.pointer("/status/observedGeneration").and_then(Value::as_i64),
    ) {
        if observed < generation {
            return ObjectStatus::InProgress;
        }
    }

    if let Some(ready) = find_condition(object, "Ready") {
        return match ready.get("status").and_then(Value::as_str) {
            Some("True") => ObjectStatus::Current,
            Some("False") => {
                if ready.get("reason").and_then(Value::as_str) == Some("Failed") {
                    ObjectStatus::Failed
                } else {
                    ObjectStatus::InProgress
                }
            }
            _ => ObjectStatus::Unknown,
        };
    }

    // Workload-shaped replica status (Deployment/ReplicaSet/StatefulSet-like):
    // ready when updated and ready replica counts have caught up to spec.
    if let (Some(replicas), Some(updated), Some(ready)) = (
        object.pointer("/spec/replicas").and_then(Value::as_i64),
        object.pointer("/status/updatedReplicas").and_then(Value::as_i64),
        object.pointer("/status/readyReplicas").and_then(Value::as_i64),
    ) {
        return if updated >= replicas && ready >= replicas {
            ObjectStatus::Current
        } else {
            ObjectStatus::InProgress
        };
    }

    // Objects with no status subresource at all (ConfigMap, Secret, RBAC,
    // Namespace, ...) are current the moment they exist.
    if object.pointer("/status").is_none() {
        return ObjectStatus::Current;
    }

    ObjectStatus::Current
}

fn find_condition<'a>(object: &'a Value, type_: &str) -> Option<&'a Value> {
    object
        .pointer("/status/conditions")
        .and_then(Value::as_array)?
        .iter()
        .find(|c| c.get("type").and_then(Value::as_str) == Some(type_))
}

fn inject(object: &mut Value, pointer: &str, value: Value) {
    let parts: Vec<&str> = pointer.trim_start_matches('/').split('/').collect();
    let mut current = object;
    for (i, part) in parts.iter().enumerate() {
        if !current.is_object() {
            *current = Value::Object(Default::default());
        }
        let map = current.as_object_mut().unwrap();
        if i == parts.len() - 1 {
            map.insert(part.to_string(), value.clone());
        } else {
            current = map.entry(part.to_string()).or_insert_with(|| Value::Object(Default::default()));
        }
    }
}

fn inject_ready_condition(object: &mut Value, status: &str) {
    let conditions = object
        .pointer_mut("/status/conditions")
        .and_then(Value::as_array_mut);
    let entry = serde_json::json!({"type": "Ready", "status": status});
    match conditions {
        Some(arr) => arr.push(entry),
        None => inject(object, "/status/conditions", Value::Array(vec![entry])),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn gvk(group: &str, kind: &str) -> GroupVersionKind {
        GroupVersionKind::new(group, "v1", kind)
    }

    #[test]
    fn object_being_deleted_is_terminating() {
        let obj = json!({"metadata": {"deletionTimestamp": "2024-01-01T00:00:00Z"}});
        assert_eq!(analyze(&gvk("", "ConfigMap"), &obj, StatusHint::default()), ObjectStatus::Terminating);
    }

    #[test]
    fn object_with_no_status_is_current() {
        let obj = json!({"metadata": {"name": "foo"}});
        assert_eq!(analyze(&gvk("", "ConfigMap"), &obj, StatusHint::default()), ObjectStatus::Current);
    }

    #[test]
    fn job_without_terminal_condition_is_in_progress() {
        let obj = json!({"status": {"conditions": []}});
        assert_eq!(analyze(&gvk("batch", "Job"), &obj, StatusHint::default()), ObjectStatus::InProgress);
    }

    #[test]
    fn job_complete_condition_is_current() {
        let obj = json!({"status": {"conditions": [{"type": "Complete", "status": "True"}]}});
        assert_eq!(analyze(&gvk("batch", "Job"), &obj, StatusHint::default()), ObjectStatus::Current);
    }

    #[test]
    fn job_failed_condition_is_failed() {
        let obj = json!({"status": {"conditions": [{"type": "Failed", "status": "True"}]}});
        assert_eq!(analyze(&gvk("batch", "Job"), &obj, StatusHint::default()), ObjectStatus::Failed);
    }

    #[test]
    fn deployment_shaped_status_tracks_replicas() {
        let not_ready = json!({
            "spec": {"replicas": 3},
            "status": {"updatedReplicas": 1, "readyReplicas": 1},
        });
        assert_eq!(analyze(&gvk("apps", "Deployment"), &not_ready, StatusHint::default()), ObjectStatus::InProgress);

        let ready = json!({
            "spec": {"replicas": 3},
            "status": {"updatedReplicas": 3, "readyReplicas": 3},
        });
        assert_eq!(analyze(&gvk("apps", "Deployment"), &ready, StatusHint::default()), ObjectStatus::Current);
    }

    #[test]
    fn ready_condition_false_is_in_progress_unless_reason_failed() {
        let in_progress = json!({"status": {"conditions": [{"type": "Ready", "status": "False", "reason": "Pending"}]}});
        assert_eq!(analyze(&gvk("x.io", "Widget"), &in_progress, StatusHint::default()), ObjectStatus::InProgress);

        let failed = json!({"status": {"conditions": [{"type": "Ready", "status": "False", "reason": "Failed"}]}});
        assert_eq!(analyze(&gvk("x.io", "Widget"), &failed, StatusHint::default()), ObjectStatus::Failed);
    }

    #[test]
    fn status_hint_injects_synthetic_ready_condition() {
        let obj = json!({"metadata": {"generation": 1}});
        let hint = StatusHint::parse("has-ready-condition");
        assert_eq!(analyze(&gvk("x.io", "Widget"), &obj, hint), ObjectStatus::Current);
    }

    #[test]
    fn observed_generation_lag_is_in_progress() {
        let obj = json!({"metadata": {"generation": 2}, "status": {"observedGeneration": 1}});
        assert_eq!(analyze(&gvk("x.io", "Widget"), &obj, StatusHint::default()), ObjectStatus::InProgress);
    }

    #[test]
    fn status_hint_parses_known_tokens_only() {
        let hint = StatusHint::parse("has-observed-generation, has-ready-condition, unknown-token");
        assert!(hint.has_observed_generation);
        assert!(hint.has_ready_condition);
    }
}
