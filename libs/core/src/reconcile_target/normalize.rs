//! Manifest post-processing (SPEC_FULL.md §4.2 steps 1-4).

use std::str::FromStr;

use kube::api::DynamicObject;
use kube::discovery;
use kube::discovery::Scope;
use kube::Client;

use crate::error::{Error, Result};
use crate::inventory::{AdoptionPolicy, DeletePolicy, GroupVersionKind, ReconcilePolicy, UpdatePolicy};

/// Annotation suffixes the engine owns; a generator that happens to emit
/// them itself would otherwise corrupt adoption detection and digest
/// computation, so they are always stripped before anything else runs.
const RESERVED_ANNOTATION_SUFFIXES: &[&str] = &["owner-id", "digest"];

const ORDER_MIN: i32 = -32768;
const ORDER_MAX: i32 = 32767;
const DEFAULT_APPLY_ORDER: i16 = 0;
const DEFAULT_DELETE_ORDER: i16 = 0;
/// One past `ORDER_MAX` on purpose: no real apply wave reaches it, so
/// "no purge-order set" and "purge never triggers" are the same value.
const DEFAULT_PURGE_ORDER: i32 = 32768;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ObjectPolicies {
    pub adoption_policy: AdoptionPolicy,
    pub reconcile_policy: ReconcilePolicy,
    pub update_policy: UpdatePolicy,
    pub delete_policy: DeletePolicy,
    pub apply_order: i16,
    pub purge_order: i32,
    pub delete_order: i16,
}

pub struct NormalizedObject {
    pub object: DynamicObject,
    pub gvk: GroupVersionKind,
    pub scope: Scope,
    pub policies: ObjectPolicies,
    pub managed_types: Vec<GroupVersionKind>,
}

/// CSV of `group/version/kind` triplets (empty segment = wildcard) this
/// object installs as a managed type, e.g. a CRD declaring the kind it
/// defines. Not in the §6 annotation table (those are all engine/operator
/// tunables); this one is structural, set by the generator itself.
const MANAGED_TYPES_ANNOTATION: &str = "managed-types";

fn parse_managed_types(raw: Option<&str>) -> Vec<GroupVersionKind> {
    let Some(raw) = raw else { return Vec::new() };
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let mut parts = entry.splitn(3, '/');
            let group = parts.next().unwrap_or("").to_string();
            let version = parts.next().unwrap_or("").to_string();
            let kind = parts.next().unwrap_or("").to_string();
            GroupVersionKind::new(group, version, kind)
        })
        .collect()
}

/// Runs steps 1-4 over every rendered object. `deployment_namespace` is the
/// component's own namespace, used to default namespaced objects that were
/// rendered without one.
pub async fn normalize(
    client: &Client,
    reconciler_name: &str,
    deployment_namespace: &str,
    rendered: Vec<DynamicObject>,
) -> Result<Vec<NormalizedObject>> {
    let mut out = Vec::with_capacity(rendered.len());
    for mut object in rendered.iter().cloned() {
        strip_reserved_annotations(&mut object, reconciler_name);
        reject_generate_name(&object)?;
        let gvk = type_info(&object)?;
        let scope = resolve_scope(client, &gvk, &rendered).await?;
        default_namespace(&mut object, &scope, deployment_namespace);
        let policies = parse_policies(&object, reconciler_name, &gvk)?;
        let managed_types = parse_managed_types(
            object
                .metadata
                .annotations
                .as_ref()
                .and_then(|a| a.get(&format!("{reconciler_name}/{MANAGED_TYPES_ANNOTATION}")))
                .map(String::as_str),
        );
        out.push(NormalizedObject {
            object,
            gvk,
            scope,
            policies,
            managed_types,
        });
    }
    Ok(out)
}

fn strip_reserved_annotations(object: &mut DynamicObject, reconciler_name: &str) {
    let Some(annotations) = object.metadata.annotations.as_mut() else {
        return;
    };
    for suffix in RESERVED_ANNOTATION_SUFFIXES {
        annotations.remove(&format!("{reconciler_name}/{suffix}"));
    }
}

fn reject_generate_name(object: &DynamicObject) -> Result<()> {
    if object.metadata.generate_name.is_some() {
        return Err(Error::invalid_object(
            object_key_for_errors(object),
            "generateName is not supported on rendered objects",
        ));
    }
    Ok(())
}

/// `TypeMeta` is required on every rendered `DynamicObject` (the generator
/// owns it); an object the generator forgot to stamp can't be normalized.
fn type_info(object: &DynamicObject) -> Result<GroupVersionKind> {
    let types = object
        .types
        .as_ref()
        .ok_or_else(|| Error::invalid_object(object_key_for_errors(object), "missing apiVersion/kind"))?;
    let (group, version) = split_api_version(&types.api_version);
    Ok(GroupVersionKind::new(group, version, types.kind.clone()))
}

fn split_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// Scope via the REST mapper, falling back to a CRD in the same rendered
/// set when discovery doesn't know the kind yet (it hasn't been installed
/// in the cluster, because this very pass is about to create it).
async fn resolve_scope(client: &Client, gvk: &GroupVersionKind, rendered: &[DynamicObject]) -> Result<Scope> {
    let core_gvk = kube::core::GroupVersionKind::gvk(&gvk.group, &gvk.version, &gvk.kind);
    match discovery::pinned_kind(client, &core_gvk).await {
        Ok((_, capabilities)) => Ok(capabilities.scope),
        Err(_) => scope_from_rendered_crd(gvk, rendered)
            .ok_or_else(|| Error::invalid_object(gvk.to_string_for_errors(), "could not determine resource scope")),
    }
}

fn scope_from_rendered_crd(gvk: &GroupVersionKind, rendered: &[DynamicObject]) -> Option<Scope> {
    rendered.iter().find_map(|candidate| {
        let types = candidate.types.as_ref()?;
        if types.kind != "CustomResourceDefinition" {
            return None;
        }
        let spec = candidate.data.get("spec")?;
        if spec.get("group")?.as_str()? != gvk.group {
            return None;
        }
        if spec.get("names")?.get("kind")?.as_str()? != gvk.kind {
            return None;
        }
        match spec.get("scope")?.as_str()? {
            "Namespaced" => Some(Scope::Namespaced),
            "Cluster" => Some(Scope::Cluster),
            _ => None,
        }
    })
}

fn default_namespace(object: &mut DynamicObject, scope: &Scope, deployment_namespace: &str) {
    match scope {
        Scope::Namespaced => {
            if object.metadata.namespace.is_none() {
                object.metadata.namespace = Some(deployment_namespace.to_string());
            }
        }
        Scope::Cluster => {
            object.metadata.namespace = None;
        }
    }
}

fn parse_policies(object: &DynamicObject, reconciler_name: &str, gvk: &GroupVersionKind) -> Result<ObjectPolicies> {
    let key = || object_key_for_errors(object);
    let annotations = object.metadata.annotations.as_ref();
    let annotation = |suffix: &str| -> Option<&str> {
        annotations.and_then(|a| a.get(&format!("{reconciler_name}/{suffix}")).map(String::as_str))
    };

    let adoption_policy = parse_enum_annotation(annotation("adoption-policy"), &key)?;
    let reconcile_policy = parse_enum_annotation(annotation("reconcile-policy"), &key)?;
    let update_policy = parse_enum_annotation(annotation("update-policy"), &key)?;
    let delete_policy = parse_enum_annotation(annotation("delete-policy"), &key)?;

    let apply_order = parse_order(annotation("apply-order"), DEFAULT_APPLY_ORDER as i32, &key)? as i16;
    let delete_order = parse_order(annotation("delete-order"), DEFAULT_DELETE_ORDER as i32, &key)? as i16;
    let purge_order = parse_order(annotation("purge-order"), DEFAULT_PURGE_ORDER, &key)?;

    let is_hard_reject_kind = gvk.kind == "Namespace"
        || gvk.kind == "CustomResourceDefinition"
        || gvk.kind == "APIService";
    if is_hard_reject_kind && purge_order <= ORDER_MAX {
        return Err(Error::invalid_object(
            key(),
            format!("purge-order is not supported on {}", gvk.kind),
        ));
    }

    Ok(ObjectPolicies {
        adoption_policy,
        reconcile_policy,
        update_policy,
        delete_policy,
        apply_order,
        purge_order,
        delete_order,
    })
}

fn parse_enum_annotation<T: FromStr<Err = crate::inventory::PolicyParseError> + Default>(
    value: Option<&str>,
    key: &impl Fn() -> String,
) -> Result<T> {
    match value {
        None => Ok(T::default()),
        Some(raw) => raw.parse().map_err(|e: crate::inventory::PolicyParseError| Error::invalid_object(key(), e.to_string())),
    }
}

fn parse_order(value: Option<&str>, default: i32, key: &impl Fn() -> String) -> Result<i32> {
    let Some(raw) = value else {
        return Ok(default);
    };
    let parsed: i32 = raw
        .parse()
        .map_err(|_| Error::invalid_object(key(), format!("'{raw}' is not a valid wave order")))?;
    if !(ORDER_MIN..=ORDER_MAX).contains(&parsed) {
        return Err(Error::invalid_object(
            key(),
            format!("wave order {parsed} is out of range [{ORDER_MIN}, {ORDER_MAX}]"),
        ));
    }
    Ok(parsed)
}

fn object_key_for_errors(object: &DynamicObject) -> String {
    let kind = object.types.as_ref().map(|t| t.kind.as_str()).unwrap_or("?");
    match &object.metadata.namespace {
        Some(ns) => format!("{kind}/{ns}/{}", object.metadata.name.as_deref().unwrap_or("?")),
        None => format!("{kind}/{}", object.metadata.name.as_deref().unwrap_or("?")),
    }
}

impl GroupVersionKind {
    fn to_string_for_errors(&self) -> String {
        format!("{}/{}, Kind={}", self.group, self.version, self.kind)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use kube::api::{ObjectMeta, TypeMeta};
    use serde_json::json;

    fn crd(group: &str, kind: &str, scope: &str) -> DynamicObject {
        DynamicObject {
            types: Some(TypeMeta {
                api_version: "apiextensions.k8s.io/v1".into(),
                kind: "CustomResourceDefinition".into(),
            }),
            metadata: ObjectMeta {
                name: Some(format!("{kind}s.{group}").to_lowercase()),
                ..Default::default()
            },
            data: json!({"spec": {"group": group, "names": {"kind": kind}, "scope": scope}}),
        }
    }

    fn object(kind: &str, ns: Option<&str>, name: &str) -> DynamicObject {
        DynamicObject {
            types: Some(TypeMeta {
                api_version: "v1".into(),
                kind: kind.into(),
            }),
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: ns.map(String::from),
                ..Default::default()
            },
            data: json!({}),
        }
    }

    #[test]
    fn split_api_version_handles_core_group() {
        assert_eq!(split_api_version("v1"), ("".to_string(), "v1".to_string()));
        assert_eq!(split_api_version("apps/v1"), ("apps".to_string(), "v1".to_string()));
    }

    #[test]
    fn scope_from_rendered_crd_matches_group_and_kind() {
        let rendered = vec![crd("x.io", "Widget", "Namespaced")];
        let gvk = GroupVersionKind::new("x.io", "v1", "Widget");
        assert_eq!(scope_from_rendered_crd(&gvk, &rendered), Some(Scope::Namespaced));

        let other = GroupVersionKind::new("y.io", "v1", "Widget");
        assert_eq!(scope_from_rendered_crd(&other, &rendered), None);
    }

    #[test]
    fn reject_generate_name_flags_generated_names() {
        let mut obj = object("ConfigMap", Some("default"), "foo");
        obj.metadata.generate_name = Some("foo-".into());
        assert!(reject_generate_name(&obj).is_err());
    }

    #[test]
    fn default_namespace_fills_namespaced_and_clears_cluster_scoped() {
        let mut namespaced = object("ConfigMap", None, "foo");
        default_namespace(&mut namespaced, &Scope::Namespaced, "prod");
        assert_eq!(namespaced.metadata.namespace.as_deref(), Some("prod"));

        let mut cluster = object("ClusterRole", Some("prod"), "foo");
        default_namespace(&mut cluster, &Scope::Cluster, "prod");
        assert_eq!(cluster.metadata.namespace, None);
    }

    #[test]
    fn parse_policies_rejects_purge_order_on_namespace() {
        let mut obj = object("Namespace", None, "prod");
        obj.metadata.annotations = Some(
            [("acme.io/purge-order".to_string(), "10".to_string())]
                .into_iter()
                .collect(),
        );
        let gvk = GroupVersionKind::new("", "v1", "Namespace");
        let err = parse_policies(&obj, "acme.io", &gvk).unwrap_err();
        assert!(matches!(err, Error::InvalidObject { .. }));
    }

    #[test]
    fn parse_policies_allows_default_purge_order_on_namespace() {
        let obj = object("Namespace", None, "prod");
        let gvk = GroupVersionKind::new("", "v1", "Namespace");
        let policies = parse_policies(&obj, "acme.io", &gvk).unwrap();
        assert_eq!(policies.purge_order, DEFAULT_PURGE_ORDER);
    }

    #[test]
    fn parse_policies_rejects_out_of_range_apply_order() {
        let mut obj = object("ConfigMap", Some("default"), "foo");
        obj.metadata.annotations = Some(
            [("acme.io/apply-order".to_string(), "40000".to_string())]
                .into_iter()
                .collect(),
        );
        let gvk = GroupVersionKind::new("", "v1", "ConfigMap");
        assert!(parse_policies(&obj, "acme.io", &gvk).is_err());
    }

    #[test]
    fn parse_policies_reads_explicit_policy_annotations() {
        let mut obj = object("ConfigMap", Some("default"), "foo");
        obj.metadata.annotations = Some(
            [("acme.io/adoption-policy".to_string(), "always".to_string())]
                .into_iter()
                .collect(),
        );
        let gvk = GroupVersionKind::new("", "v1", "ConfigMap");
        let policies = parse_policies(&obj, "acme.io", &gvk).unwrap();
        assert_eq!(policies.adoption_policy, AdoptionPolicy::Always);
    }

    #[test]
    fn parse_managed_types_splits_csv_triplets() {
        let parsed = parse_managed_types(Some("x.io/v1/Widget, /v1/"));
        assert_eq!(parsed[0], GroupVersionKind::new("x.io", "v1", "Widget"));
        assert_eq!(parsed[1], GroupVersionKind::new("", "v1", ""));
    }

    #[test]
    fn strip_reserved_annotations_removes_engine_owned_keys() {
        let mut obj = object("ConfigMap", Some("default"), "foo");
        obj.metadata.annotations = Some(
            [
                ("acme.io/owner-id".to_string(), "forged".to_string()),
                ("acme.io/digest".to_string(), "forged".to_string()),
                ("keep".to_string(), "me".to_string()),
            ]
            .into_iter()
            .collect(),
        );
        strip_reserved_annotations(&mut obj, "acme.io");
        let annotations = obj.metadata.annotations.unwrap();
        assert!(!annotations.contains_key("acme.io/owner-id"));
        assert!(!annotations.contains_key("acme.io/digest"));
        assert!(annotations.contains_key("keep"));
    }
}
