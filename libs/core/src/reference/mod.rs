//! Reference resolution and component-digest computation (SPEC_FULL.md §4.4).
//!
//! The Go source walks a component's spec reflectively looking for
//! reference-shaped fields. The Rust port replaces that walk with an
//! explicit accessor (`ComponentSpec::references`) returning an ordered list
//! of `ReferenceDescriptor`s, so the set of references a spec holds is part
//! of its type rather than discovered at runtime.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::api::Api;
use kube::Client;
use serde::Serialize;
use sha2::{Digest as _, Sha256};

use crate::error::{Error, Result};

const REFERENCE_NOT_FOUND_RETRY_AFTER: std::time::Duration = std::time::Duration::from_secs(10);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReferenceKind {
    ConfigMap,
    Secret,
}

/// One reference a component spec holds: either the whole object's data
/// (`key = None`) or a single key, optionally with fallbacks tried in
/// order when the primary key is absent.
#[derive(Clone, Debug)]
pub struct ReferenceDescriptor {
    /// JSON-path-ish label identifying where in the spec this reference
    /// lives; folded into the digest as `refs:<json_path>:<content_digest>`.
    pub json_path: String,
    pub kind: ReferenceKind,
    pub namespace: String,
    pub name: String,
    pub key: Option<String>,
    pub fallback_keys: Vec<String>,
    /// When true, a not-found is tolerated (treated as an empty value)
    /// while the owning component is being deleted.
    pub ignore_on_deletion: bool,
}

impl ReferenceDescriptor {
    pub fn config_map(json_path: impl Into<String>, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        ReferenceDescriptor {
            json_path: json_path.into(),
            kind: ReferenceKind::ConfigMap,
            namespace: namespace.into(),
            name: name.into(),
            key: None,
            fallback_keys: Vec::new(),
            ignore_on_deletion: false,
        }
    }

    pub fn secret(json_path: impl Into<String>, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        ReferenceDescriptor {
            json_path: json_path.into(),
            kind: ReferenceKind::Secret,
            namespace: namespace.into(),
            name: name.into(),
            key: None,
            fallback_keys: Vec::new(),
            ignore_on_deletion: false,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_fallback_keys(mut self, keys: Vec<String>) -> Self {
        self.fallback_keys = keys;
        self
    }

    pub fn ignore_on_deletion(mut self) -> Self {
        self.ignore_on_deletion = true;
        self
    }
}

/// An open-ended reference a spec field can embed directly (the Go source's
/// generic `Reference[T]`), resolved by the caller rather than by this
/// module and folded into the digest via its own `digest()`.
pub trait Reference: Send + Sync {
    fn load(&mut self, client: &Client, component_namespace: &str) -> Result<()>;
    fn digest(&self) -> String;
}

/// Load every `ConfigMap`/`Secret` reference a spec declares, returning the
/// `refs:<path>:<content-digest>` entries ready to fold into the component
/// digest builder.
pub async fn resolve(
    client: &Client,
    namespace: &str,
    refs: &[ReferenceDescriptor],
    component_deleting: bool,
) -> Result<Vec<(String, String)>> {
    let mut resolved = Vec::with_capacity(refs.len());
    for r in refs {
        let data = match load_one(client, namespace, r).await {
            Ok(data) => data,
            Err(Error::Kube(err)) if crate::error::is_not_found(&err) => {
                if r.ignore_on_deletion && component_deleting {
                    BTreeMap::new()
                } else {
                    return Err(Error::retriable_after(
                        format!("referenced {:?} {}/{} not found", r.kind, namespace, r.name),
                        REFERENCE_NOT_FOUND_RETRY_AFTER,
                    ));
                }
            }
            Err(other) => return Err(other),
        };
        let value = select_value(r, &data)?;
        resolved.push((r.json_path.clone(), content_digest(&value)));
    }
    Ok(resolved)
}

async fn load_one(client: &Client, namespace: &str, r: &ReferenceDescriptor) -> Result<BTreeMap<String, String>> {
    match r.kind {
        ReferenceKind::ConfigMap => {
            let api: Api<ConfigMap> = Api::namespaced(client.clone(), namespace);
            let cm = api.get(&r.name).await?;
            Ok(cm.data.unwrap_or_default())
        }
        ReferenceKind::Secret => {
            let api: Api<Secret> = Api::namespaced(client.clone(), namespace);
            let secret = api.get(&r.name).await?;
            let mut out = BTreeMap::new();
            for (k, v) in secret.data.unwrap_or_default() {
                out.insert(k, String::from_utf8_lossy(&v.0).into_owned());
            }
            for (k, v) in secret.string_data.unwrap_or_default() {
                out.entry(k).or_insert(v);
            }
            Ok(out)
        }
    }
}

/// Picks the single-key value (trying fallbacks in order) or serialises the
/// whole map when no key was requested.
fn select_value(r: &ReferenceDescriptor, data: &BTreeMap<String, String>) -> Result<serde_json::Value> {
    match &r.key {
        None => Ok(serde_json::to_value(data)?),
        Some(primary) => {
            for candidate in std::iter::once(primary).chain(r.fallback_keys.iter()) {
                if let Some(v) = data.get(candidate) {
                    return Ok(serde_json::Value::String(v.clone()));
                }
            }
            Err(Error::invalid_object(
                format!("{:?}/{}/{}", r.kind, r.namespace, r.name),
                format!("key '{primary}' (and fallbacks) not present"),
            ))
        }
    }
}

fn content_digest(value: &serde_json::Value) -> String {
    let canonical = serde_json::to_vec(value).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&canonical);
    hex::encode(hasher.finalize())
}

/// Builds the component digest: `sha256hex(canonical JSON of {generation,
/// annotations, spec, refs})` (SPEC_FULL.md §4.4).
#[derive(Serialize)]
struct DigestBuilder<'a> {
    generation: i64,
    annotations: &'a BTreeMap<String, String>,
    spec: &'a serde_json::Value,
    refs: &'a [(String, String)],
    open_refs: &'a [String],
}

pub fn component_digest(
    generation: i64,
    annotations: &BTreeMap<String, String>,
    spec: &serde_json::Value,
    resolved_refs: &[(String, String)],
    open_ref_digests: &[String],
) -> Result<String> {
    let mut refs = resolved_refs.to_vec();
    refs.sort();
    let mut open_refs = open_ref_digests.to_vec();
    open_refs.sort();

    let builder = DigestBuilder {
        generation,
        annotations,
        spec,
        refs: &refs,
        open_refs: &open_refs,
    };
    let canonical = serde_json::to_vec(&builder).map_err(Error::from)?;
    let mut hasher = Sha256::new();
    hasher.update(&canonical);
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn content_digest_is_stable_for_equal_values() {
        let a = json!({"x": 1, "y": 2});
        let b = json!({"y": 2, "x": 1});
        assert_eq!(content_digest(&a), content_digest(&b));
    }

    #[test]
    fn content_digest_differs_on_value_change() {
        assert_ne!(content_digest(&json!("a")), content_digest(&json!("b")));
    }

    #[test]
    fn select_value_uses_first_available_fallback() {
        let r = ReferenceDescriptor::config_map("spec.cfg", "default", "cfg")
            .with_key("primary")
            .with_fallback_keys(vec!["secondary".into()]);
        let mut data = BTreeMap::new();
        data.insert("secondary".to_string(), "value".to_string());
        let v = select_value(&r, &data).unwrap();
        assert_eq!(v, json!("value"));
    }

    #[test]
    fn select_value_errors_when_no_key_present() {
        let r = ReferenceDescriptor::secret("spec.sec", "default", "sec").with_key("missing");
        let err = select_value(&r, &BTreeMap::new()).unwrap_err();
        assert!(matches!(err, Error::InvalidObject { .. }));
    }

    #[test]
    fn component_digest_is_stable_across_ref_ordering() {
        let annotations = BTreeMap::new();
        let spec = json!({"replicas": 3});
        let refs_a = vec![("a".to_string(), "1".to_string()), ("b".to_string(), "2".to_string())];
        let refs_b = vec![("b".to_string(), "2".to_string()), ("a".to_string(), "1".to_string())];
        let digest_a = component_digest(1, &annotations, &spec, &refs_a, &[]).unwrap();
        let digest_b = component_digest(1, &annotations, &spec, &refs_b, &[]).unwrap();
        assert_eq!(digest_a, digest_b);
    }

    #[test]
    fn component_digest_changes_with_generation() {
        let annotations = BTreeMap::new();
        let spec = json!({});
        let d1 = component_digest(1, &annotations, &spec, &[], &[]).unwrap();
        let d2 = component_digest(2, &annotations, &spec, &[], &[]).unwrap();
        assert_ne!(d1, d2);
    }
}
