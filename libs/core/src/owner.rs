//! Ownership tracking (SPEC_FULL.md §3, §6).
//!
//! Every managed object carries a label `<reconciler-name>/owner-id`,
//! computed as a hash of the un-hashed owner-id so it fits inside
//! Kubernetes' 63-character label-value limit (sha256 hex is 64 characters,
//! one over budget; base32 of the same digest is 52), and an annotation
//! holding the un-hashed value for diagnostics. `reconciler_id` is derived
//! once per process from the target cluster's `kube-system` namespace UID
//! so owner-ids stay globally unique per cluster even across reconciler
//! instances reconciling the same component kind.

use data_encoding::BASE32HEX_NOPAD;
use k8s_openapi::api::core::v1::Namespace;
use kube::api::Api;
use kube::Client;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

pub async fn reconciler_id(client: &Client) -> Result<String> {
    let namespaces: Api<Namespace> = Api::all(client.clone());
    let kube_system = namespaces.get("kube-system").await?;
    kube_system
        .metadata
        .uid
        .ok_or_else(|| Error::assertion("kube-system namespace has no uid"))
}

/// The un-hashed owner-id, written verbatim into the owner-id annotation.
pub fn owner_id(reconciler_id: &str, component_namespace: &str, component_name: &str) -> String {
    format!("{reconciler_id}/{component_namespace}/{component_name}")
}

/// The hashed, label-safe form of an owner-id.
pub fn owner_id_label(owner_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(owner_id.as_bytes());
    BASE32HEX_NOPAD.encode(&hasher.finalize())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn owner_id_label_is_stable_and_label_safe() {
        let id = owner_id("cluster-uid-1", "default", "web");
        let label = owner_id_label(&id);
        assert_eq!(label, owner_id_label(&id));
        assert!(label.len() <= 63);
        assert!(label.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn owner_id_label_differs_per_component() {
        let a = owner_id_label(&owner_id("cluster-uid-1", "default", "web"));
        let b = owner_id_label(&owner_id("cluster-uid-1", "default", "worker"));
        assert_ne!(a, b);
    }

    #[test]
    fn owner_id_embeds_reconciler_and_component_identity() {
        let id = owner_id("cluster-uid-1", "default", "web");
        assert_eq!(id, "cluster-uid-1/default/web");
    }
}
