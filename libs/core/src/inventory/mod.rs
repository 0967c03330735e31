//! Inventory data model and phase state machine (SPEC_FULL.md §3, §4.3).

mod policy;

pub use policy::{AdoptionPolicy, DeletePolicy, PolicyParseError, ReconcilePolicy, UpdatePolicy};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Group+Kind, ignoring version. A CRD migration that bumps the storage
/// version must not leave two inventory items around for the same object
/// (SPEC_FULL.md §4.3), so `ObjectKey` intentionally omits version.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema)]
pub struct ObjectKey {
    pub group: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(
        group: impl Into<String>,
        kind: impl Into<String>,
        namespace: Option<String>,
        name: impl Into<String>,
    ) -> Self {
        ObjectKey {
            group: group.into(),
            kind: kind.into(),
            namespace,
            name: name.into(),
        }
    }

    pub fn cluster_scoped(group: impl Into<String>, kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(group, kind, None, name)
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let gk = if self.group.is_empty() {
            self.kind.to_lowercase()
        } else {
            format!("{}.{}", self.kind.to_lowercase(), self.group)
        };
        match &self.namespace {
            Some(ns) => write!(f, "{gk}/{ns}/{}", self.name),
            None => write!(f, "{gk}/{}", self.name),
        }
    }
}

/// Full group/version/kind, as opposed to `ObjectKey`'s group/kind.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub struct GroupVersionKind {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl GroupVersionKind {
    pub fn new(group: impl Into<String>, version: impl Into<String>, kind: impl Into<String>) -> Self {
        GroupVersionKind {
            group: group.into(),
            version: version.into(),
            kind: kind.into(),
        }
    }

    /// `true` when this GVK matches a managed-type declaration, honoring the
    /// wildcard conventions: empty `group`/`version`/`kind` in the
    /// declaration means "any". SPEC_FULL.md §9 leaves overlapping
    /// declarations (wildcard + specific) undefined; DESIGN.md records the
    /// "first match wins" decision, which falls out naturally here because
    /// callers iterate `ManagedTypes` in declared order.
    pub fn matches_declaration(&self, decl: &GroupVersionKind) -> bool {
        (decl.group.is_empty() || decl.group == self.group)
            && (decl.version.is_empty() || decl.version == self.version)
            && (decl.kind.is_empty() || decl.kind == self.kind)
    }

    pub fn to_key(&self) -> ObjectKeyPrefix {
        ObjectKeyPrefix {
            group: self.group.clone(),
            kind: self.kind.clone(),
        }
    }
}

/// Group+Kind pair used to test an `ObjectKey` against a `GroupVersionKind`
/// managed-type declaration without allocating a full `ObjectKey`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectKeyPrefix {
    pub group: String,
    pub kind: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum Phase {
    ScheduledForApplication,
    Creating,
    Updating,
    Ready,
    ScheduledForCompletion,
    Completing,
    Completed,
    ScheduledForDeletion,
    Deleting,
}

impl Phase {
    pub fn is_terminal_ready(&self) -> bool {
        matches!(self, Phase::Ready | Phase::Completed)
    }

    pub fn is_deletion_pending(&self) -> bool {
        matches!(
            self,
            Phase::ScheduledForDeletion
                | Phase::Deleting
                | Phase::ScheduledForCompletion
                | Phase::Completing
        )
    }
}

/// One declared managed type: a CRD or APIService this inventory item
/// installs, whose instances must be deleted before it (SPEC_FULL.md §3).
/// Wildcards (`""`) are allowed in any field.
pub type ManagedTypeDecl = GroupVersionKind;

/// Sentinel digest meaning "scheduled for deletion" (SPEC_FULL.md §3: "Empty
/// digest marker means scheduled for deletion").
pub const DELETION_DIGEST: &str = "";

/// Sentinel digest suffix for `ReconcilePolicy::Once` (SPEC_FULL.md §4.2 step 5).
pub const ONCE_DIGEST: &str = "__once__";

#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InventoryItem {
    pub group: String,
    pub version: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,

    #[serde(default)]
    pub adoption_policy: AdoptionPolicy,
    #[serde(default)]
    pub reconcile_policy: ReconcilePolicy,
    #[serde(default)]
    pub update_policy: UpdatePolicy,
    #[serde(default)]
    pub delete_policy: DeletePolicy,

    pub apply_order: i16,
    /// Wider than `apply_order`/`delete_order` because the "never purge"
    /// default (32768) sits one past `i16::MAX` on purpose — no real apply
    /// wave can reach it.
    pub purge_order: i32,
    pub delete_order: i16,

    #[serde(default)]
    pub managed_types: Vec<ManagedTypeDecl>,

    #[serde(default)]
    pub digest: String,

    pub phase: Phase,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<crate::status_analyzer::ObjectStatus>,
}

impl InventoryItem {
    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(
            self.group.clone(),
            self.kind.clone(),
            self.namespace.clone(),
            self.name.clone(),
        )
    }

    pub fn gvk(&self) -> GroupVersionKind {
        GroupVersionKind::new(self.group.clone(), self.version.clone(), self.kind.clone())
    }

    /// `item.Matches(key)` from SPEC_FULL.md §4.3: group+kind+namespace+name
    /// equal, version ignored.
    pub fn matches(&self, key: &ObjectKey) -> bool {
        self.group == key.group
            && self.kind == key.kind
            && self.namespace == key.namespace
            && self.name == key.name
    }

    /// Whether this item declares itself as installing `candidate` as a
    /// managed type (first matching declaration wins, per DESIGN.md).
    pub fn manages(&self, candidate: &GroupVersionKind) -> bool {
        self.managed_types.iter().any(|d| candidate.matches_declaration(d))
    }

    pub fn is_managed_type_declarer(&self) -> bool {
        !self.managed_types.is_empty()
    }

    /// Schedule this item for deletion: clear its digest and flip to
    /// `ScheduledForDeletion` (or `ScheduledForCompletion` if it was already
    /// `Completed`, which per invariant 4 is never re-applied but can still
    /// be torn down).
    pub fn schedule_for_deletion(&mut self) {
        self.digest = DELETION_DIGEST.to_string();
        self.phase = Phase::ScheduledForDeletion;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn item(group: &str, kind: &str, ns: Option<&str>, name: &str) -> InventoryItem {
        InventoryItem {
            group: group.into(),
            version: "v1".into(),
            kind: kind.into(),
            namespace: ns.map(String::from),
            name: name.into(),
            adoption_policy: AdoptionPolicy::default(),
            reconcile_policy: ReconcilePolicy::default(),
            update_policy: UpdatePolicy::default(),
            delete_policy: DeletePolicy::default(),
            apply_order: 0,
            purge_order: 32768,
            delete_order: 0,
            managed_types: vec![],
            digest: "abc".into(),
            phase: Phase::Ready,
            status: None,
        }
    }

    #[test]
    fn matches_ignores_version() {
        let i = item("apps", "Deployment", Some("default"), "web");
        let key_v1 = ObjectKey::new("apps", "Deployment", Some("default".into()), "web");
        assert!(i.matches(&key_v1));
    }

    #[test]
    fn matches_requires_namespace_and_name_equal() {
        let i = item("", "ConfigMap", Some("default"), "foo");
        assert!(!i.matches(&ObjectKey::new("", "ConfigMap", Some("other".into()), "foo")));
        assert!(!i.matches(&ObjectKey::new("", "ConfigMap", Some("default".into()), "bar")));
    }

    #[test]
    fn wildcard_managed_type_matches_any_kind() {
        let mut i = item("apiextensions.k8s.io", "CustomResourceDefinition", None, "widgets.x.io");
        i.managed_types = vec![GroupVersionKind::new("x.io", "v1", "")];
        assert!(i.manages(&GroupVersionKind::new("x.io", "v1", "Widget")));
        assert!(!i.manages(&GroupVersionKind::new("y.io", "v1", "Widget")));
    }

    #[test]
    fn schedule_for_deletion_clears_digest() {
        let mut i = item("", "ConfigMap", Some("default"), "foo");
        i.schedule_for_deletion();
        assert_eq!(i.digest, DELETION_DIGEST);
        assert_eq!(i.phase, Phase::ScheduledForDeletion);
    }
}
