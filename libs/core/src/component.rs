//! The `Component` trait: the engine's one seam into a concrete custom
//! resource (SPEC_FULL.md §3, §9).
//!
//! The Go source's optional sub-interfaces (`PlacementConfiguration`,
//! `ClientConfiguration`, `PolicyConfiguration`) are flattened here into a
//! single `ComponentConfig` value rather than modeled as marker traits: a
//! component either returns the defaults or overrides the fields it cares
//! about, and the engine never needs to downcast to find out which
//! sub-interfaces are implemented.

use std::time::Duration;

use kube::api::DynamicObject;
use kube::{Resource, ResourceExt};
use serde::Serialize;

use crate::inventory::{AdoptionPolicy, DeletePolicy, UpdatePolicy};
use crate::reference::ReferenceDescriptor;
use crate::status::Status;

/// Target-cluster placement and client selection for a component instance.
/// All fields default to "use the local cluster, the component's own
/// namespace, no impersonation."
#[derive(Clone, Debug, Default)]
pub struct ComponentConfig {
    /// Namespace dependent objects are placed into, if different from the
    /// component's own namespace (cluster-scoped components must set this).
    pub target_namespace: Option<String>,
    /// Name override applied to generated objects that would otherwise
    /// collide across multiple component instances in the same namespace.
    pub target_name: Option<String>,

    /// Impersonated user for the target client (SPEC_FULL.md §4.7).
    pub impersonate_user: Option<String>,
    /// Impersonated groups for the target client.
    pub impersonate_groups: Vec<String>,
    /// Name of a Secret (in the component's namespace) holding a remote
    /// cluster's kubeconfig. `None` means "reconcile the local cluster."
    pub remote_kubeconfig_secret: Option<String>,

    /// Policy overrides applied when a rendered object's own annotations
    /// don't specify one explicitly.
    pub default_adoption_policy: Option<AdoptionPolicy>,
    pub default_update_policy: Option<UpdatePolicy>,
    pub default_delete_policy: Option<DeletePolicy>,
    pub create_missing_namespaces: bool,

    /// Per-component overrides of the driver's default timers
    /// (SPEC_FULL.md §4.1 step 2); `None` defers to `ReconcilerConfig`.
    pub requeue_interval: Option<Duration>,
    pub retry_interval: Option<Duration>,
    pub reconcile_timeout: Option<Duration>,
}

/// A component's `Spec` type: opaque to the engine except for the set of
/// references it declares. SPEC_FULL.md §4.4 replaces the Go source's
/// reflective spec walk with this explicit accessor.
pub trait ComponentSpec: Serialize + Send + Sync + 'static {
    /// References this spec holds, in a stable order (digest stability
    /// depends on it, see `reference::component_digest`).
    fn references(&self) -> Vec<ReferenceDescriptor> {
        Vec::new()
    }
}

/// The reconciled entity (SPEC_FULL.md §3). Implemented by any
/// `kube::Resource`-derived custom resource whose status the engine owns.
pub trait Component:
    Resource<DynamicType = (), Scope = kube::core::NamespaceResourceScope>
    + ResourceExt
    + Clone
    + std::fmt::Debug
    + Serialize
    + serde::de::DeserializeOwned
    + Send
    + Sync
    + 'static
{
    type Spec: ComponentSpec;

    fn spec(&self) -> &Self::Spec;

    /// The engine-owned status block. `None` before the first write.
    fn status(&self) -> Option<&Status>;

    fn set_status(&mut self, status: Status);

    /// Placement, client, and policy configuration for this instance.
    /// Returns `ComponentConfig::default()` when the component exposes no
    /// overrides.
    fn config(&self) -> ComponentConfig {
        ComponentConfig::default()
    }

    /// Side-channel for annotating emitted events (SPEC_FULL.md §4.1.1:
    /// "components may annotate events by exposing a
    /// `GetEventAnnotations(componentDigest)` side-channel").
    fn event_annotations(&self, _component_digest: &str) -> std::collections::BTreeMap<String, String> {
        Default::default()
    }
}

/// The generator interface (SPEC_FULL.md §6): renders the dependent object
/// set for one component instance. Implemented per concrete `Component` by
/// the consuming operator binary, not by this crate.
pub trait ManifestGenerator<C: Component>: Send + Sync + 'static {
    fn generate(
        &self,
        namespace: &str,
        name: &str,
        spec: &C::Spec,
    ) -> crate::error::Result<Vec<DynamicObject>>;
}
