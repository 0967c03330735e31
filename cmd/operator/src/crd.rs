//! The demo custom resource this binary reconciles: a small web application
//! fronted by a `Deployment` and a `Service`, optionally templated from a
//! `ConfigMap`. Exercises the engine's inventory/wave machinery with more
//! than one dependent object, unlike a single-`Deployment` toy.

use kube::CustomResource;
use reconciler_core::reference::ReferenceDescriptor;
use reconciler_core::status::Status;
use reconciler_core::{Component, ComponentConfig, ComponentSpec};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// `WebApp.apps.example.io`: `replicas` copies of `image`, serving on
/// `port`, optionally reading environment variables from a `ConfigMap` in
/// the same namespace.
#[derive(CustomResource, Clone, Debug, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "apps.example.io",
    version = "v1",
    kind = "WebApp",
    shortname = "wa",
    namespaced
)]
#[kube(status = "Status")]
pub struct WebAppSpec {
    /// Desired replica count.
    #[schemars(range(min = 0))]
    pub replicas: i32,
    /// Container image for every replica.
    pub image: String,
    /// Port the container listens on and the `Service` forwards to.
    #[schemars(range(min = 1, max = 65535))]
    pub port: u16,
    /// Name of a `ConfigMap` (same namespace) whose keys become environment
    /// variables. Absent means no extra environment.
    pub env_config_map: Option<String>,
}

impl ComponentSpec for WebAppSpec {
    fn references(&self) -> Vec<ReferenceDescriptor> {
        match &self.env_config_map {
            Some(name) => vec![ReferenceDescriptor::config_map("envConfigMap", "", name)],
            None => Vec::new(),
        }
    }
}

impl Component for WebApp {
    type Spec = WebAppSpec;

    fn spec(&self) -> &Self::Spec {
        &self.spec
    }

    fn status(&self) -> Option<&Status> {
        self.status.as_ref()
    }

    fn set_status(&mut self, status: Status) {
        self.status = Some(status);
    }

    fn config(&self) -> ComponentConfig {
        ComponentConfig::default()
    }
}
