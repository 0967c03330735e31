//! Renders a `WebApp`'s dependent objects: one `Deployment`, one `Service`.
//!
//! Grounded on the reference operator's `echo::reconcile::deploy` (build a
//! `Deployment` spec from the component's own fields, let the generic engine
//! own applying/tracking it) but expressed as a `ManifestGenerator` so the
//! driver never needs to know `WebApp` exists.

use kube::api::DynamicObject;
use reconciler_core::component::ManifestGenerator;
use reconciler_core::error::Result;
use serde_json::json;

use crate::crd::{WebApp, WebAppSpec};

pub struct WebAppGenerator;

impl ManifestGenerator<WebApp> for WebAppGenerator {
    fn generate(&self, namespace: &str, name: &str, spec: &WebAppSpec) -> Result<Vec<DynamicObject>> {
        let labels = json!({ "app.kubernetes.io/name": name });

        let mut env = Vec::new();
        if let Some(config_map) = &spec.env_config_map {
            env.push(json!({
                "name": "WEBAPP_CONFIG",
                "valueFrom": { "configMapKeyRef": { "name": config_map, "key": "config" } },
            }));
        }

        let deployment = json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": { "name": name, "namespace": namespace },
            "spec": {
                "replicas": spec.replicas,
                "selector": { "matchLabels": labels },
                "template": {
                    "metadata": { "labels": labels },
                    "spec": {
                        "containers": [{
                            "name": "webapp",
                            "image": spec.image,
                            "ports": [{ "containerPort": spec.port }],
                            "env": env,
                        }],
                    },
                },
            },
        });

        let service = json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": { "name": name, "namespace": namespace },
            "spec": {
                "selector": labels,
                "ports": [{ "port": spec.port, "targetPort": spec.port }],
            },
        });

        Ok(vec![
            serde_json::from_value(deployment)?,
            serde_json::from_value(service)?,
        ])
    }
}
