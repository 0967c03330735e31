use crate::metrics::MetricsLayer;

use hyper_util::rt::TokioExecutor;
use kube::config::{KubeConfigOptions, Kubeconfig, KubeconfigError};
use kube::Result;
use kube::{client::ConfigExt, Client, Config};
use prometheus_client::registry::Registry;
use tower::ServiceBuilder;

/// Errors specific to constructing a target-cluster client from a remote
/// kubeconfig, distinct from `kube::Error` (the ordinary API-call path).
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("invalid remote kubeconfig: {0}")]
    Kubeconfig(#[from] KubeconfigError),
    #[error(transparent)]
    Kube(#[from] kube::Error),
}

pub async fn new_client_with_metrics(config: Config, registry: &mut Registry) -> Result<Client> {
    let metrics_layer = MetricsLayer::new(registry);
    build_client(config, metrics_layer)
}

/// Builds a metrics-instrumented client reusing an already-registered
/// `MetricsLayer` (cheap to clone: its families are `Arc`-backed), so that
/// constructing many target clients doesn't re-register the same metric
/// names into the registry (SPEC_FULL.md §4.7: "each client is wrapped so
/// requests increment a per-verb request counter" — the counter family is
/// shared across every cached client, not re-created per entry).
pub fn new_client_with_shared_metrics(config: Config, metrics_layer: MetricsLayer) -> Result<Client> {
    build_client(config, metrics_layer)
}

fn build_client(config: Config, metrics_layer: MetricsLayer) -> Result<Client> {
    let https = config.rustls_https_connector()?;
    let service = ServiceBuilder::new()
        .layer(metrics_layer)
        .layer(config.base_uri_layer())
        .option_layer(config.auth_layer()?)
        .service(hyper_util::client::legacy::Client::builder(TokioExecutor::new()).build(https));

    Ok(Client::new(service, config.default_namespace))
}

/// Builds a metrics-instrumented client for a target cluster, optionally
/// impersonating a user/groups and/or loading an alternate kubeconfig
/// (SPEC_FULL.md §4.7). `kubeconfig_yaml = None` reuses local in-cluster /
/// default kubeconfig inference.
pub async fn new_target_client_with_shared_metrics(
    kubeconfig_yaml: Option<&str>,
    impersonate_user: Option<&str>,
    impersonate_groups: &[String],
    metrics_layer: MetricsLayer,
) -> std::result::Result<Client, ClientError> {
    let mut config = match kubeconfig_yaml {
        Some(yaml) => {
            let kubeconfig = Kubeconfig::from_yaml(yaml)?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await?
        }
        None => Config::infer().await?,
    };

    if let Some(user) = impersonate_user {
        config.auth_info.impersonate = Some(user.to_string());
    }
    if !impersonate_groups.is_empty() {
        config.auth_info.impersonate_groups = Some(impersonate_groups.to_vec());
    }

    Ok(new_client_with_shared_metrics(config, metrics_layer)?)
}
