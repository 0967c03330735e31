//! Controller wiring (SPEC_FULL.md §5): drives any `Component` through
//! `driver::reconcile`/`driver::error_policy`, plus the diagnostics/metrics
//! `State` the operator binary's web server exposes.
//!
//! Grounded on the reference operator's `controller.rs` `State`/`Diagnostics`
//! split, generalized so the `Context` handed to `Controller::run` is the
//! engine's own `Reconciler<C>` rather than a bespoke per-resource struct.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use kube::api::{Api, ListParams};
use kube::runtime::controller::Controller;
use kube::runtime::events::Reporter;
use kube::runtime::watcher::Config;
use serde::Serialize;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{error, trace};

use crate::component::Component;
use crate::driver::{self, Reconciler};
use crate::metrics::Metrics;

/// Diagnostics read by the web server's `/diagnostics` endpoint.
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    #[serde(deserialize_with = "from_ts")]
    pub last_event: DateTime<Utc>,
    #[serde(skip)]
    pub reporter: Reporter,
}

impl Diagnostics {
    fn new(reconciler_name: &str) -> Self {
        Diagnostics {
            last_event: Utc::now(),
            reporter: reconciler_name.into(),
        }
    }
}

/// State shared between the controller loop and the web server, generic over
/// the `Component` kind being watched.
#[derive(Clone)]
pub struct State<C: Component> {
    diagnostics: Arc<RwLock<Diagnostics>>,
    metrics: Arc<Metrics>,
    reconciler: Arc<Reconciler<C>>,
}

impl<C: Component> State<C> {
    pub fn new(reconciler: Arc<Reconciler<C>>) -> Self {
        State {
            diagnostics: Arc::new(RwLock::new(Diagnostics::new(&reconciler.reconciler_name))),
            metrics: reconciler.metrics.clone(),
            reconciler,
        }
    }

    /// Prometheus text-exposition of the registry behind this reconciler.
    pub fn metrics(&self) -> String {
        let mut buffer = String::new();
        prometheus_client::encoding::text::encode(&mut buffer, &self.metrics.registry).unwrap();
        buffer
    }

    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }
}

/// Runs the watch/reconcile loop for `C` until the process receives a
/// shutdown signal. `api` scopes which instances are watched (all
/// namespaces, one namespace, a label selector, ...); that choice belongs to
/// the operator binary, not this crate.
pub async fn run<C: Component>(state: State<C>, api: Api<C>) {
    if let Err(e) = api.list(&ListParams::default().limit(1)).await {
        error!("CRD is not queryable; {e:?}. Is the CRD installed?");
        std::process::exit(1);
    }
    trace!("init controller");

    let reconciler = state.reconciler.clone();
    let diagnostics = state.diagnostics.clone();

    let sweep_cancel = CancellationToken::new();
    let sweeper = tokio::spawn(reconciler.clone().run_client_cache_sweeper(sweep_cancel.clone()));

    Controller::new(api, Config::default().any_semantic())
        .shutdown_on_signal()
        .run(
            move |component, reconciler| {
                let diagnostics = diagnostics.clone();
                async move {
                    diagnostics.write().await.last_event = Utc::now();
                    driver::reconcile(component, reconciler).await
                }
            },
            driver::error_policy,
            reconciler,
        )
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;

    sweep_cancel.cancel();
    let _ = sweeper.await;
}
