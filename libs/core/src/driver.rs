//! The reconciler driver (SPEC_FULL.md §4.1): the per-request algorithm that
//! ties the generic apply/delete wave engine to a `kube::runtime::Controller`.
//!
//! Grounded on the reference operator's `controller.rs` `reconcile`/
//! `error_policy` pair and `Context`/`State` split, generalized from one
//! hardcoded resource to any `Component`. The Go source's `defer`-based
//! status handler (§4.1.1) has no direct Rust equivalent; it is modeled here
//! as a plain function (`finalize`) called exactly once at the end of
//! `reconcile`, fed the `Result` of the rest of the pass rather than relying
//! on unwinding.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::events::{Recorder, Reporter};
use kube::{Client, Resource, ResourceExt};
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{field, info, instrument, warn, Span};

use crate::backoff::Backoff;
use crate::client_factory::ClientFactory;
use crate::component::{Component, ManifestGenerator};
use crate::config::ReconcilerConfig;
use crate::env::ReconcileEnv;
use crate::error::{Error, Result};
use crate::events::DedupRecorder;
use crate::inventory::{InventoryItem, ObjectKey};
use crate::metrics::Metrics;
use crate::owner;
use crate::reconcile_target;
use crate::reference;
use crate::status::{ConditionStatus, State, Status};
use crate::telemetry;

/// Hook signature shared by every registration point. `C` is borrowed, not
/// owned, since hooks only ever observe the component being reconciled.
/// Registrants box their own future (typically `|c, client| Box::pin(async
/// move { .. })`), which sidesteps the higher-ranked lifetime inference that
/// an inner `box_hook` adapter would otherwise need to thread through.
pub type Hook<C> = Box<dyn for<'a> Fn(&'a C, &'a Client) -> BoxFuture<'a, Result<()>> + Send + Sync>;

/// Builds a `Reconciler<C>`. Hooks must be registered before `setup()`; calling
/// `setup()` a second time on the same builder is a wiring-time programming
/// error, not a runtime condition, so it panics outright (SPEC_FULL.md §10.2).
pub struct ReconcilerBuilder<C: Component> {
    reconciler_name: Arc<str>,
    local_client: Client,
    generator: Arc<dyn ManifestGenerator<C>>,
    config: ReconcilerConfig,
    metrics: Arc<Metrics>,
    metrics_layer: reconciler_k8s_util::metrics::MetricsLayer,
    post_read_hooks: Vec<Hook<C>>,
    pre_reconcile_hooks: Vec<Hook<C>>,
    pre_delete_hooks: Vec<Hook<C>>,
    post_delete_hooks: Vec<Hook<C>>,
    setup_complete: bool,
}

impl<C: Component> ReconcilerBuilder<C> {
    pub fn new(
        reconciler_name: impl Into<Arc<str>>,
        local_client: Client,
        generator: impl ManifestGenerator<C>,
        config: ReconcilerConfig,
        metrics: Arc<Metrics>,
        metrics_layer: reconciler_k8s_util::metrics::MetricsLayer,
    ) -> Self {
        ReconcilerBuilder {
            reconciler_name: reconciler_name.into(),
            local_client,
            generator: Arc::new(generator),
            config,
            metrics,
            metrics_layer,
            post_read_hooks: Vec::new(),
            pre_reconcile_hooks: Vec::new(),
            pre_delete_hooks: Vec::new(),
            post_delete_hooks: Vec::new(),
            setup_complete: false,
        }
    }

    /// Runs after the component is read but before a target client is
    /// resolved (SPEC_FULL.md §4.1 step 7).
    pub fn on_post_read<F>(mut self, hook: F) -> Self
    where
        F: for<'a> Fn(&'a C, &'a Client) -> BoxFuture<'a, Result<()>> + Send + Sync + 'static,
    {
        self.post_read_hooks.push(Box::new(hook));
        self
    }

    /// Runs after the finalizer is ensured, before `Apply` (step 9).
    pub fn on_pre_reconcile<F>(mut self, hook: F) -> Self
    where
        F: for<'a> Fn(&'a C, &'a Client) -> BoxFuture<'a, Result<()>> + Send + Sync + 'static,
    {
        self.pre_reconcile_hooks.push(Box::new(hook));
        self
    }

    /// Runs before `IsDeletionAllowed`/`Delete` (step 10).
    pub fn on_pre_delete<F>(mut self, hook: F) -> Self
    where
        F: for<'a> Fn(&'a C, &'a Client) -> BoxFuture<'a, Result<()>> + Send + Sync + 'static,
    {
        self.pre_delete_hooks.push(Box::new(hook));
        self
    }

    /// Runs once `Delete` reports the inventory empty, before the finalizer
    /// is removed.
    pub fn on_post_delete<F>(mut self, hook: F) -> Self
    where
        F: for<'a> Fn(&'a C, &'a Client) -> BoxFuture<'a, Result<()>> + Send + Sync + 'static,
    {
        self.post_delete_hooks.push(Box::new(hook));
        self
    }

    pub fn setup(&mut self) -> Reconciler<C> {
        assert!(!self.setup_complete, "ReconcilerBuilder::setup called twice on the same builder");
        self.setup_complete = true;

        let reporter = Reporter::from(self.reconciler_name.to_string());
        let recorder = Recorder::new(self.local_client.clone(), reporter);

        Reconciler {
            reconciler_name: self.reconciler_name.clone(),
            local_client: self.local_client.clone(),
            generator: self.generator.clone(),
            config: self.config.clone(),
            metrics: self.metrics.clone(),
            backoff: Backoff::new(self.config.backoff_max_delay),
            client_factory: ClientFactory::new(self.config.client_cache_ttl, self.metrics_layer.clone()),
            events: DedupRecorder::new(recorder, self.config.event_dedup_window),
            post_read_hooks: std::mem::take(&mut self.post_read_hooks),
            pre_reconcile_hooks: std::mem::take(&mut self.pre_reconcile_hooks),
            pre_delete_hooks: std::mem::take(&mut self.pre_delete_hooks),
            post_delete_hooks: std::mem::take(&mut self.post_delete_hooks),
            reconciler_id: Mutex::new(None),
        }
    }
}

/// Shared infra for one component kind's reconcile loop. Constructed once via
/// `ReconcilerBuilder::setup` and handed to `kube::runtime::Controller::run`
/// wrapped in an `Arc`, exactly as the reference operator wraps its `Context`.
pub struct Reconciler<C: Component> {
    pub reconciler_name: Arc<str>,
    pub local_client: Client,
    generator: Arc<dyn ManifestGenerator<C>>,
    config: ReconcilerConfig,
    pub metrics: Arc<Metrics>,
    backoff: Backoff,
    client_factory: ClientFactory,
    events: DedupRecorder,
    post_read_hooks: Vec<Hook<C>>,
    pre_reconcile_hooks: Vec<Hook<C>>,
    pre_delete_hooks: Vec<Hook<C>>,
    post_delete_hooks: Vec<Hook<C>>,
    reconciler_id: Mutex<Option<String>>,
}

impl<C: Component> Reconciler<C> {
    async fn reconciler_id(&self) -> Result<String> {
        if let Some(id) = self.reconciler_id.lock().expect("reconciler-id mutex poisoned").clone() {
            return Ok(id);
        }
        let id = owner::reconciler_id(&self.local_client).await?;
        *self.reconciler_id.lock().expect("reconciler-id mutex poisoned") = Some(id.clone());
        Ok(id)
    }

    /// SPEC_FULL.md §4.7/§5: periodically evicts expired entries from the
    /// target-client cache so impersonated/remote clients for components
    /// that stopped reconciling don't linger forever. Runs until `cancel`
    /// fires.
    pub async fn run_client_cache_sweeper(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.client_sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.client_factory.sweep(),
                _ = cancel.cancelled() => return,
            }
        }
    }
}

/// What the per-request algorithm (steps 4-10) produced, consumed by
/// `finalize` to drive the status/event/requeue bookkeeping of §4.1.1.
enum StepOutcome {
    /// First-seen or digest-driven restart: status was already set directly,
    /// caller just needs an immediate requeue.
    Restarted,
    Applied {
        ready: bool,
        inventory: Vec<InventoryItem>,
        component_digest: String,
    },
    DeletionBlocked {
        reason: String,
    },
    Deleted {
        ready: bool,
        inventory: Vec<InventoryItem>,
        finalizer_removed: bool,
    },
}

/// SPEC_FULL.md §4.1: one reconcile pass for a single component.
#[instrument(skip(component, reconciler), fields(trace_id))]
pub async fn reconcile<C: Component>(component: Arc<C>, reconciler: Arc<Reconciler<C>>) -> Result<Action> {
    let trace_id = telemetry::get_trace_id();
    Span::current().record("trace_id", field::display(&trace_id));
    let _timer = reconciler.metrics.reconcile.count_and_measure(&trace_id);

    let namespace = component
        .namespace()
        .ok_or_else(|| Error::assertion("component must be namespaced"))?;
    let name = component.name_any();
    let deleting = component.meta().deletion_timestamp.is_some();
    info!(generation = component.meta().generation, %namespace, %name, deleting, "reconciling");

    let cfg = component.config();
    let requeue_interval = cfg.requeue_interval.unwrap_or(reconciler.config.requeue_interval);
    let retry_interval = cfg.retry_interval.unwrap_or(reconciler.config.retry_interval);
    let reconcile_timeout = cfg.reconcile_timeout.unwrap_or(reconciler.config.reconcile_timeout);

    let mut status = component.status().cloned().unwrap_or_default();
    let snapshot = status.clone();
    let backoff_key = ObjectKey::new(C::group(&()).into_owned(), C::kind(&()).into_owned(), Some(namespace.clone()), name.clone());

    let now = Utc::now();
    let outcome = run_pass(component.as_ref(), reconciler.as_ref(), &namespace, &name, &mut status, deleting, now).await;

    let (action, component_digest_for_event) = finalize(
        reconciler.as_ref(),
        component.as_ref(),
        &mut status,
        outcome,
        deleting,
        &backoff_key,
        now,
        requeue_interval,
        retry_interval,
        reconcile_timeout,
    )
    .await?;

    persist_and_emit(reconciler.as_ref(), component.as_ref(), &namespace, &name, &status, &snapshot, &component_digest_for_event).await?;

    Ok(action)
}

pub fn error_policy<C: Component>(component: Arc<C>, error: &Error, reconciler: Arc<Reconciler<C>>) -> Action {
    warn!(error = %error, "reconcile failed");
    reconciler.metrics.reconcile.set_failure(&component, error);
    Action::requeue(Duration::from_secs(5 * 60))
}

/// Steps 4-10: everything that can produce a `StepOutcome` or fail. Early
/// returns here are the Rust replacement for the Go source's `return` inside
/// a function with a deferred status handler — the caller always routes the
/// `Result` through `finalize` regardless of which branch returned.
#[allow(clippy::too_many_arguments)]
async fn run_pass<C: Component>(
    component: &C,
    reconciler: &Reconciler<C>,
    component_namespace: &str,
    component_name: &str,
    status: &mut Status,
    deleting: bool,
    now: chrono::DateTime<Utc>,
) -> Result<StepOutcome> {
    // Step 4: first-seen gate.
    if status.observed_generation <= 0 {
        status.state = State::Pending;
        status.set_condition("Ready", ConditionStatus::False, "FirstSeen", "observed for the first time", now);
        return Ok(StepOutcome::Restarted);
    }

    // Step 5: resolve references and compute the component digest.
    let refs = component.spec().references();
    let resolved = reference::resolve(&reconciler.local_client, component_namespace, &refs, deleting).await?;
    let spec_value = serde_json::to_value(component.spec())?;
    let component_digest = reference::component_digest(
        component.meta().generation.unwrap_or(0),
        component.annotations(),
        &spec_value,
        &resolved,
        &[],
    )?;

    // Step 6: digest-driven restart.
    if status.processing_since.is_some() && status.processing_digest != component_digest {
        status.processing_digest.clear();
        status.processing_since = None;
        status.state = State::Pending;
        status.set_condition("Ready", ConditionStatus::False, "Restarting", "component changed while processing", now);
        return Ok(StepOutcome::Restarted);
    }

    // Step 7: post-read hooks.
    for hook in &reconciler.post_read_hooks {
        hook(component, &reconciler.local_client).await?;
    }

    // Step 8: obtain the target client.
    let cfg = component.config();
    let kubeconfig_yaml = match &cfg.remote_kubeconfig_secret {
        Some(secret_name) => Some(load_kubeconfig_secret(&reconciler.local_client, component_namespace, secret_name).await?),
        None => None,
    };
    let target_client = reconciler
        .client_factory
        .get(kubeconfig_yaml.as_deref(), cfg.impersonate_user.as_deref(), &cfg.impersonate_groups)
        .await?;

    let env = ReconcileEnv::new(
        reconciler.reconciler_name.clone(),
        reconciler.local_client.clone(),
        target_client,
        component_digest.clone(),
        CancellationToken::new(),
    );

    let reconciler_id = reconciler.reconciler_id().await?;
    let unhashed_owner_id = owner::owner_id(&reconciler_id, component_namespace, component_name);
    let current_owner_label = owner::owner_id_label(&unhashed_owner_id);

    let target_namespace = cfg.target_namespace.clone().unwrap_or_else(|| component_namespace.to_string());
    let target_name = cfg.target_name.clone().unwrap_or_else(|| component_name.to_string());

    if !deleting {
        // Step 9.
        if !reconciler_k8s_util::finalizer::contains(component, &reconciler.reconciler_name) {
            let mut with_finalizer = component.clone();
            reconciler_k8s_util::finalizer::add(&mut with_finalizer, &reconciler.reconciler_name);
            patch_finalizers::<C>(
                &reconciler.local_client,
                component_namespace,
                component_name,
                with_finalizer.meta().finalizers.as_deref().unwrap_or_default(),
            )
            .await?;
        }

        for hook in &reconciler.pre_reconcile_hooks {
            hook(component, &reconciler.local_client).await?;
        }

        let outcome = reconcile_target::apply(
            &env,
            reconciler.generator.as_ref(),
            component,
            &reconciler_id,
            &target_namespace,
            &target_name,
            status.inventory.clone(),
            cfg.create_missing_namespaces,
        )
        .await?;

        Ok(StepOutcome::Applied {
            ready: outcome.ready,
            inventory: outcome.inventory,
            component_digest,
        })
    } else {
        // Step 10.
        for hook in &reconciler.pre_delete_hooks {
            hook(component, &reconciler.local_client).await?;
        }

        let foreign_finalizers = component
            .meta()
            .finalizers
            .as_ref()
            .is_some_and(|fs| fs.iter().any(|f| f.as_str() != reconciler.reconciler_name.as_ref()));

        if let Some(blocker) = reconcile_target::is_deletion_allowed(&env, &current_owner_label, &status.inventory).await? {
            return Ok(StepOutcome::DeletionBlocked { reason: blocker });
        }
        if foreign_finalizers {
            return Ok(StepOutcome::DeletionBlocked {
                reason: "foreign finalizers remain on the component".to_string(),
            });
        }

        let outcome = reconcile_target::delete(&env, status.inventory.clone()).await?;

        if outcome.ready {
            for hook in &reconciler.post_delete_hooks {
                hook(component, &reconciler.local_client).await?;
            }
            let mut without_finalizer = component.clone();
            reconciler_k8s_util::finalizer::remove(&mut without_finalizer, &reconciler.reconciler_name);
            patch_finalizers::<C>(
                &reconciler.local_client,
                component_namespace,
                component_name,
                without_finalizer.meta().finalizers.as_deref().unwrap_or_default(),
            )
            .await?;
        }

        Ok(StepOutcome::Deleted {
            ready: outcome.ready,
            inventory: outcome.inventory,
            finalizer_removed: outcome.ready,
        })
    }
}

/// SPEC_FULL.md §4.1.1, minus the final persist/event emission (done by
/// `persist_and_emit` once the caller has the finished `status` in hand).
/// Returns the `Action` to hand back to the controller and the component
/// digest to annotate the emitted event with (empty when the pass never got
/// far enough to compute one).
#[allow(clippy::too_many_arguments)]
async fn finalize<C: Component>(
    reconciler: &Reconciler<C>,
    component: &C,
    status: &mut Status,
    outcome: Result<StepOutcome>,
    deleting: bool,
    backoff_key: &ObjectKey,
    now: chrono::DateTime<Utc>,
    requeue_interval: Duration,
    retry_interval: Duration,
    reconcile_timeout: Duration,
) -> Result<(Action, String)> {
    status.observed_generation = component.meta().generation.unwrap_or(0);

    if matches!(outcome, Err(Error::Cancelled)) {
        // Status update suppressed entirely, exactly as a dropped future
        // under a Controller shutdown would leave it.
        return Ok((Action::requeue(Duration::from_secs(1)), String::new()));
    }

    let mut requeue_after: Option<Duration> = None;
    let mut finalizer_removed = false;
    let mut component_digest = String::new();

    match outcome {
        Err(err) => {
            reconciler.backoff.forget(backoff_key);
            if deleting {
                status.processing_digest.clear();
                status.processing_since = None;
            } else if let Some(since) = status.processing_since {
                if now.signed_duration_since(since).to_std().unwrap_or(Duration::ZERO) > reconcile_timeout {
                    status.processing_digest.clear();
                    status.processing_since = None;
                }
            }

            match &err {
                Error::Retriable { message, retry_after } => {
                    status.state = if deleting { State::DeletionPending } else { State::Pending };
                    let reason = if deleting { "DeletionRetrying" } else { "Retrying" };
                    status.set_condition("Ready", ConditionStatus::False, reason, message.clone(), now);
                    requeue_after = Some(retry_after.unwrap_or(retry_interval));
                }
                other => {
                    status.state = State::Error;
                    status.set_condition("Ready", ConditionStatus::False, "Error", other.to_string(), now);
                    requeue_after = Some(retry_interval);
                }
            }
        }
        Ok(step) => match step {
            StepOutcome::Restarted => {
                reconciler.backoff.forget(backoff_key);
                requeue_after = Some(Duration::ZERO);
            }
            StepOutcome::Applied {
                ready,
                inventory,
                component_digest: digest,
            } => {
                component_digest = digest.clone();
                status.inventory = inventory;
                if ready {
                    let was_processing = status.processing_since.is_some();
                    status.processing_digest.clear();
                    status.processing_since = None;
                    status.state = State::Ready;
                    status.set_condition("Ready", ConditionStatus::True, "Applied", "all dependents ready", now);
                    reconciler.backoff.forget(backoff_key);
                    requeue_after = Some(if was_processing { Duration::ZERO } else { requeue_interval });
                } else {
                    if status.processing_since.is_none() {
                        status.processing_since = Some(now);
                        status.processing_digest = digest;
                    }
                    let elapsed = status
                        .processing_since
                        .map(|since| now.signed_duration_since(since).to_std().unwrap_or(Duration::ZERO))
                        .unwrap_or(Duration::ZERO);
                    if elapsed > reconcile_timeout {
                        status.state = State::Error;
                        status.set_condition("Ready", ConditionStatus::False, "Timeout", "processing exceeded timeout", now);
                        requeue_after = Some(retry_interval);
                    } else {
                        status.state = State::Processing;
                        status.set_condition("Ready", ConditionStatus::False, "Processing", "applying dependents", now);
                        requeue_after = Some(reconciler.backoff.next(backoff_key, "Processing"));
                    }
                }
            }
            StepOutcome::DeletionBlocked { reason } => {
                status.state = State::Deleting;
                status.set_condition("Ready", ConditionStatus::False, "DeletionBlocked", reason, now);
                requeue_after = Some(Duration::from_secs(1) + reconciler.backoff.next(backoff_key, "DeletionBlocked"));
            }
            StepOutcome::Deleted {
                ready,
                inventory,
                finalizer_removed: removed,
            } => {
                status.inventory = inventory;
                status.processing_digest.clear();
                status.processing_since = None;
                if ready {
                    finalizer_removed = removed;
                } else {
                    status.state = State::Deleting;
                    status.set_condition("Ready", ConditionStatus::False, "Deleting", "removing dependents", now);
                    requeue_after = Some(reconciler.backoff.next(backoff_key, "Deleting"));
                }
            }
        },
    }

    if finalizer_removed {
        // The component is about to vanish from the API server; updating its
        // status now would race the deletion and is pointless.
        return Ok((Action::await_change(), component_digest));
    }

    let requeue_after = requeue_after.map(jitter);
    let action = match requeue_after {
        Some(d) => Action::requeue(d),
        None => Action::requeue(requeue_interval),
    };
    Ok((action, component_digest))
}

/// 1-5% jitter on a positive requeue delay (SPEC_FULL.md §4.1.1).
fn jitter(d: Duration) -> Duration {
    if d.is_zero() {
        return d;
    }
    let factor = 1.0 + rand::thread_rng().gen_range(0.01..=0.05);
    Duration::from_secs_f64(d.as_secs_f64() * factor)
}

async fn persist_and_emit<C: Component>(
    reconciler: &Reconciler<C>,
    component: &C,
    namespace: &str,
    name: &str,
    status: &Status,
    snapshot: &Status,
    component_digest: &str,
) -> Result<()> {
    let changed = serde_json::to_value(status)? != serde_json::to_value(snapshot)?;
    if changed {
        let mut to_persist = status.clone();
        to_persist.last_observed_at = Some(Utc::now());
        let api: Api<C> = Api::namespaced(reconciler.local_client.clone(), namespace);
        let patch = serde_json::json!({ "status": to_persist });
        api.patch_status(name, &PatchParams::apply(reconciler.reconciler_name.as_ref()), &Patch::Merge(patch))
            .await?;
    }

    let event_type = if status.state.is_warning() {
        kube::runtime::events::EventType::Warning
    } else {
        kube::runtime::events::EventType::Normal
    };
    let (reason, message) = status
        .condition("Ready")
        .map(|c| (c.reason.clone().unwrap_or_default(), c.message.clone().unwrap_or_default()))
        .unwrap_or_default();
    let annotations = component.event_annotations(component_digest);
    let reference = component.object_ref(&());
    let uid = component.uid().unwrap_or_default();
    reconciler
        .events
        .publish(&uid, &reference, event_type, reason, "Reconcile", Some(message), &annotations)
        .await?;

    Ok(())
}

async fn load_kubeconfig_secret(client: &Client, namespace: &str, secret_name: &str) -> Result<String> {
    let api: Api<k8s_openapi::api::core::v1::Secret> = Api::namespaced(client.clone(), namespace);
    let secret = api.get(secret_name).await?;
    let data = secret.data.unwrap_or_default();
    let bytes = data
        .get("kubeconfig")
        .ok_or_else(|| Error::invalid_object(format!("secret/{namespace}/{secret_name}"), "missing 'kubeconfig' key"))?;
    Ok(String::from_utf8_lossy(&bytes.0).into_owned())
}

async fn patch_finalizers<C: Component>(client: &Client, namespace: &str, name: &str, finalizers: &[String]) -> Result<()> {
    let api: Api<C> = Api::namespaced(client.clone(), namespace);
    let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
    api.patch(name, &PatchParams::default(), &Patch::Merge(patch)).await?;
    Ok(())
}
