//! Generic Kubernetes component reconciliation engine.
//!
//! `component`/`driver`/`controller` are the engine's public seam: a binary
//! implements `Component` for its own custom resource and a
//! `ManifestGenerator` that renders its dependents, then hands both to
//! `driver::ReconcilerBuilder` and `controller::run`. Everything else in this
//! crate (inventory tracking, reference resolution, backoff, the target
//! client cache, event dedup, status analysis) is resource-agnostic.

pub mod backoff;
pub mod client_factory;
pub mod component;
pub mod config;
pub mod controller;
pub mod driver;
pub mod env;
pub mod error;
pub mod events;
pub mod inventory;
pub mod metrics;
pub mod owner;
pub mod reconcile_target;
pub mod reference;
pub mod status;
pub mod status_analyzer;
pub mod telemetry;

pub use component::{Component, ComponentConfig, ComponentSpec, ManifestGenerator};
pub use config::ReconcilerConfig;
pub use driver::{Reconciler, ReconcilerBuilder};
pub use error::{Error, Result};
