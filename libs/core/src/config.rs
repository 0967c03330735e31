//! Engine-level configuration (SPEC_FULL.md §12).
//!
//! Built once from parsed CLI args and passed into `ReconcilerBuilder`/the
//! shared `Context`; the engine crate never reads these knobs from ambient
//! globals, matching the reference codebase's explicit `Args` → `Context`
//! wiring in `cmd/operator/src/main.rs`.

use std::time::Duration;

#[derive(Clone, Debug)]
pub struct ReconcilerConfig {
    /// Default `requeueInterval` (SPEC_FULL.md §4.1 step 2).
    pub requeue_interval: Duration,
    /// Default `retryInterval`; falls back to `requeue_interval` when unset
    /// by the caller.
    pub retry_interval: Duration,
    /// Default `timeout`; falls back to `requeue_interval` when unset.
    pub reconcile_timeout: Duration,
    /// Cap on concurrently running reconciles (SPEC_FULL.md §5).
    pub max_concurrent_reconciles: u16,
    /// Event deduplication window (SPEC_FULL.md §4.8).
    pub event_dedup_window: Duration,
    /// Target-client cache TTL (SPEC_FULL.md §4.7).
    pub client_cache_ttl: Duration,
    /// How often the client factory sweeps expired entries (SPEC_FULL.md §4.7).
    pub client_sweep_interval: Duration,
    /// Long-term floor for the per-item backoff schedule (SPEC_FULL.md §4.6).
    pub backoff_max_delay: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        let requeue_interval = Duration::from_secs(600);
        ReconcilerConfig {
            requeue_interval,
            retry_interval: requeue_interval,
            reconcile_timeout: requeue_interval,
            max_concurrent_reconciles: 5,
            event_dedup_window: Duration::from_secs(5 * 60),
            client_cache_ttl: Duration::from_secs(15 * 60),
            client_sweep_interval: Duration::from_secs(10),
            backoff_max_delay: Duration::from_secs(10),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn retry_and_timeout_default_to_requeue_interval() {
        let config = ReconcilerConfig::default();
        assert_eq!(config.retry_interval, config.requeue_interval);
        assert_eq!(config.reconcile_timeout, config.requeue_interval);
    }
}
