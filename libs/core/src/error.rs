//! Crate-wide error taxonomy.
//!
//! Mirrors the reference operator's pattern of a single `thiserror`-derived
//! enum rather than a per-module error zoo: callers match on variants instead
//! of downcasting.

use std::time::Duration;

/// Crate-wide result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Transport/API-server error from the `kube` client.
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// An error that should not flip the component into `State::Error`; the
    /// driver converts this into `Pending`/`DeletionPending` and requeues
    /// after `retry_after` (or the configured retry interval).
    #[error("{message}")]
    Retriable {
        message: String,
        retry_after: Option<Duration>,
    },

    /// The reconcile-scoped cancellation token fired mid-pass. The driver
    /// suppresses the status update for this error, matching what happens
    /// when the surrounding controller framework drops the reconcile future.
    #[error("reconcile cancelled")]
    Cancelled,

    /// A per-object validation or precondition failure. Always carries the
    /// offending object's key so the message is actionable without a
    /// debugger.
    #[error("{key}: {reason}")]
    InvalidObject { key: String, reason: String },

    /// An "this cannot happen" invariant violation, narrowed from the
    /// source's use of panics (see SPEC_FULL.md §10.2): callers that would
    /// otherwise panic return this instead so the deferred status handler
    /// still runs.
    #[error("internal invariant violated: {0}")]
    Assertion(String),

    #[error("failed to serialize/deserialize: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("failed to compute digest: {0}")]
    Digest(String),

    /// OpenTelemetry handed back `TraceId::INVALID`; only reachable when
    /// tracing is misconfigured or disabled (see `metrics::TraceLabel`).
    #[error("invalid trace id")]
    InvalidTraceId,
}

impl Error {
    /// Build a `Retriable` with no explicit retry-after (the driver falls
    /// back to the configured retry interval).
    pub fn retriable(message: impl Into<String>) -> Self {
        Error::Retriable {
            message: message.into(),
            retry_after: None,
        }
    }

    /// Build a `Retriable` carrying an explicit retry-after, e.g. the
    /// reference resolver's "not found" case (default 10s, SPEC_FULL.md §4.4).
    pub fn retriable_after(message: impl Into<String>, retry_after: Duration) -> Self {
        Error::Retriable {
            message: message.into(),
            retry_after: Some(retry_after),
        }
    }

    pub fn invalid_object(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::InvalidObject {
            key: key.into(),
            reason: reason.into(),
        }
    }

    pub fn assertion(message: impl Into<String>) -> Self {
        Error::Assertion(message.into())
    }

    /// True for errors that must not transition the component to `Error`.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Error::Retriable { .. })
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::Retriable { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Low-cardinality label for metrics (`ErrorLabels` in metrics.rs mirrors
    /// the reference operator's `Error::metric_label`).
    pub fn metric_label(&self) -> &'static str {
        match self {
            Error::Kube(_) => "kube",
            Error::Retriable { .. } => "retriable",
            Error::Cancelled => "cancelled",
            Error::InvalidObject { .. } => "invalid_object",
            Error::Assertion(_) => "assertion",
            Error::Serialization(_) => "serialization",
            Error::Digest(_) => "digest",
            Error::InvalidTraceId => "invalid_trace_id",
        }
    }
}

/// True if the underlying `kube::Error` is a 404.
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 404)
}

/// True if the underlying `kube::Error` is a 409 conflict.
pub fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 409)
}

/// True if the underlying `kube::Error` is a "no kind registered"/no-match
/// error, which the driver treats identically to not-found during deletion
/// (SPEC_FULL.md §7: `NoMatch` is treated as `NotFound` for deletion).
pub fn is_no_match(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 404)
        || matches!(err, kube::Error::Api(resp) if resp.reason == "NoKindMatchError")
}
