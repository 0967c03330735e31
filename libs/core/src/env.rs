//! The reconcile environment (SPEC_FULL.md §9 design note, §10.3).
//!
//! A plain record threaded as a parameter through every helper instead of
//! ambient/dynamic state: reconciler identity, the local and target
//! clients, the component digest for this pass, and a cooperative
//! cancellation token.

use kube::Client;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

#[derive(Clone)]
pub struct ReconcileEnv {
    pub reconciler_name: std::sync::Arc<str>,
    pub local_client: Client,
    pub target_client: Client,
    pub component_digest: String,
    cancellation: CancellationToken,
}

impl ReconcileEnv {
    pub fn new(
        reconciler_name: impl Into<std::sync::Arc<str>>,
        local_client: Client,
        target_client: Client,
        component_digest: impl Into<String>,
        cancellation: CancellationToken,
    ) -> Self {
        ReconcileEnv {
            reconciler_name: reconciler_name.into(),
            local_client,
            target_client,
            component_digest: component_digest.into(),
            cancellation,
        }
    }

    /// Checked cooperatively between iterations of long-running loops (the
    /// delete-wave poll, the client-factory sweep) so a cancelled pass
    /// aborts without touching status, matching what would happen if the
    /// surrounding `Controller` dropped the reconcile future outright.
    pub fn check_cancelled(&self) -> Result<()> {
        if self.cancellation.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// `<reconciler-name>/<suffix>`, the prefix every annotation, label, and
    /// finalizer this engine writes uses (SPEC_FULL.md §6).
    pub fn annotation_key(&self, suffix: &str) -> String {
        format!("{}/{suffix}", self.reconciler_name)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn env(cancellation: CancellationToken) -> ReconcileEnv {
        ReconcileEnv::new(
            "widgets.x.io/widget-operator",
            Client::try_from(kube::Config::new("https://localhost".parse().unwrap())).unwrap(),
            Client::try_from(kube::Config::new("https://localhost".parse().unwrap())).unwrap(),
            "digest",
            cancellation,
        )
    }

    #[test]
    fn annotation_key_is_prefixed_by_reconciler_name() {
        let e = env(CancellationToken::new());
        assert_eq!(e.annotation_key("owner-id"), "widgets.x.io/widget-operator/owner-id");
    }

    #[test]
    fn check_cancelled_errors_once_token_fires() {
        let token = CancellationToken::new();
        let e = env(token.clone());
        assert!(e.check_cancelled().is_ok());
        token.cancel();
        assert!(matches!(e.check_cancelled(), Err(Error::Cancelled)));
    }
}
