//! Deduplicating event recorder (SPEC_FULL.md §4.8).
//!
//! Wraps `kube::runtime::events::Recorder` exactly as the reference pack's
//! `kaniop` controller context does (`recorder.publish(&Event{..}, &obj_ref)`),
//! adding the suppression window the driver's deferred status handler
//! relies on so that an unchanged state doesn't spam identical events every
//! reconcile.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder};
use sha2::{Digest as _, Sha256};

use crate::error::{Error, Result};

struct Recent {
    fingerprint: String,
    recorded_at: DateTime<Utc>,
}

pub struct DedupRecorder {
    recorder: Recorder,
    window: Duration,
    recent: Mutex<HashMap<String, Recent>>,
}

impl DedupRecorder {
    pub fn new(recorder: Recorder, window: Duration) -> Self {
        DedupRecorder {
            recorder,
            window,
            recent: Mutex::new(HashMap::new()),
        }
    }

    /// Publishes `event` against `object_uid`/`reference` unless the same
    /// `(objectUID, sha256(annotations, type, reason, note))` tuple was
    /// already recorded within the configured window.
    pub async fn publish(
        &self,
        object_uid: &str,
        reference: &ObjectReference,
        event_type: EventType,
        reason: impl Into<String>,
        action: impl Into<String>,
        note: Option<String>,
        annotations: &BTreeMap<String, String>,
    ) -> Result<()> {
        let reason = reason.into();
        let action = action.into();
        let fingerprint = Self::fingerprint(annotations, event_type, &reason, note.as_deref());

        if self.is_duplicate(object_uid, &fingerprint) {
            return Ok(());
        }

        let event = Event {
            type_: event_type,
            reason,
            note,
            action,
            secondary: None,
        };
        self.recorder.publish(&event, reference).await.map_err(Error::from)?;
        self.remember(object_uid, fingerprint);
        Ok(())
    }

    fn is_duplicate(&self, object_uid: &str, fingerprint: &str) -> bool {
        let mut recent = self.recent.lock().expect("event recorder mutex poisoned");
        self.purge(&mut recent);
        recent
            .get(object_uid)
            .is_some_and(|r| r.fingerprint == fingerprint)
    }

    fn remember(&self, object_uid: &str, fingerprint: String) {
        let mut recent = self.recent.lock().expect("event recorder mutex poisoned");
        recent.insert(
            object_uid.to_string(),
            Recent {
                fingerprint,
                recorded_at: Utc::now(),
            },
        );
    }

    fn purge(&self, recent: &mut HashMap<String, Recent>) {
        let window = chrono::Duration::from_std(self.window).unwrap_or(chrono::Duration::minutes(5));
        let now = Utc::now();
        recent.retain(|_, r| now.signed_duration_since(r.recorded_at) < window);
    }

    fn fingerprint(
        annotations: &BTreeMap<String, String>,
        event_type: EventType,
        reason: &str,
        note: Option<&str>,
    ) -> String {
        let mut hasher = Sha256::new();
        for (k, v) in annotations {
            hasher.update(k.as_bytes());
            hasher.update(b"=");
            hasher.update(v.as_bytes());
            hasher.update(b";");
        }
        hasher.update(format!("{event_type:?}").as_bytes());
        hasher.update(reason.as_bytes());
        hasher.update(note.unwrap_or_default().as_bytes());
        hex::encode(hasher.finalize())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fingerprint_is_stable_for_equal_inputs() {
        let annotations = BTreeMap::new();
        let a = DedupRecorder::fingerprint(&annotations, EventType::Normal, "Ready", Some("ok"));
        let b = DedupRecorder::fingerprint(&annotations, EventType::Normal, "Ready", Some("ok"));
        assert_eq!(a, b);
    }

    #[test]
    fn fingerprint_differs_on_reason_change() {
        let annotations = BTreeMap::new();
        let a = DedupRecorder::fingerprint(&annotations, EventType::Normal, "Ready", None);
        let b = DedupRecorder::fingerprint(&annotations, EventType::Normal, "Pending", None);
        assert_ne!(a, b);
    }

    #[test]
    fn fingerprint_differs_on_type_change() {
        let annotations = BTreeMap::new();
        let a = DedupRecorder::fingerprint(&annotations, EventType::Normal, "Error", None);
        let b = DedupRecorder::fingerprint(&annotations, EventType::Warning, "Error", None);
        assert_ne!(a, b);
    }
}
