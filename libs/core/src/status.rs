//! Engine-owned component status (SPEC_FULL.md §3).
//!
//! `Status` is the only part of a component's `.status` subresource the
//! engine writes; everything else (the component's own domain status, if
//! any) is left to the consuming operator.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::inventory::InventoryItem;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "PascalCase")]
pub enum State {
    #[default]
    Pending,
    Processing,
    Ready,
    Error,
    Deleting,
    DeletionPending,
}

impl State {
    /// Normal events are emitted for every state but `Error`; see
    /// SPEC_FULL.md §4.1.1 / §7.
    pub fn is_warning(&self) -> bool {
        matches!(self, State::Error)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    #[serde(rename = "lastTransitionTime", skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Condition {
    pub fn new(type_: impl Into<String>, status: ConditionStatus) -> Self {
        Condition {
            type_: type_.into(),
            status,
            last_transition_time: None,
            reason: None,
            message: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    #[serde(default, skip_serializing_if = "is_zero")]
    pub observed_generation: i64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub applied_generation: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_observed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_applied_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub state: State,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub processing_digest: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_since: Option<DateTime<Utc>>,
    #[serde(default)]
    pub inventory: Vec<InventoryItem>,
}

fn is_zero(v: &i64) -> bool {
    *v == 0
}

impl Status {
    /// Find or insert a condition of the given type, returning it mutably.
    /// Sets `LastTransitionTime` only when the status value actually
    /// changes (invariant from SPEC_FULL.md §8: "`SetState` is monotonic
    /// w.r.t. a given condition's `LastTransitionTime` only when its
    /// `Status` actually changes").
    pub fn set_condition(
        &mut self,
        type_: &str,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) {
        let reason = reason.into();
        let message = message.into();
        if let Some(existing) = self.conditions.iter_mut().find(|c| c.type_ == type_) {
            let changed = existing.status != status;
            existing.status = status;
            existing.reason = Some(reason);
            existing.message = Some(message);
            if changed {
                existing.last_transition_time = Some(now);
            }
        } else {
            let mut cond = Condition::new(type_, status).with_reason(reason).with_message(message);
            cond.last_transition_time = Some(now);
            self.conditions.push(cond);
        }
    }

    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    /// Inventory items keyed by their matching key, for O(1) lookups during
    /// the diff (SPEC_FULL.md §4.2 step 6 / §4.3).
    pub fn inventory_index(&self) -> BTreeMap<crate::inventory::ObjectKey, usize> {
        self.inventory
            .iter()
            .enumerate()
            .map(|(i, item)| (item.key(), i))
            .collect()
    }
}
