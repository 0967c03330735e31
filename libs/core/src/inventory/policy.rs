//! Per-object annotation policies (SPEC_FULL.md §6 annotation table).
//!
//! Parsing follows the same `FromStr`/`Display` shape the reference
//! codebase's event `Level` enum uses, so an unrecognised annotation value
//! produces a precise, user-facing parse error rather than silently falling
//! back to a default.

use std::fmt;
use std::str::FromStr;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
#[error("invalid value '{value}' for annotation '{annotation}', available options are: {options}")]
pub struct PolicyParseError {
    pub annotation: &'static str,
    pub value: String,
    pub options: &'static str,
}

macro_rules! policy_enum {
    (
        $(#[$meta:meta])*
        $name:ident, annotation = $annotation:literal, options = $options:literal {
            $($variant:ident => $default:literal => $wire:literal),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
        pub enum $name {
            $($variant),+
        }

        impl Default for $name {
            fn default() -> Self {
                $(if $default { return $name::$variant; })+
                unreachable!("exactly one variant of {} must be marked default", stringify!($name))
            }
        }

        impl FromStr for $name {
            type Err = PolicyParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($wire => Ok($name::$variant),)+
                    other => Err(PolicyParseError {
                        annotation: $annotation,
                        value: other.to_string(),
                        options: $options,
                    }),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let wire = match self {
                    $($name::$variant => $wire,)+
                };
                write!(f, "{wire}")
            }
        }
    };
}

policy_enum! {
    /// How the engine reclaims an object that already exists without an
    /// owner-id label, or with a different one.
    AdoptionPolicy, annotation = "adoption-policy", options = "never, if-unowned, always" {
        Never => false => "never",
        IfUnowned => true => "if-unowned",
        Always => false => "always",
    }
}

policy_enum! {
    /// What triggers re-application of an object.
    ReconcilePolicy, annotation = "reconcile-policy", options = "on-object-change, on-object-or-component-change, once" {
        OnObjectChange => true => "on-object-change",
        OnObjectOrComponentChange => false => "on-object-or-component-change",
        Once => false => "once",
    }
}

policy_enum! {
    /// How an update is written to the cluster when the rendered digest
    /// differs from the last-applied one.
    UpdatePolicy, annotation = "update-policy", options = "default, recreate, replace, ssa-merge, ssa-override" {
        Default => false => "default",
        Recreate => false => "recreate",
        Replace => true => "replace",
        SsaMerge => false => "ssa-merge",
        SsaOverride => false => "ssa-override",
    }
}

impl UpdatePolicy {
    /// `default` resolves to `replace` (SPEC_FULL.md §6 table default column).
    pub fn resolved(self) -> UpdatePolicy {
        match self {
            UpdatePolicy::Default => UpdatePolicy::Replace,
            other => other,
        }
    }
}

policy_enum! {
    /// What happens to an object when it drops out of the rendered set.
    DeletePolicy, annotation = "delete-policy", options = "default, delete, orphan" {
        Default => false => "default",
        Delete => true => "delete",
        Orphan => false => "orphan",
    }
}

impl DeletePolicy {
    pub fn resolved(self) -> DeletePolicy {
        match self {
            DeletePolicy::Default => DeletePolicy::Delete,
            other => other,
        }
    }

    pub fn is_orphan(self) -> bool {
        matches!(self.resolved(), DeletePolicy::Orphan)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_match_table() {
        assert_eq!(AdoptionPolicy::default(), AdoptionPolicy::IfUnowned);
        assert_eq!(ReconcilePolicy::default(), ReconcilePolicy::OnObjectChange);
        assert_eq!(UpdatePolicy::default(), UpdatePolicy::Replace);
        assert_eq!(DeletePolicy::default(), DeletePolicy::Delete);
    }

    #[test]
    fn parses_wire_values() {
        assert_eq!(AdoptionPolicy::from_str("always").unwrap(), AdoptionPolicy::Always);
        assert_eq!(UpdatePolicy::from_str("ssa-merge").unwrap(), UpdatePolicy::SsaMerge);
    }

    #[test]
    fn rejects_unknown_value() {
        let err = AdoptionPolicy::from_str("sometimes").unwrap_err();
        assert_eq!(err.annotation, "adoption-policy");
        assert_eq!(err.value, "sometimes");
    }

    #[test]
    fn default_update_policy_resolves_to_replace() {
        assert_eq!(UpdatePolicy::Default.resolved(), UpdatePolicy::Replace);
        assert_eq!(UpdatePolicy::SsaMerge.resolved(), UpdatePolicy::SsaMerge);
    }

    #[test]
    fn default_delete_policy_resolves_to_delete() {
        assert_eq!(DeletePolicy::Default.resolved(), DeletePolicy::Delete);
        assert!(DeletePolicy::Orphan.is_orphan());
        assert!(!DeletePolicy::Delete.is_orphan());
    }

    #[test]
    fn display_round_trips_through_from_str() {
        for p in [AdoptionPolicy::Never, AdoptionPolicy::IfUnowned, AdoptionPolicy::Always] {
            assert_eq!(AdoptionPolicy::from_str(&p.to_string()).unwrap(), p);
        }
    }
}
