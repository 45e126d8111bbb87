use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How serious a violation of an invariant is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Info => f.write_str("info"),
            Self::Warning => f.write_str("warning"),
            Self::Critical => f.write_str("critical"),
        }
    }
}

/// Whether an invariant is keyed per entity or once for the whole cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvariantScope {
    PerEntity,
    Cluster,
}

/// Static declaration of one invariant: name, severity, grace period, scope.
///
/// Checkers declare these as constants; the engine consults the grace period
/// when deciding whether a persisting condition has become a violation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantConfig {
    /// Stable invariant name, used as the violation-key prefix.
    pub name: String,
    pub severity: Severity,
    /// Minimum duration the condition must persist before a violation is
    /// emitted. Zero means emit on first sighting.
    pub grace: Duration,
    pub scope: InvariantScope,
}

impl InvariantConfig {
    /// Declare an invariant with an immediate (zero) grace period.
    #[must_use]
    pub fn immediate(name: &str, severity: Severity, scope: InvariantScope) -> Self {
        Self {
            name: name.to_owned(),
            severity,
            grace: Duration::ZERO,
            scope,
        }
    }

    /// Declare an invariant that must persist for `grace` before firing.
    #[must_use]
    pub fn with_grace(
        name: &str,
        severity: Severity,
        grace: Duration,
        scope: InvariantScope,
    ) -> Self {
        Self {
            name: name.to_owned(),
            severity,
            grace,
            scope,
        }
    }
}

/// A single violating condition reported by a checker for one invariant.
///
/// Conditions are pre-grace: the engine decides whether each one has
/// persisted long enough to become an [`InvariantViolation`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    /// Entity the condition applies to; `None` for cluster-scoped invariants.
    pub entity_id: Option<String>,
    /// Human-readable description of what is wrong.
    pub message: String,
}

impl Condition {
    /// A cluster-scoped condition.
    #[must_use]
    pub fn cluster(message: impl Into<String>) -> Self {
        Self {
            entity_id: None,
            message: message.into(),
        }
    }

    /// A condition scoped to one entity.
    #[must_use]
    pub fn entity(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            entity_id: Some(id.into()),
            message: message.into(),
        }
    }
}

/// A condition that has persisted past its grace period.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Name of the invariant that fired.
    pub invariant: String,
    /// Entity the violation applies to, if per-entity.
    pub entity_id: Option<String>,
    pub severity: Severity,
    pub message: String,
    /// When the condition was first sighted (grace clock start).
    pub first_seen: DateTime<Utc>,
    /// When the condition was most recently sighted.
    pub last_seen: DateTime<Utc>,
}

impl InvariantViolation {
    /// The deduplication key this violation maps to.
    pub fn key(&self) -> String {
        violation_key(&self.invariant, self.entity_id.as_deref())
    }
}

/// Build the deduplication key for an invariant/entity pair:
/// `invariant` alone for cluster scope, `invariant:entity` otherwise.
pub fn violation_key(invariant: &str, entity_id: Option<&str>) -> String {
    match entity_id {
        Some(entity) => format!("{invariant}:{entity}"),
        None => invariant.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_includes_entity_when_present() {
        assert_eq!(violation_key("high_latency", Some("n1")), "high_latency:n1");
        assert_eq!(violation_key("control_plane_down", None), "control_plane_down");
    }

    #[test]
    fn severity_orders_info_below_critical() {
        assert!(Severity::Info < Severity::Warning);
        assert!(Severity::Warning < Severity::Critical);
    }

    #[test]
    fn severity_serializes_snake_case() {
        let s = serde_json::to_string(&Severity::Critical).unwrap();
        assert_eq!(s, "\"critical\"");
    }
}
