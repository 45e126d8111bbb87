use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Health state reported for a single entity (node, store, shard).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityState {
    /// Entity is registered and serving.
    Up,
    /// Entity is registered but not reachable.
    Down,
    /// Entity is serving but impaired (e.g. leaving, overloaded).
    Degraded,
    /// The adapter could not determine the state.
    Unknown,
}

impl EntityState {
    /// Whether this state counts as healthy for invariant purposes.
    pub fn is_up(self) -> bool {
        matches!(self, Self::Up)
    }
}

/// Per-entity metrics sampled during one observe sweep.
///
/// Fields the subject cannot measure are left `None`; invariants treat
/// missing data as "no evidence", never as a violation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntityMetrics {
    /// P99 request latency in milliseconds.
    pub p99_latency_ms: Option<f64>,
    /// Requests per second handled by the entity.
    pub throughput_rps: Option<f64>,
    /// Named resource gauges (e.g. `disk_used_percent`, `mem_used_percent`).
    #[serde(default)]
    pub resource: HashMap<String, f64>,
}

/// One entity as seen by a single observation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityObservation {
    /// Canonical string identifier. Adapters stringify native ids at
    /// ingress and convert back only at control-plane egress.
    pub id: String,
    /// Network address the entity is reachable at.
    pub address: String,
    /// Health state at observation time.
    pub state: EntityState,
    /// Metrics sampled for this entity.
    #[serde(default)]
    pub metrics: EntityMetrics,
}

/// Cluster-level facts that are not tied to a single entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterFacts {
    /// Whether the subject's coordinating service answered.
    pub control_plane_up: bool,
    /// Named counters (e.g. `request_count`, `declared_limit`).
    #[serde(default)]
    pub counters: HashMap<String, f64>,
    /// Named boolean facts (e.g. `config_consistent`).
    #[serde(default)]
    pub flags: HashMap<String, bool>,
}

impl Default for ClusterFacts {
    fn default() -> Self {
        Self {
            control_plane_up: true,
            counters: HashMap::new(),
            flags: HashMap::new(),
        }
    }
}

/// A single snapshot of subject state produced by one observe sweep.
///
/// Observations are transient: created once per monitor tick, consumed by
/// the invariant checker, and optionally serialized into a ticket's metric
/// snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observation {
    /// When the sweep completed.
    pub observed_at: DateTime<Utc>,
    /// Every entity the control plane knows about.
    pub entities: Vec<EntityObservation>,
    /// Cluster-level facts.
    pub cluster: ClusterFacts,
    /// Subject-specific payload for facts the shared model has no slot for.
    #[serde(default)]
    pub extra: serde_json::Value,
}

impl Observation {
    /// Create an empty observation stamped now.
    #[must_use]
    pub fn new() -> Self {
        Self {
            observed_at: Utc::now(),
            entities: Vec::new(),
            cluster: ClusterFacts::default(),
            extra: serde_json::Value::Null,
        }
    }

    /// Look up an entity by id.
    pub fn entity(&self, id: &str) -> Option<&EntityObservation> {
        self.entities.iter().find(|e| e.id == id)
    }

    /// Serialize the observation into an opaque snapshot for ticket storage.
    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

impl Default for Observation {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_lookup() {
        let mut obs = Observation::new();
        obs.entities.push(EntityObservation {
            id: "n1".into(),
            address: "10.0.0.1:8080".into(),
            state: EntityState::Up,
            metrics: EntityMetrics::default(),
        });

        assert!(obs.entity("n1").is_some());
        assert!(obs.entity("n2").is_none());
    }

    #[test]
    fn snapshot_round_trips() {
        let mut obs = Observation::new();
        obs.cluster.counters.insert("request_count".into(), 42.0);

        let snap = obs.snapshot();
        let back: Observation = serde_json::from_value(snap).unwrap();
        assert_eq!(back.cluster.counters.get("request_count"), Some(&42.0));
    }

    #[test]
    fn state_up_predicate() {
        assert!(EntityState::Up.is_up());
        assert!(!EntityState::Down.is_up());
        assert!(!EntityState::Degraded.is_up());
    }
}
