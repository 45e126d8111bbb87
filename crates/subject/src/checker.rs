use std::time::Duration;

use vigil_core::{Condition, InvariantConfig, InvariantScope, Observation, Severity};

use crate::error::CheckError;

/// Subject-specific invariant evaluation over one observation.
///
/// Evaluation is synchronous and pure: the same observation yields the same
/// conditions. The engine calls [`evaluate`](InvariantChecker::evaluate) once
/// per declared invariant per tick and isolates per-invariant failures.
pub trait InvariantChecker: Send + Sync {
    /// The invariants this checker declares, with severity/grace/scope.
    fn invariants(&self) -> &[InvariantConfig];

    /// Evaluate one declared invariant. Returns the currently-violating
    /// conditions (empty when clean).
    fn evaluate(&self, invariant: &str, obs: &Observation) -> Result<Vec<Condition>, CheckError>;
}

/// Names of the standard invariants every subject provides.
pub mod standard {
    pub const ENTITY_UNREACHABLE: &str = "entity_unreachable";
    pub const CONTROL_PLANE_DOWN: &str = "control_plane_down";
    pub const HIGH_LATENCY: &str = "high_latency";
    pub const POLICY_DRIFT: &str = "policy_drift";
    pub const MISCONFIGURATION: &str = "misconfiguration";
}

/// The standard invariant declarations: unreachable and control-plane are
/// immediate criticals; latency and drift carry grace periods.
pub fn standard_invariants() -> Vec<InvariantConfig> {
    vec![
        InvariantConfig::immediate(
            standard::ENTITY_UNREACHABLE,
            Severity::Critical,
            InvariantScope::PerEntity,
        ),
        InvariantConfig::immediate(
            standard::CONTROL_PLANE_DOWN,
            Severity::Critical,
            InvariantScope::Cluster,
        ),
        InvariantConfig::with_grace(
            standard::HIGH_LATENCY,
            Severity::Warning,
            Duration::from_secs(60),
            InvariantScope::PerEntity,
        ),
        InvariantConfig::with_grace(
            standard::POLICY_DRIFT,
            Severity::Warning,
            Duration::from_secs(30),
            InvariantScope::Cluster,
        ),
        InvariantConfig::immediate(
            standard::MISCONFIGURATION,
            Severity::Warning,
            InvariantScope::Cluster,
        ),
    ]
}

/// One condition per registered entity not in the `Up` state.
pub fn entities_not_up(obs: &Observation) -> Vec<Condition> {
    obs.entities
        .iter()
        .filter(|e| !e.state.is_up())
        .map(|e| {
            Condition::entity(
                e.id.clone(),
                format!("entity {} at {} is {:?}", e.id, e.address, e.state),
            )
        })
        .collect()
}

/// A single cluster condition when the control plane did not answer.
pub fn control_plane_down(obs: &Observation) -> Vec<Condition> {
    if obs.cluster.control_plane_up {
        Vec::new()
    } else {
        vec![Condition::cluster("control plane is unreachable")]
    }
}

/// One condition per entity whose P99 exceeds `threshold_ms`.
pub fn high_latency(obs: &Observation, threshold_ms: f64) -> Vec<Condition> {
    obs.entities
        .iter()
        .filter_map(|e| {
            let p99 = e.metrics.p99_latency_ms?;
            if p99 > threshold_ms {
                Some(Condition::entity(
                    e.id.clone(),
                    format!(
                        "entity {} p99 latency {p99:.0}ms exceeds threshold {threshold_ms:.0}ms",
                        e.id
                    ),
                ))
            } else {
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_core::{EntityMetrics, EntityObservation, EntityState};

    fn entity(id: &str, state: EntityState, p99: Option<f64>) -> EntityObservation {
        EntityObservation {
            id: id.into(),
            address: format!("{id}.local:80"),
            state,
            metrics: EntityMetrics {
                p99_latency_ms: p99,
                throughput_rps: None,
                resource: std::collections::HashMap::new(),
            },
        }
    }

    #[test]
    fn down_entities_each_get_a_condition() {
        let mut obs = Observation::new();
        obs.entities.push(entity("n0", EntityState::Up, None));
        obs.entities.push(entity("n1", EntityState::Down, None));
        obs.entities.push(entity("n2", EntityState::Degraded, None));

        let conditions = entities_not_up(&obs);
        assert_eq!(conditions.len(), 2);
        assert_eq!(conditions[0].entity_id.as_deref(), Some("n1"));
        assert_eq!(conditions[1].entity_id.as_deref(), Some("n2"));
    }

    #[test]
    fn latency_ignores_missing_metrics() {
        let mut obs = Observation::new();
        obs.entities.push(entity("n0", EntityState::Up, None));
        obs.entities.push(entity("n1", EntityState::Up, Some(250.0)));

        let conditions = high_latency(&obs, 100.0);
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].entity_id.as_deref(), Some("n1"));
    }

    #[test]
    fn control_plane_condition_is_cluster_scoped() {
        let mut obs = Observation::new();
        obs.cluster.control_plane_up = false;
        let conditions = control_plane_down(&obs);
        assert_eq!(conditions.len(), 1);
        assert!(conditions[0].entity_id.is_none());
    }

    #[test]
    fn standard_set_declares_five() {
        let invariants = standard_invariants();
        assert_eq!(invariants.len(), 5);
        assert!(
            invariants
                .iter()
                .any(|i| i.name == standard::HIGH_LATENCY
                    && i.grace == Duration::from_secs(60))
        );
    }
}
