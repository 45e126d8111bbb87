use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use vigil_core::{ActionDefinition, ChaosKind, Observation, SubjectConfig};

use crate::error::{ActionError, ObserveError};

/// The capability set Vigil requires from any distributed system it operates.
///
/// Implementations own their network clients; the operator never builds
/// per-request clients. All methods take `&self`; adapters that need
/// interior state use their own synchronization.
#[async_trait]
pub trait Subject: Send + Sync {
    /// Sweep the subject's control plane, metrics, and state backend into a
    /// single [`Observation`].
    async fn observe(&self) -> Result<Observation, ObserveError>;

    /// The static catalog of remediation actions this subject exposes.
    fn action_definitions(&self) -> Vec<ActionDefinition>;

    /// Ask the control plane to perform an action. Fire-and-forget: returns
    /// once the endpoint accepts the request, without polling for effect.
    async fn execute_action(
        &self,
        name: &str,
        params: &serde_json::Value,
    ) -> Result<(), ActionError>;

    /// Informational descriptor (name, SLOs).
    fn config(&self) -> SubjectConfig;

    /// Restore the subject to a known-healthy baseline before a trial.
    ///
    /// The default is a no-op for subjects whose environment resets itself
    /// (e.g. the harness restarts containers out-of-band).
    async fn reset(&self) -> Result<(), ObserveError> {
        Ok(())
    }

    /// Poll until the subject observes healthy or the deadline passes.
    async fn wait_healthy(&self, deadline: Duration) -> Result<(), ObserveError> {
        let started = std::time::Instant::now();
        loop {
            match self.observe().await {
                Ok(obs) if observation_healthy(&obs) => return Ok(()),
                Ok(_) | Err(ObserveError::Transient(_)) => {}
                Err(fatal) => return Err(fatal),
            }
            if started.elapsed() >= deadline {
                return Err(ObserveError::Transient(format!(
                    "subject did not become healthy within {deadline:?}"
                )));
            }
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
    }

    /// Capture a subject-defined JSON document describing end-of-trial state.
    ///
    /// The default derives a compact entity-state map from one observation.
    async fn snapshot_state(&self) -> Result<serde_json::Value, ObserveError> {
        let obs = self.observe().await?;
        let entities: serde_json::Map<String, serde_json::Value> = obs
            .entities
            .iter()
            .map(|e| {
                (
                    e.id.clone(),
                    serde_json::to_value(e.state).unwrap_or(serde_json::Value::Null),
                )
            })
            .collect();
        Ok(json!({
            "control_plane_up": obs.cluster.control_plane_up,
            "entities": entities,
        }))
    }

    /// Whether a `snapshot_state` document describes a healthy cluster.
    ///
    /// The default understands the default snapshot shape.
    fn is_healthy(&self, final_state: &serde_json::Value) -> bool {
        let control_plane_up = final_state
            .get("control_plane_up")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false);
        let entities_up = final_state
            .get("entities")
            .and_then(serde_json::Value::as_object)
            .is_some_and(|m| {
                !m.is_empty() && m.values().all(|v| v.as_str() == Some("up"))
            });
        control_plane_up && entities_up
    }

    /// The chaos kinds this subject's environment can absorb.
    fn supported_chaos(&self) -> Vec<ChaosKind> {
        Vec::new()
    }

    /// Whether independent copies of this subject can run trials in
    /// parallel. Defaults to `false`; the campaign runner clamps
    /// parallelism to 1 unless every subject opts in.
    fn supports_parallel_trials(&self) -> bool {
        false
    }
}

/// All entities up and the control plane answering.
pub fn observation_healthy(obs: &Observation) -> bool {
    obs.cluster.control_plane_up && obs.entities.iter().all(|e| e.state.is_up())
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_core::{EntityMetrics, EntityObservation, EntityState};

    fn obs(states: &[EntityState]) -> Observation {
        let mut o = Observation::new();
        for (i, state) in states.iter().enumerate() {
            o.entities.push(EntityObservation {
                id: format!("n{i}"),
                address: format!("10.0.0.{i}:80"),
                state: *state,
                metrics: EntityMetrics::default(),
            });
        }
        o
    }

    #[test]
    fn healthy_requires_all_up() {
        assert!(observation_healthy(&obs(&[EntityState::Up, EntityState::Up])));
        assert!(!observation_healthy(&obs(&[
            EntityState::Up,
            EntityState::Down
        ])));
    }

    #[test]
    fn healthy_requires_control_plane() {
        let mut o = obs(&[EntityState::Up]);
        o.cluster.control_plane_up = false;
        assert!(!observation_healthy(&o));
    }
}
