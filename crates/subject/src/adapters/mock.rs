//! Scripted in-memory subject for tests and baseline trials.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;

use vigil_core::{
    ActionDefinition, ChaosKind, Condition, EntityMetrics, EntityObservation, EntityState,
    InvariantConfig, Observation, ParamSpec, RiskLevel, SubjectConfig,
};

use crate::checker::{
    InvariantChecker, control_plane_down, entities_not_up, high_latency, standard,
    standard_invariants,
};
use crate::error::{ActionError, CheckError, ObserveError};
use crate::subject::Subject;

/// P99 threshold the mock checker enforces.
const LATENCY_THRESHOLD_MS: f64 = 100.0;

#[derive(Debug, Default)]
struct MockState {
    observation: Observation,
    /// Message for a one-shot transient observe failure.
    fail_observe: Option<String>,
    executed: Vec<(String, serde_json::Value)>,
    resets: u32,
}

/// A subject whose world is a mutable in-memory observation.
///
/// Tests mutate the scripted state between ticks; `restart_node` actually
/// revives the target entity so remediation paths can be exercised end to
/// end without a network.
#[derive(Debug)]
pub struct MockSubject {
    state: Mutex<MockState>,
}

impl MockSubject {
    /// A mock with `nodes` healthy entities, plus its companion checker.
    pub fn healthy(nodes: usize) -> (Arc<Self>, Arc<MockChecker>) {
        let mut observation = Observation::new();
        for i in 0..nodes {
            observation.entities.push(EntityObservation {
                id: format!("n{i}"),
                address: format!("10.99.0.{i}:7400"),
                state: EntityState::Up,
                metrics: EntityMetrics::default(),
            });
        }
        observation
            .cluster
            .counters
            .insert("request_count".to_owned(), 0.0);
        observation
            .cluster
            .counters
            .insert("declared_limit".to_owned(), 1000.0);

        let subject = Arc::new(Self {
            state: Mutex::new(MockState {
                observation,
                ..MockState::default()
            }),
        });
        (subject, Arc::new(MockChecker::new()))
    }

    pub fn set_entity_state(&self, id: &str, state: EntityState) {
        let mut guard = self.state.lock().unwrap();
        if let Some(entity) = guard.observation.entities.iter_mut().find(|e| e.id == id) {
            entity.state = state;
        }
    }

    pub fn set_latency(&self, id: &str, p99_ms: f64) {
        let mut guard = self.state.lock().unwrap();
        if let Some(entity) = guard.observation.entities.iter_mut().find(|e| e.id == id) {
            entity.metrics.p99_latency_ms = Some(p99_ms);
        }
    }

    pub fn set_counter(&self, name: &str, value: f64) {
        self.state
            .lock()
            .unwrap()
            .observation
            .cluster
            .counters
            .insert(name.to_owned(), value);
    }

    pub fn set_control_plane_up(&self, up: bool) {
        self.state.lock().unwrap().observation.cluster.control_plane_up = up;
    }

    /// Make the next observe fail transiently with `message`.
    pub fn fail_next_observe(&self, message: &str) {
        self.state.lock().unwrap().fail_observe = Some(message.to_owned());
    }

    /// Actions executed so far, in order.
    pub fn executed_actions(&self) -> Vec<(String, serde_json::Value)> {
        self.state.lock().unwrap().executed.clone()
    }

    pub fn reset_count(&self) -> u32 {
        self.state.lock().unwrap().resets
    }
}

#[async_trait]
impl Subject for MockSubject {
    async fn observe(&self) -> Result<Observation, ObserveError> {
        let mut guard = self.state.lock().unwrap();
        if let Some(message) = guard.fail_observe.take() {
            return Err(ObserveError::Transient(message));
        }
        let mut obs = guard.observation.clone();
        obs.observed_at = chrono::Utc::now();
        Ok(obs)
    }

    fn action_definitions(&self) -> Vec<ActionDefinition> {
        let mut restart_params = HashMap::new();
        restart_params.insert(
            "node".to_owned(),
            ParamSpec {
                ty: "string".into(),
                description: "entity id to restart".into(),
                required: true,
            },
        );
        vec![
            ActionDefinition {
                name: "restart_node".into(),
                description: "Restart a single entity".into(),
                params: restart_params,
                risk: RiskLevel::Medium,
                requires_approval: false,
            },
            ActionDefinition {
                name: "reset_counters".into(),
                description: "Zero the cluster request counters".into(),
                params: HashMap::new(),
                risk: RiskLevel::Low,
                requires_approval: false,
            },
        ]
    }

    async fn execute_action(
        &self,
        name: &str,
        params: &serde_json::Value,
    ) -> Result<(), ActionError> {
        let definition = self
            .action_definitions()
            .into_iter()
            .find(|d| d.name == name)
            .ok_or_else(|| ActionError::UnknownAction(name.to_owned()))?;
        definition
            .validate_params(params)
            .map_err(ActionError::InvalidParams)?;

        let mut guard = self.state.lock().unwrap();
        match name {
            "restart_node" => {
                let node = params
                    .get("node")
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or_default()
                    .to_owned();
                if let Some(entity) = guard
                    .observation
                    .entities
                    .iter_mut()
                    .find(|e| e.id == node)
                {
                    entity.state = EntityState::Up;
                    entity.metrics.p99_latency_ms = None;
                } else {
                    return Err(ActionError::RemoteRejected(format!(
                        "no such node: {node}"
                    )));
                }
            }
            "reset_counters" => {
                guard
                    .observation
                    .cluster
                    .counters
                    .insert("request_count".to_owned(), 0.0);
            }
            _ => {}
        }
        guard.executed.push((name.to_owned(), params.clone()));
        Ok(())
    }

    fn config(&self) -> SubjectConfig {
        SubjectConfig {
            name: "mock".into(),
            slos: vec![],
        }
    }

    async fn reset(&self) -> Result<(), ObserveError> {
        let mut guard = self.state.lock().unwrap();
        guard.resets += 1;
        guard.fail_observe = None;
        for entity in &mut guard.observation.entities {
            entity.state = EntityState::Up;
            entity.metrics.p99_latency_ms = None;
        }
        guard.observation.cluster.control_plane_up = true;
        guard
            .observation
            .cluster
            .counters
            .insert("request_count".to_owned(), 0.0);
        Ok(())
    }

    async fn snapshot_state(&self) -> Result<serde_json::Value, ObserveError> {
        let guard = self.state.lock().unwrap();
        let entities: serde_json::Map<String, serde_json::Value> = guard
            .observation
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
            "control_plane_up": guard.observation.cluster.control_plane_up,
            "entities": entities,
        }))
    }

    fn supported_chaos(&self) -> Vec<ChaosKind> {
        vec![
            ChaosKind::NodeKill,
            ChaosKind::Latency,
            ChaosKind::DiskPressure,
            ChaosKind::NetworkPartition,
        ]
    }

    fn supports_parallel_trials(&self) -> bool {
        true
    }
}

/// Standard-invariant checker over the mock's shared observation model.
#[derive(Debug)]
pub struct MockChecker {
    invariants: Vec<InvariantConfig>,
}

impl MockChecker {
    #[must_use]
    pub fn new() -> Self {
        Self {
            invariants: standard_invariants(),
        }
    }
}

impl Default for MockChecker {
    fn default() -> Self {
        Self::new()
    }
}

impl InvariantChecker for MockChecker {
    fn invariants(&self) -> &[InvariantConfig] {
        &self.invariants
    }

    fn evaluate(&self, invariant: &str, obs: &Observation) -> Result<Vec<Condition>, CheckError> {
        match invariant {
            standard::ENTITY_UNREACHABLE => Ok(entities_not_up(obs)),
            standard::CONTROL_PLANE_DOWN => Ok(control_plane_down(obs)),
            standard::HIGH_LATENCY => Ok(high_latency(obs, LATENCY_THRESHOLD_MS)),
            standard::POLICY_DRIFT => {
                let count = obs.cluster.counters.get("request_count").copied();
                let limit = obs.cluster.counters.get("declared_limit").copied();
                match (count, limit) {
                    (Some(count), Some(limit)) if count > limit => {
                        Ok(vec![Condition::cluster(format!(
                            "request_count {count:.0} exceeds declared limit {limit:.0}"
                        ))])
                    }
                    _ => Ok(Vec::new()),
                }
            }
            standard::MISCONFIGURATION => {
                if obs.cluster.flags.get("config_consistent") == Some(&false) {
                    Ok(vec![Condition::cluster("configuration is inconsistent")])
                } else {
                    Ok(Vec::new())
                }
            }
            other => Err(CheckError(format!("unknown invariant `{other}`"))),
        }
    }
}
