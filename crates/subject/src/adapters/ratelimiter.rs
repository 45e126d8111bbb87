//! Adapter for a rate-limiter fleet.
//!
//! Control plane: HTTP API exposing node registry, declared limits, and
//! remediation verbs. State backend: Redis, holding the live request
//! counters the fleet enforces against. Metrics: Prometheus P99 per node.

use std::collections::HashMap;

use async_trait::async_trait;
use redis::AsyncCommands;
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use vigil_core::{
    ActionDefinition, ChaosKind, Condition, EntityMetrics, EntityObservation, EntityState,
    InvariantConfig, Observation, ParamSpec, RiskLevel, Slo, SubjectConfig,
};

use crate::checker::{
    InvariantChecker, entities_not_up, high_latency, standard, standard_invariants,
};
use crate::clients::{ControlPlaneClient, PrometheusClient};
use crate::error::{ActionError, CheckError, ObserveError, SubjectError};
use crate::registry::{SubjectEndpoints, SubjectParts};
use crate::subject::Subject;

/// Default P99 threshold (ms) for the high-latency invariant.
const DEFAULT_LATENCY_THRESHOLD_MS: f64 = 100.0;

/// Prometheus expression for per-node P99 in seconds.
const P99_QUERY: &str = "histogram_quantile(0.99, sum by (le, instance) \
     (rate(ratelimiter_request_duration_seconds_bucket[1m])))";

#[derive(Debug, Deserialize)]
struct NodesResponse {
    nodes: Vec<NodeInfo>,
}

#[derive(Debug, Deserialize)]
struct NodeInfo {
    id: String,
    address: String,
    state: String,
    /// The limit this node believes it is enforcing.
    #[serde(default)]
    limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct LimitsConfig {
    /// Declared requests-per-window limit for the fleet.
    limit: i64,
}

fn parse_state(s: &str) -> EntityState {
    match s.to_ascii_lowercase().as_str() {
        "up" | "serving" | "healthy" => EntityState::Up,
        "down" | "offline" | "dead" => EntityState::Down,
        "degraded" | "draining" => EntityState::Degraded,
        _ => EntityState::Unknown,
    }
}

/// Rate-limiter fleet subject.
pub struct RateLimiterSubject {
    control_plane: ControlPlaneClient,
    metrics: Option<PrometheusClient>,
    state_backend: Option<redis::aio::ConnectionManager>,
    counter_key: String,
}

impl RateLimiterSubject {
    /// Build from pre-constructed clients. `counter_key` is the Redis key
    /// holding the fleet-wide request counter.
    #[must_use]
    pub fn new(
        control_plane: ControlPlaneClient,
        metrics: Option<PrometheusClient>,
        state_backend: Option<redis::aio::ConnectionManager>,
    ) -> Self {
        Self {
            control_plane,
            metrics,
            state_backend,
            counter_key: "ratelimiter:request_count".to_owned(),
        }
    }

    #[allow(clippy::cast_precision_loss)]
    async fn read_counter(&self) -> Option<f64> {
        let manager = self.state_backend.clone()?;
        let mut conn = manager;
        match conn.get::<_, Option<i64>>(&self.counter_key).await {
            Ok(value) => value.map(|v| v as f64),
            Err(e) => {
                warn!(error = %e, "rate-limiter state backend unreachable");
                None
            }
        }
    }
}

#[async_trait]
impl Subject for RateLimiterSubject {
    #[allow(clippy::cast_precision_loss)]
    async fn observe(&self) -> Result<Observation, ObserveError> {
        let nodes: NodesResponse = self.control_plane.get_json("/v1/nodes").await?;
        let limits: LimitsConfig = self.control_plane.get_json("/v1/config").await?;

        let mut obs = Observation::new();
        obs.cluster.control_plane_up = true;
        obs.cluster
            .counters
            .insert("declared_limit".to_owned(), limits.limit as f64);

        // Latency sweep is best-effort: a dead Prometheus never fails a tick.
        let mut p99_by_node: HashMap<String, f64> = HashMap::new();
        if let Some(metrics) = &self.metrics {
            match metrics.query_by_label(P99_QUERY, "instance").await {
                Ok(values) => p99_by_node = values,
                Err(e) => warn!(error = %e, "metrics sweep failed"),
            }
        }

        let mut config_consistent = true;
        for node in nodes.nodes {
            if node.limit.is_some_and(|node_limit| node_limit != limits.limit) {
                config_consistent = false;
            }
            let p99_ms = p99_by_node
                .get(&node.id)
                .or_else(|| p99_by_node.get(&node.address))
                .map(|seconds| seconds * 1000.0);
            obs.entities.push(EntityObservation {
                id: node.id,
                address: node.address,
                state: parse_state(&node.state),
                metrics: EntityMetrics {
                    p99_latency_ms: p99_ms,
                    throughput_rps: None,
                    resource: HashMap::new(),
                },
            });
        }
        obs.cluster
            .flags
            .insert("config_consistent".to_owned(), config_consistent);

        match self.read_counter().await {
            Some(count) => {
                obs.cluster.counters.insert("request_count".to_owned(), count);
                obs.cluster.flags.insert("state_backend_up".to_owned(), true);
            }
            None => {
                obs.cluster
                    .flags
                    .insert("state_backend_up".to_owned(), self.state_backend.is_none());
            }
        }

        Ok(obs)
    }

    fn action_definitions(&self) -> Vec<ActionDefinition> {
        let node_param = |desc: &str| {
            let mut params = HashMap::new();
            params.insert(
                "node".to_owned(),
                ParamSpec {
                    ty: "string".into(),
                    description: desc.into(),
                    required: true,
                },
            );
            params
        };
        let mut limit_params = HashMap::new();
        limit_params.insert(
            "limit".to_owned(),
            ParamSpec {
                ty: "integer".into(),
                description: "new requests-per-window limit".into(),
                required: true,
            },
        );
        vec![
            ActionDefinition {
                name: "restart_node".into(),
                description: "Restart one limiter node via the control plane".into(),
                params: node_param("node id to restart"),
                risk: RiskLevel::Medium,
                requires_approval: false,
            },
            ActionDefinition {
                name: "reset_counters".into(),
                description: "Zero the fleet-wide request counters".into(),
                params: HashMap::new(),
                risk: RiskLevel::Low,
                requires_approval: false,
            },
            ActionDefinition {
                name: "set_limit".into(),
                description: "Change the declared request limit".into(),
                params: limit_params,
                risk: RiskLevel::High,
                requires_approval: true,
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

        match name {
            "restart_node" => {
                let node = params
                    .get("node")
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or_default();
                self.control_plane
                    .post_action(&format!("/v1/nodes/{node}/restart"), &json!({}))
                    .await
            }
            "reset_counters" => {
                self.control_plane
                    .post_action("/v1/counters/reset", &json!({}))
                    .await
            }
            "set_limit" => {
                self.control_plane
                    .post_action("/v1/config/limit", params)
                    .await
            }
            _ => Err(ActionError::UnknownAction(name.to_owned())),
        }
    }

    fn config(&self) -> SubjectConfig {
        SubjectConfig {
            name: "ratelimiter".into(),
            slos: vec![
                Slo {
                    name: "availability".into(),
                    description: "all limiter nodes serving".into(),
                },
                Slo {
                    name: "latency".into(),
                    description: format!(
                        "p99 below {DEFAULT_LATENCY_THRESHOLD_MS:.0}ms per node"
                    ),
                },
            ],
        }
    }

    fn supported_chaos(&self) -> Vec<ChaosKind> {
        vec![
            ChaosKind::NodeKill,
            ChaosKind::Latency,
            ChaosKind::DiskPressure,
            ChaosKind::NetworkPartition,
        ]
    }
}

/// Standard invariants applied to the rate-limiter's observation model.
pub struct RateLimiterChecker {
    invariants: Vec<InvariantConfig>,
    latency_threshold_ms: f64,
}

impl RateLimiterChecker {
    #[must_use]
    pub fn new() -> Self {
        Self {
            invariants: standard_invariants(),
            latency_threshold_ms: DEFAULT_LATENCY_THRESHOLD_MS,
        }
    }

    /// Override the P99 threshold.
    #[must_use]
    pub fn with_latency_threshold(mut self, threshold_ms: f64) -> Self {
        self.latency_threshold_ms = threshold_ms;
        self
    }
}

impl Default for RateLimiterChecker {
    fn default() -> Self {
        Self::new()
    }
}

impl InvariantChecker for RateLimiterChecker {
    fn invariants(&self) -> &[InvariantConfig] {
        &self.invariants
    }

    fn evaluate(&self, invariant: &str, obs: &Observation) -> Result<Vec<Condition>, CheckError> {
        match invariant {
            standard::ENTITY_UNREACHABLE => Ok(entities_not_up(obs)),
            standard::CONTROL_PLANE_DOWN => {
                // The backing store counts as coordinating infrastructure.
                let mut conditions = Vec::new();
                if !obs.cluster.control_plane_up {
                    conditions.push(Condition::cluster("control plane is unreachable"));
                } else if obs.cluster.flags.get("state_backend_up") == Some(&false) {
                    conditions.push(Condition::cluster("state backend (redis) is unreachable"));
                }
                Ok(conditions)
            }
            standard::HIGH_LATENCY => Ok(high_latency(obs, self.latency_threshold_ms)),
            standard::POLICY_DRIFT => {
                let count = obs.cluster.counters.get("request_count").copied();
                let limit = obs.cluster.counters.get("declared_limit").copied();
                match (count, limit) {
                    (Some(count), Some(limit)) if count > limit => {
                        Ok(vec![Condition::cluster(format!(
                            "request counter {count:.0} exceeds declared limit {limit:.0}"
                        ))])
                    }
                    _ => Ok(Vec::new()),
                }
            }
            standard::MISCONFIGURATION => {
                if obs.cluster.flags.get("config_consistent") == Some(&false) {
                    Ok(vec![Condition::cluster(
                        "node-local limit disagrees with declared fleet limit",
                    )])
                } else {
                    Ok(Vec::new())
                }
            }
            other => Err(CheckError(format!("unknown invariant `{other}`"))),
        }
    }
}

/// Factory: build the adapter and checker from endpoints.
pub async fn make_subject(endpoints: SubjectEndpoints) -> Result<SubjectParts, SubjectError> {
    let control_plane = ControlPlaneClient::new(endpoints.control_plane()?)
        .map_err(|e| SubjectError::Configuration(e.to_string()))?;

    let metrics = match &endpoints.metrics_url {
        Some(url) => Some(
            PrometheusClient::new(url.clone())
                .map_err(|e| SubjectError::Configuration(e.to_string()))?,
        ),
        None => None,
    };

    let state_backend = match &endpoints.state_backend_url {
        Some(url) => {
            let client = redis::Client::open(url.as_str())
                .map_err(|e| SubjectError::Configuration(e.to_string()))?;
            match client.get_connection_manager().await {
                Ok(manager) => Some(manager),
                Err(e) => {
                    // Construction survives a dead backend; observe reports it.
                    warn!(error = %e, "redis unavailable at construction");
                    None
                }
            }
        }
        None => None,
    };

    let subject = std::sync::Arc::new(RateLimiterSubject::new(
        control_plane,
        metrics,
        state_backend,
    ));
    let checker = std::sync::Arc::new(RateLimiterChecker::new());
    Ok((subject, checker))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_parsing_covers_aliases() {
        assert_eq!(parse_state("Up"), EntityState::Up);
        assert_eq!(parse_state("serving"), EntityState::Up);
        assert_eq!(parse_state("down"), EntityState::Down);
        assert_eq!(parse_state("draining"), EntityState::Degraded);
        assert_eq!(parse_state("???"), EntityState::Unknown);
    }

    #[test]
    fn checker_reports_state_backend_loss_as_control_plane() {
        let checker = RateLimiterChecker::new();
        let mut obs = Observation::new();
        obs.cluster.flags.insert("state_backend_up".into(), false);

        let conditions = checker
            .evaluate(standard::CONTROL_PLANE_DOWN, &obs)
            .unwrap();
        assert_eq!(conditions.len(), 1);
        assert!(conditions[0].message.contains("redis"));
    }

    #[test]
    fn drift_requires_both_counters() {
        let checker = RateLimiterChecker::new();
        let mut obs = Observation::new();
        obs.cluster.counters.insert("request_count".into(), 500.0);
        assert!(checker.evaluate(standard::POLICY_DRIFT, &obs).unwrap().is_empty());

        obs.cluster.counters.insert("declared_limit".into(), 100.0);
        assert_eq!(checker.evaluate(standard::POLICY_DRIFT, &obs).unwrap().len(), 1);
    }

    #[test]
    fn node_wire_format_parses() {
        let body = r#"{"nodes": [
            {"id": "rl-0", "address": "10.0.1.10:7400", "state": "up", "limit": 1000},
            {"id": "rl-1", "address": "10.0.1.11:7400", "state": "down"}
        ]}"#;
        let parsed: NodesResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.nodes.len(), 2);
        assert_eq!(parsed.nodes[0].limit, Some(1000));
        assert_eq!(parsed.nodes[1].limit, None);
    }
}
