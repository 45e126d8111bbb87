//! Adapter for a distributed key-value store fleet.
//!
//! Control plane: a placement-driver HTTP API (store registry, replica
//! config, scheduling verbs). Metrics: Prometheus P99 per store. Store ids
//! are numeric on the wire; they are stringified at ingress and parsed back
//! only when calling the placement driver.

use std::collections::HashMap;

use async_trait::async_trait;
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

const DEFAULT_LATENCY_THRESHOLD_MS: f64 = 50.0;

/// Leader counts further than this fraction from the mean indicate drift.
const LEADER_IMBALANCE_FRACTION: f64 = 0.5;

const P99_QUERY: &str = "histogram_quantile(0.99, sum by (le, instance) \
     (rate(kvstore_grpc_request_duration_seconds_bucket[1m])))";

#[derive(Debug, Deserialize)]
struct StoresResponse {
    count: u32,
    stores: Vec<StoreEntry>,
}

#[derive(Debug, Deserialize)]
struct StoreEntry {
    store: StoreMeta,
    #[serde(default)]
    status: StoreStatus,
}

#[derive(Debug, Deserialize)]
struct StoreMeta {
    id: u64,
    address: String,
    state_name: String,
}

#[derive(Debug, Default, Deserialize)]
struct StoreStatus {
    #[serde(default)]
    leader_count: Option<f64>,
    #[serde(default)]
    region_count: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct ReplicaConfig {
    #[serde(rename = "max-replicas")]
    max_replicas: u32,
}

fn parse_state(s: &str) -> EntityState {
    match s.to_ascii_lowercase().as_str() {
        "up" => EntityState::Up,
        "down" | "disconnected" => EntityState::Down,
        "offline" | "tombstone" => EntityState::Degraded,
        _ => EntityState::Unknown,
    }
}

fn parse_store_id(raw: &str) -> Result<u64, ActionError> {
    raw.parse::<u64>()
        .map_err(|_| ActionError::InvalidParams(format!("store id must be numeric, got `{raw}`")))
}

/// Key-value store subject backed by a placement driver.
pub struct KvStoreSubject {
    control_plane: ControlPlaneClient,
    metrics: Option<PrometheusClient>,
}

impl KvStoreSubject {
    #[must_use]
    pub fn new(control_plane: ControlPlaneClient, metrics: Option<PrometheusClient>) -> Self {
        Self {
            control_plane,
            metrics,
        }
    }
}

#[async_trait]
impl Subject for KvStoreSubject {
    #[allow(clippy::cast_precision_loss)]
    async fn observe(&self) -> Result<Observation, ObserveError> {
        let stores: StoresResponse = self.control_plane.get_json("/pd/api/v1/stores").await?;
        let replicas: ReplicaConfig = self
            .control_plane
            .get_json("/pd/api/v1/config/replicate")
            .await?;

        let mut obs = Observation::new();
        obs.cluster.control_plane_up = true;
        obs.cluster
            .counters
            .insert("store_count".to_owned(), f64::from(stores.count));
        obs.cluster
            .counters
            .insert("max_replicas".to_owned(), f64::from(replicas.max_replicas));

        let mut p99_by_store: HashMap<String, f64> = HashMap::new();
        if let Some(metrics) = &self.metrics {
            match metrics.query_by_label(P99_QUERY, "instance").await {
                Ok(values) => p99_by_store = values,
                Err(e) => warn!(error = %e, "metrics sweep failed"),
            }
        }

        for entry in stores.stores {
            let id = entry.store.id.to_string();
            let mut resource = HashMap::new();
            if let Some(leaders) = entry.status.leader_count {
                resource.insert("leader_count".to_owned(), leaders);
            }
            if let Some(regions) = entry.status.region_count {
                resource.insert("region_count".to_owned(), regions);
            }
            let p99_ms = p99_by_store
                .get(&id)
                .or_else(|| p99_by_store.get(&entry.store.address))
                .map(|seconds| seconds * 1000.0);
            obs.entities.push(EntityObservation {
                id,
                address: entry.store.address,
                state: parse_state(&entry.store.state_name),
                metrics: EntityMetrics {
                    p99_latency_ms: p99_ms,
                    throughput_rps: None,
                    resource,
                },
            });
        }

        Ok(obs)
    }

    fn action_definitions(&self) -> Vec<ActionDefinition> {
        let store_param = |desc: &str| {
            let mut params = HashMap::new();
            params.insert(
                "store".to_owned(),
                ParamSpec {
                    ty: "string".into(),
                    description: desc.into(),
                    required: true,
                },
            );
            params
        };
        let mut transfer_params = store_param("destination store id");
        transfer_params.insert(
            "region".to_owned(),
            ParamSpec {
                ty: "string".into(),
                description: "region id whose leader moves".into(),
                required: true,
            },
        );
        vec![
            ActionDefinition {
                name: "evict_leader".into(),
                description: "Evict all leaders from one store".into(),
                params: store_param("store id to drain of leaders"),
                risk: RiskLevel::Medium,
                requires_approval: false,
            },
            ActionDefinition {
                name: "transfer_leader".into(),
                description: "Move one region's leader to a destination store".into(),
                params: transfer_params,
                risk: RiskLevel::Medium,
                requires_approval: false,
            },
            ActionDefinition {
                name: "remove_peer".into(),
                description: "Remove a store's peer and let the scheduler re-replicate".into(),
                params: store_param("store id to remove"),
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

        let store_id = |params: &serde_json::Value| -> Result<u64, ActionError> {
            let raw = params
                .get("store")
                .and_then(serde_json::Value::as_str)
                .ok_or_else(|| ActionError::InvalidParams("store must be a string".into()))?;
            parse_store_id(raw)
        };

        match name {
            "evict_leader" => {
                let id = store_id(params)?;
                self.control_plane
                    .post_action(
                        "/pd/api/v1/schedulers",
                        &json!({"name": "evict-leader-scheduler", "store_id": id}),
                    )
                    .await
            }
            "transfer_leader" => {
                let id = store_id(params)?;
                let region = params
                    .get("region")
                    .and_then(serde_json::Value::as_str)
                    .ok_or_else(|| ActionError::InvalidParams("region must be a string".into()))?;
                let region_id = parse_store_id(region)?;
                self.control_plane
                    .post_action(
                        "/pd/api/v1/operators",
                        &json!({"name": "transfer-leader", "region_id": region_id, "to_store_id": id}),
                    )
                    .await
            }
            "remove_peer" => {
                let id = store_id(params)?;
                self.control_plane
                    .post_action(&format!("/pd/api/v1/store/{id}/state?state=Offline"), &json!({}))
                    .await
            }
            _ => Err(ActionError::UnknownAction(name.to_owned())),
        }
    }

    fn config(&self) -> SubjectConfig {
        SubjectConfig {
            name: "kvstore".into(),
            slos: vec![
                Slo {
                    name: "availability".into(),
                    description: "every registered store serving".into(),
                },
                Slo {
                    name: "replication".into(),
                    description: "store count at or above max-replicas".into(),
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

/// Standard invariants over the key-value store's observation model.
pub struct KvStoreChecker {
    invariants: Vec<InvariantConfig>,
    latency_threshold_ms: f64,
}

impl KvStoreChecker {
    #[must_use]
    pub fn new() -> Self {
        Self {
            invariants: standard_invariants(),
            latency_threshold_ms: DEFAULT_LATENCY_THRESHOLD_MS,
        }
    }
}

impl Default for KvStoreChecker {
    fn default() -> Self {
        Self::new()
    }
}

impl InvariantChecker for KvStoreChecker {
    fn invariants(&self) -> &[InvariantConfig] {
        &self.invariants
    }

    fn evaluate(&self, invariant: &str, obs: &Observation) -> Result<Vec<Condition>, CheckError> {
        match invariant {
            standard::ENTITY_UNREACHABLE => Ok(entities_not_up(obs)),
            standard::CONTROL_PLANE_DOWN => {
                if obs.cluster.control_plane_up {
                    Ok(Vec::new())
                } else {
                    Ok(vec![Condition::cluster("placement driver is unreachable")])
                }
            }
            standard::HIGH_LATENCY => Ok(high_latency(obs, self.latency_threshold_ms)),
            standard::POLICY_DRIFT => {
                // Leader balance: any store further than the allowed fraction
                // from the mean has drifted from the scheduler's declared goal.
                let leaders: Vec<(&str, f64)> = obs
                    .entities
                    .iter()
                    .filter_map(|e| {
                        e.metrics
                            .resource
                            .get("leader_count")
                            .map(|v| (e.id.as_str(), *v))
                    })
                    .collect();
                if leaders.len() < 2 {
                    return Ok(Vec::new());
                }
                #[allow(clippy::cast_precision_loss)]
                let mean = leaders.iter().map(|(_, v)| v).sum::<f64>() / leaders.len() as f64;
                if mean <= 0.0 {
                    return Ok(Vec::new());
                }
                Ok(leaders
                    .iter()
                    .filter(|(_, count)| {
                        (count - mean).abs() / mean > LEADER_IMBALANCE_FRACTION
                    })
                    .map(|(id, count)| {
                        Condition::entity(
                            (*id).to_owned(),
                            format!(
                                "store {id} holds {count:.0} leaders, mean is {mean:.0}"
                            ),
                        )
                    })
                    .collect())
            }
            standard::MISCONFIGURATION => {
                let stores = obs.cluster.counters.get("store_count").copied();
                let replicas = obs.cluster.counters.get("max_replicas").copied();
                match (stores, replicas) {
                    (Some(stores), Some(replicas)) if stores < replicas => {
                        Ok(vec![Condition::cluster(format!(
                            "{stores:.0} stores cannot satisfy max-replicas {replicas:.0}"
                        ))])
                    }
                    _ => Ok(Vec::new()),
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

    let subject = std::sync::Arc::new(KvStoreSubject::new(control_plane, metrics));
    let checker = std::sync::Arc::new(KvStoreChecker::new());
    Ok((subject, checker))
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_core::EntityObservation;

    fn store(id: &str, leaders: f64) -> EntityObservation {
        let mut resource = HashMap::new();
        resource.insert("leader_count".to_owned(), leaders);
        EntityObservation {
            id: id.into(),
            address: format!("{id}.kv.local:20160"),
            state: EntityState::Up,
            metrics: EntityMetrics {
                p99_latency_ms: None,
                throughput_rps: None,
                resource,
            },
        }
    }

    #[test]
    fn pd_wire_format_parses() {
        let body = r#"{
            "count": 2,
            "stores": [
                {"store": {"id": 1, "address": "kv-0:20160", "state_name": "Up"},
                 "status": {"leader_count": 12, "region_count": 30}},
                {"store": {"id": 5, "address": "kv-1:20160", "state_name": "Down"}}
            ]
        }"#;
        let parsed: StoresResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.count, 2);
        assert_eq!(parsed.stores[0].store.id, 1);
        assert_eq!(parsed.stores[0].status.leader_count, Some(12.0));
        assert_eq!(parsed.stores[1].status.leader_count, None);
    }

    #[test]
    fn store_id_round_trip_is_explicit() {
        assert_eq!(parse_store_id("42").unwrap(), 42);
        assert!(parse_store_id("store-42").is_err());
    }

    #[test]
    fn leader_imbalance_is_policy_drift() {
        let checker = KvStoreChecker::new();
        let mut obs = Observation::new();
        obs.entities.push(store("1", 100.0));
        obs.entities.push(store("2", 100.0));
        obs.entities.push(store("3", 10.0));

        let conditions = checker.evaluate(standard::POLICY_DRIFT, &obs).unwrap();
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].entity_id.as_deref(), Some("3"));
    }

    #[test]
    fn understaffed_cluster_is_misconfigured() {
        let checker = KvStoreChecker::new();
        let mut obs = Observation::new();
        obs.cluster.counters.insert("store_count".into(), 2.0);
        obs.cluster.counters.insert("max_replicas".into(), 3.0);

        let conditions = checker.evaluate(standard::MISCONFIGURATION, &obs).unwrap();
        assert_eq!(conditions.len(), 1);
    }
}
