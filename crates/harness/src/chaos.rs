//! Parameterized fault injection.
//!
//! Every injector returns a metadata document containing everything its
//! `cleanup` needs, so cleanup stays stateless across harness restarts.
//! Cleanup is best-effort and idempotent: callers log failures and rely on
//! the next trial's reset to restore anything left over.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{info, warn};

use vigil_core::ChaosKind;

use crate::docker::ContainerManager;
use crate::error::HarnessError;

/// Path of the fill file created by disk-pressure chaos.
const FILL_FILE: &str = "/vigil-fill";

/// One chaos implementation.
#[async_trait]
pub trait ChaosInjector: Send + Sync {
    fn kind(&self) -> ChaosKind;

    /// Inject the fault. The returned metadata must carry every field
    /// [`cleanup`](ChaosInjector::cleanup) needs.
    async fn inject(&self, params: &HashMap<String, Value>) -> Result<Value, HarnessError>;

    /// Undo the fault. Must tolerate being called twice and being called
    /// with metadata from a previous process.
    async fn cleanup(&self, metadata: &Value) -> Result<(), HarnessError>;
}

fn require_str<'a>(
    params: &'a HashMap<String, Value>,
    key: &str,
) -> Result<&'a str, HarnessError> {
    params
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| HarnessError::Config(format!("chaos param `{key}` must be a string")))
}

fn require_u64(params: &HashMap<String, Value>, key: &str) -> Result<u64, HarnessError> {
    params
        .get(key)
        .and_then(Value::as_u64)
        .ok_or_else(|| HarnessError::Config(format!("chaos param `{key}` must be an integer")))
}

/// Validate chaos parameters without a docker connection; shared by the
/// campaign config loader.
pub fn validate_params(
    kind: ChaosKind,
    params: &HashMap<String, Value>,
) -> Result<(), HarnessError> {
    match kind {
        ChaosKind::None => Ok(()),
        ChaosKind::NodeKill => require_str(params, "container").map(|_| ()),
        ChaosKind::Latency => {
            require_str(params, "container")?;
            let min = require_u64(params, "min_ms")?;
            let max = require_u64(params, "max_ms")?;
            if min > max {
                return Err(HarnessError::Config(format!(
                    "latency min_ms {min} exceeds max_ms {max}"
                )));
            }
            Ok(())
        }
        ChaosKind::DiskPressure => {
            require_str(params, "container")?;
            let fill = require_u64(params, "fill_percent")?;
            if !(1..=99).contains(&fill) {
                return Err(HarnessError::Config(format!(
                    "fill_percent must be in [1, 99], got {fill}"
                )));
            }
            Ok(())
        }
        ChaosKind::NetworkPartition => {
            require_str(params, "container")?;
            let peers = params
                .get("peers")
                .and_then(Value::as_array)
                .ok_or_else(|| {
                    HarnessError::Config("chaos param `peers` must be an array".to_owned())
                })?;
            if peers.is_empty() {
                return Err(HarnessError::Config(
                    "network_partition needs at least one peer".to_owned(),
                ));
            }
            Ok(())
        }
    }
}

/// Baseline injector: does nothing, cleans up nothing.
pub struct NoneChaos;

#[async_trait]
impl ChaosInjector for NoneChaos {
    fn kind(&self) -> ChaosKind {
        ChaosKind::None
    }

    async fn inject(&self, _params: &HashMap<String, Value>) -> Result<Value, HarnessError> {
        Ok(Value::Null)
    }

    async fn cleanup(&self, _metadata: &Value) -> Result<(), HarnessError> {
        Ok(())
    }
}

/// Stop a specific node container. No cleanup: the next trial reset
/// restores the fleet.
pub struct NodeKillChaos {
    docker: ContainerManager,
}

#[async_trait]
impl ChaosInjector for NodeKillChaos {
    fn kind(&self) -> ChaosKind {
        ChaosKind::NodeKill
    }

    async fn inject(&self, params: &HashMap<String, Value>) -> Result<Value, HarnessError> {
        validate_params(self.kind(), params)?;
        let container = require_str(params, "container")?;
        self.docker
            .stop(container)
            .await
            .map_err(|e| HarnessError::Chaos(e.to_string()))?;
        info!(container, "node killed");
        Ok(json!({ "container": container }))
    }

    async fn cleanup(&self, _metadata: &Value) -> Result<(), HarnessError> {
        Ok(())
    }
}

/// Inject network delay via traffic control on the container interface.
pub struct LatencyChaos {
    docker: ContainerManager,
}

#[async_trait]
impl ChaosInjector for LatencyChaos {
    fn kind(&self) -> ChaosKind {
        ChaosKind::Latency
    }

    async fn inject(&self, params: &HashMap<String, Value>) -> Result<Value, HarnessError> {
        validate_params(self.kind(), params)?;
        let container = require_str(params, "container")?;
        let min = require_u64(params, "min_ms")?;
        let max = require_u64(params, "max_ms")?;
        let delay = (min + max) / 2;
        let jitter = (max - min) / 2;

        let script =
            format!("tc qdisc add dev eth0 root netem delay {delay}ms {jitter}ms");
        let output = self
            .docker
            .exec_sh(container, &script)
            .await
            .map_err(|e| HarnessError::Chaos(e.to_string()))?;
        if !output.success() {
            return Err(HarnessError::Chaos(format!(
                "tc failed in {container}: {}",
                output.stderr
            )));
        }
        info!(container, delay, jitter, "latency injected");
        Ok(json!({ "container": container, "interface": "eth0" }))
    }

    async fn cleanup(&self, metadata: &Value) -> Result<(), HarnessError> {
        let Some(container) = metadata.get("container").and_then(Value::as_str) else {
            return Ok(());
        };
        let interface = metadata
            .get("interface")
            .and_then(Value::as_str)
            .unwrap_or("eth0");
        // Deleting an absent qdisc fails; that is the idempotent case.
        let output = self
            .docker
            .exec_sh(container, &format!("tc qdisc del dev {interface} root netem"))
            .await
            .map_err(|e| HarnessError::Chaos(e.to_string()))?;
        if !output.success() && !output.stderr.contains("No such file") {
            warn!(container, stderr = %output.stderr, "latency cleanup reported failure");
        }
        Ok(())
    }
}

/// Allocate a fill file consuming a fraction of the container's free space.
pub struct DiskPressureChaos {
    docker: ContainerManager,
}

#[async_trait]
impl ChaosInjector for DiskPressureChaos {
    fn kind(&self) -> ChaosKind {
        ChaosKind::DiskPressure
    }

    async fn inject(&self, params: &HashMap<String, Value>) -> Result<Value, HarnessError> {
        validate_params(self.kind(), params)?;
        let container = require_str(params, "container")?;
        let fill_percent = require_u64(params, "fill_percent")?;

        let script = format!(
            "avail=$(df -B1 --output=avail / | tail -1) && \
             fallocate -l $((avail * {fill_percent} / 100)) {FILL_FILE} || \
             dd if=/dev/zero of={FILL_FILE} bs=1M count=$((avail * {fill_percent} / 104857600))"
        );
        let output = self
            .docker
            .exec_sh(container, &script)
            .await
            .map_err(|e| HarnessError::Chaos(e.to_string()))?;
        if !output.success() {
            return Err(HarnessError::Chaos(format!(
                "disk fill failed in {container}: {}",
                output.stderr
            )));
        }
        info!(container, fill_percent, "disk pressure injected");
        Ok(json!({ "container": container, "path": FILL_FILE }))
    }

    async fn cleanup(&self, metadata: &Value) -> Result<(), HarnessError> {
        let Some(container) = metadata.get("container").and_then(Value::as_str) else {
            return Ok(());
        };
        let path = metadata
            .get("path")
            .and_then(Value::as_str)
            .unwrap_or(FILL_FILE);
        self.docker
            .exec_sh(container, &format!("rm -f {path}"))
            .await
            .map_err(|e| HarnessError::Chaos(e.to_string()))?;
        Ok(())
    }
}

/// Install DROP rules both directions between a container and its peers.
pub struct NetworkPartitionChaos {
    docker: ContainerManager,
}

#[async_trait]
impl ChaosInjector for NetworkPartitionChaos {
    fn kind(&self) -> ChaosKind {
        ChaosKind::NetworkPartition
    }

    async fn inject(&self, params: &HashMap<String, Value>) -> Result<Value, HarnessError> {
        validate_params(self.kind(), params)?;
        let container = require_str(params, "container")?;
        let peers: Vec<String> = params
            .get("peers")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(ToOwned::to_owned)
                    .collect()
            })
            .unwrap_or_default();

        let mut peer_ips = Vec::with_capacity(peers.len());
        for peer in &peers {
            let ip = self
                .docker
                .ip_address(peer)
                .await
                .map_err(|e| HarnessError::Chaos(e.to_string()))?;
            let script = format!(
                "iptables -A INPUT -s {ip} -j DROP && iptables -A OUTPUT -d {ip} -j DROP"
            );
            let output = self
                .docker
                .exec_sh(container, &script)
                .await
                .map_err(|e| HarnessError::Chaos(e.to_string()))?;
            if !output.success() {
                return Err(HarnessError::Chaos(format!(
                    "iptables failed in {container}: {}",
                    output.stderr
                )));
            }
            peer_ips.push(ip);
        }
        info!(container, peers = peers.len(), "partition installed");
        Ok(json!({ "container": container, "peer_ips": peer_ips }))
    }

    async fn cleanup(&self, metadata: &Value) -> Result<(), HarnessError> {
        let Some(container) = metadata.get("container").and_then(Value::as_str) else {
            return Ok(());
        };
        let peer_ips: Vec<&str> = metadata
            .get("peer_ips")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();

        for ip in peer_ips {
            let script = format!(
                "iptables -D INPUT -s {ip} -j DROP; iptables -D OUTPUT -d {ip} -j DROP; true"
            );
            if let Err(e) = self.docker.exec_sh(container, &script).await {
                warn!(container, ip, error = %e, "partition cleanup failed");
            }
        }
        Ok(())
    }
}

/// Maps chaos kinds to injectors.
#[derive(Default, Clone)]
pub struct ChaosRegistry {
    injectors: HashMap<ChaosKind, Arc<dyn ChaosInjector>>,
}

impl ChaosRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The full docker-backed set plus the baseline.
    #[must_use]
    pub fn docker(docker: &ContainerManager) -> Self {
        let mut registry = Self::new();
        registry.insert(Arc::new(NoneChaos));
        registry.insert(Arc::new(NodeKillChaos {
            docker: docker.clone(),
        }));
        registry.insert(Arc::new(LatencyChaos {
            docker: docker.clone(),
        }));
        registry.insert(Arc::new(DiskPressureChaos {
            docker: docker.clone(),
        }));
        registry.insert(Arc::new(NetworkPartitionChaos {
            docker: docker.clone(),
        }));
        registry
    }

    pub fn insert(&mut self, injector: Arc<dyn ChaosInjector>) {
        self.injectors.insert(injector.kind(), injector);
    }

    pub fn get(&self, kind: ChaosKind) -> Result<Arc<dyn ChaosInjector>, HarnessError> {
        self.injectors
            .get(&kind)
            .cloned()
            .ok_or_else(|| HarnessError::Chaos(format!("no injector registered for {kind}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), v.clone()))
            .collect()
    }

    #[test]
    fn latency_validation_orders_bounds() {
        let ok = params(&[
            ("container", json!("rl-0")),
            ("min_ms", json!(50)),
            ("max_ms", json!(100)),
        ]);
        assert!(validate_params(ChaosKind::Latency, &ok).is_ok());

        let swapped = params(&[
            ("container", json!("rl-0")),
            ("min_ms", json!(100)),
            ("max_ms", json!(50)),
        ]);
        assert!(validate_params(ChaosKind::Latency, &swapped).is_err());
    }

    #[test]
    fn fill_percent_bounds_are_enforced() {
        for (value, ok) in [(0u64, false), (1, true), (99, true), (100, false)] {
            let p = params(&[
                ("container", json!("kv-0")),
                ("fill_percent", json!(value)),
            ]);
            assert_eq!(validate_params(ChaosKind::DiskPressure, &p).is_ok(), ok, "{value}");
        }
    }

    #[test]
    fn partition_needs_peers() {
        let empty = params(&[("container", json!("kv-0")), ("peers", json!([]))]);
        assert!(validate_params(ChaosKind::NetworkPartition, &empty).is_err());

        let ok = params(&[
            ("container", json!("kv-0")),
            ("peers", json!(["kv-1", "kv-2"])),
        ]);
        assert!(validate_params(ChaosKind::NetworkPartition, &ok).is_ok());
    }

    #[test]
    fn registry_rejects_unknown_kind() {
        let registry = ChaosRegistry::new();
        assert!(registry.get(ChaosKind::NodeKill).is_err());
    }

    #[tokio::test]
    async fn baseline_injector_is_inert() {
        let chaos = NoneChaos;
        let metadata = chaos.inject(&HashMap::new()).await.unwrap();
        assert_eq!(metadata, Value::Null);
        chaos.cleanup(&metadata).await.unwrap();
    }
}
