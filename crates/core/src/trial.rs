use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The parameterized fault kinds a trial can inject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChaosKind {
    /// Baseline: no fault injected.
    None,
    NodeKill,
    Latency,
    DiskPressure,
    NetworkPartition,
}

impl ChaosKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::NodeKill => "node_kill",
            Self::Latency => "latency",
            Self::DiskPressure => "disk_pressure",
            Self::NetworkPartition => "network_partition",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "none" => Some(Self::None),
            "node_kill" => Some(Self::NodeKill),
            "latency" => Some(Self::Latency),
            "disk_pressure" => Some(Self::DiskPressure),
            "network_partition" => Some(Self::NetworkPartition),
            _ => None,
        }
    }
}

impl std::fmt::Display for ChaosKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One chaos entry in a campaign configuration: kind plus parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChaosSpec {
    #[serde(rename = "type")]
    pub kind: ChaosKind,
    #[serde(default)]
    pub params: HashMap<String, serde_json::Value>,
}

impl ChaosSpec {
    /// A baseline spec with no fault.
    #[must_use]
    pub fn baseline() -> Self {
        Self {
            kind: ChaosKind::None,
            params: HashMap::new(),
        }
    }
}

/// One cell of the expanded campaign matrix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrialSpec {
    pub subject: String,
    pub chaos: ChaosSpec,
    /// Index within the campaign's expansion order.
    pub index: u32,
}

/// Execution status of a trial row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialStatus {
    Pending,
    Running,
    Complete,
    Failed,
}

impl TrialStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "complete" => Some(Self::Complete),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// A persisted record of one trial execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trial {
    pub id: String,
    pub campaign_id: String,
    pub subject: String,
    pub chaos_kind: ChaosKind,
    pub chaos_params: serde_json::Value,
    pub status: TrialStatus,
    pub started_at: Option<DateTime<Utc>>,
    /// When the fault landed; scoring measures detection from here.
    pub chaos_injected_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Everything cleanup needs, returned by the injector.
    pub chaos_metadata: serde_json::Value,
    /// Subject-defined state document captured after the agent ran.
    pub final_state: serde_json::Value,
    pub agent_session_id: Option<String>,
    /// Tickets opened during the trial window.
    pub ticket_ids: Vec<i64>,
    pub error: Option<String>,
}

impl Trial {
    /// A fresh pending row for one matrix cell.
    #[must_use]
    pub fn pending(campaign_id: &str, spec: &TrialSpec) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            campaign_id: campaign_id.to_owned(),
            subject: spec.subject.clone(),
            chaos_kind: spec.chaos.kind,
            chaos_params: serde_json::to_value(&spec.chaos.params)
                .unwrap_or(serde_json::Value::Null),
            status: TrialStatus::Pending,
            started_at: None,
            chaos_injected_at: None,
            ended_at: None,
            chaos_metadata: serde_json::Value::Null,
            final_state: serde_json::Value::Null,
            agent_session_id: None,
            ticket_ids: Vec::new(),
            error: None,
        }
    }

    /// Whether this trial was a baseline (no chaos).
    pub fn is_baseline(&self) -> bool {
        self.chaos_kind == ChaosKind::None
    }
}

/// Validated campaign configuration (the YAML document, post-validation).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignSpec {
    pub name: String,
    pub subjects: Vec<String>,
    pub chaos_types: Vec<ChaosSpec>,
    pub trials_per_combination: u32,
    pub parallel: u32,
    pub cooldown_seconds: u64,
    pub include_baseline: bool,
}

impl CampaignSpec {
    /// Expand the subject × chaos matrix in deterministic order, repeating
    /// each combination and appending one baseline per subject when asked.
    pub fn expand(&self) -> Vec<TrialSpec> {
        let mut specs = Vec::new();
        let mut index = 0u32;
        for subject in &self.subjects {
            for chaos in &self.chaos_types {
                for _ in 0..self.trials_per_combination {
                    specs.push(TrialSpec {
                        subject: subject.clone(),
                        chaos: chaos.clone(),
                        index,
                    });
                    index += 1;
                }
            }
        }
        if self.include_baseline {
            for subject in &self.subjects {
                specs.push(TrialSpec {
                    subject: subject.clone(),
                    chaos: ChaosSpec::baseline(),
                    index,
                });
                index += 1;
            }
        }
        specs
    }
}

/// A persisted campaign row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub config: serde_json::Value,
}

impl Campaign {
    #[must_use]
    pub fn new(spec: &CampaignSpec) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: spec.name.clone(),
            created_at: Utc::now(),
            config: serde_json::to_value(spec).unwrap_or(serde_json::Value::Null),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> CampaignSpec {
        CampaignSpec {
            name: "matrix".into(),
            subjects: vec!["a".into(), "b".into()],
            chaos_types: vec![
                ChaosSpec {
                    kind: ChaosKind::Latency,
                    params: HashMap::new(),
                },
                ChaosSpec {
                    kind: ChaosKind::NodeKill,
                    params: HashMap::new(),
                },
            ],
            trials_per_combination: 2,
            parallel: 2,
            cooldown_seconds: 0,
            include_baseline: false,
        }
    }

    #[test]
    fn matrix_expands_to_product_times_repeats() {
        let specs = spec().expand();
        assert_eq!(specs.len(), 8);
        // Deterministic order: subject-major, chaos next, repeats last.
        assert_eq!(specs[0].subject, "a");
        assert_eq!(specs[0].chaos.kind, ChaosKind::Latency);
        assert_eq!(specs[7].subject, "b");
        assert_eq!(specs[7].chaos.kind, ChaosKind::NodeKill);
        let indices: Vec<u32> = specs.iter().map(|s| s.index).collect();
        assert_eq!(indices, (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn baseline_appends_one_per_subject() {
        let mut s = spec();
        s.include_baseline = true;
        let specs = s.expand();
        assert_eq!(specs.len(), 10);
        assert!(specs[8].chaos.kind == ChaosKind::None);
        assert!(specs[9].chaos.kind == ChaosKind::None);
    }

    #[test]
    fn chaos_kind_round_trips() {
        for kind in [
            ChaosKind::None,
            ChaosKind::NodeKill,
            ChaosKind::Latency,
            ChaosKind::DiskPressure,
            ChaosKind::NetworkPartition,
        ] {
            assert_eq!(ChaosKind::parse(kind.as_str()), Some(kind));
        }
    }
}
