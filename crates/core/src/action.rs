use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// How risky an action is if executed against a healthy cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

/// Declared shape of one action parameter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamSpec {
    /// Parameter type name (`string`, `integer`, `number`, `boolean`).
    #[serde(rename = "type")]
    pub ty: String,
    pub description: String,
    #[serde(default)]
    pub required: bool,
}

/// A remediation action a subject exposes to operators and agents.
///
/// Definitions are static per subject; execution is fire-and-forget through
/// [`Subject::execute_action`](https://docs.rs/vigil-subject).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionDefinition {
    pub name: String,
    pub description: String,
    /// Parameter name to declared shape.
    #[serde(default)]
    pub params: HashMap<String, ParamSpec>,
    pub risk: RiskLevel,
    /// Advisory flag recorded in the catalog; the v3 core does not gate on it.
    #[serde(default)]
    pub requires_approval: bool,
}

impl ActionDefinition {
    /// Validate a parameter map against this definition: every required
    /// parameter present, no unknown parameters.
    pub fn validate_params(&self, params: &serde_json::Value) -> Result<(), String> {
        let empty = serde_json::Map::new();
        let map = match params {
            serde_json::Value::Object(map) => map,
            serde_json::Value::Null => &empty,
            other => return Err(format!("params must be an object, got {other}")),
        };

        for (name, spec) in &self.params {
            if spec.required && !map.contains_key(name) {
                return Err(format!("missing required parameter `{name}`"));
            }
        }
        for name in map.keys() {
            if !self.params.contains_key(name) {
                return Err(format!("unknown parameter `{name}`"));
            }
        }
        Ok(())
    }
}

/// A service-level objective declared by a subject, informational only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Slo {
    pub name: String,
    pub description: String,
}

/// Informational descriptor returned by `Subject::config()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubjectConfig {
    pub name: String,
    #[serde(default)]
    pub slos: Vec<Slo>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn restart_node() -> ActionDefinition {
        let mut params = HashMap::new();
        params.insert(
            "node".to_owned(),
            ParamSpec {
                ty: "string".into(),
                description: "node id to restart".into(),
                required: true,
            },
        );
        ActionDefinition {
            name: "restart_node".into(),
            description: "Restart one node".into(),
            params,
            risk: RiskLevel::Medium,
            requires_approval: false,
        }
    }

    #[test]
    fn validate_accepts_complete_params() {
        assert!(restart_node().validate_params(&json!({"node": "n1"})).is_ok());
    }

    #[test]
    fn validate_rejects_missing_required() {
        let err = restart_node().validate_params(&json!({})).unwrap_err();
        assert!(err.contains("node"));
    }

    #[test]
    fn validate_rejects_unknown() {
        let err = restart_node()
            .validate_params(&json!({"node": "n1", "force": true}))
            .unwrap_err();
        assert!(err.contains("force"));
    }
}
