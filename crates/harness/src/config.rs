//! Campaign configuration document (YAML).

use std::collections::HashMap;

use serde::Deserialize;

use vigil_core::{CampaignSpec, ChaosKind, ChaosSpec};

use crate::chaos::validate_params;
use crate::error::HarnessError;

const MAX_PARALLEL: u32 = 10;

fn default_trials() -> u32 {
    1
}
fn default_parallel() -> u32 {
    1
}

/// On-disk campaign document, pre-validation.
#[derive(Debug, Deserialize)]
struct CampaignFile {
    name: String,
    subjects: Vec<String>,
    chaos_types: Vec<ChaosSpec>,
    #[serde(default = "default_trials")]
    trials_per_combination: u32,
    #[serde(default = "default_parallel")]
    parallel: u32,
    #[serde(default)]
    cooldown_seconds: u64,
    #[serde(default)]
    include_baseline: bool,
}

/// Parse and structurally validate a campaign YAML document.
///
/// Subject-dependent validation (is each chaos type supported?) happens in
/// [`validate_support`] once the subjects are constructed.
pub fn parse_campaign(yaml: &str) -> Result<CampaignSpec, HarnessError> {
    let file: CampaignFile =
        serde_yaml_ng::from_str(yaml).map_err(|e| HarnessError::Config(e.to_string()))?;

    if file.subjects.is_empty() {
        return Err(HarnessError::Config("subjects must not be empty".into()));
    }
    if file.chaos_types.is_empty() && !file.include_baseline {
        return Err(HarnessError::Config(
            "chaos_types must not be empty unless include_baseline is set".into(),
        ));
    }
    if !(1..=MAX_PARALLEL).contains(&file.parallel) {
        return Err(HarnessError::Config(format!(
            "parallel must be in [1, {MAX_PARALLEL}], got {}",
            file.parallel
        )));
    }
    if file.trials_per_combination == 0 {
        return Err(HarnessError::Config(
            "trials_per_combination must be at least 1".into(),
        ));
    }
    for chaos in &file.chaos_types {
        validate_params(chaos.kind, &chaos.params)?;
    }

    Ok(CampaignSpec {
        name: file.name,
        subjects: file.subjects,
        chaos_types: file.chaos_types,
        trials_per_combination: file.trials_per_combination,
        parallel: file.parallel,
        cooldown_seconds: file.cooldown_seconds,
        include_baseline: file.include_baseline,
    })
}

/// Check that every configured chaos type is supported by every listed
/// subject.
pub fn validate_support(
    spec: &CampaignSpec,
    supported: &HashMap<String, Vec<ChaosKind>>,
) -> Result<(), HarnessError> {
    for subject in &spec.subjects {
        let kinds = supported.get(subject).ok_or_else(|| {
            HarnessError::Config(format!("unknown subject `{subject}` in campaign"))
        })?;
        for chaos in &spec.chaos_types {
            if chaos.kind != ChaosKind::None && !kinds.contains(&chaos.kind) {
                return Err(HarnessError::Config(format!(
                    "subject `{subject}` does not support chaos type `{}`",
                    chaos.kind
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MATRIX_YAML: &str = r"
name: latency-and-kill
subjects: [ratelimiter, kvstore]
chaos_types:
  - type: latency
    params: {container: rl-0, min_ms: 50, max_ms: 100}
  - type: node_kill
    params: {container: rl-1}
trials_per_combination: 2
parallel: 2
";

    #[test]
    fn parses_with_defaults() {
        let spec = parse_campaign(MATRIX_YAML).unwrap();
        assert_eq!(spec.name, "latency-and-kill");
        assert_eq!(spec.subjects.len(), 2);
        assert_eq!(spec.chaos_types.len(), 2);
        assert_eq!(spec.trials_per_combination, 2);
        assert_eq!(spec.parallel, 2);
        assert_eq!(spec.cooldown_seconds, 0);
        assert!(!spec.include_baseline);
        // The classic matrix: 2 subjects x 2 chaos x 2 repeats.
        assert_eq!(spec.expand().len(), 8);
    }

    #[test]
    fn parallel_out_of_range_is_rejected() {
        let yaml = MATRIX_YAML.replace("parallel: 2", "parallel: 11");
        assert!(parse_campaign(&yaml).is_err());
        let yaml = MATRIX_YAML.replace("parallel: 2", "parallel: 0");
        assert!(parse_campaign(&yaml).is_err());
    }

    #[test]
    fn chaos_params_are_type_checked() {
        let yaml = MATRIX_YAML.replace("min_ms: 50", "min_ms: 500");
        let err = parse_campaign(&yaml).unwrap_err();
        assert!(err.to_string().contains("min_ms"));
    }

    #[test]
    fn unsupported_chaos_fails_support_validation() {
        let spec = parse_campaign(MATRIX_YAML).unwrap();
        let mut supported = HashMap::new();
        supported.insert(
            "ratelimiter".to_owned(),
            vec![ChaosKind::Latency, ChaosKind::NodeKill],
        );
        supported.insert("kvstore".to_owned(), vec![ChaosKind::Latency]);

        let err = validate_support(&spec, &supported).unwrap_err();
        assert!(err.to_string().contains("kvstore"));

        supported
            .get_mut("kvstore")
            .unwrap()
            .push(ChaosKind::NodeKill);
        assert!(validate_support(&spec, &supported).is_ok());
    }

    #[test]
    fn empty_subjects_rejected() {
        let yaml = "name: x\nsubjects: []\nchaos_types:\n  - type: node_kill\n    params: {container: a}\n";
        assert!(parse_campaign(yaml).is_err());
    }
}
