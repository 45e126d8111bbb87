//! Secret redaction for audit payloads.
//!
//! Redaction happens structure-first: objects and arrays are recursed
//! before any key-name scrutiny, so a sensitive branch keeps its shape
//! while its leaves are masked. Redaction always runs before a payload is
//! serialized into storage, never at read time, and is idempotent.

use std::sync::LazyLock;

use regex::Regex;

const PLACEHOLDER: &str = "[REDACTED]";

/// Leaf values longer than this are candidates for the entropy detector.
const ENTROPY_MIN_LEN: usize = 24;

/// Bits per character above which a mixed-alphabet candidate is a secret.
/// English identifiers sit near 3.5 to 4.0; random base64 sits above 4.5.
const ENTROPY_THRESHOLD: f64 = 4.2;

/// Hex strings are capped at 4 bits per character, so they get their own
/// lower bar (random hex sits near 3.7 to 4.0).
const HEX_ENTROPY_THRESHOLD: f64 = 3.0;

/// Key names whose string values are masked outright.
const SENSITIVE_KEYS: &[&str] = &[
    "password",
    "secret",
    "token",
    "api_key",
    "apikey",
    "authorization",
    "access_key",
    "private_key",
    "credential",
];

/// Structural identifiers that the entropy detector must not eat: masking
/// them would break tool-call/result linkage in the audit log.
const STRUCTURAL_KEYS: &[&str] = &["tool_use_id", "session_id", "id"];

static ENV_ASSIGNMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\b([A-Z0-9_]*(?:API_?KEY|TOKEN|PASSWORD|SECRET)[A-Z0-9_]*)=("[^"]*"|'[^']*'|\S+)"#)
        .expect("env assignment regex")
});

static BEARER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(bearer)\s+[A-Za-z0-9\-._~+/=]+").expect("bearer regex")
});

static KNOWN_PREFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:sk|pk|ghp|gho|xox[baps]|AKIA)[A-Za-z0-9_\-]{6,}\b")
        .expect("known prefix regex")
});

static ENTROPY_CANDIDATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z0-9+/=_\-]{24,}").expect("entropy candidate regex"));

static HEX_CANDIDATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[0-9a-fA-F]{32,}\b").expect("hex candidate regex"));

/// Shannon entropy in bits per character.
fn shannon_entropy(s: &str) -> f64 {
    let len = s.chars().count();
    if len == 0 {
        return 0.0;
    }
    let mut counts = std::collections::HashMap::new();
    for c in s.chars() {
        *counts.entry(c).or_insert(0usize) += 1;
    }
    #[allow(clippy::cast_precision_loss)]
    counts
        .values()
        .map(|&count| {
            let p = count as f64 / len as f64;
            -p * p.log2()
        })
        .sum()
}

/// Masks secrets in JSON values before they reach the audit store.
#[derive(Debug, Default, Clone)]
pub struct Redactor;

impl Redactor {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Redact `value` in place.
    pub fn redact(&self, value: &mut serde_json::Value) {
        self.redact_inner(value, None);
    }

    /// Redact and return, for call sites that own the value.
    #[must_use]
    pub fn redacted(&self, mut value: serde_json::Value) -> serde_json::Value {
        self.redact(&mut value);
        value
    }

    fn redact_inner(&self, value: &mut serde_json::Value, key: Option<&str>) {
        match value {
            serde_json::Value::Object(map) => {
                for (k, v) in map.iter_mut() {
                    let key_lower = k.to_lowercase();
                    self.redact_inner(v, Some(&key_lower));
                }
            }
            serde_json::Value::Array(items) => {
                for item in items {
                    self.redact_inner(item, key);
                }
            }
            serde_json::Value::String(s) => {
                let sensitive_key = key.is_some_and(|k| {
                    SENSITIVE_KEYS.iter().any(|needle| k.contains(needle))
                });
                if sensitive_key {
                    *s = PLACEHOLDER.to_owned();
                } else {
                    let structural = key.is_some_and(|k| STRUCTURAL_KEYS.contains(&k));
                    *s = scrub_text(s, structural);
                }
            }
            _ => {
                // Sensitive keys mask non-string leaves too.
                if key.is_some_and(|k| SENSITIVE_KEYS.iter().any(|needle| k.contains(needle))) {
                    *value = serde_json::Value::String(PLACEHOLDER.to_owned());
                }
            }
        }
    }
}

/// Pattern-scrub one string leaf.
fn scrub_text(text: &str, skip_entropy: bool) -> String {
    let pass = ENV_ASSIGNMENT.replace_all(text, format!("${{1}}={PLACEHOLDER}"));
    let pass = BEARER.replace_all(&pass, format!("${{1}} {PLACEHOLDER}"));
    let pass = KNOWN_PREFIX.replace_all(&pass, PLACEHOLDER);
    if skip_entropy {
        return pass.into_owned();
    }
    let pass = HEX_CANDIDATE.replace_all(&pass, |caps: &regex::Captures<'_>| {
        let token = &caps[0];
        if shannon_entropy(token) >= HEX_ENTROPY_THRESHOLD {
            PLACEHOLDER.to_owned()
        } else {
            token.to_owned()
        }
    });
    ENTROPY_CANDIDATE
        .replace_all(&pass, |caps: &regex::Captures<'_>| {
            let token = &caps[0];
            if shannon_entropy(token) >= ENTROPY_THRESHOLD {
                PLACEHOLDER.to_owned()
            } else {
                token.to_owned()
            }
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn redact(value: serde_json::Value) -> serde_json::Value {
        Redactor::new().redacted(value)
    }

    #[test]
    fn bearer_token_is_masked_in_command_strings() {
        let value = json!({
            "cmd": "curl -H 'Authorization: Bearer sk_live_ABC123' https://x"
        });
        let out = redact(value);
        let cmd = out["cmd"].as_str().unwrap();
        assert_eq!(
            cmd,
            "curl -H 'Authorization: Bearer [REDACTED]' https://x"
        );
    }

    #[test]
    fn env_assignments_keep_the_variable_name() {
        let out = redact(json!({"cmd": "API_KEY=abc123 TOKEN=xyz ./run"}));
        assert_eq!(
            out["cmd"].as_str().unwrap(),
            "API_KEY=[REDACTED] TOKEN=[REDACTED] ./run"
        );
    }

    #[test]
    fn sensitive_keys_mask_values() {
        let out = redact(json!({
            "user": "alice",
            "password": "hunter2",
            "nested": {"api_key": 12345}
        }));
        assert_eq!(out["user"], "alice");
        assert_eq!(out["password"], PLACEHOLDER);
        assert_eq!(out["nested"]["api_key"], PLACEHOLDER);
    }

    #[test]
    fn high_entropy_tokens_are_masked_but_prose_survives() {
        let secret = "dGhpc0lzQVNlY3JldFZhbHVlMTIzNDU2Nzg5MA";
        let out = redact(json!({"log": format!("leaked credential {secret} in output")}));
        let log = out["log"].as_str().unwrap();
        assert!(log.contains(PLACEHOLDER));
        assert!(!log.contains(secret));

        // A long English word run is below the entropy bar.
        let out = redact(json!({"log": "reconfiguration_in_progress_now"}));
        assert_eq!(out["log"], "reconfiguration_in_progress_now");
    }

    #[test]
    fn structural_ids_survive_entropy_detection() {
        let out = redact(json!({"tool_use_id": "toolu_01H8KRXPD2ZQ4WVNBTGCAY7M"}));
        assert_eq!(out["tool_use_id"], "toolu_01H8KRXPD2ZQ4WVNBTGCAY7M");
    }

    #[test]
    fn redaction_is_idempotent() {
        let value = json!({
            "cmd": "curl -H 'Authorization: Bearer sk_live_ABC123' https://x",
            "password": "hunter2",
            "env": "SECRET=shh",
        });
        let once = redact(value);
        let twice = redact(once.clone());
        assert_eq!(once, twice);
    }

    #[test]
    fn arrays_are_recursed() {
        let out = redact(json!({"steps": [{"token": "abc"}, {"note": "fine"}]}));
        assert_eq!(out["steps"][0]["token"], PLACEHOLDER);
        assert_eq!(out["steps"][1]["note"], "fine");
    }

    #[test]
    fn entropy_math_is_sane() {
        assert!(shannon_entropy("") < 0.1);
        assert!(shannon_entropy("aaaaaaaaaaaa") < 0.1);
        // 24 distinct symbols: log2(24) ≈ 4.58 bits per character.
        assert!(shannon_entropy("aB3xQ9mZpL7vK2wT5nR8cD4f") > ENTROPY_THRESHOLD);
    }

    #[test]
    fn random_hex_is_masked() {
        let out = redact(json!({"log": "leaked 3f9a1c4e7b2d8f05a6c3e9d1b4f72a08 digest"}));
        let log = out["log"].as_str().unwrap();
        assert!(log.contains(PLACEHOLDER));
        // Low-entropy filler hex of the same length survives.
        let out = redact(json!({"log": "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa padding"}));
        assert_eq!(out["log"], "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa padding");
    }
}
