//! Stateful invariant evaluation.
//!
//! The engine owns the per-key first-sighting map that implements grace
//! periods. State is in-memory only and lost on restart by design: flap
//! tracking is best-effort, and a restarted operator simply restarts the
//! grace clocks.

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;

use chrono::{DateTime, Utc};
use tracing::{error, warn};

use vigil_core::{InvariantViolation, Observation, violation_key};
use vigil_subject::InvariantChecker;

/// Grace-period engine over a subject-specific checker.
///
/// All reads and writes happen on the monitor's single worker; one `check`
/// call corresponds to one tick. Re-running `check` with the same
/// observation and clock yields the same violations.
#[derive(Debug, Default)]
pub struct InvariantEngine {
    /// Violation key to the instant the condition was first sighted.
    first_seen: HashMap<String, DateTime<Utc>>,
}

impl InvariantEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently inside their grace window or firing.
    pub fn tracked_keys(&self) -> usize {
        self.first_seen.len()
    }

    /// Evaluate every declared invariant against `obs` at instant `now`.
    ///
    /// A checker that returns an error or panics skips that invariant for
    /// this tick; its grace state is left untouched and the remaining
    /// invariants still run.
    pub fn check(
        &mut self,
        checker: &dyn InvariantChecker,
        obs: &Observation,
        now: DateTime<Utc>,
    ) -> Vec<InvariantViolation> {
        let mut violations = Vec::new();
        let mut sighted: HashSet<String> = HashSet::new();
        let mut evaluated: HashSet<String> = HashSet::new();

        for config in checker.invariants().to_vec() {
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
                checker.evaluate(&config.name, obs)
            }));
            let conditions = match result {
                Ok(Ok(conditions)) => conditions,
                Ok(Err(e)) => {
                    warn!(invariant = %config.name, error = %e, "invariant evaluation failed");
                    continue;
                }
                Err(_) => {
                    error!(invariant = %config.name, "invariant evaluation panicked");
                    continue;
                }
            };
            evaluated.insert(config.name.clone());

            let grace = chrono::Duration::from_std(config.grace)
                .unwrap_or(chrono::TimeDelta::MAX);
            for condition in conditions {
                let key = violation_key(&config.name, condition.entity_id.as_deref());
                let first = *self.first_seen.entry(key.clone()).or_insert(now);
                sighted.insert(key);
                if now - first >= grace {
                    violations.push(InvariantViolation {
                        invariant: config.name.clone(),
                        entity_id: condition.entity_id,
                        severity: config.severity,
                        message: condition.message,
                        first_seen: first,
                        last_seen: now,
                    });
                }
            }
        }

        // First clean sighting clears the key; the next violation restarts
        // the grace clock. Keys owned by invariants that failed to evaluate
        // this tick keep their state.
        self.first_seen.retain(|key, _| {
            let invariant = key.split(':').next().unwrap_or(key);
            sighted.contains(key) || !evaluated.contains(invariant)
        });

        violations
    }
}
