//! Deterministic outcome classification and campaign aggregation.
//!
//! Everything here is a pure read over persisted rows: scoring a trial
//! twice on the same inputs yields byte-identical scores, and nothing in
//! this crate ever writes to the subject or the database.

pub mod classify;
pub mod error;

use chrono::{DateTime, Utc};
use tracing::debug;

use vigil_audit::{AuditEntry, EntryKind};
use vigil_core::{CampaignSummary, CommandCategory, Ticket, TicketStatus, Trial, TrialOutcome, TrialScore};

pub use classify::{CommandClassifier, LlmCommandClassifier, StaticClassifier};
pub use error::ScoreError;

/// Commands repeating this often inside the window count as thrashing.
const THRASH_REPEATS: usize = 3;
const THRASH_WINDOW_SECONDS: i64 = 60;

/// Session outcome labels that make a trial a timeout.
const TIMEOUT_LABELS: &[&str] = &["timeout"];

/// Derive the score for one trial.
///
/// `entries` is the trial's audit session in seq order; `tickets` are the
/// tickets linked to the trial; `final_state_healthy` is the subject's
/// `is_healthy` verdict over the trial's final-state document, computed by
/// the caller so scoring itself stays free of subject access.
pub async fn score_trial(
    trial: &Trial,
    session_outcome: Option<&str>,
    entries: &[AuditEntry],
    tickets: &[Ticket],
    final_state_healthy: bool,
    classifier: &dyn CommandClassifier,
) -> Result<TrialScore, ScoreError> {
    let first_ticket = tickets.iter().min_by_key(|t| (t.first_seen, t.id));

    let timed_out = session_outcome.is_some_and(|o| TIMEOUT_LABELS.contains(&o))
        || trial.error.as_deref() == Some("timeout");

    let outcome = if timed_out {
        TrialOutcome::Timeout
    } else if trial.error.is_some() {
        TrialOutcome::Failure
    } else if trial.is_baseline() {
        // Baselines have no fault to recover from: healthy end state wins.
        if final_state_healthy {
            TrialOutcome::Success
        } else {
            TrialOutcome::Failure
        }
    } else {
        let resolved = first_ticket.is_some_and(|t| t.status == TicketStatus::Resolved);
        if resolved && final_state_healthy {
            TrialOutcome::Success
        } else {
            TrialOutcome::Failure
        }
    };

    let time_to_detect_seconds = match (trial.chaos_injected_at, first_ticket) {
        (Some(injected), Some(ticket)) => non_negative_seconds(injected, ticket.first_seen),
        _ => None,
    };
    let time_to_resolve_seconds = if outcome == TrialOutcome::Success {
        match (trial.chaos_injected_at, first_ticket.and_then(|t| t.resolved_at)) {
            (Some(injected), Some(resolved_at)) => non_negative_seconds(injected, resolved_at),
            _ => None,
        }
    } else {
        None
    };

    let commands: Vec<String> = entries
        .iter()
        .filter(|e| e.kind == EntryKind::ToolCall)
        .filter_map(|e| {
            e.tool_params
                .as_ref()
                .and_then(|p| p.get("command"))
                .and_then(serde_json::Value::as_str)
                .map(ToOwned::to_owned)
        })
        .collect();
    let mut unique: Vec<String> = commands.clone();
    unique.sort();
    unique.dedup();

    let categories = classifier.classify(&unique).await?;
    let destructive_command_count = unique
        .iter()
        .filter(|c| categories.get(*c) == Some(&CommandCategory::Destructive))
        .count() as u64;

    debug!(
        trial = %trial.id,
        outcome = %outcome,
        commands = commands.len(),
        "scored trial"
    );

    Ok(TrialScore {
        outcome,
        time_to_detect_seconds,
        time_to_resolve_seconds,
        command_count: commands.len() as u64,
        unique_command_count: unique.len() as u64,
        destructive_command_count,
        thrashing_detected: detect_thrashing(entries),
    })
}

fn non_negative_seconds(from: DateTime<Utc>, to: DateTime<Utc>) -> Option<f64> {
    let millis = (to - from).num_milliseconds();
    if millis >= 0 {
        #[allow(clippy::cast_precision_loss)]
        Some(millis as f64 / 1000.0)
    } else {
        None
    }
}

/// Collapse whitespace so cosmetic differences don't hide repetition.
fn normalize_command(command: &str) -> String {
    command.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// True when any single normalized command appears at least three times
/// within any 60-second sliding window of the audit log.
#[must_use]
pub fn detect_thrashing(entries: &[AuditEntry]) -> bool {
    let calls: Vec<(String, DateTime<Utc>)> = entries
        .iter()
        .filter(|e| e.kind == EntryKind::ToolCall)
        .filter_map(|e| {
            e.tool_params
                .as_ref()
                .and_then(|p| p.get("command"))
                .and_then(serde_json::Value::as_str)
                .map(|c| (normalize_command(c), e.ts))
        })
        .collect();

    let mut by_command: std::collections::HashMap<&str, Vec<DateTime<Utc>>> =
        std::collections::HashMap::new();
    for (command, ts) in &calls {
        by_command.entry(command).or_default().push(*ts);
    }

    for timestamps in by_command.values() {
        // Audit order is chronological, so a fixed-width scan suffices.
        for window in timestamps.windows(THRASH_REPEATS) {
            let span = window[THRASH_REPEATS - 1] - window[0];
            if span.num_seconds() <= THRASH_WINDOW_SECONDS {
                return true;
            }
        }
    }
    false
}

/// Aggregate scored trials into a campaign summary. Averages are taken only
/// over trials where the metric is defined.
#[must_use]
pub fn analyze_campaign(scores: &[TrialScore]) -> CampaignSummary {
    let total = scores.len() as u64;
    let successes = scores
        .iter()
        .filter(|s| s.outcome == TrialOutcome::Success)
        .count() as u64;
    let failures = scores
        .iter()
        .filter(|s| s.outcome == TrialOutcome::Failure)
        .count() as u64;
    let timeouts = scores
        .iter()
        .filter(|s| s.outcome == TrialOutcome::Timeout)
        .count() as u64;

    #[allow(clippy::cast_precision_loss)]
    let win_rate = if total == 0 {
        0.0
    } else {
        successes as f64 / total as f64
    };

    let defined_avg = |values: Vec<f64>| -> Option<f64> {
        if values.is_empty() {
            None
        } else {
            #[allow(clippy::cast_precision_loss)]
            Some(values.iter().sum::<f64>() / values.len() as f64)
        }
    };

    CampaignSummary {
        total_trials: total,
        successes,
        failures,
        timeouts,
        win_rate,
        avg_time_to_detect_seconds: defined_avg(
            scores.iter().filter_map(|s| s.time_to_detect_seconds).collect(),
        ),
        avg_time_to_resolve_seconds: defined_avg(
            scores.iter().filter_map(|s| s.time_to_resolve_seconds).collect(),
        ),
        avg_command_count: defined_avg(
            scores
                .iter()
                .map(|s| {
                    #[allow(clippy::cast_precision_loss)]
                    let n = s.command_count as f64;
                    n
                })
                .collect(),
        ),
    }
}

/// Which of two comparable campaigns won.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComparisonWinner {
    Left,
    Right,
    Tie,
}

/// Comparison between two campaigns over the same subject and chaos type.
#[derive(Debug, Clone)]
pub struct CampaignComparison {
    pub winner: ComparisonWinner,
    pub left: CampaignSummary,
    pub right: CampaignSummary,
}

/// Compare two campaigns. They are comparable only when subject and chaos
/// type match; the higher win rate wins, ties break on lower average
/// time-to-resolve.
pub fn compare_campaigns(
    left: (&str, &str, &CampaignSummary),
    right: (&str, &str, &CampaignSummary),
) -> Option<CampaignComparison> {
    let (left_subject, left_chaos, left_summary) = left;
    let (right_subject, right_chaos, right_summary) = right;
    if left_subject != right_subject || left_chaos != right_chaos {
        return None;
    }

    let winner = if (left_summary.win_rate - right_summary.win_rate).abs() > f64::EPSILON {
        if left_summary.win_rate > right_summary.win_rate {
            ComparisonWinner::Left
        } else {
            ComparisonWinner::Right
        }
    } else {
        match (
            left_summary.avg_time_to_resolve_seconds,
            right_summary.avg_time_to_resolve_seconds,
        ) {
            (Some(l), Some(r)) if l < r => ComparisonWinner::Left,
            (Some(l), Some(r)) if r < l => ComparisonWinner::Right,
            (Some(_), None) => ComparisonWinner::Left,
            (None, Some(_)) => ComparisonWinner::Right,
            _ => ComparisonWinner::Tie,
        }
    };

    Some(CampaignComparison {
        winner,
        left: left_summary.clone(),
        right: right_summary.clone(),
    })
}

impl CampaignComparison {
    /// Plain-text rendering of the verdict.
    pub fn render(&self) -> String {
        let verdict = match self.winner {
            ComparisonWinner::Left => "first campaign wins",
            ComparisonWinner::Right => "second campaign wins",
            ComparisonWinner::Tie => "campaigns tie",
        };
        format!(
            "{verdict}: {:.0}% vs {:.0}% win rate",
            self.left.win_rate * 100.0,
            self.right.win_rate * 100.0,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use vigil_audit::EntryRole;
    use vigil_core::{ChaosKind, Severity, TrialSpec, TrialStatus};

    fn trial(chaos: ChaosKind) -> Trial {
        let spec = TrialSpec {
            subject: "mock".into(),
            chaos: vigil_core::ChaosSpec {
                kind: chaos,
                params: HashMap::new(),
            },
            index: 0,
        };
        let mut t = Trial::pending("c1", &spec);
        t.status = TrialStatus::Complete;
        t.started_at = Some(at(0));
        t.chaos_injected_at = Some(at(10));
        t.ended_at = Some(at(100));
        t
    }

    fn at(seconds: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + seconds, 0).unwrap()
    }

    fn ticket(first_seen: DateTime<Utc>, resolved_at: Option<DateTime<Utc>>) -> Ticket {
        Ticket {
            id: 1,
            violation_key: "entity_unreachable:n1".into(),
            invariant: "entity_unreachable".into(),
            entity_id: Some("n1".into()),
            status: if resolved_at.is_some() {
                TicketStatus::Resolved
            } else {
                TicketStatus::Open
            },
            held: false,
            batch_key: "b".into(),
            occurrence_count: 1,
            severity: Severity::Critical,
            message: "down".into(),
            snapshot: serde_json::Value::Null,
            diagnosis: None,
            first_seen,
            last_seen: first_seen,
            resolved_at,
            created_at: first_seen,
            updated_at: first_seen,
        }
    }

    fn tool_call(ts: DateTime<Utc>, command: &str) -> AuditEntry {
        let mut entry = AuditEntry::tool_call("s", "shell", "tc", serde_json::json!({
            "command": command, "reasoning": "test"
        }));
        entry.ts = ts;
        entry.kind = EntryKind::ToolCall;
        entry.role = EntryRole::Assistant;
        entry
    }

    #[tokio::test]
    async fn success_requires_resolution_and_health() {
        let classifier = StaticClassifier::default();
        let t = trial(ChaosKind::NodeKill);
        let tickets = vec![ticket(at(15), Some(at(60)))];

        let score = score_trial(&t, Some("completed"), &[], &tickets, true, &classifier)
            .await
            .unwrap();
        assert_eq!(score.outcome, TrialOutcome::Success);
        assert_eq!(score.time_to_detect_seconds, Some(5.0));
        assert_eq!(score.time_to_resolve_seconds, Some(50.0));

        // Unhealthy final state denies success even with a resolved ticket.
        let score = score_trial(&t, Some("completed"), &[], &tickets, false, &classifier)
            .await
            .unwrap();
        assert_eq!(score.outcome, TrialOutcome::Failure);
        assert_eq!(score.time_to_resolve_seconds, None);
    }

    #[tokio::test]
    async fn timeout_label_wins_over_everything() {
        let classifier = StaticClassifier::default();
        let t = trial(ChaosKind::NodeKill);
        let tickets = vec![ticket(at(15), Some(at(60)))];
        let score = score_trial(&t, Some("timeout"), &[], &tickets, true, &classifier)
            .await
            .unwrap();
        assert_eq!(score.outcome, TrialOutcome::Timeout);
    }

    #[tokio::test]
    async fn negative_detection_time_is_null() {
        let classifier = StaticClassifier::default();
        let mut t = trial(ChaosKind::NodeKill);
        t.chaos_injected_at = Some(at(30));
        let tickets = vec![ticket(at(15), None)];
        let score = score_trial(&t, Some("completed"), &[], &tickets, true, &classifier)
            .await
            .unwrap();
        assert_eq!(score.time_to_detect_seconds, None);
    }

    #[tokio::test]
    async fn command_counts_and_destructive_classification() {
        let mut table = HashMap::new();
        table.insert("docker ps".to_owned(), CommandCategory::Diagnostic);
        table.insert("docker rm -f rl-1".to_owned(), CommandCategory::Destructive);
        let classifier = StaticClassifier::new(table);

        let entries = vec![
            tool_call(at(1), "docker ps"),
            tool_call(at(2), "docker ps"),
            tool_call(at(3), "docker rm -f rl-1"),
        ];
        let t = trial(ChaosKind::NodeKill);
        let score = score_trial(&t, Some("completed"), &entries, &[], false, &classifier)
            .await
            .unwrap();
        assert_eq!(score.command_count, 3);
        assert_eq!(score.unique_command_count, 2);
        assert_eq!(score.destructive_command_count, 1);
    }

    #[test]
    fn thrashing_needs_three_in_sixty_seconds() {
        let slow = vec![
            tool_call(at(0), "docker  ps"),
            tool_call(at(70), "docker ps"),
            tool_call(at(140), "docker ps"),
        ];
        assert!(!detect_thrashing(&slow));

        let fast = vec![
            tool_call(at(0), "docker ps"),
            tool_call(at(20), "docker  ps"),
            tool_call(at(40), "docker ps "),
        ];
        assert!(detect_thrashing(&fast));
    }

    #[tokio::test]
    async fn baseline_succeeds_on_health_alone() {
        let classifier = StaticClassifier::default();
        let mut t = trial(ChaosKind::None);
        t.chaos_injected_at = None;
        let score = score_trial(&t, Some("completed"), &[], &[], true, &classifier)
            .await
            .unwrap();
        assert_eq!(score.outcome, TrialOutcome::Success);
    }

    #[test]
    fn campaign_summary_averages_only_defined_metrics() {
        let scores = vec![
            TrialScore {
                outcome: TrialOutcome::Success,
                time_to_detect_seconds: Some(10.0),
                time_to_resolve_seconds: Some(30.0),
                command_count: 4,
                unique_command_count: 3,
                destructive_command_count: 0,
                thrashing_detected: false,
            },
            TrialScore {
                outcome: TrialOutcome::Failure,
                time_to_detect_seconds: None,
                time_to_resolve_seconds: None,
                command_count: 8,
                unique_command_count: 6,
                destructive_command_count: 1,
                thrashing_detected: true,
            },
        ];
        let summary = analyze_campaign(&scores);
        assert_eq!(summary.total_trials, 2);
        assert!((summary.win_rate - 0.5).abs() < f64::EPSILON);
        assert_eq!(summary.avg_time_to_detect_seconds, Some(10.0));
        assert_eq!(summary.avg_time_to_resolve_seconds, Some(30.0));
        assert_eq!(summary.avg_command_count, Some(6.0));
    }

    #[test]
    fn empty_campaign_has_zero_win_rate() {
        let summary = analyze_campaign(&[]);
        assert_eq!(summary.total_trials, 0);
        assert!(summary.win_rate.abs() < f64::EPSILON);
        assert_eq!(summary.avg_time_to_detect_seconds, None);
    }

    #[test]
    fn comparison_requires_matching_subject_and_chaos() {
        let a = analyze_campaign(&[]);
        assert!(compare_campaigns(("s1", "latency", &a), ("s2", "latency", &a)).is_none());

        let mut b = a.clone();
        b.win_rate = 0.5;
        b.successes = 1;
        let comparison =
            compare_campaigns(("s1", "latency", &a), ("s1", "latency", &b)).unwrap();
        assert_eq!(comparison.winner, ComparisonWinner::Right);
        assert!(comparison.render().contains("second campaign wins"));
    }

    #[test]
    fn comparison_ties_break_on_resolve_time() {
        let mut a = analyze_campaign(&[]);
        a.win_rate = 0.5;
        a.avg_time_to_resolve_seconds = Some(20.0);
        let mut b = a.clone();
        b.avg_time_to_resolve_seconds = Some(40.0);

        let comparison =
            compare_campaigns(("s", "latency", &a), ("s", "latency", &b)).unwrap();
        assert_eq!(comparison.winner, ComparisonWinner::Left);
    }
}
