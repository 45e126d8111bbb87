use serde::{Deserialize, Serialize};

/// Final classification of a trial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialOutcome {
    Success,
    Failure,
    Timeout,
}

impl std::fmt::Display for TrialOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => f.write_str("success"),
            Self::Failure => f.write_str("failure"),
            Self::Timeout => f.write_str("timeout"),
        }
    }
}

/// Category assigned to a shell command by the deterministic classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandCategory {
    Diagnostic,
    Remediation,
    Destructive,
    Other,
}

/// Deterministic score derived from one trial's persisted rows.
///
/// Scores are pure reads over (trial, audit session, tickets); deriving one
/// never writes to the subject or the database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialScore {
    pub outcome: TrialOutcome,
    /// Seconds from chaos injection to the first ticket; `None` when
    /// undefined (no ticket, or negative clock skew).
    pub time_to_detect_seconds: Option<f64>,
    /// Seconds from chaos injection to resolution; only defined on success.
    pub time_to_resolve_seconds: Option<f64>,
    /// Total `tool_call` audit entries.
    pub command_count: u64,
    /// Distinct command strings.
    pub unique_command_count: u64,
    /// Commands the classifier labelled destructive.
    pub destructive_command_count: u64,
    /// Whether any normalized command repeated >= 3 times in a 60 s window.
    pub thrashing_detected: bool,
}

/// Aggregate over a campaign's scored trials.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CampaignSummary {
    pub total_trials: u64,
    pub successes: u64,
    pub failures: u64,
    pub timeouts: u64,
    /// successes / total, in `[0, 1]`; 0 for an empty campaign.
    pub win_rate: f64,
    /// Averages taken only over trials where the metric is defined.
    pub avg_time_to_detect_seconds: Option<f64>,
    pub avg_time_to_resolve_seconds: Option<f64>,
    pub avg_command_count: Option<f64>,
}

impl CampaignSummary {
    /// Plain-text one-paragraph rendering.
    pub fn render(&self) -> String {
        let mut out = format!(
            "{} trials: {} success / {} failure / {} timeout (win rate {:.0}%)",
            self.total_trials,
            self.successes,
            self.failures,
            self.timeouts,
            self.win_rate * 100.0,
        );
        if let Some(ttd) = self.avg_time_to_detect_seconds {
            out.push_str(&format!(", avg detect {ttd:.1}s"));
        }
        if let Some(ttr) = self.avg_time_to_resolve_seconds {
            out.push_str(&format!(", avg resolve {ttr:.1}s"));
        }
        out
    }
}
