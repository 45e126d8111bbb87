use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::invariant::Severity;

/// Lifecycle status of a ticket.
///
/// Status progresses monotonically in the declared order; `Resolved` is
/// terminal for a ticket row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    Open,
    Acknowledged,
    Diagnosed,
    Resolved,
}

impl TicketStatus {
    /// Database/text representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Acknowledged => "acknowledged",
            Self::Diagnosed => "diagnosed",
            Self::Resolved => "resolved",
        }
    }

    /// Parse the database representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(Self::Open),
            "acknowledged" => Some(Self::Acknowledged),
            "diagnosed" => Some(Self::Diagnosed),
            "resolved" => Some(Self::Resolved),
            _ => None,
        }
    }
}

impl std::fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persistent record of one violation across time.
///
/// At most one non-resolved ticket exists per violation key; recurrences
/// bump `occurrence_count` and `last_seen` instead of opening a new row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticket {
    /// Monotonic row id assigned by the store.
    pub id: i64,
    /// Deduplication key: `invariant` or `invariant:entity`.
    pub violation_key: String,
    /// Invariant name that opened the ticket.
    pub invariant: String,
    /// Entity the ticket applies to, if per-entity.
    pub entity_id: Option<String>,
    pub status: TicketStatus,
    /// When true, auto-resolve skips this ticket; explicit resolve still works.
    pub held: bool,
    /// Groups tickets created or updated by the same monitor tick.
    pub batch_key: String,
    /// Number of `open_or_update` calls since creation; at least 1.
    pub occurrence_count: i64,
    pub severity: Severity,
    pub message: String,
    /// Opaque observation snapshot captured when the ticket last fired.
    pub snapshot: serde_json::Value,
    /// Opaque diagnosis text attached by an agent or operator.
    pub diagnosis: Option<String>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Ticket {
    /// Whether the ticket still counts against the one-open-per-key invariant.
    pub fn is_open(&self) -> bool {
        self.status != TicketStatus::Resolved
    }

    /// One-line plain-text rendering: id, key, severity, status,
    /// occurrences, seen range, message.
    pub fn render_line(&self) -> String {
        format!(
            "#{} [{}] {} {} x{} {}..{} {}",
            self.id,
            self.severity,
            self.violation_key,
            self.status,
            self.occurrence_count,
            self.first_seen.format("%H:%M:%S"),
            self.last_seen.format("%H:%M:%S"),
            self.message,
        )
    }
}
