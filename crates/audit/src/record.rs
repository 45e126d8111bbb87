use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Conversation role an audit entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryRole {
    System,
    User,
    Assistant,
    Tool,
}

impl EntryRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "system" => Some(Self::System),
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            "tool" => Some(Self::Tool),
            _ => None,
        }
    }
}

/// What kind of event an audit entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Message,
    ToolCall,
    ToolResult,
    Summary,
}

impl EntryKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::ToolCall => "tool_call",
            Self::ToolResult => "tool_result",
            Self::Summary => "summary",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "message" => Some(Self::Message),
            "tool_call" => Some(Self::ToolCall),
            "tool_result" => Some(Self::ToolResult),
            "summary" => Some(Self::Summary),
            _ => None,
        }
    }
}

/// One append-only record in a session's history.
///
/// `seq` is assigned by the store at write time and is strictly increasing
/// within a session with no gaps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub session_id: String,
    pub seq: i64,
    pub ts: DateTime<Utc>,
    pub role: EntryRole,
    pub kind: EntryKind,
    /// Opaque JSON payload, redacted before it ever reaches storage.
    pub payload: serde_json::Value,
    pub tool_name: Option<String>,
    pub tool_params: Option<serde_json::Value>,
    pub tool_result: Option<serde_json::Value>,
}

impl AuditEntry {
    /// A plain message entry (seq filled in by the store).
    #[must_use]
    pub fn message(session_id: &str, role: EntryRole, payload: serde_json::Value) -> Self {
        Self {
            session_id: session_id.to_owned(),
            seq: 0,
            ts: Utc::now(),
            role,
            kind: EntryKind::Message,
            payload,
            tool_name: None,
            tool_params: None,
            tool_result: None,
        }
    }

    /// A tool-call entry carrying the model's requested invocation.
    #[must_use]
    pub fn tool_call(
        session_id: &str,
        tool_name: &str,
        call_id: &str,
        params: serde_json::Value,
    ) -> Self {
        Self {
            session_id: session_id.to_owned(),
            seq: 0,
            ts: Utc::now(),
            role: EntryRole::Assistant,
            kind: EntryKind::ToolCall,
            payload: serde_json::json!({ "tool_use_id": call_id }),
            tool_name: Some(tool_name.to_owned()),
            tool_params: Some(params),
            tool_result: None,
        }
    }

    /// A tool-result entry carrying the captured outcome.
    #[must_use]
    pub fn tool_result(
        session_id: &str,
        tool_name: &str,
        call_id: &str,
        result: serde_json::Value,
    ) -> Self {
        Self {
            session_id: session_id.to_owned(),
            seq: 0,
            ts: Utc::now(),
            role: EntryRole::Tool,
            kind: EntryKind::ToolResult,
            payload: serde_json::json!({ "tool_use_id": call_id }),
            tool_name: Some(tool_name.to_owned()),
            tool_params: None,
            tool_result: Some(result),
        }
    }

    /// An end-of-session summary entry.
    #[must_use]
    pub fn summary(session_id: &str, text: &str) -> Self {
        Self {
            session_id: session_id.to_owned(),
            seq: 0,
            ts: Utc::now(),
            role: EntryRole::Assistant,
            kind: EntryKind::Summary,
            payload: serde_json::json!({ "summary": text }),
            tool_name: None,
            tool_params: None,
            tool_result: None,
        }
    }

    /// The tool-use id this entry refers to, if any.
    pub fn tool_use_id(&self) -> Option<&str> {
        self.payload.get("tool_use_id").and_then(serde_json::Value::as_str)
    }
}

/// Session metadata; entries live in their own table keyed by `(session, seq)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditSession {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Terminal outcome label (`completed`, `timeout`, …); set once at end.
    pub outcome: Option<String>,
}

/// New session id: UTC timestamp plus 8 hex characters of randomness.
#[must_use]
pub fn session_id() -> String {
    let stamp = Utc::now().format("%Y%m%dT%H%M%SZ");
    let random = Uuid::new_v4().simple().to_string();
    format!("{stamp}-{}", &random[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_ids_carry_timestamp_and_random_suffix() {
        let id = session_id();
        let (stamp, random) = id.split_once('-').unwrap();
        assert!(stamp.ends_with('Z'));
        assert_eq!(random.len(), 8);
        assert_ne!(session_id(), id);
    }

    #[test]
    fn tool_entries_link_by_use_id() {
        let call = AuditEntry::tool_call("s", "shell", "toolu_1", serde_json::json!({}));
        let result = AuditEntry::tool_result("s", "shell", "toolu_1", serde_json::json!({}));
        assert_eq!(call.tool_use_id(), Some("toolu_1"));
        assert_eq!(call.tool_use_id(), result.tool_use_id());
        assert_eq!(call.kind, EntryKind::ToolCall);
        assert_eq!(result.role, EntryRole::Tool);
    }
}
