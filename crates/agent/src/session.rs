//! The bounded tool-calling conversation loop.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use vigil_audit::{AuditEntry, AuditStore, EntryRole};

use crate::error::{AgentError, ProviderError};
use crate::provider::{ChatMessage, ChatProvider, ChatResponse, ContentBlock, ToolSchema};
use crate::shell::{DEFAULT_SHELL_TIMEOUT, ShellTool};

/// Tuning for one agent session.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub system_prompt: String,
    /// Hard cap on model turns.
    pub max_turns: u32,
    /// Wall-clock limit per shell command.
    pub shell_timeout: Duration,
    /// Wall-clock limit for the whole session; `None` leaves cancellation
    /// to the caller's token.
    pub deadline: Option<Duration>,
    /// Total provider attempts per turn, including the first.
    pub provider_attempts: u32,
    /// Base delay for the provider retry backoff.
    pub provider_backoff: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            system_prompt: crate::prompt::DEFAULT_SYSTEM_PROMPT.to_owned(),
            max_turns: 20,
            shell_timeout: DEFAULT_SHELL_TIMEOUT,
            deadline: None,
            provider_attempts: 3,
            provider_backoff: Duration::from_millis(500),
        }
    }
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionLabel {
    /// The model returned a turn with no tool calls.
    Completed,
    /// The turn cap fired.
    MaxTurns,
    /// The deadline or an external cancellation fired.
    Timeout,
    /// The provider stayed unreachable past the retry budget.
    ProviderUnreachable,
}

impl SessionLabel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::MaxTurns => "max_turns",
            Self::Timeout => "timeout",
            Self::ProviderUnreachable => "provider_unreachable",
        }
    }
}

/// What a finished session looked like.
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub session_id: String,
    pub label: SessionLabel,
    pub turns: u32,
}

/// The JSON Schema the model sees for the `shell` tool.
#[must_use]
pub fn shell_tool_schema() -> ToolSchema {
    ToolSchema {
        name: "shell".into(),
        description: "Execute a shell command inside the operator sandbox. The sandbox has \
                      docker CLI access to the subject's containers. Output is captured and \
                      returned; a non-zero exit code is not an error."
            .into(),
        input_schema: json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The command to execute"
                },
                "reasoning": {
                    "type": "string",
                    "description": "Why this command is being run"
                }
            },
            "required": ["command", "reasoning"]
        }),
    }
}

/// One run of the conversation loop around a remote model.
///
/// Within a session everything is sequential: tool calls returned by one
/// turn execute in order, each audited before the next begins. Multiple
/// sessions may run concurrently; they share no state beyond the stores.
pub struct AgentSession {
    provider: Arc<dyn ChatProvider>,
    summarizer: Option<Arc<dyn ChatProvider>>,
    audit: Arc<AuditStore>,
    config: AgentConfig,
    shell: ShellTool,
}

impl AgentSession {
    #[must_use]
    pub fn new(provider: Arc<dyn ChatProvider>, audit: Arc<AuditStore>, config: AgentConfig) -> Self {
        let shell = ShellTool::new(config.shell_timeout);
        Self {
            provider,
            summarizer: None,
            audit,
            config,
            shell,
        }
    }

    /// Attach a cheaper model used only for the end-of-session summary.
    #[must_use]
    pub fn with_summarizer(mut self, summarizer: Arc<dyn ChatProvider>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    /// Run the session to termination. Every audit entry is flushed before
    /// this returns; an audit write failure aborts immediately.
    pub async fn run(
        &self,
        initial_context: &str,
        cancel: &CancellationToken,
    ) -> Result<SessionReport, AgentError> {
        let session_id = vigil_audit::session_id();
        self.audit.begin_session(&session_id).await?;
        info!(session = %session_id, "agent session started");

        let cancel = cancel.child_token();
        if let Some(deadline) = self.config.deadline {
            let deadline_token = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(deadline).await;
                deadline_token.cancel();
            });
        }

        self.audit
            .append(AuditEntry::message(
                &session_id,
                EntryRole::User,
                json!({ "text": initial_context }),
            ))
            .await?;

        let tools = [shell_tool_schema()];
        let mut messages = vec![ChatMessage::user_text(initial_context)];
        let mut turns = 0u32;

        let label = 'conversation: loop {
            if turns >= self.config.max_turns {
                break SessionLabel::MaxTurns;
            }

            let response = tokio::select! {
                () = cancel.cancelled() => break 'conversation SessionLabel::Timeout,
                result = self.respond_with_retry(&tools, &messages) => match result {
                    Ok(response) => response,
                    Err(e) => {
                        warn!(session = %session_id, error = %e, "provider gave up");
                        break 'conversation SessionLabel::ProviderUnreachable;
                    }
                },
            };
            turns += 1;

            self.audit
                .append(AuditEntry::message(
                    &session_id,
                    EntryRole::Assistant,
                    json!({ "content": response.content.clone() }),
                ))
                .await?;

            let calls: Vec<(String, String, serde_json::Value)> = response
                .tool_uses()
                .into_iter()
                .map(|(id, name, input)| (id.to_owned(), name.to_owned(), input.clone()))
                .collect();
            if calls.is_empty() {
                break SessionLabel::Completed;
            }

            let mut results = Vec::with_capacity(calls.len());
            let mut interrupted = false;
            for (call_id, tool_name, input) in calls {
                let (result, timed_out) = self
                    .execute_call(&session_id, &call_id, &tool_name, &input, &cancel)
                    .await?;
                results.push(result);
                if timed_out && cancel.is_cancelled() {
                    interrupted = true;
                    break;
                }
            }

            messages.push(ChatMessage::assistant(response.content));
            messages.push(ChatMessage::tool_results(results));

            if interrupted {
                break SessionLabel::Timeout;
            }
        };

        if label != SessionLabel::ProviderUnreachable {
            self.write_summary(&session_id, &messages).await;
        }
        self.audit.end_session(&session_id, label.as_str()).await?;
        info!(session = %session_id, label = label.as_str(), turns, "agent session ended");

        Ok(SessionReport {
            session_id,
            label,
            turns,
        })
    }

    /// Execute one tool call with the full audit ordering:
    /// tool_call entry, execution, tool_result entry.
    ///
    /// The boolean reports whether the shell run timed out (or was killed
    /// by cancellation, which shares the timeout semantics).
    async fn execute_call(
        &self,
        session_id: &str,
        call_id: &str,
        tool_name: &str,
        input: &serde_json::Value,
        cancel: &CancellationToken,
    ) -> Result<(ContentBlock, bool), AgentError> {
        self.audit
            .append(AuditEntry::tool_call(
                session_id,
                tool_name,
                call_id,
                input.clone(),
            ))
            .await?;

        if tool_name != "shell" {
            let error = json!({ "error": format!("unknown tool `{tool_name}`") });
            self.audit
                .append(AuditEntry::tool_result(
                    session_id, tool_name, call_id, error.clone(),
                ))
                .await?;
            return Ok((
                ContentBlock::ToolResult {
                    tool_use_id: call_id.to_owned(),
                    content: error.to_string(),
                    is_error: true,
                },
                false,
            ));
        }

        let command = input
            .get("command")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default();
        let reasoning = input
            .get("reasoning")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default();

        let outcome = self
            .shell
            .run_cancellable(command, reasoning, cancel)
            .await?;

        self.audit
            .append(AuditEntry::tool_result(
                session_id,
                tool_name,
                call_id,
                outcome.to_json(),
            ))
            .await?;

        Ok((
            ContentBlock::ToolResult {
                tool_use_id: call_id.to_owned(),
                content: outcome.to_json().to_string(),
                is_error: false,
            },
            outcome.timed_out,
        ))
    }

    async fn respond_with_retry(
        &self,
        tools: &[ToolSchema],
        messages: &[ChatMessage],
    ) -> Result<ChatResponse, ProviderError> {
        let mut failures = 0u32;
        loop {
            match self
                .provider
                .respond(&self.config.system_prompt, tools, messages)
                .await
            {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retryable() => {
                    failures += 1;
                    if failures >= self.config.provider_attempts {
                        return Err(e);
                    }
                    let delay = self.backoff_delay(failures);
                    debug!(attempt = failures, ?delay, error = %e, "retrying provider");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Exponential backoff with uniform jitter in [0.5x, 1.5x].
    #[allow(clippy::cast_possible_truncation)]
    fn backoff_delay(&self, failures: u32) -> Duration {
        let base = self.config.provider_backoff.as_millis() as u64;
        if base == 0 {
            return Duration::ZERO;
        }
        let exp = base * (1u64 << failures.saturating_sub(1).min(16));
        let jittered = rand::thread_rng().gen_range((exp / 2)..=(exp + exp / 2));
        Duration::from_millis(jittered)
    }

    /// Best-effort end-of-session summary; absence is never a failure.
    async fn write_summary(&self, session_id: &str, messages: &[ChatMessage]) {
        let Some(summarizer) = &self.summarizer else {
            return;
        };
        let transcript: String = messages
            .iter()
            .flat_map(|m| m.content.iter())
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.clone()),
                ContentBlock::ToolUse { input, .. } => input
                    .get("command")
                    .and_then(serde_json::Value::as_str)
                    .map(|c| format!("$ {c}")),
                ContentBlock::ToolResult { .. } => None,
            })
            .collect::<Vec<_>>()
            .join("\n");

        let prompt = vec![ChatMessage::user_text(format!(
            "Summarize this incident-response session in two or three sentences:\n\n{transcript}"
        ))];
        match summarizer
            .respond("You summarize SRE agent sessions.", &[], &prompt)
            .await
        {
            Ok(response) => {
                let text = response.text();
                if let Err(e) = self
                    .audit
                    .append(AuditEntry::summary(session_id, &text))
                    .await
                {
                    warn!(session = session_id, error = %e, "summary write failed");
                }
            }
            Err(e) => warn!(session = session_id, error = %e, "summarizer failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{FailingProvider, MockProvider};
    use vigil_audit::EntryKind;

    async fn audit() -> Arc<AuditStore> {
        let pool = vigil_store::connect_memory().await.unwrap();
        Arc::new(AuditStore::new(pool).await.unwrap())
    }

    fn fast_config() -> AgentConfig {
        AgentConfig {
            provider_backoff: Duration::ZERO,
            ..AgentConfig::default()
        }
    }

    #[tokio::test]
    async fn session_completes_when_model_stops_calling_tools() {
        let provider = Arc::new(MockProvider::scripted(vec![
            MockProvider::tool_use_turn("tc_1", "echo diagnosing"),
            MockProvider::text_turn("the node is healthy again"),
        ]));
        let audit = audit().await;
        let session = AgentSession::new(provider.clone(), audit.clone(), fast_config());

        let report = session
            .run("node n1 is down", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.label, SessionLabel::Completed);
        assert_eq!(report.turns, 2);

        let entries = audit.entries(&report.session_id).await.unwrap();
        let kinds: Vec<EntryKind> = entries.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                EntryKind::Message,    // initial context
                EntryKind::Message,    // assistant turn 1
                EntryKind::ToolCall,
                EntryKind::ToolResult,
                EntryKind::Message,    // assistant turn 2
            ]
        );
        // Gapless seq.
        let seqs: Vec<i64> = entries.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, (1..=5).collect::<Vec<_>>());

        // The tool result made it back to the model verbatim.
        let sent = provider.received();
        let last = sent.last().unwrap();
        let results_message = &last[last.len() - 1];
        assert_eq!(results_message.role, "user");
        assert!(matches!(
            results_message.content[0],
            ContentBlock::ToolResult { .. }
        ));
    }

    #[tokio::test]
    async fn turn_cap_terminates_the_session() {
        let provider = Arc::new(MockProvider::repeating(MockProvider::tool_use_turn(
            "tc", "true",
        )));
        let session = AgentSession::new(
            provider,
            audit().await,
            AgentConfig {
                max_turns: 3,
                ..fast_config()
            },
        );

        let report = session.run("ctx", &CancellationToken::new()).await.unwrap();
        assert_eq!(report.label, SessionLabel::MaxTurns);
        assert_eq!(report.turns, 3);
    }

    #[tokio::test]
    async fn provider_failure_is_retried_then_fatal() {
        let provider = Arc::new(FailingProvider::new());
        let session = AgentSession::new(provider.clone(), audit().await, fast_config());

        let report = session.run("ctx", &CancellationToken::new()).await.unwrap();
        assert_eq!(report.label, SessionLabel::ProviderUnreachable);
        assert_eq!(provider.attempts(), 3);
    }

    #[tokio::test]
    async fn deadline_interrupts_inflight_shell() {
        let provider = Arc::new(MockProvider::scripted(vec![MockProvider::tool_use_turn(
            "tc_1", "sleep 290",
        )]));
        let audit = audit().await;
        let session = AgentSession::new(
            provider,
            audit.clone(),
            AgentConfig {
                deadline: Some(Duration::from_millis(300)),
                ..fast_config()
            },
        );

        let started = std::time::Instant::now();
        let report = session.run("ctx", &CancellationToken::new()).await.unwrap();
        assert_eq!(report.label, SessionLabel::Timeout);
        assert!(started.elapsed() < Duration::from_secs(5));

        // The interrupted call still has its result entry.
        let entries = audit.entries(&report.session_id).await.unwrap();
        let last = entries.last().unwrap();
        assert_eq!(last.kind, EntryKind::ToolResult);
        assert_eq!(
            last.tool_result.as_ref().unwrap()["timed_out"],
            serde_json::Value::Bool(true)
        );
    }

    #[tokio::test]
    async fn unknown_tool_yields_error_result_and_continues() {
        let provider = Arc::new(MockProvider::scripted(vec![
            ChatResponse {
                content: vec![ContentBlock::ToolUse {
                    id: "tc_1".into(),
                    name: "teleport".into(),
                    input: json!({}),
                }],
                stop_reason: Some("tool_use".into()),
            },
            MockProvider::text_turn("giving up on teleportation"),
        ]));
        let session = AgentSession::new(provider, audit().await, fast_config());

        let report = session.run("ctx", &CancellationToken::new()).await.unwrap();
        assert_eq!(report.label, SessionLabel::Completed);
        assert_eq!(report.turns, 2);
    }

    #[tokio::test]
    async fn summary_entry_is_written_when_summarizer_present() {
        let provider = Arc::new(MockProvider::scripted(vec![MockProvider::text_turn(
            "all clear",
        )]));
        let summarizer = Arc::new(MockProvider::repeating(MockProvider::text_turn(
            "agent confirmed the cluster was healthy",
        )));
        let audit = audit().await;
        let session = AgentSession::new(provider, audit.clone(), fast_config())
            .with_summarizer(summarizer);

        let report = session.run("ctx", &CancellationToken::new()).await.unwrap();
        let entries = audit.entries(&report.session_id).await.unwrap();
        assert_eq!(entries.last().unwrap().kind, EntryKind::Summary);
    }
}
