//! Scripted chat providers for tests.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use serde_json::json;

use crate::error::ProviderError;
use crate::provider::{ChatMessage, ChatProvider, ChatResponse, ContentBlock, ToolSchema};

/// A provider that replays a fixed script of turns.
///
/// Once the script runs dry it returns a plain text turn, which ends the
/// conversation loop. Every request's message history is recorded for
/// assertions.
#[derive(Debug, Default)]
pub struct MockProvider {
    script: Mutex<VecDeque<ChatResponse>>,
    repeat: Option<ChatResponse>,
    received: Mutex<Vec<Vec<ChatMessage>>>,
}

impl MockProvider {
    #[must_use]
    pub fn scripted(turns: Vec<ChatResponse>) -> Self {
        Self {
            script: Mutex::new(turns.into()),
            repeat: None,
            received: Mutex::new(Vec::new()),
        }
    }

    /// A provider that returns the same turn forever.
    #[must_use]
    pub fn repeating(turn: ChatResponse) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            repeat: Some(turn),
            received: Mutex::new(Vec::new()),
        }
    }

    /// A turn that calls the shell tool once.
    #[must_use]
    pub fn tool_use_turn(id: &str, command: &str) -> ChatResponse {
        ChatResponse {
            content: vec![
                ContentBlock::Text {
                    text: format!("running `{command}`"),
                },
                ContentBlock::ToolUse {
                    id: id.into(),
                    name: "shell".into(),
                    input: json!({ "command": command, "reasoning": "scripted" }),
                },
            ],
            stop_reason: Some("tool_use".into()),
        }
    }

    /// A text-only turn, which terminates the loop.
    #[must_use]
    pub fn text_turn(text: &str) -> ChatResponse {
        ChatResponse {
            content: vec![ContentBlock::Text { text: text.into() }],
            stop_reason: Some("end_turn".into()),
        }
    }

    /// Message histories seen so far, one per request.
    pub fn received(&self) -> Vec<Vec<ChatMessage>> {
        self.received.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatProvider for MockProvider {
    async fn respond(
        &self,
        _system: &str,
        _tools: &[ToolSchema],
        messages: &[ChatMessage],
    ) -> Result<ChatResponse, ProviderError> {
        self.received.lock().unwrap().push(messages.to_vec());
        if let Some(turn) = self.script.lock().unwrap().pop_front() {
            return Ok(turn);
        }
        if let Some(turn) = &self.repeat {
            return Ok(turn.clone());
        }
        Ok(Self::text_turn("done"))
    }
}

/// A provider whose every call fails with a retryable transport error.
#[derive(Debug, Default)]
pub struct FailingProvider {
    attempts: AtomicU32,
}

impl FailingProvider {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatProvider for FailingProvider {
    async fn respond(
        &self,
        _system: &str,
        _tools: &[ToolSchema],
        _messages: &[ChatMessage],
    ) -> Result<ChatResponse, ProviderError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(ProviderError::Transport("connection refused".into()))
    }
}
