//! Completion backend seam.
//!
//! The engine only needs "send a prompt to a model, get text and token usage
//! back". Concrete clients are blocking (they run inside `spawn_blocking`
//! workers during extraction); tests use `MockLlmClient`.

pub mod ollama;
pub mod openai;

pub use ollama::OllamaClient;
pub use openai::OpenAiClient;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{EngineSettings, LlmBackend};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LlmError {
    #[error("Completion backend is not reachable at {0}")]
    Connection(String),

    #[error("Request timed out after {0}s")]
    Timeout(u64),

    #[error("Backend returned error (status {status}): {body}")]
    Status { status: u16, body: String },

    #[error("HTTP client error: {0}")]
    HttpClient(String),

    #[error("Malformed backend response: {0}")]
    MalformedResponse(String),
}

impl LlmError {
    /// True when the backend could not be reached at all (as opposed to a
    /// bad answer for one prompt).
    pub fn is_unreachable(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}

/// Token counts reported by the backend for one call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
        }
    }

    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// One finished completion call.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub text: String,
    pub usage: TokenUsage,
    /// Monetary cost if the backend reports it (LiteLLM does); otherwise the
    /// ledger prices the call from its token counts.
    pub reported_cost: Option<f64>,
}

impl Completion {
    pub fn new(text: impl Into<String>, usage: TokenUsage) -> Self {
        Self {
            text: text.into(),
            usage,
            reported_cost: None,
        }
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.reported_cost = Some(cost);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

impl ChatRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Self::User => "User",
            Self::Assistant => "Assistant",
        }
    }
}

/// One message of a conversation, oldest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: ChatRole,
    pub content: String,
}

impl ChatTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// Fold a conversation into one prompt for single-prompt backends. A lone
/// user turn is passed through unchanged.
pub fn render_transcript(turns: &[ChatTurn]) -> String {
    match turns {
        [only] if only.role == ChatRole::User => only.content.clone(),
        _ => {
            let mut prompt = String::from("Conversation so far:\n\n");
            for turn in turns {
                prompt.push_str(&format!("{}: {}\n\n", turn.role.label(), turn.content));
            }
            prompt.push_str("Answer the last User message.");
            prompt
        }
    }
}

/// LLM client abstraction (allows mocking).
pub trait LlmClient: Send + Sync {
    fn generate(&self, model: &str, prompt: &str, system: &str) -> Result<Completion, LlmError>;

    /// Multi-turn completion. Backends without a message API get the
    /// conversation folded into one prompt.
    fn chat(&self, model: &str, system: &str, turns: &[ChatTurn]) -> Result<Completion, LlmError> {
        self.generate(model, &render_transcript(turns), system)
    }
}

/// Build the client selected by the settings.
pub fn client_from_settings(settings: &EngineSettings) -> Result<Arc<dyn LlmClient>, LlmError> {
    match settings.backend {
        LlmBackend::Ollama => Ok(Arc::new(OllamaClient::new(
            &settings.llm_base_url,
            settings.llm_timeout_secs,
        )?)),
        LlmBackend::OpenAi => Ok(Arc::new(OpenAiClient::new(
            &settings.llm_base_url,
            settings.llm_api_key.clone(),
            settings.llm_timeout_secs,
        )?)),
    }
}

type Responder = dyn Fn(&str, &str) -> Result<Completion, LlmError> + Send + Sync;

/// Mock LLM client for testing. Answers through a closure of `(model, prompt)`.
pub struct MockLlmClient {
    responder: Box<Responder>,
    calls: AtomicUsize,
}

impl MockLlmClient {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&str, &str) -> Result<Completion, LlmError> + Send + Sync + 'static,
    {
        Self {
            responder: Box::new(responder),
            calls: AtomicUsize::new(0),
        }
    }

    /// Always answer with the same text and usage.
    pub fn fixed(text: &str, usage: TokenUsage) -> Self {
        let text = text.to_string();
        Self::new(move |_, _| Ok(Completion::new(text.clone(), usage)))
    }

    /// Always fail with the given error.
    pub fn failing(error: LlmError) -> Self {
        Self::new(move |_, _| Err(error.clone()))
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl LlmClient for MockLlmClient {
    fn generate(&self, model: &str, prompt: &str, _system: &str) -> Result<Completion, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        (self.responder)(model, prompt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_counts_calls() {
        let mock = MockLlmClient::fixed("{}", TokenUsage::new(10, 5));
        assert_eq!(mock.call_count(), 0);
        let completion = mock.generate("gpt-4o-mini", "prompt", "system").unwrap();
        assert_eq!(completion.text, "{}");
        assert_eq!(completion.usage.total(), 15);
        assert_eq!(mock.call_count(), 1);
    }

    #[test]
    fn failing_mock_returns_error() {
        let mock = MockLlmClient::failing(LlmError::Connection("http://x".into()));
        let err = mock.generate("m", "p", "s").unwrap_err();
        assert!(err.is_unreachable());
    }

    #[test]
    fn only_connection_errors_are_unreachable() {
        assert!(!LlmError::Timeout(5).is_unreachable());
        assert!(!LlmError::MalformedResponse("x".into()).is_unreachable());
    }

    #[test]
    fn client_from_settings_builds_both_backends() {
        let mut settings = EngineSettings::default();
        assert!(client_from_settings(&settings).is_ok());
        settings.backend = LlmBackend::OpenAi;
        settings.llm_base_url = LlmBackend::OpenAi.default_base_url().into();
        assert!(client_from_settings(&settings).is_ok());
    }

    #[test]
    fn default_chat_folds_history_into_prompt() {
        let mock = MockLlmClient::new(|_, prompt| Ok(Completion::new(prompt, TokenUsage::default())));
        let single = mock.chat("m", "s", &[ChatTurn::user("How many visits?")]).unwrap();
        assert_eq!(single.text, "How many visits?");

        let turns = vec![
            ChatTurn::user("First event?"),
            ChatTurn::assistant("Intake on 2023-01-18 [R1]"),
            ChatTurn::user("And the second?"),
        ];
        let folded = mock.chat("m", "s", &turns).unwrap().text;
        let first = folded.find("User: First event?").unwrap();
        let answer = folded.find("Assistant: Intake on 2023-01-18 [R1]").unwrap();
        let last = folded.find("User: And the second?").unwrap();
        assert!(first < answer && answer < last);
        assert_eq!(mock.call_count(), 2);
    }

    #[test]
    fn chat_roles_serialize_lowercase() {
        let turn: ChatTurn = serde_json::from_str(r#"{"role": "assistant", "content": "x"}"#).unwrap();
        assert_eq!(turn, ChatTurn::assistant("x"));
        assert_eq!(ChatRole::User.as_str(), "user");
    }

    #[test]
    fn reported_cost_is_optional() {
        let completion = Completion::new("x", TokenUsage::default());
        assert!(completion.reported_cost.is_none());
        assert_eq!(completion.with_cost(0.25).reported_cost, Some(0.25));
    }
}
