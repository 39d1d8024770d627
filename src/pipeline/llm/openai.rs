//! OpenAI-compatible chat completions client (OpenAI, LiteLLM proxy, vLLM).

use serde::{Deserialize, Serialize};

use super::{ChatTurn, Completion, LlmClient, LlmError, TokenUsage};

/// Case questions are answered with a little more latitude than extraction.
const CHAT_TEMPERATURE: f32 = 0.1;

pub struct OpenAiClient {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::blocking::Client,
    timeout_secs: u64,
}

impl OpenAiClient {
    pub fn new(base_url: &str, api_key: Option<String>, timeout_secs: u64) -> Result<Self, LlmError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| LlmError::HttpClient(e.to_string()))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            client,
            timeout_secs,
        })
    }

    fn endpoint(&self) -> String {
        if self.base_url.ends_with("/v1") {
            format!("{}/chat/completions", self.base_url)
        } else {
            format!("{}/v1/chat/completions", self.base_url)
        }
    }
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    /// LiteLLM proxies add the computed spend here.
    #[serde(default)]
    cost: Option<f64>,
}

fn completion_from_response(parsed: ChatResponse) -> Result<Completion, LlmError> {
    let text = parsed
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .ok_or_else(|| LlmError::MalformedResponse("No message content in choices".into()))?;

    let (usage, cost) = match parsed.usage {
        Some(u) => (TokenUsage::new(u.prompt_tokens, u.completion_tokens), u.cost),
        None => (TokenUsage::default(), None),
    };

    let completion = Completion::new(text, usage);
    Ok(match cost {
        Some(cost) => completion.with_cost(cost),
        None => completion,
    })
}

fn chat_messages<'a>(system: &'a str, turns: &'a [ChatTurn]) -> Vec<ChatMessage<'a>> {
    let mut messages = Vec::with_capacity(turns.len() + 1);
    messages.push(ChatMessage {
        role: "system",
        content: system,
    });
    messages.extend(turns.iter().map(|turn| ChatMessage {
        role: turn.role.as_str(),
        content: &turn.content,
    }));
    messages
}

impl OpenAiClient {
    fn send(&self, body: &ChatRequest<'_>) -> Result<Completion, LlmError> {
        let mut request = self.client.post(self.endpoint()).json(body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().map_err(|e| {
            if e.is_connect() {
                LlmError::Connection(self.base_url.clone())
            } else if e.is_timeout() {
                LlmError::Timeout(self.timeout_secs)
            } else {
                LlmError::HttpClient(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(LlmError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: ChatResponse = response
            .json()
            .map_err(|e| LlmError::MalformedResponse(e.to_string()))?;

        completion_from_response(parsed)
    }
}

impl LlmClient for OpenAiClient {
    fn generate(&self, model: &str, prompt: &str, system: &str) -> Result<Completion, LlmError> {
        self.send(&ChatRequest {
            model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system,
                },
                ChatMessage {
                    role: "user",
                    content: prompt,
                },
            ],
            temperature: 0.0,
        })
    }

    fn chat(&self, model: &str, system: &str, turns: &[ChatTurn]) -> Result<Completion, LlmError> {
        self.send(&ChatRequest {
            model,
            messages: chat_messages(system, turns),
            temperature: CHAT_TEMPERATURE,
        })
    }
}
