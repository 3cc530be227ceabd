//! Text generation
//!
//! Sends a system prompt, prior conversation turns and the new user message
//! to the configured chat provider and returns the completion text. Unlike
//! embeddings there is no fallback: failures go back to the caller.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::config::{ProviderConfig, ProviderKind};

#[derive(Error, Debug)]
pub enum GenerationError {
    #[error("No API key configured for {0}")]
    NotConfigured(String),
    #[error("Generation request failed: {0}")]
    Http(String),
    #[error("Generation provider returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("Malformed generation response: {0}")]
    Malformed(String),
}

impl From<reqwest::Error> for GenerationError {
    fn from(e: reqwest::Error) -> Self {
        GenerationError::Http(e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: ChatRole,
    pub content: String,
}

impl ChatTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: ChatRole::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: ChatRole::Assistant, content: content.into() }
    }
}

/// Prior turns of a chat, oldest first
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    turns: Vec<ChatTurn>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn turns(&self) -> &[ChatTurn] {
        &self.turns
    }

    /// Record a completed question/answer pair
    pub fn push_exchange(&mut self, question: impl Into<String>, answer: impl Into<String>) {
        self.turns.push(ChatTurn::user(question));
        self.turns.push(ChatTurn::assistant(answer));
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn clear(&mut self) {
        self.turns.clear();
    }
}

// ── Provider request/response shapes ───────────────────────────────

#[derive(Serialize)]
struct OpenAiMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct OpenAiChatRequest<'a> {
    model: &'a str,
    messages: Vec<OpenAiMessage<'a>>,
}

#[derive(Deserialize)]
struct OpenAiChatResponse {
    choices: Vec<OpenAiChoice>,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: OpenAiChoiceMessage,
}

#[derive(Deserialize)]
struct OpenAiChoiceMessage {
    content: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct GeminiPart {
    #[serde(default)]
    text: String,
}

#[derive(Serialize)]
struct GeminiContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'static str>,
    parts: Vec<GeminiPart>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiGenerateRequest {
    system_instruction: GeminiContent,
    contents: Vec<GeminiContent>,
}

#[derive(Deserialize)]
struct GeminiGenerateResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

#[derive(Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiCandidateContent>,
}

#[derive(Deserialize)]
struct GeminiCandidateContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

enum ChatRequest<'a> {
    OpenAi(OpenAiChatRequest<'a>),
    Gemini { model: &'a str, body: GeminiGenerateRequest },
}

impl<'a> ChatRequest<'a> {
    fn build(provider: &'a ProviderConfig, system: &'a str, history: &'a [ChatTurn], user: &'a str) -> Self {
        let model = provider.generation_model();
        match provider.kind {
            ProviderKind::OpenAi => {
                let mut messages = Vec::with_capacity(history.len() + 2);
                messages.push(OpenAiMessage { role: "system", content: system });
                messages.extend(history.iter().map(|turn| OpenAiMessage {
                    role: match turn.role {
                        ChatRole::User => "user",
                        ChatRole::Assistant => "assistant",
                    },
                    content: &turn.content,
                }));
                messages.push(OpenAiMessage { role: "user", content: user });
                ChatRequest::OpenAi(OpenAiChatRequest { model, messages })
            }
            ProviderKind::Gemini => {
                let text = |s: &str| vec![GeminiPart { text: s.to_string() }];
                let mut contents: Vec<GeminiContent> = history
                    .iter()
                    .map(|turn| GeminiContent {
                        role: Some(match turn.role {
                            ChatRole::User => "user",
                            ChatRole::Assistant => "model",
                        }),
                        parts: text(&turn.content),
                    })
                    .collect();
                contents.push(GeminiContent { role: Some("user"), parts: text(user) });
                ChatRequest::Gemini {
                    model,
                    body: GeminiGenerateRequest {
                        system_instruction: GeminiContent { role: None, parts: text(system) },
                        contents,
                    },
                }
            }
        }
    }

    async fn send(&self, http: &reqwest::Client, provider: &ProviderConfig, key: &str) -> Result<String, GenerationError> {
        let base = provider.base_url();
        let response = match self {
            ChatRequest::OpenAi(body) => {
                http.post(format!("{}/chat/completions", base))
                    .bearer_auth(key)
                    .json(body)
                    .send()
                    .await?
            }
            ChatRequest::Gemini { model, body } => {
                http.post(format!("{}/models/{}:generateContent", base, model))
                    .header("x-goog-api-key", key)
                    .json(body)
                    .send()
                    .await?
            }
        };

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(GenerationError::Status { status: status.as_u16(), body: text });
        }

        let completion = match self {
            ChatRequest::OpenAi(_) => {
                let parsed: OpenAiChatResponse = serde_json::from_str(&text)
                    .map_err(|e| GenerationError::Malformed(e.to_string()))?;
                parsed.choices.into_iter().next()
                    .and_then(|c| c.message.content)
                    .ok_or_else(|| GenerationError::Malformed("no completion in response".to_string()))?
            }
            ChatRequest::Gemini { .. } => {
                let parsed: GeminiGenerateResponse = serde_json::from_str(&text)
                    .map_err(|e| GenerationError::Malformed(e.to_string()))?;
                parsed.candidates.into_iter().next()
                    .and_then(|c| c.content)
                    .map(|c| c.parts.into_iter().map(|p| p.text).collect::<String>())
                    .ok_or_else(|| GenerationError::Malformed("no candidates in response".to_string()))?
            }
        };

        Ok(completion)
    }
}

// ── Client ─────────────────────────────────────────────────────────

struct GenerationState {
    provider: ProviderConfig,
    http: reqwest::Client,
}

impl GenerationState {
    fn new(provider: ProviderConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(provider.timeout_secs.max(60)))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { provider, http }
    }
}

pub struct GenerationClient {
    state: RwLock<GenerationState>,
}

impl GenerationClient {
    pub fn new(provider: ProviderConfig) -> Self {
        Self { state: RwLock::new(GenerationState::new(provider)) }
    }

    pub fn reload(&self, provider: ProviderConfig) {
        debug!(provider = provider.kind.as_str(), model = provider.generation_model(), "Reloading generation client");
        *self.state.write() = GenerationState::new(provider);
    }

    pub fn is_configured(&self) -> bool {
        self.state.read().provider.is_configured()
    }

    /// Run one completion: `system`, then `history`, then `user`
    pub async fn generate(&self, system: &str, history: &[ChatTurn], user: &str) -> Result<String, GenerationError> {
        let (provider, http) = {
            let state = self.state.read();
            (state.provider.clone(), state.http.clone())
        };
        let key = provider
            .credential()
            .ok_or_else(|| GenerationError::NotConfigured(provider.kind.as_str().to_string()))?;

        debug!(provider = provider.kind.as_str(), turns = history.len(), "Requesting completion");
        ChatRequest::build(&provider, system, history, user)
            .send(&http, &provider, key)
            .await
    }
}
