//! Remote classifier over an OpenAI-compatible chat-completions API.
//!
//! The policy instruction goes in as the system message, the candidate text
//! as the user message. The reply must be `ADMIT` or `REJECT: <reason>`;
//! anything else counts as a malformed reply, which the gate treats as
//! unavailability.

use std::{fmt, time::Duration};

use async_trait::async_trait;
use murmur_core::{
    Classification, Classifier, ClassifierError,
    moderation::{POLICY_INSTRUCTION, parse_verdict},
};
use serde::{Deserialize, Serialize};

/// Default chat-completions endpoint.
pub const DEFAULT_ENDPOINT: &str = "https://api.openai.com/v1/chat/completions";

/// Default model.
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// Connection settings for [`OpenAiClassifier`].
#[derive(Clone)]
pub struct OpenAiConfig {
    /// Bearer token
    pub api_key: String,
    /// Model name
    pub model: String,
    /// Full chat-completions URL
    pub endpoint: String,
    /// HTTP request timeout
    pub request_timeout: Duration,
}

impl fmt::Debug for OpenAiConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenAiConfig")
            .field("model", &self.model)
            .field("endpoint", &self.endpoint)
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}

/// Classifier backed by a language model.
pub struct OpenAiClassifier {
    config: OpenAiConfig,
    http_client: reqwest::Client,
}

impl OpenAiClassifier {
    /// Build the classifier and its HTTP client.
    ///
    /// # Errors
    ///
    /// - `Transport`: the HTTP client could not be constructed (TLS backend)
    pub fn new(config: OpenAiConfig) -> Result<Self, ClassifierError> {
        let http_client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .user_agent(concat!("murmur/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ClassifierError::Transport(e.to_string()))?;

        Ok(Self { config, http_client })
    }
}

impl fmt::Debug for OpenAiClassifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenAiClassifier").field("config", &self.config).finish_non_exhaustive()
    }
}

#[async_trait]
impl Classifier for OpenAiClassifier {
    async fn classify(&self, text: &str) -> Result<Classification, ClassifierError> {
        let request = ChatRequest::screening(&self.config.model, text);

        let response = self
            .http_client
            .post(&self.config.endpoint)
            .bearer_auth(&self.config.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| self.transport_error(&e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ClassifierError::Transport(format!("HTTP {status}")));
        }

        let reply: ChatResponse = response.json().await.map_err(|e| {
            if e.is_decode() {
                ClassifierError::MalformedReply(e.to_string())
            } else {
                self.transport_error(&e)
            }
        })?;

        parse_verdict(reply.content()?)
    }
}

impl OpenAiClassifier {
    fn transport_error(&self, err: &reqwest::Error) -> ClassifierError {
        if err.is_timeout() {
            ClassifierError::Timeout(self.config.request_timeout)
        } else {
            ClassifierError::Transport(err.to_string())
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f32,
    max_tokens: u32,
    messages: [ChatMessage<'a>; 2],
}

impl<'a> ChatRequest<'a> {
    fn screening(model: &'a str, text: &'a str) -> Self {
        Self {
            model,
            temperature: 0.0,
            max_tokens: 32,
            messages: [
                ChatMessage { role: "system", content: POLICY_INSTRUCTION },
                ChatMessage { role: "user", content: text },
            ],
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    #[serde(default)]
    content: Option<String>,
}

impl ChatResponse {
    fn content(&self) -> Result<&str, ClassifierError> {
        self.choices
            .first()
            .and_then(|choice| choice.message.content.as_deref())
            .ok_or_else(|| ClassifierError::MalformedReply("no choices in reply".into()))
    }
}
