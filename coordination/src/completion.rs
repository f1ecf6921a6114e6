//! Completion API client.
//!
//! Speaks the OpenAI-compatible `/chat/completions` shape. Callers treat
//! every failure the same way ("no result"); the variants exist for logs.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::CompletionConfig;

/// Who authored a turn in a completion request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    System,
    User,
    Assistant,
}

/// One message in a completion request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: TurnRole,
    pub content: String,
}

impl ChatTurn {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::Assistant,
            content: content.into(),
        }
    }
}

/// A completion request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompletionRequest {
    pub messages: Vec<ChatTurn>,
    /// Overrides the client's configured limit.
    pub max_tokens: Option<u32>,
}

impl CompletionRequest {
    pub fn new(messages: Vec<ChatTurn>) -> Self {
        Self {
            messages,
            max_tokens: None,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

/// Error type for completion calls
#[derive(Debug, Clone, thiserror::Error)]
pub enum CompletionError {
    #[error("request failed: {0}")]
    Request(String),

    #[error("completion API returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed completion body: {0}")]
    Malformed(String),

    #[error("completion was empty")]
    Empty,
}

/// Text-generation dependency.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, CompletionError>;
}

/// Shared reference to a CompletionClient
pub type SharedCompletionClient = Arc<dyn CompletionClient>;

/// Client that answers from a script, for simulations and integration tests.
///
/// Responses are served in order. Once the script runs dry the fallback
/// reply is returned, or [`CompletionError::Empty`] when there is none.
#[derive(Default)]
pub struct ScriptedCompletionClient {
    script: Mutex<VecDeque<Result<String, CompletionError>>>,
    fallback: Option<String>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedCompletionClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fallback(mut self, reply: impl Into<String>) -> Self {
        self.fallback = Some(reply.into());
        self
    }

    pub fn push_reply(&self, reply: impl Into<String>) {
        self.lock_script().push_back(Ok(reply.into()));
    }

    pub fn push_error(&self, error: CompletionError) {
        self.lock_script().push_back(Err(error));
    }

    /// Requests received so far, oldest first.
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn lock_script(&self) -> MutexGuard<'_, VecDeque<Result<String, CompletionError>>> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl CompletionClient for ScriptedCompletionClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, CompletionError> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());
        match self.lock_script().pop_front() {
            Some(next) => next,
            None => self.fallback.clone().ok_or(CompletionError::Empty),
        }
    }
}

#[derive(Serialize)]
struct ChatCompletionBody<'a> {
    model: &'a str,
    messages: &'a [ChatTurn],
    max_tokens: u32,
    temperature: f32,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

/// HTTP client for an OpenAI-compatible endpoint.
pub struct HttpCompletionClient {
    http: reqwest::Client,
    config: CompletionConfig,
}

impl HttpCompletionClient {
    pub fn new(config: CompletionConfig) -> Result<Self, CompletionError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| CompletionError::Request(e.to_string()))?;
        Ok(Self { http, config })
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        )
    }

    /// Check whether the endpoint answers `GET /models`.
    pub async fn probe(&self) -> bool {
        let url = format!("{}/models", self.config.base_url.trim_end_matches('/'));
        let mut request = self.http.get(&url).timeout(Duration::from_secs(5));
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }
        match request.send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }
}

#[async_trait]
impl CompletionClient for HttpCompletionClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, CompletionError> {
        let body = ChatCompletionBody {
            model: &self.config.model,
            messages: &request.messages,
            max_tokens: request.max_tokens.unwrap_or(self.config.max_tokens),
            temperature: self.config.temperature,
        };

        let mut builder = self.http.post(self.endpoint()).json(&body);
        if let Some(key) = &self.config.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|e| {
            warn!(error = %e, "Completion request failed");
            CompletionError::Request(e.to_string())
        })?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            warn!(status, "Completion API returned error status");
            return Err(CompletionError::Status { status, body });
        }

        let parsed: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| CompletionError::Malformed(e.to_string()))?;

        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .map(|content| content.trim().to_string())
            .unwrap_or_default();

        if text.is_empty() {
            return Err(CompletionError::Empty);
        }
        debug!(chars = text.len(), "Completion received");
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_turn_role_serializes_lowercase() {
        let json = serde_json::to_string(&ChatTurn::assistant("hi")).unwrap();
        assert_eq!(json, r#"{"role":"assistant","content":"hi"}"#);
    }

    #[test]
    fn test_body_shape() {
        let messages = vec![ChatTurn::system("rules"), ChatTurn::user("hello")];
        let body = ChatCompletionBody {
            model: "m",
            messages: &messages,
            max_tokens: 64,
            temperature: 0.5,
        };
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["model"], "m");
        assert_eq!(value["max_tokens"], 64);
        assert_eq!(value["messages"][1]["role"], "user");
    }

    #[test]
    fn test_response_parsing_tolerates_null_content() {
        let parsed: ChatCompletionResponse =
            serde_json::from_str(r#"{"choices":[{"message":{"content":null}}]}"#).unwrap();
        assert!(parsed.choices[0].message.content.is_none());
    }

    #[test]
    fn test_endpoint_trims_trailing_slash() {
        let client = HttpCompletionClient::new(CompletionConfig {
            base_url: "http://llm:8080/v1/".to_string(),
            ..CompletionConfig::default()
        })
        .unwrap();
        assert_eq!(client.endpoint(), "http://llm:8080/v1/chat/completions");
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_request_error() {
        let client = HttpCompletionClient::new(CompletionConfig {
            base_url: "http://127.0.0.1:9".to_string(),
            timeout_secs: 2,
            ..CompletionConfig::default()
        })
        .unwrap();
        let err = client
            .complete(&CompletionRequest::new(vec![ChatTurn::user("ping")]))
            .await
            .unwrap_err();
        assert!(matches!(err, CompletionError::Request(_)));
        assert!(!client.probe().await);
    }

    #[tokio::test]
    async fn test_scripted_client_serves_in_order_then_falls_back() {
        let client = ScriptedCompletionClient::new().with_fallback("done");
        client.push_reply("first");
        client.push_error(CompletionError::Empty);
        let request = CompletionRequest::new(vec![ChatTurn::user("hi")]);

        assert_eq!(client.complete(&request).await.unwrap(), "first");
        assert!(client.complete(&request).await.is_err());
        assert_eq!(client.complete(&request).await.unwrap(), "done");
        assert_eq!(client.requests().len(), 3);

        let bare = ScriptedCompletionClient::new();
        assert!(matches!(
            bare.complete(&request).await,
            Err(CompletionError::Empty)
        ));
    }
}
