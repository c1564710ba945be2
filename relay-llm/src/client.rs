use crate::error::{LlmError, Result};
use crate::openai::OpenAiClient;
use crate::types::{ChatMessage, ChatResponse};
use reqwest::Url;
use std::time::Duration;

pub const DEFAULT_COMPLETIONS_URL: &str = "https://api.openai.com/v1/chat/completions";

#[derive(Clone)]
pub struct LlmClient {
    api_key: String,
    model: String,
    endpoint: String,
    client: reqwest::Client,
}

impl LlmClient {
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn new(api_key: &str, model: &str) -> Result<Self> {
        let model = model.trim();
        if model.is_empty() {
            return Err(LlmError::InvalidInput("model is required".to_string()));
        }
        Ok(Self {
            api_key: api_key.trim().to_string(),
            model: model.to_string(),
            endpoint: DEFAULT_COMPLETIONS_URL.to_string(),
            client: build_http_client(Duration::from_secs(60)),
        })
    }

    /// Point the client at another OpenAI-compatible completions endpoint.
    pub fn with_endpoint(mut self, endpoint: &str) -> Result<Self> {
        self.endpoint = normalize_endpoint(endpoint)?;
        Ok(self)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.client = build_http_client(timeout);
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn has_api_key(&self) -> bool {
        !self.api_key.is_empty()
    }

    #[tracing::instrument(level = "info", skip_all, fields(model = %self.model, messages = messages.len()))]
    pub async fn chat(&self, messages: &[ChatMessage]) -> Result<ChatResponse> {
        if messages.is_empty() {
            return Err(LlmError::InvalidInput(
                "chat requires at least one message".to_string(),
            ));
        }
        let c = OpenAiClient::new(
            self.client.clone(),
            &self.endpoint,
            &self.api_key,
            &self.model,
        );
        c.chat(messages).await
    }
}

fn build_http_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_else(|e| {
            tracing::warn!(%e, "reqwest client build failed; falling back to default client");
            reqwest::Client::new()
        })
}

fn normalize_endpoint(raw: &str) -> Result<String> {
    let normalized = raw.trim().to_string();
    if normalized.is_empty() {
        return Err(LlmError::InvalidInput(
            "completion endpoint is required".to_string(),
        ));
    }
    let parsed = Url::parse(&normalized)
        .map_err(|e| LlmError::InvalidInput(format!("invalid completion endpoint: {e}")))?;
    match parsed.scheme() {
        "http" | "https" => Ok(normalized),
        other => Err(LlmError::InvalidInput(format!(
            "invalid completion endpoint scheme: {other}"
        ))),
    }
}
