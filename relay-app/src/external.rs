//! Outbound calls: chat completion, joke fetch, quote fetch.
//!
//! Completion failures propagate so the router can decide what to persist.
//! Joke and quote failures are swallowed here and replaced by a fixed string.

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use relay_llm::{ChatMessage, LlmClient, LlmError};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::time::Duration;

pub const JOKE_FALLBACK: &str = "Sorry, I couldn't fetch a joke at this time.";
pub const QUOTE_FALLBACK: &str = "Sorry, I couldn't fetch a quote at this time.";

#[async_trait]
pub trait ExternalServices: Send + Sync {
    /// Top reply for `transcript`, trimmed.
    async fn complete_conversation(&self, transcript: &[ChatMessage]) -> relay_llm::Result<String>;

    /// Never fails: returns [`JOKE_FALLBACK`] when the joke service does.
    async fn fetch_joke(&self) -> String;

    /// Never fails: returns [`QUOTE_FALLBACK`] when the quote service does.
    async fn fetch_quote(&self) -> String;
}

pub struct HttpServices {
    llm: LlmClient,
    http: reqwest::Client,
    joke_url: String,
    quote_url: String,
    system_prompt: Option<String>,
}

impl HttpServices {
    pub fn new(llm: LlmClient, joke_url: &str, quote_url: &str, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            llm,
            http,
            joke_url: joke_url.trim().to_string(),
            quote_url: quote_url.trim().to_string(),
            system_prompt: None,
        })
    }

    pub fn with_system_prompt(mut self, system_prompt: Option<String>) -> Self {
        self.system_prompt = system_prompt
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty());
        self
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        let response = self.http.get(url).send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(anyhow!("GET {url} failed: status={status} body={body}"));
        }
        serde_json::from_str(&body).map_err(|e| anyhow!("GET {url} returned unexpected body: {e}"))
    }
}

#[derive(Debug, Deserialize)]
struct JokePayload {
    setup: String,
    punchline: String,
}

#[derive(Debug, Deserialize)]
struct QuotePayload {
    q: String,
    a: String,
}

#[async_trait]
impl ExternalServices for HttpServices {
    #[tracing::instrument(level = "info", skip_all, fields(turns = transcript.len()))]
    async fn complete_conversation(&self, transcript: &[ChatMessage]) -> relay_llm::Result<String> {
        let mut messages = Vec::with_capacity(transcript.len() + 1);
        if let Some(prompt) = self.system_prompt.as_deref() {
            messages.push(ChatMessage::system(prompt));
        }
        messages.extend_from_slice(transcript);

        let response = self.llm.chat(&messages).await?;
        let reply = response.message.content.trim();
        if reply.is_empty() {
            return Err(LlmError::ResponseFormat(
                "completion returned an empty reply".to_string(),
            ));
        }
        tracing::debug!(
            prompt_tokens = response.usage.prompt_tokens,
            completion_tokens = response.usage.completion_tokens,
            finish_reason = %response.finish_reason,
            "completion received"
        );
        Ok(reply.to_string())
    }

    async fn fetch_joke(&self) -> String {
        best_effort("joke", JOKE_FALLBACK, async {
            let joke: JokePayload = self.get_json(&self.joke_url).await?;
            Ok::<_, anyhow::Error>(format!("{}\n{}", joke.setup, joke.punchline))
        })
        .await
    }

    async fn fetch_quote(&self) -> String {
        best_effort("quote", QUOTE_FALLBACK, async {
            let quotes: Vec<QuotePayload> = self.get_json(&self.quote_url).await?;
            let quote = quotes
                .into_iter()
                .next()
                .ok_or_else(|| anyhow!("quote service returned an empty list"))?;
            Ok::<_, anyhow::Error>(format!("\"{}\"\n- {}", quote.q, quote.a))
        })
        .await
    }
}

/// Run a flavor-text fetch, turning any failure into `fallback`.
async fn best_effort<F>(service: &'static str, fallback: &str, call: F) -> String
where
    F: Future<Output = Result<String>>,
{
    match call.await {
        Ok(text) => text,
        Err(error) => {
            tracing::warn!(service, %error, "external fetch failed; replying with fallback");
            fallback.to_string()
        }
    }
}
