//! chatrelay configuration loader.
//!
//! Optional TOML file, then environment overrides. Every field has a default so
//! the bot runs from environment variables alone.

use crate::lifecycle::MAX_CHALLENGE_WAIT;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub keys: KeysConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub services: ServicesConfig,
    #[serde(default)]
    pub conversation: ConversationConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_model")]
    pub model: String,
    /// Prepended to every completion request; never stored in transcripts.
    #[serde(default)]
    pub system_prompt: Option<String>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            system_prompt: None,
        }
    }
}

fn default_model() -> String {
    "gpt-3.5-turbo".to_string()
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct KeysConfig {
    pub openai_api_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_host")]
    pub bind_host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Public URL used in pages and log hints. Default: `http://localhost:{port}`.
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_qr_wait_seconds")]
    pub qr_wait_seconds: u64,
    #[serde(default = "default_http_timeout_seconds")]
    pub http_timeout_seconds: u64,
    #[serde(default = "default_http_max_in_flight")]
    pub http_max_in_flight: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_host: default_bind_host(),
            port: default_port(),
            base_url: None,
            qr_wait_seconds: default_qr_wait_seconds(),
            http_timeout_seconds: default_http_timeout_seconds(),
            http_max_in_flight: default_http_max_in_flight(),
        }
    }
}

fn default_bind_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_qr_wait_seconds() -> u64 {
    30
}

fn default_http_timeout_seconds() -> u64 {
    60
}

fn default_http_max_in_flight() -> usize {
    64
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_bridge_url")]
    pub bridge_url: String,
    #[serde(default)]
    pub bridge_token: Option<String>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_challenge_check_interval_ms")]
    pub challenge_check_interval_ms: u64,
    #[serde(default = "default_initialize_on_startup")]
    pub initialize_on_startup: bool,
    #[serde(default = "default_max_poll_failures")]
    pub max_poll_failures: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            bridge_url: default_bridge_url(),
            bridge_token: None,
            poll_interval_ms: default_poll_interval_ms(),
            challenge_check_interval_ms: default_challenge_check_interval_ms(),
            initialize_on_startup: default_initialize_on_startup(),
            max_poll_failures: default_max_poll_failures(),
        }
    }
}

fn default_bridge_url() -> String {
    "http://127.0.0.1:8085".to_string()
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_challenge_check_interval_ms() -> u64 {
    1000
}

fn default_initialize_on_startup() -> bool {
    true
}

fn default_max_poll_failures() -> u32 {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServicesConfig {
    #[serde(default = "default_completion_url")]
    pub completion_url: String,
    #[serde(default = "default_joke_url")]
    pub joke_url: String,
    #[serde(default = "default_quote_url")]
    pub quote_url: String,
    #[serde(default = "default_services_timeout_seconds")]
    pub timeout_seconds: u64,
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            completion_url: default_completion_url(),
            joke_url: default_joke_url(),
            quote_url: default_quote_url(),
            timeout_seconds: default_services_timeout_seconds(),
        }
    }
}

fn default_completion_url() -> String {
    relay_llm::DEFAULT_COMPLETIONS_URL.to_string()
}

fn default_joke_url() -> String {
    "https://official-joke-api.appspot.com/random_joke".to_string()
}

fn default_quote_url() -> String {
    "https://zenquotes.io/api/random".to_string()
}

fn default_services_timeout_seconds() -> u64 {
    60
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConversationConfig {
    /// Keep at most this many turns per sender; 0 keeps everything.
    #[serde(default)]
    pub max_turns: usize,
}

impl RelayConfig {
    pub async fn load(path: Option<PathBuf>) -> anyhow::Result<Self> {
        let mut cfg = match path {
            Some(path) => Self::from_file(&path).await?,
            None => {
                let path = default_config_path();
                if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                    Self::from_file(&path).await?
                } else {
                    tracing::debug!(path = %path.display(), "no config file; using defaults");
                    Self::default()
                }
            }
        };

        cfg.apply_env_overrides(|key| std::env::var(key).ok());
        cfg.validate()?;
        Ok(cfg)
    }

    async fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| anyhow::anyhow!("read config {}: {e}", path.display()))?;
        toml::from_str(&contents)
            .map_err(|e| anyhow::anyhow!("parse config {}: {e}", path.display()))
    }

    fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = var("OPENAI_API_KEY") {
            self.keys.openai_api_key = Some(v);
        }
        if let Some(v) = var("PORT") {
            match v.trim().parse::<u16>() {
                Ok(port) => self.server.port = port,
                Err(e) => tracing::warn!(value = %v, %e, "ignoring invalid PORT"),
            }
        }
        if let Some(v) = var("BASE_URL") {
            self.server.base_url = Some(v);
        }
        if let Some(v) = var("CHATRELAY_MODEL") {
            self.general.model = v;
        }
        if let Some(v) = var("CHATRELAY_SYSTEM_PROMPT") {
            self.general.system_prompt = Some(v);
        }
        if let Some(v) = var("CHATRELAY_BRIDGE_URL") {
            self.session.bridge_url = v;
        }
        if let Some(v) = var("CHATRELAY_BRIDGE_TOKEN") {
            self.session.bridge_token = Some(v);
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.general.model.trim().is_empty() {
            return Err(anyhow::anyhow!("general.model is required"));
        }
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("server.port must be > 0"));
        }
        if self.server.qr_wait_seconds == 0 {
            return Err(anyhow::anyhow!("server.qr_wait_seconds must be > 0"));
        }
        if self.server.qr_wait_seconds > MAX_CHALLENGE_WAIT.as_secs() {
            return Err(anyhow::anyhow!(
                "server.qr_wait_seconds must be <= {}",
                MAX_CHALLENGE_WAIT.as_secs()
            ));
        }
        if self.server.http_timeout_seconds <= self.server.qr_wait_seconds {
            return Err(anyhow::anyhow!(
                "server.http_timeout_seconds ({}) must exceed server.qr_wait_seconds ({})",
                self.server.http_timeout_seconds,
                self.server.qr_wait_seconds
            ));
        }
        if self.server.http_max_in_flight == 0 {
            return Err(anyhow::anyhow!("server.http_max_in_flight must be > 0"));
        }
        if self.session.poll_interval_ms == 0 {
            return Err(anyhow::anyhow!("session.poll_interval_ms must be > 0"));
        }
        if self.session.challenge_check_interval_ms == 0 {
            return Err(anyhow::anyhow!(
                "session.challenge_check_interval_ms must be > 0"
            ));
        }
        require_http_url(&self.session.bridge_url, "session.bridge_url")?;
        require_http_url(&self.services.completion_url, "services.completion_url")?;
        require_http_url(&self.services.joke_url, "services.joke_url")?;
        require_http_url(&self.services.quote_url, "services.quote_url")?;
        if let Some(base_url) = self.server.base_url.as_deref() {
            require_http_url(base_url, "server.base_url")?;
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        format!("{}:{}", self.server.bind_host.trim(), self.server.port)
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid server.bind_host: {e}"))
    }

    pub fn base_url(&self) -> String {
        match self.server.base_url.as_deref() {
            Some(url) => url.trim().trim_end_matches('/').to_string(),
            None => format!("http://localhost:{}", self.server.port),
        }
    }

    /// Empty when no key is configured; the completion service rejects it then.
    pub fn openai_api_key(&self) -> &str {
        self.keys.openai_api_key.as_deref().unwrap_or_default()
    }

    pub fn qr_wait(&self) -> Duration {
        Duration::from_secs(self.server.qr_wait_seconds)
    }
}

fn require_http_url(raw: &str, field: &str) -> anyhow::Result<()> {
    let parsed = reqwest::Url::parse(raw.trim()).map_err(|e| anyhow::anyhow!("invalid {field}: {e}"))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(anyhow::anyhow!("invalid {field} scheme: {other}")),
    }
}

pub fn default_config_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".chatrelay").join("config.toml")
}
