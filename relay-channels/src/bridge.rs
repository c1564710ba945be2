//! HTTP bridge to a messaging web-client sidecar.
//!
//! The sidecar owns the actual web-client session. We ask it to start a
//! session, poll its event feed, and post replies back through it.

use crate::traits::{MessagingSession, SessionSubscription};
use crate::types::{InboundMessage, OutboundMessage, SessionEvent};
use anyhow::{Result, anyhow};
use chrono::Utc;
use reqwest::Url;
use serde::Deserialize;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const RECENT_EVENT_ID_CAPACITY: usize = 4096;
const DEFAULT_MAX_POLL_FAILURES: u32 = 5;

#[derive(Clone)]
pub struct BridgeSession {
    http: reqwest::Client,
    base_url: String,
    auth_token: Option<String>,
    poll_interval: Duration,
    max_poll_failures: u32,
    shutdown: CancellationToken,
}

impl BridgeSession {
    pub fn new(base_url: &str) -> Result<Self> {
        let base_url = normalize_http_url(base_url, "bridge_url")?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            http,
            base_url,
            auth_token: None,
            poll_interval: Duration::from_millis(1000),
            max_poll_failures: DEFAULT_MAX_POLL_FAILURES,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn with_auth_token(mut self, auth_token: Option<String>) -> Self {
        self.auth_token = auth_token
            .as_deref()
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(ToOwned::to_owned);
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_max_poll_failures(mut self, max_poll_failures: u32) -> Self {
        self.max_poll_failures = max_poll_failures.max(1);
        self
    }

    /// Tie the poll loop to an outer shutdown token.
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        Url::parse(&format!("{}{}", self.base_url, path))
            .map_err(|e| anyhow!("invalid bridge url for {path}: {e}"))
    }

    fn authorized_request(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.auth_token.as_deref() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait::async_trait]
impl MessagingSession for BridgeSession {
    fn session_id(&self) -> &str {
        "bridge"
    }

    #[tracing::instrument(level = "info", skip_all)]
    async fn initialize(&self, subscription: SessionSubscription) -> Result<()> {
        let client_id = Uuid::new_v4().to_string();
        let url = self.endpoint("/session/initialize")?;
        let response = self
            .authorized_request(self.http.post(url))
            .json(&serde_json::json!({ "client_id": client_id }))
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(anyhow!(
                "bridge session initialize failed: status={} body={}",
                status,
                body
            ));
        }
        tracing::info!(%client_id, bridge_url = %self.base_url, "bridge session initialized");

        let session = self.clone();
        tokio::spawn(async move {
            if let Err(error) = session.run_poll_loop(subscription).await {
                tracing::error!(%error, "bridge poll loop exited");
            }
        });
        Ok(())
    }

    async fn reply(&self, recipient_id: &str, message: OutboundMessage) -> Result<()> {
        let recipient_id = recipient_id.trim();
        if recipient_id.is_empty() {
            return Err(anyhow!("recipient_id is required"));
        }
        if message.content.trim().is_empty() {
            return Err(anyhow!("message content is empty"));
        }

        let payload = serde_json::json!({
            "recipient_id": recipient_id,
            "content": message.content,
            "reply_to_message_id": message.reply_to_message_id,
        });
        let url = self.endpoint("/messages/reply")?;
        let response = self
            .authorized_request(self.http.post(url))
            .json(&payload)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(anyhow!(
                "bridge reply failed: status={} body={}",
                status,
                body
            ));
        }
        Ok(())
    }

    async fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl BridgeSession {
    async fn run_poll_loop(&self, subscription: SessionSubscription) -> Result<()> {
        let session: Arc<dyn MessagingSession> = Arc::new(self.clone());
        let mut recent_event_ids = VecDeque::<String>::new();
        let mut recent_event_id_set = HashSet::<String>::new();
        let mut consecutive_failures = 0u32;

        loop {
            let events = tokio::select! {
                _ = self.shutdown.cancelled() => {
                    tracing::info!("bridge poll loop cancelled");
                    return Ok(());
                }
                polled = self.poll_once() => polled,
            };

            let events = match events {
                Ok(events) => {
                    consecutive_failures = 0;
                    events
                }
                Err(error) => {
                    consecutive_failures += 1;
                    tracing::warn!(%error, consecutive_failures, "bridge poll failed");
                    if consecutive_failures >= self.max_poll_failures {
                        let reason = format!("bridge unreachable: {error}");
                        subscription
                            .deliver(SessionEvent::Disconnected { reason }, session.clone())
                            .await;
                        return Ok(());
                    }
                    self.pause().await;
                    continue;
                }
            };

            let mut delivered = 0usize;
            for (index, envelope) in events.into_iter().enumerate() {
                let Some((event_id, event)) = normalize_session_event(&envelope, index) else {
                    continue;
                };
                if recent_event_id_set.contains(&event_id) {
                    continue;
                }
                remember_event_id(
                    event_id,
                    &mut recent_event_ids,
                    &mut recent_event_id_set,
                    RECENT_EVENT_ID_CAPACITY,
                );

                let disconnected = matches!(event, SessionEvent::Disconnected { .. });
                tracing::debug!(kind = event.kind(), "bridge event");
                subscription.deliver(event, session.clone()).await;
                delivered += 1;
                if disconnected {
                    tracing::info!("bridge session disconnected; poll loop ends");
                    return Ok(());
                }
            }

            if delivered > 0 {
                tracing::debug!(delivered, "bridge poll cycle complete");
            }
            self.pause().await;
        }
    }

    async fn pause(&self) {
        tokio::select! {
            _ = self.shutdown.cancelled() => {}
            _ = tokio::time::sleep(self.poll_interval) => {}
        }
    }

    async fn poll_once(&self) -> Result<Vec<BridgeEventEnvelope>> {
        let url = self.endpoint("/session/events")?;
        let response = self
            .authorized_request(self.http.get(url))
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(anyhow!(
                "bridge poll failed: status={} body={}",
                status,
                body
            ));
        }
        let body: serde_json::Value = serde_json::from_str(&body)?;
        Ok(extract_poll_events(body))
    }
}

fn normalize_http_url(raw: &str, field: &str) -> Result<String> {
    let normalized = raw.trim().trim_end_matches('/').to_string();
    if normalized.is_empty() {
        return Err(anyhow!("{field} is required"));
    }
    let parsed = Url::parse(&normalized).map_err(|e| anyhow!("invalid {field}: {e}"))?;
    match parsed.scheme() {
        "http" | "https" => Ok(normalized),
        other => Err(anyhow!("invalid {field} scheme: {other}")),
    }
}

fn extract_poll_events(body: serde_json::Value) -> Vec<BridgeEventEnvelope> {
    match body {
        serde_json::Value::Array(events) => events
            .into_iter()
            .filter_map(|event| serde_json::from_value(event).ok())
            .collect(),
        serde_json::Value::Object(mut obj) => {
            if let Some(events) = obj
                .remove("events")
                .and_then(|value| value.as_array().cloned())
            {
                return events
                    .into_iter()
                    .filter_map(|event| serde_json::from_value(event).ok())
                    .collect();
            }
            serde_json::from_value(serde_json::Value::Object(obj))
                .ok()
                .into_iter()
                .collect()
        }
        _ => Vec::new(),
    }
}

fn normalize_session_event(
    envelope: &BridgeEventEnvelope,
    fallback_index: usize,
) -> Option<(String, SessionEvent)> {
    let kind = envelope.kind.as_deref()?.trim().to_ascii_lowercase();
    let reason = || {
        envelope
            .reason
            .as_deref()
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .unwrap_or("unspecified")
            .to_string()
    };

    let event = match kind.as_str() {
        "qr" => {
            let token = envelope.token.as_deref().map(str::trim).unwrap_or_default();
            if token.is_empty() {
                return None;
            }
            SessionEvent::Challenge {
                token: token.to_string(),
            }
        }
        "authenticated" => SessionEvent::Authenticated,
        "auth_failure" => SessionEvent::AuthFailure { reason: reason() },
        "ready" => SessionEvent::Ready,
        "disconnected" => SessionEvent::Disconnected { reason: reason() },
        "message" => SessionEvent::Message(normalize_inbound_message(envelope)?),
        other => {
            tracing::debug!(kind = other, "ignoring unknown bridge event");
            return None;
        }
    };

    let timestamp = envelope
        .timestamp_ms
        .unwrap_or_else(|| Utc::now().timestamp_millis());
    let event_id = envelope
        .event_id
        .as_deref()
        .or(envelope.message_id.as_deref())
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| format!("{kind}:{timestamp}:{fallback_index}"));
    Some((event_id, event))
}

fn normalize_inbound_message(envelope: &BridgeEventEnvelope) -> Option<InboundMessage> {
    let sender_id = envelope
        .sender_id
        .as_deref()
        .map(str::trim)
        .unwrap_or_default();
    if sender_id.is_empty() {
        return None;
    }
    // Media-only messages arrive without a body and are still answered.
    let content = envelope.content.as_deref().unwrap_or_default();
    let message_id = envelope
        .message_id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let thread_id = envelope
        .thread_id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty() && *id != sender_id)
        .map(Into::into);

    Some(InboundMessage {
        message_id: message_id.into(),
        sender_id: sender_id.into(),
        thread_id,
        content: content.to_string(),
        received_at: Utc::now(),
    })
}

fn remember_event_id(
    event_id: String,
    order: &mut VecDeque<String>,
    set: &mut HashSet<String>,
    max_capacity: usize,
) {
    if set.insert(event_id.clone()) {
        order.push_back(event_id);
    }
    while order.len() > max_capacity {
        if let Some(evicted) = order.pop_front() {
            set.remove(&evicted);
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct BridgeEventEnvelope {
    event_id: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    token: Option<String>,
    reason: Option<String>,
    message_id: Option<String>,
    sender_id: Option<String>,
    thread_id: Option<String>,
    content: Option<String>,
    timestamp_ms: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::{LifecycleHandler, MessageHandler, ReplyHandle};
    use axum::Json;
    use axum::extract::State;
    use axum::routing::{get, post};
    use std::sync::Mutex;
    use tokio::sync::Notify;

    fn envelope(kind: &str) -> BridgeEventEnvelope {
        BridgeEventEnvelope {
            kind: Some(kind.to_string()),
            ..BridgeEventEnvelope::default()
        }
    }

    #[test]
    fn normalize_http_url_requires_http_or_https() {
        assert_eq!(
            normalize_http_url("http://127.0.0.1:8085/", "bridge_url").expect("valid"),
            "http://127.0.0.1:8085"
        );
        assert!(normalize_http_url("ws://127.0.0.1:8085", "bridge_url").is_err());
        assert!(normalize_http_url("  ", "bridge_url").is_err());
    }

    #[test]
    fn extract_poll_events_supports_array_and_wrapped_shape() {
        let array_payload = serde_json::json!([{ "type": "qr", "token": "abc" }]);
        let wrapped_payload = serde_json::json!({
            "events": [{ "type": "ready" }, { "type": "authenticated" }]
        });
        assert_eq!(extract_poll_events(array_payload).len(), 1);
        assert_eq!(extract_poll_events(wrapped_payload).len(), 2);
        assert!(extract_poll_events(serde_json::json!("nope")).is_empty());
    }

    #[test]
    fn normalize_maps_lifecycle_kinds() {
        let mut qr = envelope("qr");
        qr.token = Some("2@abc".to_string());
        qr.event_id = Some("e1".to_string());
        let (id, event) = normalize_session_event(&qr, 0).expect("qr event");
        assert_eq!(id, "e1");
        assert!(matches!(event, SessionEvent::Challenge { token } if token == "2@abc"));

        let (_, event) =
            normalize_session_event(&envelope("AUTH_FAILURE"), 0).expect("auth failure");
        assert!(matches!(event, SessionEvent::AuthFailure { reason } if reason == "unspecified"));

        let mut gone = envelope("disconnected");
        gone.reason = Some("LOGOUT".to_string());
        let (_, event) = normalize_session_event(&gone, 0).expect("disconnect");
        assert!(matches!(event, SessionEvent::Disconnected { reason } if reason == "LOGOUT"));

        assert!(normalize_session_event(&envelope("qr"), 0).is_none());
        assert!(normalize_session_event(&envelope("typing"), 0).is_none());
        assert!(normalize_session_event(&BridgeEventEnvelope::default(), 0).is_none());
    }

    #[test]
    fn normalize_message_keeps_body_and_drops_self_thread() {
        let mut msg = envelope("message");
        msg.message_id = Some("m-7".to_string());
        msg.sender_id = Some("15550001111@c.us".to_string());
        msg.thread_id = Some("15550001111@c.us".to_string());
        msg.content = Some("  hello  ".to_string());
        let (id, event) = normalize_session_event(&msg, 3).expect("message event");
        assert_eq!(id, "m-7");
        let SessionEvent::Message(inbound) = event else {
            panic!("expected message event");
        };
        assert_eq!(inbound.content, "  hello  ");
        assert!(inbound.thread_id.is_none());
        assert_eq!(inbound.reply_target(), "15550001111@c.us");

        msg.content = None;
        let (_, event) = normalize_session_event(&msg, 3).expect("media-only message");
        let SessionEvent::Message(inbound) = event else {
            panic!("expected message event");
        };
        assert_eq!(inbound.content, "");

        msg.sender_id = Some("  ".to_string());
        assert!(normalize_session_event(&msg, 3).is_none());
    }

    #[test]
    fn remember_event_id_evicts_oldest() {
        let mut order = VecDeque::new();
        let mut set = HashSet::new();
        for id in ["a", "b", "c"] {
            remember_event_id(id.to_string(), &mut order, &mut set, 2);
        }
        assert!(!set.contains("a"));
        assert!(set.contains("b") && set.contains("c"));
        assert_eq!(order.len(), 2);
    }

    #[derive(Default)]
    struct Captured {
        events: Mutex<Vec<String>>,
        done: Notify,
    }

    #[async_trait::async_trait]
    impl LifecycleHandler for Captured {
        async fn on_challenge(&self, token: String) {
            self.events.lock().expect("lock").push(format!("qr:{token}"));
        }
        async fn on_authenticated(&self) {
            self.events.lock().expect("lock").push("authenticated".into());
        }
        async fn on_auth_failure(&self, reason: String) {
            self.events
                .lock()
                .expect("lock")
                .push(format!("auth_failure:{reason}"));
        }
        async fn on_ready(&self) {
            self.events.lock().expect("lock").push("ready".into());
        }
        async fn on_disconnected(&self, reason: String) {
            self.events
                .lock()
                .expect("lock")
                .push(format!("disconnected:{reason}"));
            self.done.notify_one();
        }
    }

    #[async_trait::async_trait]
    impl MessageHandler for Captured {
        async fn on_message(&self, message: InboundMessage, reply: ReplyHandle) {
            self.events
                .lock()
                .expect("lock")
                .push(format!("message:{}", message.content));
            reply.send(format!("echo {}", message.content)).await.expect("reply");
        }
    }

    #[derive(Clone, Default)]
    struct FakeBridge {
        replies: Arc<Mutex<Vec<serde_json::Value>>>,
    }

    async fn spawn_fake_bridge(bridge: FakeBridge) -> String {
        let router = axum::Router::new()
            .route(
                "/session/initialize",
                post(|| async { Json(serde_json::json!({ "status": "ok" })) }),
            )
            .route(
                "/session/events",
                get(|| async {
                    Json(serde_json::json!({
                        "events": [
                            { "event_id": "1", "type": "qr", "token": "tok-1" },
                            { "event_id": "1", "type": "qr", "token": "tok-1" },
                            { "event_id": "2", "type": "authenticated" },
                            { "event_id": "3", "type": "ready" },
                            { "event_id": "4", "type": "message", "message_id": "m1",
                              "sender_id": "alice", "content": "hi" },
                            { "event_id": "5", "type": "disconnected", "reason": "LOGOUT" }
                        ]
                    }))
                }),
            )
            .route(
                "/messages/reply",
                post(
                    |State(bridge): State<FakeBridge>, Json(body): Json<serde_json::Value>| async move {
                        bridge.replies.lock().expect("lock").push(body);
                        Json(serde_json::json!({ "status": "ok" }))
                    },
                ),
            )
            .with_state(bridge);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind fake bridge");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn initialize_polls_and_delivers_events_until_disconnect() {
        let bridge = FakeBridge::default();
        let base_url = spawn_fake_bridge(bridge.clone()).await;
        let session = BridgeSession::new(&base_url)
            .expect("bridge session")
            .with_poll_interval(Duration::from_millis(10));
        let captured = Arc::new(Captured::default());

        session
            .initialize(SessionSubscription::new(captured.clone(), captured.clone()))
            .await
            .expect("initialize");
        tokio::time::timeout(Duration::from_secs(5), captured.done.notified())
            .await
            .expect("disconnect delivered");

        assert_eq!(
            *captured.events.lock().expect("lock"),
            vec![
                "qr:tok-1",
                "authenticated",
                "ready",
                "message:hi",
                "disconnected:LOGOUT",
            ]
        );
        let replies = bridge.replies.lock().expect("lock").clone();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0]["recipient_id"], "alice");
        assert_eq!(replies[0]["content"], "echo hi");
        assert_eq!(replies[0]["reply_to_message_id"], "m1");
    }

    #[tokio::test]
    async fn reply_sends_content_verbatim_and_rejects_blank() {
        let bridge = FakeBridge::default();
        let base_url = spawn_fake_bridge(bridge.clone()).await;
        let session = BridgeSession::new(&base_url).expect("bridge session");

        session
            .reply(
                "alice",
                OutboundMessage {
                    content: "  line one\nline two  ".to_string(),
                    reply_to_message_id: None,
                },
            )
            .await
            .expect("reply");
        let blank = session
            .reply(
                "alice",
                OutboundMessage {
                    content: " \n ".to_string(),
                    reply_to_message_id: None,
                },
            )
            .await;
        assert!(blank.is_err());

        let replies = bridge.replies.lock().expect("lock").clone();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0]["content"], "  line one\nline two  ");
        assert!(replies[0]["reply_to_message_id"].is_null());
    }

    #[tokio::test]
    async fn unreachable_bridge_reports_disconnect_after_max_failures() {
        let session = BridgeSession::new("http://127.0.0.1:9")
            .expect("bridge session")
            .with_poll_interval(Duration::from_millis(5))
            .with_max_poll_failures(2);
        let captured = Arc::new(Captured::default());

        session
            .run_poll_loop(SessionSubscription::new(captured.clone(), captured.clone()))
            .await
            .expect("loop ends cleanly");

        let events = captured.events.lock().expect("lock").clone();
        assert_eq!(events.len(), 1);
        assert!(events[0].starts_with("disconnected:bridge unreachable"));
    }
}
