use crate::types::{InboundMessage, OutboundMessage, SessionEvent};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// Receives the authentication lifecycle of a messaging session.
#[async_trait]
pub trait LifecycleHandler: Send + Sync {
    /// A new pairing challenge (QR payload) was issued. May repeat as the
    /// client rotates challenges.
    async fn on_challenge(&self, token: String);

    async fn on_authenticated(&self);

    async fn on_auth_failure(&self, reason: String);

    async fn on_ready(&self);

    /// The session is gone; it must be initialized again before it can issue
    /// new challenges.
    async fn on_disconnected(&self, reason: String);
}

/// Receives inbound chat messages together with a way to answer them.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn on_message(&self, message: InboundMessage, reply: ReplyHandle);
}

#[async_trait]
pub trait MessagingSession: Send + Sync {
    /// Stable identifier for logs: "bridge", "memory", ...
    fn session_id(&self) -> &str;

    /// Start a fresh client session and deliver its events to `subscription`
    /// until it disconnects.
    async fn initialize(&self, subscription: SessionSubscription) -> Result<()>;

    /// Send `message` to a chat (sender or group id).
    async fn reply(&self, recipient_id: &str, message: OutboundMessage) -> Result<()>;

    /// Stop delivering events. Sessions without background work keep the default.
    async fn shutdown(&self) {}
}

/// The named handlers a session delivers its events to.
#[derive(Clone)]
pub struct SessionSubscription {
    lifecycle: Arc<dyn LifecycleHandler>,
    messages: Arc<dyn MessageHandler>,
}

impl SessionSubscription {
    pub fn new(lifecycle: Arc<dyn LifecycleHandler>, messages: Arc<dyn MessageHandler>) -> Self {
        Self {
            lifecycle,
            messages,
        }
    }

    /// Route one event to the handler that owns it.
    pub async fn deliver(&self, event: SessionEvent, session: Arc<dyn MessagingSession>) {
        match event {
            SessionEvent::Challenge { token } => self.lifecycle.on_challenge(token).await,
            SessionEvent::Authenticated => self.lifecycle.on_authenticated().await,
            SessionEvent::AuthFailure { reason } => self.lifecycle.on_auth_failure(reason).await,
            SessionEvent::Ready => self.lifecycle.on_ready().await,
            SessionEvent::Disconnected { reason } => {
                self.lifecycle.on_disconnected(reason).await
            }
            SessionEvent::Message(message) => {
                let reply = ReplyHandle::new(session, &message);
                self.messages.on_message(message, reply).await
            }
        }
    }
}

/// Answers exactly one inbound message.
#[derive(Clone)]
pub struct ReplyHandle {
    session: Arc<dyn MessagingSession>,
    recipient_id: String,
    message_id: crate::types::MessageId,
}

impl ReplyHandle {
    pub fn new(session: Arc<dyn MessagingSession>, message: &InboundMessage) -> Self {
        Self {
            session,
            recipient_id: message.reply_target().to_string(),
            message_id: message.message_id.clone(),
        }
    }

    pub fn recipient_id(&self) -> &str {
        &self.recipient_id
    }

    pub async fn send(&self, content: impl Into<String>) -> Result<()> {
        self.session
            .reply(
                &self.recipient_id,
                OutboundMessage {
                    content: content.into(),
                    reply_to_message_id: Some(self.message_id.clone()),
                },
            )
            .await
    }
}
