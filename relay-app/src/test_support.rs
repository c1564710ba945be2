//! In-crate stand-ins for the messaging session and the outbound services.

use crate::external::ExternalServices;
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use relay_channels::{
    InboundMessage, MessageHandler, MessagingSession, OutboundMessage, ReplyHandle, SessionEvent,
    SessionSubscription,
};
use relay_llm::{ChatMessage, LlmError, Role};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

/// Records replies and initialize calls; events are pushed in with [`RecordingSession::emit`].
#[derive(Default)]
pub struct RecordingSession {
    fail_initialize: bool,
    fail_reply: bool,
    reply_attempts: AtomicUsize,
    initialize_calls: AtomicUsize,
    initialized: Notify,
    subscription: Mutex<Option<SessionSubscription>>,
    sent: Mutex<Vec<(String, String)>>,
    sent_signal: Notify,
}

impl RecordingSession {
    pub fn failing_initialize() -> Self {
        Self {
            fail_initialize: true,
            ..Self::default()
        }
    }

    /// Every `reply` call fails, as when the chat can no longer be reached.
    pub fn failing_reply() -> Self {
        Self {
            fail_reply: true,
            ..Self::default()
        }
    }

    pub fn initialize_calls(&self) -> usize {
        self.initialize_calls.load(Ordering::SeqCst)
    }

    pub async fn wait_for_initialize(&self) {
        self.initialized.notified().await;
    }

    pub async fn emit(self: &Arc<Self>, event: SessionEvent) {
        let subscription = self
            .subscription
            .lock()
            .expect("subscription lock")
            .clone()
            .expect("session initialized before emit");
        subscription.deliver(event, self.clone()).await;
    }

    /// `(recipient_id, content)` pairs in send order.
    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().expect("sent lock").clone()
    }

    pub async fn wait_for_replies(&self, count: usize) -> Vec<(String, String)> {
        self.wait_until(|| self.sent().len() >= count).await;
        self.sent()
    }

    /// Waits for `count` calls to `reply`, successful or not.
    pub async fn wait_for_reply_attempts(&self, count: usize) {
        self.wait_until(|| self.reply_attempts.load(Ordering::SeqCst) >= count)
            .await;
    }

    async fn wait_until(&self, done: impl Fn() -> bool) {
        let wait = async {
            loop {
                let notified = self.sent_signal.notified();
                if done() {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), wait)
            .await
            .expect("replies arrive in time");
    }
}

#[async_trait]
impl MessagingSession for RecordingSession {
    fn session_id(&self) -> &str {
        "recording"
    }

    async fn initialize(&self, subscription: SessionSubscription) -> Result<()> {
        self.initialize_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_initialize {
            return Err(anyhow!("client refused to start"));
        }
        *self.subscription.lock().expect("subscription lock") = Some(subscription);
        self.initialized.notify_one();
        Ok(())
    }

    async fn reply(&self, recipient_id: &str, message: OutboundMessage) -> Result<()> {
        if self.fail_reply {
            self.reply_attempts.fetch_add(1, Ordering::SeqCst);
            self.sent_signal.notify_waiters();
            return Err(anyhow!("recipient unreachable"));
        }
        self.sent
            .lock()
            .expect("sent lock")
            .push((recipient_id.to_string(), message.content));
        self.reply_attempts.fetch_add(1, Ordering::SeqCst);
        self.sent_signal.notify_waiters();
        Ok(())
    }
}

/// Message handler for lifecycle tests that never see traffic.
pub struct NullHandler;

#[async_trait]
impl MessageHandler for NullHandler {
    async fn on_message(&self, _message: InboundMessage, _reply: ReplyHandle) {}
}

#[derive(Debug, Clone)]
pub enum CompletionBehavior {
    Reply(String),
    /// Replies with `echo: <last user turn>`.
    Echo,
    Fail,
    Panic,
}

pub struct StubServices {
    behavior: CompletionBehavior,
    delay: Duration,
    transcripts: Mutex<Vec<Vec<ChatMessage>>>,
}

impl Default for StubServices {
    fn default() -> Self {
        Self::new(CompletionBehavior::Reply("hi there".to_string()))
    }
}

impl StubServices {
    pub const JOKE: &'static str = "Why did the crab never share?\nBecause he's shellfish.";
    pub const QUOTE: &'static str = "\"Stay hungry.\"\n- Steve Jobs";

    pub fn new(behavior: CompletionBehavior) -> Self {
        Self {
            behavior,
            delay: Duration::ZERO,
            transcripts: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn completion_calls(&self) -> usize {
        self.transcripts.lock().expect("transcripts lock").len()
    }

    /// Prompts passed to `complete_conversation`, in call order.
    pub fn transcripts(&self) -> Vec<Vec<ChatMessage>> {
        self.transcripts.lock().expect("transcripts lock").clone()
    }
}

#[async_trait]
impl ExternalServices for StubServices {
    async fn complete_conversation(&self, transcript: &[ChatMessage]) -> relay_llm::Result<String> {
        self.transcripts
            .lock()
            .expect("transcripts lock")
            .push(transcript.to_vec());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match &self.behavior {
            CompletionBehavior::Reply(reply) => Ok(reply.clone()),
            CompletionBehavior::Echo => {
                let last = transcript
                    .iter()
                    .rev()
                    .find(|m| m.role == Role::User)
                    .map(|m| m.content.as_str())
                    .unwrap_or_default();
                Ok(format!("echo: {last}"))
            }
            CompletionBehavior::Fail => Err(LlmError::Status {
                status: 500,
                body: "upstream down".to_string(),
            }),
            CompletionBehavior::Panic => panic!("completion stub panicked"),
        }
    }

    async fn fetch_joke(&self) -> String {
        Self::JOKE.to_string()
    }

    async fn fetch_quote(&self) -> String {
        Self::QUOTE.to_string()
    }
}
