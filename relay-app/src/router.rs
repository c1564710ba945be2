//! Entry point for inbound chat messages.
//!
//! Each sender gets a FIFO lane: one queue plus one worker task, so a sender's
//! messages are answered in arrival order and their transcript mutations never
//! interleave. Different senders are handled concurrently. Lanes are never
//! reclaimed, matching the per-sender transcripts they guard.

use crate::commands;
use crate::conversation::ConversationStore;
use crate::external::ExternalServices;
use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::FutureExt;
use relay_channels::{InboundMessage, MessageHandler, ReplyHandle, SenderId};
use relay_llm::Role;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::mpsc;

pub const COMPLETION_APOLOGY: &str = "Sorry, I encountered an error while processing your request.";

struct LaneJob {
    message: InboundMessage,
    reply: ReplyHandle,
}

/// A computed reply. `assistant_turn` replies join the transcript only once
/// they have been delivered.
struct Routed {
    text: String,
    assistant_turn: bool,
}

impl Routed {
    fn plain(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            assistant_turn: false,
        }
    }
}

struct RouterCore {
    conversations: ConversationStore,
    services: Arc<dyn ExternalServices>,
}

pub struct MessageRouter {
    core: Arc<RouterCore>,
    lanes: DashMap<SenderId, mpsc::UnboundedSender<LaneJob>>,
}

impl MessageRouter {
    pub fn new(conversations: ConversationStore, services: Arc<dyn ExternalServices>) -> Self {
        Self {
            core: Arc::new(RouterCore {
                conversations,
                services,
            }),
            lanes: DashMap::new(),
        }
    }

    /// Reply for one message, bypassing the lanes and treating it as delivered.
    #[cfg(test)]
    pub async fn route(&self, message: &InboundMessage) -> String {
        let routed = self.core.route(message).await;
        self.core.delivered(&message.sender_id, routed)
    }

    #[cfg(test)]
    pub fn active_lanes(&self) -> usize {
        self.lanes.len()
    }

    #[cfg(test)]
    pub fn transcript(&self, sender: &str) -> Vec<relay_llm::ChatMessage> {
        self.core.conversations.snapshot(&SenderId::from(sender))
    }

    fn lane(&self, sender: &SenderId) -> mpsc::UnboundedSender<LaneJob> {
        self.lanes
            .entry(sender.clone())
            .or_insert_with(|| {
                let (tx, rx) = mpsc::unbounded_channel();
                tokio::spawn(run_lane(self.core.clone(), sender.clone(), rx));
                tracing::debug!(sender_id = %sender, "opened sender lane");
                tx
            })
            .clone()
    }
}

impl RouterCore {
    /// Compute the reply for one message. On the conversation path the user
    /// turn is appended here; the assistant turn waits for [`Self::delivered`].
    /// Callers must serialize calls per sender.
    #[tracing::instrument(level = "info", skip_all, fields(sender_id = %message.sender_id, message_id = %message.message_id))]
    async fn route(&self, message: &InboundMessage) -> Routed {
        let sender = &message.sender_id;
        if let Some(invocation) = commands::parse_command(&message.content) {
            let text = commands::dispatch(
                &invocation,
                sender,
                &self.conversations,
                self.services.as_ref(),
            )
            .await;
            return Routed::plain(text);
        }

        self.conversations
            .append(sender, Role::User, message.content.clone());
        let transcript = self.conversations.snapshot(sender);
        match self.services.complete_conversation(&transcript).await {
            Ok(reply) => Routed {
                text: reply,
                assistant_turn: true,
            },
            Err(error) => {
                tracing::warn!(%error, "completion failed; keeping the unanswered user turn");
                Routed::plain(COMPLETION_APOLOGY)
            }
        }
    }

    /// Record a reply the sender actually received.
    fn delivered(&self, sender: &SenderId, routed: Routed) -> String {
        if routed.assistant_turn {
            self.conversations
                .append(sender, Role::Assistant, routed.text.clone());
        }
        routed.text
    }
}

async fn run_lane(core: Arc<RouterCore>, sender: SenderId, mut jobs: mpsc::UnboundedReceiver<LaneJob>) {
    while let Some(LaneJob { message, reply }) = jobs.recv().await {
        let routed = match AssertUnwindSafe(core.route(&message)).catch_unwind().await {
            Ok(routed) => routed,
            Err(_) => {
                tracing::error!(sender_id = %sender, message_id = %message.message_id, "message handling panicked");
                Routed::plain(COMPLETION_APOLOGY)
            }
        };
        match reply.send(routed.text.as_str()).await {
            Ok(()) => {
                core.delivered(&sender, routed);
            }
            Err(error) => {
                tracing::warn!(
                    sender_id = %sender,
                    recipient_id = reply.recipient_id(),
                    %error,
                    "failed to send reply; assistant turn not recorded"
                );
            }
        }
    }
    tracing::debug!(sender_id = %sender, "sender lane closed");
}

#[async_trait]
impl MessageHandler for MessageRouter {
    async fn on_message(&self, message: InboundMessage, reply: ReplyHandle) {
        let sender = message.sender_id.clone();
        if self.lane(&sender).send(LaneJob { message, reply }).is_err() {
            tracing::error!(sender_id = %sender, "sender lane is closed; dropping message");
        }
    }
}
