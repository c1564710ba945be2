//! Per-sender conversation transcripts.

use dashmap::DashMap;
use relay_channels::SenderId;
use relay_llm::{ChatMessage, Role};

pub struct ConversationStore {
    transcripts: DashMap<SenderId, Vec<ChatMessage>>,
    max_turns: usize,
}

impl ConversationStore {
    /// `max_turns == 0` keeps every turn until the sender resets.
    pub fn new(max_turns: usize) -> Self {
        Self {
            transcripts: DashMap::new(),
            max_turns,
        }
    }

    pub fn append(&self, sender: &SenderId, role: Role, content: impl Into<String>) {
        let mut transcript = self.transcripts.entry(sender.clone()).or_default();
        transcript.push(ChatMessage::new(role, content));
        if self.max_turns > 0 && transcript.len() > self.max_turns {
            let overflow = transcript.len() - self.max_turns;
            transcript.drain(..overflow);
        }
    }

    pub fn reset(&self, sender: &SenderId) {
        self.transcripts
            .entry(sender.clone())
            .or_default()
            .clear();
    }

    pub fn snapshot(&self, sender: &SenderId) -> Vec<ChatMessage> {
        self.transcripts
            .get(sender)
            .map(|t| t.value().clone())
            .unwrap_or_default()
    }

    #[cfg(test)]
    pub fn sender_count(&self) -> usize {
        self.transcripts.len()
    }
}
