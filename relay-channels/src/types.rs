use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self::new(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                self.as_str()
            }
        }

        impl Deref for $name {
            type Target = str;

            fn deref(&self) -> &Self::Target {
                self.as_str()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

id_newtype!(MessageId);
id_newtype!(SenderId);
id_newtype!(ThreadId);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub message_id: MessageId,
    pub sender_id: SenderId,
    /// Chat the message arrived in, when it differs from the sender (groups).
    pub thread_id: Option<ThreadId>,
    /// Text body; empty for media-only messages.
    pub content: String,
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    /// Where a reply to this message should be delivered.
    pub fn reply_target(&self) -> &str {
        self.thread_id
            .as_deref()
            .unwrap_or_else(|| self.sender_id.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub content: String,
    #[serde(default)]
    pub reply_to_message_id: Option<MessageId>,
}

/// Everything a messaging session can report to its subscriber.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Challenge { token: String },
    Authenticated,
    AuthFailure { reason: String },
    Ready,
    Disconnected { reason: String },
    Message(InboundMessage),
}

impl SessionEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Challenge { .. } => "qr",
            Self::Authenticated => "authenticated",
            Self::AuthFailure { .. } => "auth_failure",
            Self::Ready => "ready",
            Self::Disconnected { .. } => "disconnected",
            Self::Message(_) => "message",
        }
    }
}
