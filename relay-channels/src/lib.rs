//! Messaging-session boundary for chatrelay.
//!
//! A session is pure I/O: it turns the messaging client's lifecycle and message
//! traffic into `SessionEvent`s for a `SessionSubscription`, and sends replies.

mod bridge;
mod traits;
mod types;

pub use bridge::BridgeSession;
pub use traits::{
    LifecycleHandler, MessageHandler, MessagingSession, ReplyHandle, SessionSubscription,
};
pub use types::{InboundMessage, MessageId, OutboundMessage, SenderId, SessionEvent, ThreadId};
