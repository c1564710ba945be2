//! `!command` parser and dispatcher.

use crate::conversation::ConversationStore;
use crate::external::ExternalServices;
use relay_channels::SenderId;

pub const COMMAND_SIGIL: char = '!';

pub const HELP_TEXT: &str = "List of commands:\n\
!help - Show this help message\n\
!joke - Tell a joke\n\
!quote - Get an inspirational quote\n\
!reset - Reset the conversation history";

pub const RESET_CONFIRMATION: &str = "Conversation history has been reset.";

pub const UNKNOWN_COMMAND: &str = "Unknown command. Type !help for a list of commands.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandInvocation {
    pub verb: String,
    /// Words after the verb. No handler reads it yet.
    pub argument: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Help,
    Joke,
    Quote,
    Reset,
    Unknown,
}

impl Command {
    fn from_verb(verb: &str) -> Self {
        match verb {
            "help" => Self::Help,
            "joke" => Self::Joke,
            "quote" => Self::Quote,
            "reset" => Self::Reset,
            _ => Self::Unknown,
        }
    }
}

/// `None` when `text` is conversation rather than a command.
pub fn parse_command(text: &str) -> Option<CommandInvocation> {
    let rest = text.strip_prefix(COMMAND_SIGIL)?;
    let mut words = rest.split_whitespace();
    let verb = words.next().unwrap_or_default().to_lowercase();
    let argument = words.collect::<Vec<_>>().join(" ");
    Some(CommandInvocation { verb, argument })
}

/// Produce the reply for one command. Total: every invocation gets a string.
#[tracing::instrument(level = "info", skip_all, fields(verb = %invocation.verb, argument = %invocation.argument))]
pub async fn dispatch(
    invocation: &CommandInvocation,
    sender: &SenderId,
    conversations: &ConversationStore,
    services: &dyn ExternalServices,
) -> String {
    match Command::from_verb(&invocation.verb) {
        Command::Help => HELP_TEXT.to_string(),
        Command::Joke => services.fetch_joke().await,
        Command::Quote => services.fetch_quote().await,
        Command::Reset => {
            conversations.reset(sender);
            tracing::info!(sender_id = %sender, "conversation reset");
            RESET_CONFIRMATION.to_string()
        }
        Command::Unknown => UNKNOWN_COMMAND.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::StubServices;
    use relay_llm::{ChatMessage, Role};

    #[test]
    fn parse_splits_verb_and_argument() {
        assert_eq!(
            parse_command("!JOKE  about   cats "),
            Some(CommandInvocation {
                verb: "joke".to_string(),
                argument: "about cats".to_string(),
            })
        );
        assert_eq!(
            parse_command("!   help"),
            Some(CommandInvocation {
                verb: "help".to_string(),
                argument: String::new(),
            })
        );
    }

    #[test]
    fn parse_requires_leading_sigil() {
        assert_eq!(parse_command("hello !help"), None);
        assert_eq!(parse_command(" !help"), None);
        assert_eq!(parse_command("what's up?"), None);
        assert_eq!(
            parse_command("!"),
            Some(CommandInvocation {
                verb: String::new(),
                argument: String::new(),
            })
        );
    }

    #[tokio::test]
    async fn help_joke_and_quote_replies() {
        let store = ConversationStore::new(0);
        let services = StubServices::default();
        let sender = SenderId::from("alice");

        let reply = dispatch(&parse_command("!help").expect("cmd"), &sender, &store, &services).await;
        assert_eq!(reply, HELP_TEXT);
        assert!(reply.contains("!reset - Reset the conversation history"));

        let reply = dispatch(&parse_command("!joke").expect("cmd"), &sender, &store, &services).await;
        assert_eq!(reply, StubServices::JOKE);

        let reply = dispatch(&parse_command("!Quote").expect("cmd"), &sender, &store, &services).await;
        assert_eq!(reply, StubServices::QUOTE);
        assert_eq!(store.sender_count(), 0);
    }

    #[tokio::test]
    async fn reset_clears_only_the_senders_transcript() {
        let store = ConversationStore::new(0);
        let services = StubServices::default();
        let alice = SenderId::from("alice");
        let bob = SenderId::from("bob");
        store.append(&alice, Role::User, "hello");
        store.append(&alice, Role::Assistant, "hi there");
        store.append(&bob, Role::User, "yo");

        let reply = dispatch(&parse_command("!reset").expect("cmd"), &alice, &store, &services).await;
        assert_eq!(reply, RESET_CONFIRMATION);
        assert!(store.snapshot(&alice).is_empty());
        assert_eq!(store.snapshot(&bob), vec![ChatMessage::user("yo")]);
    }

    #[tokio::test]
    async fn unknown_verbs_leave_store_untouched() {
        let store = ConversationStore::new(0);
        let services = StubServices::default();
        let alice = SenderId::from("alice");
        store.append(&alice, Role::User, "hello");

        for text in ["!weather", "!", "!resett", "!help-me now"] {
            let reply = dispatch(&parse_command(text).expect("cmd"), &alice, &store, &services).await;
            assert_eq!(reply, UNKNOWN_COMMAND, "input {text:?}");
        }
        assert_eq!(store.snapshot(&alice), vec![ChatMessage::user("hello")]);
        assert_eq!(services.completion_calls(), 0);
    }
}
