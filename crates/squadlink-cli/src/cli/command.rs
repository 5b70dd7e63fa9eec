use squadlink_core::models::ConversationKey;

/// One CLI invocation, decoupled from clap
#[derive(Debug, Clone, PartialEq)]
pub enum CliCommand {
    ListConversations,
    History {
        key: ConversationKey,
    },
    Send {
        key: ConversationKey,
        content: String,
        reply_to: Option<String>,
    },
    Edit {
        key: ConversationKey,
        id: String,
        content: String,
    },
    Delete {
        key: ConversationKey,
        id: String,
    },
    ListPins {
        key: ConversationKey,
    },
    Pin {
        key: ConversationKey,
        message_id: String,
    },
    Unpin {
        key: ConversationKey,
        pin_id: String,
    },
    /// Stay connected and stream events for one conversation
    Watch {
        key: ConversationKey,
    },
}

impl CliCommand {
    /// Conversation the command opens, if any
    pub fn conversation(&self) -> Option<&ConversationKey> {
        match self {
            CliCommand::ListConversations => None,
            CliCommand::History { key }
            | CliCommand::Send { key, .. }
            | CliCommand::Edit { key, .. }
            | CliCommand::Delete { key, .. }
            | CliCommand::ListPins { key }
            | CliCommand::Pin { key, .. }
            | CliCommand::Unpin { key, .. }
            | CliCommand::Watch { key } => Some(key),
        }
    }
}
