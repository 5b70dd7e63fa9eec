use serde::Serialize;

use crate::error::SyncError;
use crate::models::ConversationKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToastLevel {
    Info,
    /// Transient failure, the user may retry
    Warning,
    /// Policy refusal or server-reported error
    Error,
}

/// What the presentation layer needs to react to after a session operation
/// or an incoming channel event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CoreEvent {
    /// The message sequence of `key` changed; re-read its snapshot
    MessagesChanged { key: ConversationKey },
    /// Order, previews, unread counts or presence changed
    ConversationsChanged,
    PinsChanged { key: ConversationKey },
    Toast { level: ToastLevel, message: String },
    Typing {
        key: ConversationKey,
        user_id: String,
        is_typing: bool,
    },
    /// A delivered reply points at a loaded message the UI may reveal
    RevealReply {
        key: ConversationKey,
        message_id: String,
    },
    ConnectionChanged { connected: bool },
}

impl CoreEvent {
    pub fn toast(level: ToastLevel, message: impl Into<String>) -> Self {
        CoreEvent::Toast {
            level,
            message: message.into(),
        }
    }

    /// Toast for a failed operation: policy refusals block, the rest warn
    pub fn for_error(error: &SyncError) -> Self {
        let level = if error.is_recoverable() {
            ToastLevel::Warning
        } else {
            ToastLevel::Error
        };
        CoreEvent::toast(level, error.to_string())
    }
}
