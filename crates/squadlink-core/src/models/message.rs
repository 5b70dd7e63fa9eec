use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::{topics, REPLY_SNAPSHOT_MAX_CHARS, TEMP_ID_PREFIX};

/// Generate a client-unique temporary id for an optimistic send
pub fn new_temp_id() -> String {
    format!("{}{}", TEMP_ID_PREFIX, Uuid::new_v4())
}

/// Identifies one message sequence: a private chat (keyed by the counterpart)
/// or a team channel (keyed by the team).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum ConversationKey {
    User(String),
    Team(String),
}

impl ConversationKey {
    pub fn user(id: impl Into<String>) -> Self {
        ConversationKey::User(id.into())
    }

    pub fn team(id: impl Into<String>) -> Self {
        ConversationKey::Team(id.into())
    }

    pub fn id(&self) -> &str {
        match self {
            ConversationKey::User(id) | ConversationKey::Team(id) => id,
        }
    }

    pub fn is_team(&self) -> bool {
        matches!(self, ConversationKey::Team(_))
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConversationKey::User(id) => write!(f, "{}:{}", topics::DIRECT, id),
            ConversationKey::Team(id) => write!(f, "{}:{}", topics::TEAM, id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid conversation key: {0} (expected dm:<id> or team:<id>)")]
pub struct ParseKeyError(pub String);

impl FromStr for ConversationKey {
    type Err = ParseKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((topics::DIRECT, id)) if !id.is_empty() => Ok(ConversationKey::user(id)),
            Some((topics::TEAM, id)) if !id.is_empty() => Ok(ConversationKey::team(id)),
            _ => Err(ParseKeyError(s.to_string())),
        }
    }
}

/// Denormalized snapshot of the message being replied to, captured when the
/// reply is created so the preview survives the target being unloaded or deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyRef {
    pub message_id: String,
    pub sender_id: String,
    pub content: String,
}

impl ReplyRef {
    pub fn snapshot_of(message: &Message) -> Self {
        Self {
            message_id: message.id.clone(),
            sender_id: message.sender_id.clone(),
            content: message.content.chars().take(REPLY_SNAPSHOT_MAX_CHARS).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Store-issued id. Optimistic entries carry their temp id here until confirmed.
    pub id: String,
    pub conversation: ConversationKey,
    pub sender_id: String,
    pub content: String,
    pub sent_at: DateTime<Utc>,
    #[serde(default)]
    pub edited_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_optimistic: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_id: Option<String>,
    #[serde(default)]
    pub reply_to: Option<ReplyRef>,
}

impl Message {
    /// Build the local echo of a send intent.
    pub fn optimistic(
        temp_id: String,
        conversation: ConversationKey,
        sender_id: String,
        content: String,
        reply_to: Option<ReplyRef>,
    ) -> Self {
        Self {
            id: temp_id.clone(),
            conversation,
            sender_id,
            content,
            sent_at: Utc::now(),
            edited_at: None,
            is_optimistic: true,
            temp_id: Some(temp_id),
            reply_to,
        }
    }

    pub fn reply_to_id(&self) -> Option<&str> {
        self.reply_to.as_ref().map(|r| r.message_id.as_str())
    }

    pub fn is_from(&self, user_id: &str) -> bool {
        self.sender_id == user_id
    }
}

/// Conversation an item addressed to `target` by `sender` belongs to, as seen
/// by `local_user`. Private conversations are keyed by the counterpart: the
/// recipient for our own sends, the sender for everything else.
pub fn conversation_for(
    sender: &str,
    target: &ConversationKey,
    local_user: &str,
) -> ConversationKey {
    match target {
        ConversationKey::Team(_) => target.clone(),
        ConversationKey::User(recipient) if sender == local_user => {
            ConversationKey::User(recipient.clone())
        }
        ConversationKey::User(_) => ConversationKey::User(sender.to_string()),
    }
}

/// A message as the store and the push channel describe it: addressed by
/// `target` rather than by the local conversation key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: String,
    pub sender_id: String,
    pub target: ConversationKey,
    pub content: String,
    pub sent_at: DateTime<Utc>,
    #[serde(default)]
    pub edited_at: Option<DateTime<Utc>>,
    /// Echo of the temp id the sending client attached, when the server supports it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default)]
    pub reply_to: Option<ReplyRef>,
}

impl MessageRecord {
    /// Conversation this record belongs to from the local user's point of view.
    pub fn conversation_for(&self, local_user: &str) -> ConversationKey {
        conversation_for(&self.sender_id, &self.target, local_user)
    }

    pub fn into_message(self, local_user: &str) -> Message {
        let conversation = self.conversation_for(local_user);
        Message {
            id: self.id,
            conversation,
            sender_id: self.sender_id,
            content: self.content,
            sent_at: self.sent_at,
            edited_at: self.edited_at,
            is_optimistic: false,
            temp_id: None,
            reply_to: self.reply_to,
        }
    }
}
