use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::message::{ConversationKey, Message};
use crate::constants::PREVIEW_MAX_CHARS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnlineStatus {
    Online,
    Away,
    #[default]
    Offline,
}

/// Last-message preview shown in the conversation list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePreview {
    pub message_id: String,
    pub sender_id: String,
    pub content: String,
    pub sent_at: DateTime<Utc>,
}

impl MessagePreview {
    pub fn of(message: &Message) -> Self {
        Self {
            message_id: message.id.clone(),
            sender_id: message.sender_id.clone(),
            content: message.content.chars().take(PREVIEW_MAX_CHARS).collect(),
            sent_at: message.sent_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Conversation {
    pub key: ConversationKey,
    pub display_name: String,
    pub avatar_ref: Option<String>,
    pub online_status: OnlineStatus,
    pub last_message: Option<MessagePreview>,
    pub unread_count: u32,
    pub last_seen_at: Option<DateTime<Utc>>,
}

impl Conversation {
    /// Minimal entry for a conversation we only know by key
    pub fn placeholder(key: ConversationKey) -> Self {
        Self {
            display_name: key.id().to_string(),
            key,
            avatar_ref: None,
            online_status: OnlineStatus::Offline,
            last_message: None,
            unread_count: 0,
            last_seen_at: None,
        }
    }

    pub fn last_activity(&self) -> Option<DateTime<Utc>> {
        self.last_message.as_ref().map(|m| m.sent_at)
    }
}

/// One row of `GET /conversations`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub key: ConversationKey,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub last_message: Option<MessagePreview>,
    #[serde(default)]
    pub unread_count: u32,
}
