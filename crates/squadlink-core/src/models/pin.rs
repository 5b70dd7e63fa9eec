use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::message::ConversationKey;

/// A reference to a pinned message. Does not own the message it points to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PinnedMessage {
    pub pin_id: String,
    pub message_id: String,
    pub conversation: ConversationKey,
    pub pinned_by: String,
    pub pinned_at: DateTime<Utc>,
}
