use serde::{Deserialize, Serialize};

use super::conversation::OnlineStatus;
use super::message::ConversationKey;

/// Identity data for a friend or team, as resolved by the roster collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RosterEntry {
    pub key: ConversationKey,
    pub display_name: String,
    #[serde(default)]
    pub avatar_ref: Option<String>,
    #[serde(default)]
    pub online_status: OnlineStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberRole {
    #[default]
    Member,
    Captain,
    Admin,
}

impl MemberRole {
    /// Captains and admins may remove anyone's pin in their team channel
    pub fn can_moderate(self) -> bool {
        matches!(self, MemberRole::Captain | MemberRole::Admin)
    }
}
