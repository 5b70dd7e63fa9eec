pub mod conversation;
pub mod message;
pub mod pin;
pub mod roster;

pub use conversation::{Conversation, ConversationSummary, MessagePreview, OnlineStatus};
pub use message::{
    conversation_for, new_temp_id, ConversationKey, Message, MessageRecord, ParseKeyError, ReplyRef,
};
pub use pin::PinnedMessage;
pub use roster::{MemberRole, RosterEntry};
