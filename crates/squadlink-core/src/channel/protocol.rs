//! Push-channel wire format.
//!
//! Both directions are closed tagged unions serialized as JSON objects with a
//! `type` discriminator, e.g. `{"type":"join_topic","topic":"dm:u1"}`.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::constants::topics;
use crate::models::{ConversationKey, MessageRecord, OnlineStatus};

/// A push-channel subscription scope
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Topic(String);

impl Topic {
    pub fn for_conversation(key: &ConversationKey) -> Self {
        Topic(key.to_string())
    }

    /// Session-wide topic carrying everything addressed to the local user
    pub fn user_inbox(user_id: &str) -> Self {
        Topic(format!("{}:{}", topics::USER, user_id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Client → server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientCommand {
    JoinTopic {
        topic: Topic,
    },
    LeaveTopic {
        topic: Topic,
    },
    SendMessage {
        content: String,
        target: ConversationKey,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply_to: Option<String>,
        /// Temp id of the optimistic entry, echoed back on `message_received`
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
    },
    EditMessage {
        id: String,
        content: String,
    },
    DeleteMessage {
        id: String,
    },
    Typing {
        target: ConversationKey,
        is_typing: bool,
    },
}

impl ClientCommand {
    pub fn name(&self) -> &'static str {
        match self {
            ClientCommand::JoinTopic { .. } => "join_topic",
            ClientCommand::LeaveTopic { .. } => "leave_topic",
            ClientCommand::SendMessage { .. } => "send_message",
            ClientCommand::EditMessage { .. } => "edit_message",
            ClientCommand::DeleteMessage { .. } => "delete_message",
            ClientCommand::Typing { .. } => "typing",
        }
    }
}

/// Server → client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    MessageReceived {
        message: MessageRecord,
    },
    MessageEdited {
        message: MessageRecord,
    },
    MessageDeleted {
        id: String,
        sender_id: String,
        target: ConversationKey,
    },
    Typing {
        sender_id: String,
        target: ConversationKey,
        is_typing: bool,
    },
    PresenceChanged {
        user_id: String,
        status: OnlineStatus,
    },
    Error {
        message: String,
        /// Set when the error refuses one of our sends
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_command_wire_shape() {
        let cmd = ClientCommand::SendMessage {
            content: "gg".to_string(),
            target: ConversationKey::user("bob"),
            reply_to: None,
            client_id: Some("tmp-1".to_string()),
        };
        let value = serde_json::to_value(&cmd).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "send_message",
                "content": "gg",
                "target": {"kind": "user", "id": "bob"},
                "client_id": "tmp-1"
            })
        );
        assert_eq!(cmd.name(), "send_message");
    }

    #[test]
    fn test_parse_message_received() {
        let raw = json!({
            "type": "message_received",
            "message": {
                "id": "m42",
                "sender_id": "bob",
                "target": {"kind": "user", "id": "me"},
                "content": "gg",
                "sent_at": "2024-05-01T12:00:00Z"
            }
        });
        let event: ServerEvent = serde_json::from_value(raw).unwrap();
        match event {
            ServerEvent::MessageReceived { message } => {
                assert_eq!(message.id, "m42");
                assert!(message.client_id.is_none());
                assert!(message.reply_to.is_none());
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_parse_error_and_presence() {
        let err: ServerEvent =
            serde_json::from_str(r#"{"type":"error","message":"rate limited"}"#).unwrap();
        assert_eq!(
            err,
            ServerEvent::Error {
                message: "rate limited".to_string(),
                client_id: None,
            }
        );

        let refused: ServerEvent = serde_json::from_str(
            r#"{"type":"error","message":"muted","client_id":"tmp-7"}"#,
        )
        .unwrap();
        assert_eq!(
            refused,
            ServerEvent::Error {
                message: "muted".to_string(),
                client_id: Some("tmp-7".to_string()),
            }
        );

        let presence: ServerEvent =
            serde_json::from_str(r#"{"type":"presence_changed","user_id":"bob","status":"online"}"#)
                .unwrap();
        assert_eq!(
            presence,
            ServerEvent::PresenceChanged {
                user_id: "bob".to_string(),
                status: OnlineStatus::Online
            }
        );
    }

    #[test]
    fn test_unknown_event_type_is_rejected() {
        assert!(serde_json::from_str::<ServerEvent>(r#"{"type":"reaction_added"}"#).is_err());
    }

    #[test]
    fn test_topics() {
        assert_eq!(Topic::for_conversation(&ConversationKey::team("t1")).as_str(), "team:t1");
        assert_eq!(Topic::user_inbox("me").to_string(), "user:me");
    }
}
