pub mod manager;
pub mod protocol;
pub mod websocket;

pub use manager::{
    ChannelEvent, ChannelHandle, ChannelManager, Credential, PushConnector, PushLink,
    TopicSubscription,
};
pub use protocol::{ClientCommand, ServerEvent, Topic};
pub use websocket::WebSocketConnector;

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Push connection failed: {0}")]
    Connect(String),
    #[error("Push channel not connected")]
    NotConnected,
    #[error("Push channel closed")]
    Closed,
    #[error("Push frame codec error: {0}")]
    Codec(#[from] serde_json::Error),
}
