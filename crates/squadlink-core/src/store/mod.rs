pub mod client;
pub mod last_seen;
pub mod roster;

pub use client::{HttpMessageStore, MessageStore, SendRequest};
pub use last_seen::{unread_since, LastSeenError, LastSeenStore};
pub use roster::{RosterProvider, StaticRoster};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Message store request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Message store error ({status}): {body}")]
    Status { status: u16, body: String },
    #[error("Failed to decode message store response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("Invalid message store URL: {0}")]
    InvalidUrl(String),
}

impl StoreError {
    /// The store refused the caller (401/403)
    pub fn is_forbidden(&self) -> bool {
        matches!(self, StoreError::Status { status: 401 | 403, .. })
    }

    /// Failures where nothing reached a definitive answer: transport errors and 5xx
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Http(_) => true,
            StoreError::Status { status, .. } => *status >= 500,
            StoreError::Decode(_) | StoreError::InvalidUrl(_) => false,
        }
    }
}
