use crate::channel::ChannelError;
use crate::store::{LastSeenError, StoreError};

/// Errors surfaced to the caller of a session operation.
///
/// Recoverable conditions (a failed send, a dropped channel) have already been
/// cleaned up locally when one of these is returned: failed optimistic entries
/// are removed, never left dangling.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Message content cannot be empty")]
    Validation,
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
    #[error("Network error, message not sent: {0}")]
    Transient(String),
    #[error("A send is already in flight")]
    SendInFlight,
    #[error("No active conversation")]
    NoActiveConversation,
    #[error("Unknown message: {0}")]
    UnknownMessage(String),
    #[error("Unknown pin: {0}")]
    UnknownPin(String),
    /// The server refused an edit. The caller restores `previous_content`.
    #[error("Edit of {id} was rejected: {reason}")]
    EditRejected {
        id: String,
        previous_content: String,
        reason: String,
    },
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    LastSeen(#[from] LastSeenError),
}

impl SyncError {
    /// Recoverable errors may succeed if the user simply tries again.
    /// Policy errors (permission, validation) never will.
    pub fn is_recoverable(&self) -> bool {
        match self {
            SyncError::Transient(_)
            | SyncError::SendInFlight
            | SyncError::EditRejected { .. }
            | SyncError::Channel(_)
            | SyncError::Store(_)
            | SyncError::LastSeen(_) => true,
            SyncError::Validation
            | SyncError::PermissionDenied(_)
            | SyncError::NoActiveConversation
            | SyncError::UnknownMessage(_)
            | SyncError::UnknownPin(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_errors_are_not_recoverable() {
        assert!(!SyncError::Validation.is_recoverable());
        assert!(!SyncError::PermissionDenied("unpin".into()).is_recoverable());
        assert!(SyncError::Transient("timeout".into()).is_recoverable());
        assert!(SyncError::from(ChannelError::NotConnected).is_recoverable());
    }
}
