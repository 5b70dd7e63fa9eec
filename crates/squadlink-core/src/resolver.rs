//! Reply & Pin Resolver: the pending reply target, reply-preview resolution
//! and the per-conversation pinned sets.

use std::collections::HashMap;

use tracing::debug;

use crate::error::SyncError;
use crate::models::{ConversationKey, MemberRole, Message, PinnedMessage, ReplyRef};
use crate::sync::MessageSynchronizer;

/// Where a click on a reply preview leads
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyResolution {
    /// Target is in the loaded sequence; the UI may scroll to and highlight it
    Loaded { message_id: String },
    /// Target is not loaded (older or deleted); only the snapshot can be shown
    SnapshotOnly(ReplyRef),
}

#[derive(Default)]
pub struct ReplyPinResolver {
    pending_reply: Option<(ConversationKey, ReplyRef)>,
    pins: HashMap<ConversationKey, Vec<PinnedMessage>>,
}

impl ReplyPinResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `target` the reply target of the next send in its conversation.
    pub fn begin_reply(&mut self, target: &Message) {
        debug!("Replying to {} in {}", target.id, target.conversation);
        self.pending_reply = Some((target.conversation.clone(), ReplyRef::snapshot_of(target)));
    }

    pub fn cancel_reply(&mut self) {
        self.pending_reply = None;
    }

    pub fn pending_reply(&self, key: &ConversationKey) -> Option<&ReplyRef> {
        self.pending_reply
            .as_ref()
            .filter(|(k, _)| k == key)
            .map(|(_, reply)| reply)
    }

    /// Consume the reply target for a send in `key`. A target set in another
    /// conversation is discarded, never carried over.
    pub fn take_reply(&mut self, key: &ConversationKey) -> Option<ReplyRef> {
        match self.pending_reply.take() {
            Some((k, reply)) if &k == key => Some(reply),
            Some((k, _)) => {
                debug!("Dropping reply target from {} (sending in {})", k, key);
                None
            }
            None => None,
        }
    }

    /// Restore a reply target consumed by a send that was then refused.
    pub fn restore_reply(&mut self, key: &ConversationKey, reply: ReplyRef) {
        self.pending_reply = Some((key.clone(), reply));
    }

    pub fn resolve(reply: &ReplyRef, sequence: &MessageSynchronizer) -> ReplyResolution {
        match sequence.find(&reply.message_id) {
            Some(message) => ReplyResolution::Loaded {
                message_id: message.id.clone(),
            },
            None => ReplyResolution::SnapshotOnly(reply.clone()),
        }
    }

    pub fn pins(&self, key: &ConversationKey) -> &[PinnedMessage] {
        self.pins.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn set_pins(&mut self, key: &ConversationKey, pins: Vec<PinnedMessage>) {
        self.pins.insert(key.clone(), pins);
    }

    pub fn find_pin(&self, key: &ConversationKey, pin_id: &str) -> Option<&PinnedMessage> {
        self.pins(key).iter().find(|p| p.pin_id == pin_id)
    }

    pub fn pin_for_message(
        &self,
        key: &ConversationKey,
        message_id: &str,
    ) -> Option<&PinnedMessage> {
        self.pins(key).iter().find(|p| p.message_id == message_id)
    }

    pub fn insert_pin(&mut self, pin: PinnedMessage) {
        let pins = self.pins.entry(pin.conversation.clone()).or_default();
        if pins.iter().any(|p| p.pin_id == pin.pin_id) {
            return;
        }
        pins.push(pin);
    }

    /// Client-side unpin rule: the pin's author, or a captain/admin of the team.
    /// Private chats have no moderator role.
    pub fn check_unpin(
        pin: &PinnedMessage,
        user_id: &str,
        role: MemberRole,
    ) -> Result<(), SyncError> {
        if pin.pinned_by == user_id {
            return Ok(());
        }
        if pin.conversation.is_team() && role.can_moderate() {
            return Ok(());
        }
        Err(SyncError::PermissionDenied(format!(
            "only {} or a team captain/admin can remove this pin",
            pin.pinned_by
        )))
    }

    pub fn remove_pin(&mut self, key: &ConversationKey, pin_id: &str) -> Option<PinnedMessage> {
        let pins = self.pins.get_mut(key)?;
        let idx = pins.iter().position(|p| p.pin_id == pin_id)?;
        Some(pins.remove(idx))
    }

    /// A message was deleted: drop every pin that references it.
    pub fn cascade_delete(
        &mut self,
        key: &ConversationKey,
        message_id: &str,
    ) -> Vec<PinnedMessage> {
        let Some(pins) = self.pins.get_mut(key) else {
            return Vec::new();
        };
        let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(pins)
            .into_iter()
            .partition(|p| p.message_id == message_id);
        *pins = kept;
        if !removed.is_empty() {
            debug!("Deleting {} removed {} pin(s)", message_id, removed.len());
        }
        removed
    }
}
