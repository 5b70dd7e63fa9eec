//! Conversation Index: the ordered conversation list with previews, unread
//! counters and presence.

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::constants::PREVIEW_MAX_CHARS;
use crate::models::{
    Conversation, ConversationKey, ConversationSummary, Message, MessagePreview, OnlineStatus,
    RosterEntry,
};
use crate::store::LastSeenStore;

pub struct ConversationIndex {
    local_user: String,
    /// Sorted by last activity, most recent first
    conversations: Vec<Conversation>,
    active: Option<ConversationKey>,
    /// Conversations synthesized from events, awaiting canonical roster data
    backfill: Vec<ConversationKey>,
}

impl ConversationIndex {
    pub fn new(local_user: impl Into<String>) -> Self {
        Self {
            local_user: local_user.into(),
            conversations: Vec::new(),
            active: None,
            backfill: Vec::new(),
        }
    }

    pub fn active(&self) -> Option<&ConversationKey> {
        self.active.as_ref()
    }

    pub fn is_active(&self, key: &ConversationKey) -> bool {
        self.active.as_ref() == Some(key)
    }

    pub fn get(&self, key: &ConversationKey) -> Option<&Conversation> {
        self.conversations.iter().find(|c| &c.key == key)
    }

    fn get_mut(&mut self, key: &ConversationKey) -> Option<&mut Conversation> {
        self.conversations.iter_mut().find(|c| &c.key == key)
    }

    /// Immutable copy of the list in display order
    pub fn snapshot(&self) -> Vec<Conversation> {
        self.conversations.clone()
    }

    pub fn len(&self) -> usize {
        self.conversations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
    }

    pub fn total_unread(&self) -> u32 {
        self.conversations
            .iter()
            .map(|c| c.unread_count)
            .fold(0u32, u32::saturating_add)
    }

    /// Re-sort in one pass. Conversations without messages go last.
    fn sort(&mut self) {
        self.conversations
            .sort_by(|a, b| b.last_activity().cmp(&a.last_activity()));
    }

    /// Rebuild from the store's list overlaid with roster identity data.
    pub fn replace_all(
        &mut self,
        summaries: Vec<ConversationSummary>,
        roster: &[RosterEntry],
        last_seen: &LastSeenStore,
    ) {
        let mut conversations: Vec<Conversation> = Vec::with_capacity(summaries.len());

        for summary in summaries {
            if conversations.iter().any(|c| c.key == summary.key) {
                continue;
            }
            let mut conversation = Conversation::placeholder(summary.key.clone());
            if let Some(name) = summary.display_name {
                conversation.display_name = name;
            }
            conversation.last_seen_at = last_seen.get(&summary.key, &self.local_user);

            // A local checkpoint at or after the last message wins over the server count
            let seen_everything = match (&summary.last_message, conversation.last_seen_at) {
                (Some(last), Some(seen)) => seen >= last.sent_at,
                _ => false,
            };
            conversation.unread_count = if seen_everything || self.is_active(&summary.key) {
                0
            } else {
                summary.unread_count
            };
            conversation.last_message = summary.last_message;
            conversations.push(conversation);
        }

        for entry in roster {
            match conversations.iter_mut().find(|c| c.key == entry.key) {
                Some(conversation) => overlay(conversation, entry),
                None => {
                    let mut conversation = Conversation::placeholder(entry.key.clone());
                    overlay(&mut conversation, entry);
                    conversation.last_seen_at = last_seen.get(&entry.key, &self.local_user);
                    conversations.push(conversation);
                }
            }
        }

        self.conversations = conversations;
        self.backfill.clear();
        self.sort();
        info!("Conversation index loaded: {} conversations", self.conversations.len());
    }

    /// Account for a message delivered for `message.conversation`.
    /// Returns true if the conversation was unknown and has been synthesized.
    pub fn record_incoming(&mut self, message: &Message) -> bool {
        let key = message.conversation.clone();
        let counts_as_unread = !message.is_from(&self.local_user) && !self.is_active(&key);

        let synthesized = self.get(&key).is_none();
        if synthesized {
            debug!("First contact in {}, synthesizing conversation", key);
            self.conversations.push(Conversation::placeholder(key.clone()));
            if !self.backfill.contains(&key) {
                self.backfill.push(key.clone());
            }
        }

        if let Some(conversation) = self.get_mut(&key) {
            set_preview_if_newer(conversation, message);
            if counts_as_unread {
                conversation.unread_count = conversation.unread_count.saturating_add(1);
            }
        }
        self.sort();
        synthesized
    }

    /// Optimistic preview for a local send
    pub fn record_outgoing(&mut self, message: &Message) {
        if self.get(&message.conversation).is_none() {
            self.conversations
                .push(Conversation::placeholder(message.conversation.clone()));
        }
        if let Some(conversation) = self.get_mut(&message.conversation) {
            set_preview_if_newer(conversation, message);
        }
        self.sort();
    }

    /// Loaded history may carry a newer last message than the summary did.
    pub fn observe_latest(&mut self, message: &Message) {
        if let Some(conversation) = self.get_mut(&message.conversation) {
            set_preview_if_newer(conversation, message);
            self.sort();
        }
    }

    /// A pending send was confirmed: swap the preview over to the confirmed message.
    pub fn apply_confirmed(&mut self, temp_id: &str, message: &Message) {
        if let Some(conversation) = self.get_mut(&message.conversation) {
            let points_at_temp = conversation
                .last_message
                .as_ref()
                .is_some_and(|p| p.message_id == temp_id);
            if points_at_temp {
                conversation.last_message = Some(MessagePreview::of(message));
            } else {
                set_preview_if_newer(conversation, message);
            }
        }
        self.sort();
    }

    /// Point the preview at `last` (after a delete or failed send), when the
    /// current preview refers to `removed_id`.
    pub fn refresh_preview(
        &mut self,
        key: &ConversationKey,
        removed_id: &str,
        last: Option<&Message>,
    ) -> bool {
        let Some(conversation) = self.get_mut(key) else {
            return false;
        };
        let stale = conversation
            .last_message
            .as_ref()
            .is_some_and(|p| p.message_id == removed_id);
        if !stale {
            return false;
        }
        conversation.last_message = last.map(MessagePreview::of);
        self.sort();
        true
    }

    pub fn apply_edit(&mut self, key: &ConversationKey, id: &str, content: &str) -> bool {
        let Some(preview) = self
            .get_mut(key)
            .and_then(|c| c.last_message.as_mut())
            .filter(|p| p.message_id == id)
        else {
            return false;
        };
        preview.content = content.chars().take(PREVIEW_MAX_CHARS).collect();
        true
    }

    /// Make `key` the active conversation: unread drops to 0 and the returned
    /// time is the checkpoint to persist.
    pub fn activate(&mut self, key: &ConversationKey) -> DateTime<Utc> {
        let now = Utc::now();
        self.active = Some(key.clone());
        if self.get(key).is_none() {
            self.conversations.push(Conversation::placeholder(key.clone()));
            self.sort();
        }
        if let Some(conversation) = self.get_mut(key) {
            conversation.unread_count = 0;
            conversation.last_seen_at = Some(now);
        }
        now
    }

    /// Clear the active conversation; returns the checkpoint for the one left.
    pub fn deactivate(&mut self) -> Option<(ConversationKey, DateTime<Utc>)> {
        let key = self.active.take()?;
        let now = Utc::now();
        if let Some(conversation) = self.get_mut(&key) {
            conversation.last_seen_at = Some(now);
        }
        Some((key, now))
    }

    /// Overwrite a counter recomputed from history and checkpoints
    pub fn set_unread(&mut self, key: &ConversationKey, count: u32) {
        let active = self.is_active(key);
        if let Some(conversation) = self.get_mut(key) {
            conversation.unread_count = if active { 0 } else { count };
        }
    }

    pub fn apply_presence(&mut self, user_id: &str, status: OnlineStatus) -> bool {
        let key = ConversationKey::user(user_id);
        match self.get_mut(&key) {
            Some(conversation) if conversation.online_status != status => {
                conversation.online_status = status;
                true
            }
            _ => false,
        }
    }

    /// Canonical identity data arrived (backfill)
    pub fn apply_roster_entry(&mut self, entry: &RosterEntry) -> bool {
        self.backfill.retain(|k| k != &entry.key);
        match self.get_mut(&entry.key) {
            Some(conversation) => {
                overlay(conversation, entry);
                true
            }
            None => false,
        }
    }

    /// Drain the queue of conversations awaiting canonical roster data
    pub fn take_backfill(&mut self) -> Vec<ConversationKey> {
        std::mem::take(&mut self.backfill)
    }
}

fn overlay(conversation: &mut Conversation, entry: &RosterEntry) {
    conversation.display_name = entry.display_name.clone();
    conversation.avatar_ref = entry.avatar_ref.clone();
    conversation.online_status = entry.online_status;
}

fn set_preview_if_newer(conversation: &mut Conversation, message: &Message) {
    let newer = conversation
        .last_message
        .as_ref()
        .map_or(true, |p| message.sent_at >= p.sent_at);
    if newer {
        conversation.last_message = Some(MessagePreview::of(message));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    const ME: &str = "me";

    fn message(id: &str, key: ConversationKey, sender: &str, at: DateTime<Utc>) -> Message {
        Message {
            id: id.to_string(),
            conversation: key,
            sender_id: sender.to_string(),
            content: format!("body of {}", id),
            sent_at: at,
            edited_at: None,
            is_optimistic: false,
            temp_id: None,
            reply_to: None,
        }
    }

    fn summary(key: ConversationKey, unread: u32, at: DateTime<Utc>) -> ConversationSummary {
        ConversationSummary {
            last_message: Some(MessagePreview {
                message_id: format!("last-{}", key.id()),
                sender_id: key.id().to_string(),
                content: "...".to_string(),
                sent_at: at,
            }),
            key,
            display_name: None,
            unread_count: unread,
        }
    }

    fn keys(index: &ConversationIndex) -> Vec<String> {
        index
            .snapshot()
            .into_iter()
            .map(|c| format!("{}({})", c.key.id(), c.unread_count))
            .collect()
    }

    #[test]
    fn test_incoming_for_most_recent_conversation() {
        let now = Utc::now();
        let a = ConversationKey::user("a");
        let b = ConversationKey::user("b");
        let mut index = ConversationIndex::new(ME);
        index.replace_all(
            vec![
                summary(a.clone(), 0, now - Duration::minutes(1)),
                summary(b.clone(), 2, now - Duration::minutes(5)),
            ],
            &[],
            &LastSeenStore::in_memory(),
        );
        assert_eq!(keys(&index), vec!["a(0)", "b(2)"]);

        index.record_incoming(&message("m1", a.clone(), "a", now));
        assert_eq!(keys(&index), vec!["a(1)", "b(2)"]);
        assert_eq!(index.total_unread(), 3);
    }

    #[test]
    fn test_incoming_moves_conversation_to_front() {
        let now = Utc::now();
        let a = ConversationKey::user("a");
        let b = ConversationKey::user("b");
        let mut index = ConversationIndex::new(ME);
        index.replace_all(
            vec![
                summary(b.clone(), 2, now - Duration::minutes(1)),
                summary(a.clone(), 0, now - Duration::minutes(5)),
            ],
            &[],
            &LastSeenStore::in_memory(),
        );
        assert_eq!(keys(&index), vec!["b(2)", "a(0)"]);

        index.record_incoming(&message("m1", a.clone(), "a", now));
        assert_eq!(keys(&index), vec!["a(1)", "b(2)"]);
        assert_eq!(index.get(&a).unwrap().last_message.as_ref().unwrap().message_id, "m1");
    }

    #[test]
    fn test_unread_counts_only_others_while_inactive() {
        let now = Utc::now();
        let c = ConversationKey::team("t1");
        let mut index = ConversationIndex::new(ME);

        for i in 0..3 {
            index.record_incoming(&message(&format!("m{}", i), c.clone(), "bob", now));
        }
        index.record_incoming(&message("own", c.clone(), ME, now));
        assert_eq!(index.get(&c).unwrap().unread_count, 3);

        let seen_at = index.activate(&c);
        let conversation = index.get(&c).unwrap();
        assert_eq!(conversation.unread_count, 0);
        assert_eq!(conversation.last_seen_at, Some(seen_at));

        index.record_incoming(&message("m9", c.clone(), "bob", now));
        assert_eq!(index.get(&c).unwrap().unread_count, 0);
    }

    #[test]
    fn test_first_contact_is_synthesized_and_queued() {
        let mut index = ConversationIndex::new(ME);
        let stranger = ConversationKey::user("stranger");
        assert!(index.record_incoming(&message("m1", stranger.clone(), "stranger", Utc::now())));
        assert!(!index.record_incoming(&message("m2", stranger.clone(), "stranger", Utc::now())));
        assert_eq!(index.get(&stranger).unwrap().display_name, "stranger");
        assert_eq!(index.take_backfill(), vec![stranger.clone()]);
        assert!(index.take_backfill().is_empty());

        index.apply_roster_entry(&RosterEntry {
            key: stranger.clone(),
            display_name: "Stranger Danger".to_string(),
            avatar_ref: Some("av://1".to_string()),
            online_status: OnlineStatus::Away,
        });
        let conversation = index.get(&stranger).unwrap();
        assert_eq!(conversation.display_name, "Stranger Danger");
        assert_eq!(conversation.online_status, OnlineStatus::Away);
    }

    #[test]
    fn test_checkpoint_overrides_server_unread() {
        let now = Utc::now();
        let a = ConversationKey::user("a");
        let b = ConversationKey::user("b");
        let mut last_seen = LastSeenStore::in_memory();
        last_seen.mark_seen(&a, ME, now).unwrap();
        last_seen
            .mark_seen(&b, ME, now - Duration::hours(1))
            .unwrap();

        let mut index = ConversationIndex::new(ME);
        index.replace_all(
            vec![
                summary(a.clone(), 4, now - Duration::minutes(1)),
                summary(b.clone(), 4, now - Duration::minutes(1)),
            ],
            &[],
            &last_seen,
        );
        assert_eq!(index.get(&a).unwrap().unread_count, 0);
        assert_eq!(index.get(&b).unwrap().unread_count, 4);
    }

    #[test]
    fn test_roster_overlay_and_friends_without_history() {
        let now = Utc::now();
        let a = ConversationKey::user("a");
        let roster = vec![
            RosterEntry {
                key: a.clone(),
                display_name: "Alice".to_string(),
                avatar_ref: None,
                online_status: OnlineStatus::Online,
            },
            RosterEntry {
                key: ConversationKey::team("t1"),
                display_name: "Night Owls".to_string(),
                avatar_ref: None,
                online_status: OnlineStatus::Offline,
            },
        ];
        let mut index = ConversationIndex::new(ME);
        index.replace_all(vec![summary(a.clone(), 0, now)], &roster, &LastSeenStore::in_memory());

        let snapshot = index.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].display_name, "Alice");
        assert_eq!(snapshot[1].display_name, "Night Owls");
        assert!(snapshot[1].last_message.is_none());

        assert!(index.apply_presence("a", OnlineStatus::Away));
        assert!(!index.apply_presence("a", OnlineStatus::Away));
        assert!(!index.apply_presence("nobody", OnlineStatus::Online));
    }

    #[test]
    fn test_outgoing_preview_and_confirmation() {
        let now = Utc::now();
        let a = ConversationKey::user("a");
        let b = ConversationKey::user("b");
        let mut index = ConversationIndex::new(ME);
        index.replace_all(
            vec![
                summary(b.clone(), 0, now - Duration::minutes(1)),
                summary(a.clone(), 0, now - Duration::minutes(2)),
            ],
            &[],
            &LastSeenStore::in_memory(),
        );

        let pending = Message::optimistic(
            "tmp-1".to_string(),
            a.clone(),
            ME.to_string(),
            "on my way".to_string(),
            None,
        );
        index.record_outgoing(&pending);
        assert_eq!(index.snapshot()[0].key, a);

        let sent_at = pending.sent_at - Duration::milliseconds(5);
        let mut confirmed = message("m7", a.clone(), ME, sent_at);
        confirmed.content = "on my way".to_string();
        index.apply_confirmed("tmp-1", &confirmed);
        assert_eq!(index.get(&a).unwrap().last_message.as_ref().unwrap().message_id, "m7");

        assert!(index.apply_edit(&a, "m7", "omw"));
        assert_eq!(index.get(&a).unwrap().last_message.as_ref().unwrap().content, "omw");

        assert!(index.refresh_preview(&a, "m7", None));
        assert!(index.get(&a).unwrap().last_message.is_none());
        assert_eq!(index.snapshot()[0].key, b);
    }
}
