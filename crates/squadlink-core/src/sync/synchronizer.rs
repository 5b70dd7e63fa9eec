use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, trace};

use crate::constants::ECHO_MATCH_WINDOW_MS;
use crate::models::{ConversationKey, Message, MessageRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    Empty,
    Loading,
    Ready,
}

/// What `apply_received` / `confirm_send` did with an authoritative message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// Replaced the pending optimistic entry `temp_id`
    Reconciled { temp_id: String },
    Appended,
    /// Already present under this id; nothing changed
    Duplicate,
}

#[derive(Debug, Clone)]
struct Entry {
    message: Message,
    /// Arrival order, the tie-breaker for equal `sent_at`
    seq: u64,
}

/// The message sequence of one conversation.
///
/// Merges the REST snapshot, optimistic local sends and push-delivered events
/// into one list sorted by `(sent_at, arrival)` and de-duplicated on the
/// authoritative id.
#[derive(Debug)]
pub struct MessageSynchronizer {
    key: ConversationKey,
    local_user: String,
    echo_window: chrono::Duration,
    state: LoadState,
    entries: Vec<Entry>,
    next_seq: u64,
    /// temp id -> authoritative id of sends already confirmed
    confirmed: HashMap<String, String>,
    /// Own messages that arrived without a client id and matched no pending send.
    /// A later optimistic append with the same content claims one instead of
    /// producing a second bubble.
    unclaimed_own: HashSet<String>,
}

impl MessageSynchronizer {
    pub fn new(key: ConversationKey, local_user: impl Into<String>, echo_window: Duration) -> Self {
        let echo_window = chrono::Duration::from_std(echo_window)
            .unwrap_or_else(|_| chrono::Duration::milliseconds(ECHO_MATCH_WINDOW_MS as i64));
        Self {
            key,
            local_user: local_user.into(),
            echo_window,
            state: LoadState::Empty,
            entries: Vec::new(),
            next_seq: 0,
            confirmed: HashMap::new(),
            unclaimed_own: HashSet::new(),
        }
    }

    pub fn key(&self) -> &ConversationKey {
        &self.key
    }

    pub fn state(&self) -> LoadState {
        self.state
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn find(&self, id: &str) -> Option<&Message> {
        self.position(id).map(|idx| &self.entries[idx].message)
    }

    pub fn last_message(&self) -> Option<&Message> {
        self.entries.last().map(|e| &e.message)
    }

    /// Immutable copy of the rendered sequence
    pub fn snapshot(&self) -> Vec<Message> {
        self.entries.iter().map(|e| e.message.clone()).collect()
    }

    /// Whether `temp_id` is still waiting for its authoritative message
    pub fn is_pending(&self, temp_id: &str) -> bool {
        self.position_of_temp(temp_id).is_some()
    }

    pub fn pending_count(&self) -> usize {
        self.entries.iter().filter(|e| e.message.is_optimistic).count()
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.message.id == id)
    }

    fn position_of_temp(&self, temp_id: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.message.is_optimistic && e.message.temp_id.as_deref() == Some(temp_id))
    }

    fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn sort(&mut self) {
        self.entries.sort_by(|a, b| {
            a.message
                .sent_at
                .cmp(&b.message.sent_at)
                .then(a.seq.cmp(&b.seq))
        });
    }

    pub fn begin_load(&mut self) {
        if self.state == LoadState::Empty {
            self.state = LoadState::Loading;
        }
    }

    /// A history fetch failed; allow the next activation to retry it.
    pub fn load_failed(&mut self) {
        if self.state == LoadState::Loading {
            self.state = LoadState::Empty;
        }
    }

    /// Merge a full history snapshot.
    ///
    /// Pending optimistic sends survive unless the snapshot confirms them, or
    /// the snapshot already covers more than an echo window past them (the
    /// server never stored them). Confirmed entries missing from the snapshot
    /// are kept only if they are newer than everything in it (delivered live
    /// while the fetch was running).
    ///
    /// Returns the temp ids of the pending sends that were dropped.
    pub fn apply_snapshot(&mut self, records: Vec<MessageRecord>) -> Vec<String> {
        let newest = records.iter().map(|r| r.sent_at).max();
        let mut previous = std::mem::take(&mut self.entries);

        for record in records {
            if self.position(&record.id).is_some() {
                continue;
            }
            let client_id = record.client_id.clone();
            let message = record.into_message(&self.local_user);

            let pending = if message.is_from(&self.local_user) {
                find_pending(&previous, &message, client_id.as_deref(), self.echo_window)
            } else {
                None
            };
            let seq = match pending {
                Some(idx) => {
                    let entry = previous.remove(idx);
                    if let Some(temp_id) = entry.message.temp_id {
                        debug!("Snapshot confirmed pending send {} as {}", temp_id, message.id);
                        self.confirmed.insert(temp_id, message.id.clone());
                    }
                    entry.seq
                }
                None => match previous.iter().position(|e| e.message.id == message.id) {
                    Some(idx) => previous.remove(idx).seq,
                    None => self.next_seq(),
                },
            };
            self.entries.push(Entry { message, seq });
        }

        let before = self.entries.len();
        let mut lost = Vec::new();
        for entry in previous {
            let keep = match newest {
                None => true,
                Some(newest) if entry.message.is_optimistic => {
                    entry.message.sent_at + self.echo_window >= newest
                }
                Some(newest) => entry.message.sent_at > newest,
            };
            if keep {
                self.entries.push(entry);
                continue;
            }
            match entry.message.temp_id {
                Some(temp_id) if entry.message.is_optimistic => {
                    debug!("Dropping send {} the snapshot has moved past", temp_id);
                    lost.push(temp_id);
                }
                _ => trace!("Dropping {} absent from snapshot", entry.message.id),
            }
        }

        self.state = LoadState::Ready;
        self.sort();
        debug!(
            "Snapshot for {}: {} messages ({} kept from before)",
            self.key,
            self.entries.len(),
            self.entries.len() - before
        );
        lost
    }

    /// Append the local echo of a send. Returns false when the send was already
    /// confirmed (the authoritative message is present), in which case nothing
    /// is appended.
    pub fn push_optimistic(&mut self, message: Message) -> bool {
        if let Some(temp_id) = &message.temp_id {
            if let Some(id) = self.confirmed.get(temp_id) {
                debug!("Send {} already confirmed as {}, skipping local echo", temp_id, id);
                return false;
            }
        }

        let claim = self
            .unclaimed_own
            .iter()
            .filter_map(|id| self.position(id))
            .filter(|&idx| {
                let existing = &self.entries[idx].message;
                existing.sender_id == message.sender_id
                    && existing.content == message.content
                    && within(existing.sent_at, message.sent_at, self.echo_window)
            })
            .min_by_key(|&idx| self.entries[idx].seq);
        if let Some(idx) = claim {
            let id = self.entries[idx].message.id.clone();
            self.unclaimed_own.remove(&id);
            if let Some(temp_id) = message.temp_id {
                debug!("Echo {} arrived before local send {}, skipping", id, temp_id);
                self.confirmed.insert(temp_id, id);
            }
            return false;
        }

        let seq = self.next_seq();
        self.entries.push(Entry { message, seq });
        self.sort();
        true
    }

    /// Apply the store's answer to a REST send.
    pub fn confirm_send(&mut self, temp_id: &str, record: MessageRecord) -> ReceiveOutcome {
        let message = record.into_message(&self.local_user);
        self.confirmed
            .insert(temp_id.to_string(), message.id.clone());
        self.unclaimed_own.remove(&message.id);

        if self.position(&message.id).is_some() {
            // Push echo won the race
            if let Some(idx) = self.position_of_temp(temp_id) {
                self.entries.remove(idx);
            }
            debug!("Send {} already delivered as {}", temp_id, message.id);
            return ReceiveOutcome::Duplicate;
        }

        match self.position_of_temp(temp_id) {
            Some(idx) => {
                self.entries[idx].message = message;
                self.sort();
                ReceiveOutcome::Reconciled {
                    temp_id: temp_id.to_string(),
                }
            }
            None => {
                let seq = self.next_seq();
                self.entries.push(Entry { message, seq });
                self.sort();
                ReceiveOutcome::Appended
            }
        }
    }

    /// Drop a send that could not be delivered. Returns the removed entry.
    pub fn fail_send(&mut self, temp_id: &str) -> Option<Message> {
        let idx = self.position_of_temp(temp_id)?;
        debug!("Removing failed send {} from {}", temp_id, self.key);
        Some(self.entries.remove(idx).message)
    }

    /// Apply a push-delivered (or otherwise authoritative) new message.
    pub fn apply_received(&mut self, record: MessageRecord) -> ReceiveOutcome {
        if self.position(&record.id).is_some() {
            trace!("Duplicate delivery of {}", record.id);
            return ReceiveOutcome::Duplicate;
        }

        let client_id = record.client_id.clone();
        let message = record.into_message(&self.local_user);

        if message.is_from(&self.local_user) {
            let pending = find_pending(
                &self.entries,
                &message,
                client_id.as_deref(),
                self.echo_window,
            );
            if let Some(idx) = pending {
                let temp_id = self.entries[idx]
                    .message
                    .temp_id
                    .clone()
                    .unwrap_or_default();
                debug!("Reconciled pending send {} with {}", temp_id, message.id);
                self.confirmed.insert(temp_id.clone(), message.id.clone());
                self.entries[idx].message = message;
                self.sort();
                return ReceiveOutcome::Reconciled { temp_id };
            }
            match client_id {
                Some(client_id) => {
                    self.confirmed.insert(client_id, message.id.clone());
                }
                None => {
                    self.unclaimed_own.insert(message.id.clone());
                }
            }
        }

        let seq = self.next_seq();
        self.entries.push(Entry { message, seq });
        self.sort();
        ReceiveOutcome::Appended
    }

    /// Optimistic in-place edit. Returns the content it replaced.
    pub fn apply_edit_local(&mut self, id: &str, content: &str) -> Option<String> {
        let idx = self.position(id)?;
        Some(std::mem::replace(
            &mut self.entries[idx].message.content,
            content.to_string(),
        ))
    }

    /// Apply an authoritative edit. Returns false if the message is not loaded.
    pub fn apply_edit_confirmed(&mut self, record: &MessageRecord) -> bool {
        let Some(idx) = self.position(&record.id) else {
            return false;
        };
        let entry = &mut self.entries[idx].message;
        entry.content = record.content.clone();
        entry.edited_at = record.edited_at.or(Some(Utc::now()));
        if let Some(reply) = &record.reply_to {
            entry.reply_to = Some(reply.clone());
        }
        true
    }

    /// Put back a message whose delete the server refused.
    pub fn reinsert(&mut self, message: Message) {
        if self.position(&message.id).is_some() {
            return;
        }
        let seq = self.next_seq();
        self.entries.push(Entry { message, seq });
        self.sort();
    }

    /// Remove a message. Replies that point to it keep their snapshot.
    pub fn remove(&mut self, id: &str) -> Option<Message> {
        let idx = self.position(id)?;
        self.unclaimed_own.remove(id);
        Some(self.entries.remove(idx).message)
    }
}

/// Pending optimistic entry an own-message echo confirms: exact client id
/// first, then same content within the echo window (oldest pending wins).
fn find_pending(
    entries: &[Entry],
    message: &Message,
    client_id: Option<&str>,
    window: chrono::Duration,
) -> Option<usize> {
    if let Some(client_id) = client_id {
        let exact = entries.iter().position(|e| {
            e.message.is_optimistic && e.message.temp_id.as_deref() == Some(client_id)
        });
        if exact.is_some() {
            return exact;
        }
    }
    entries
        .iter()
        .enumerate()
        .filter(|(_, e)| {
            e.message.is_optimistic
                && e.message.sender_id == message.sender_id
                && e.message.content == message.content
                && within(e.message.sent_at, message.sent_at, window)
        })
        .min_by_key(|(_, e)| e.seq)
        .map(|(idx, _)| idx)
}

fn within(a: DateTime<Utc>, b: DateTime<Utc>, window: chrono::Duration) -> bool {
    let diff = if a > b { a - b } else { b - a };
    diff <= window
}
