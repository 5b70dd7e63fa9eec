//! Chat session: wires the channel manager, the per-conversation
//! synchronizers, the conversation index and the reply/pin resolver, and owns
//! the active-conversation lifecycle.
//!
//! Every operation returns the `CoreEvent`s the presentation layer should
//! react to. Operations run on one task; the only concurrency is the push
//! supervisor behind the channel manager.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::channel::{
    ChannelError, ChannelEvent, ChannelHandle, ChannelManager, ClientCommand, Credential,
    PushConnector, ServerEvent, Topic, TopicSubscription, WebSocketConnector,
};
use crate::config::CoreConfig;
use crate::error::SyncError;
use crate::events::{CoreEvent, ToastLevel};
use crate::index::ConversationIndex;
use crate::models::{
    conversation_for, new_temp_id, Conversation, ConversationKey, MemberRole, Message,
    MessageRecord, PinnedMessage, ReplyRef,
};
use crate::resolver::{ReplyPinResolver, ReplyResolution};
use crate::store::{
    unread_since, HttpMessageStore, LastSeenStore, MessageStore, RosterProvider, SendRequest,
    StaticRoster, StoreError,
};
use crate::sync::{LoadState, MessageSynchronizer, ReceiveOutcome};

/// Map a store failure onto the caller-facing taxonomy
fn store_failure(error: StoreError) -> SyncError {
    if error.is_forbidden() {
        SyncError::PermissionDenied(error.to_string())
    } else if error.is_transient() {
        SyncError::Transient(error.to_string())
    } else {
        SyncError::Store(error)
    }
}

/// How a dispatched send left the client
#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    /// Written to the push channel; the server echo confirms it
    Pushed,
    /// Stored over REST (channel was down)
    Stored(MessageRecord),
}

#[derive(Debug, Default)]
struct SendSlot {
    in_flight: bool,
    /// Sends dropped between `prepare_send` and `complete_send`
    abandoned: Vec<(ConversationKey, String)>,
}

/// Holds the session's single send slot from `prepare_send` until
/// `complete_send`. Dropped any earlier, it frees the slot and leaves the
/// optimistic entry for the session to remove.
struct SendGuard {
    slot: Arc<Mutex<SendSlot>>,
    key: ConversationKey,
    temp_id: String,
    completed: bool,
}

impl SendGuard {
    fn complete(mut self) {
        self.completed = true;
    }
}

impl Drop for SendGuard {
    fn drop(&mut self) {
        let mut slot = self.slot.lock();
        slot.in_flight = false;
        if !self.completed {
            debug!("Send {} abandoned before completion", self.temp_id);
            let temp_id = std::mem::take(&mut self.temp_id);
            slot.abandoned.push((self.key.clone(), temp_id));
        }
    }
}

/// A send whose optimistic entry is in place, ready to go over the network.
///
/// Holds everything it needs, so `dispatch` runs without borrowing the session
/// and the conversation may be switched meanwhile.
pub struct PendingSend {
    key: ConversationKey,
    temp_id: String,
    content: String,
    reply_to: Option<ReplyRef>,
    channel: ChannelHandle,
    store: Arc<dyn MessageStore>,
    guard: SendGuard,
}

/// Result of `PendingSend::dispatch`, to be handed back to `complete_send`
pub struct DispatchedSend {
    key: ConversationKey,
    temp_id: String,
    reply_to: Option<ReplyRef>,
    result: Result<SendOutcome, SyncError>,
    guard: SendGuard,
}

impl DispatchedSend {
    pub fn key(&self) -> &ConversationKey {
        &self.key
    }

    pub fn temp_id(&self) -> &str {
        &self.temp_id
    }
}

impl PendingSend {
    pub fn key(&self) -> &ConversationKey {
        &self.key
    }

    pub fn temp_id(&self) -> &str {
        &self.temp_id
    }

    /// Push when connected, REST otherwise (or when the push write fails).
    pub async fn dispatch(self) -> DispatchedSend {
        let result = self.deliver().await;
        DispatchedSend {
            key: self.key,
            temp_id: self.temp_id,
            reply_to: self.reply_to,
            result,
            guard: self.guard,
        }
    }

    async fn deliver(&self) -> Result<SendOutcome, SyncError> {
        let reply_id = self.reply_to.as_ref().map(|r| r.message_id.clone());

        if self.channel.is_connected() {
            let command = ClientCommand::SendMessage {
                content: self.content.clone(),
                target: self.key.clone(),
                reply_to: reply_id.clone(),
                client_id: Some(self.temp_id.clone()),
            };
            match self.channel.send(command).await {
                Ok(()) => {
                    debug!("Send {} pushed to {}", self.temp_id, self.key);
                    return Ok(SendOutcome::Pushed);
                }
                Err(e) => warn!("Push send failed ({}), falling back to REST", e),
            }
        }

        let request = SendRequest {
            content: self.content.clone(),
            target: self.key.clone(),
            reply_to: reply_id,
            client_id: Some(self.temp_id.clone()),
        };
        let record = self
            .store
            .send_message(&request)
            .await
            .map_err(store_failure)?;
        debug!("Send {} stored as {}", self.temp_id, record.id);
        Ok(SendOutcome::Stored(record))
    }
}

pub struct ChatSession {
    config: CoreConfig,
    credential: Credential,
    channel: ChannelManager,
    store: Arc<dyn MessageStore>,
    roster: Arc<dyn RosterProvider>,
    index: ConversationIndex,
    resolver: ReplyPinResolver,
    buckets: HashMap<ConversationKey, MessageSynchronizer>,
    subscription: Option<TopicSubscription>,
    last_seen: LastSeenStore,
    send_slot: Arc<Mutex<SendSlot>>,
    /// Pushed sends waiting for their echo: temp id -> conversation
    awaiting_echo: HashMap<String, ConversationKey>,
    /// Set when the channel dropped; the next `Connected` refreshes history
    resync_on_connect: bool,
}

impl ChatSession {
    pub fn new(
        config: CoreConfig,
        credential: Credential,
        connector: Arc<dyn PushConnector>,
        store: Arc<dyn MessageStore>,
        roster: Arc<dyn RosterProvider>,
        last_seen: LastSeenStore,
    ) -> Self {
        let channel = ChannelManager::new(connector, config.reconnect.clone());
        let index = ConversationIndex::new(credential.user_id.clone());
        Self {
            config,
            credential,
            channel,
            store,
            roster,
            index,
            resolver: ReplyPinResolver::new(),
            buckets: HashMap::new(),
            subscription: None,
            last_seen,
            send_slot: Arc::new(Mutex::new(SendSlot::default())),
            awaiting_echo: HashMap::new(),
            resync_on_connect: false,
        }
    }

    /// Session over the production REST store and websocket push channel,
    /// with the roster held in memory.
    pub fn with_defaults(config: CoreConfig, credential: Credential) -> Result<Self, SyncError> {
        let store = HttpMessageStore::new(
            config.api_base_url.clone(),
            credential.token.clone(),
            config.request_timeout(),
        )?;
        let connector = WebSocketConnector::new(config.push_url.clone());
        let last_seen = LastSeenStore::new(&config.data_dir);
        Ok(Self::new(
            config,
            credential,
            Arc::new(connector),
            Arc::new(store),
            Arc::new(StaticRoster::default()),
            last_seen,
        ))
    }

    pub fn local_user(&self) -> &str {
        &self.credential.user_id
    }

    pub fn is_connected(&self) -> bool {
        self.channel.is_connected()
    }

    pub fn is_sending(&self) -> bool {
        self.send_slot.lock().in_flight
    }

    pub fn active(&self) -> Option<&ConversationKey> {
        self.index.active()
    }

    pub fn conversations(&self) -> Vec<Conversation> {
        self.index.snapshot()
    }

    pub fn conversation(&self, key: &ConversationKey) -> Option<&Conversation> {
        self.index.get(key)
    }

    pub fn messages(&self, key: &ConversationKey) -> Vec<Message> {
        self.buckets
            .get(key)
            .map(MessageSynchronizer::snapshot)
            .unwrap_or_default()
    }

    pub fn pins(&self, key: &ConversationKey) -> Vec<PinnedMessage> {
        self.resolver.pins(key).to_vec()
    }

    pub fn pending_reply(&self) -> Option<&ReplyRef> {
        self.index
            .active()
            .and_then(|key| self.resolver.pending_reply(key))
    }

    /// The channel event stream; taken once by whoever drives the session.
    pub fn take_channel_events(&mut self) -> Option<mpsc::UnboundedReceiver<ChannelEvent>> {
        self.channel.take_event_rx()
    }

    fn bucket_mut(&mut self, key: &ConversationKey) -> &mut MessageSynchronizer {
        let local_user = &self.credential.user_id;
        let window = self.config.echo_match_window();
        self.buckets
            .entry(key.clone())
            .or_insert_with(|| MessageSynchronizer::new(key.clone(), local_user.clone(), window))
    }

    fn active_key(&self) -> Result<ConversationKey, SyncError> {
        self.index
            .active()
            .cloned()
            .ok_or(SyncError::NoActiveConversation)
    }

    /// Remove a send that will not be confirmed. False if it was no longer pending.
    fn drop_send(&mut self, key: &ConversationKey, temp_id: &str) -> bool {
        let Some(bucket) = self.buckets.get_mut(key) else {
            return false;
        };
        if bucket.fail_send(temp_id).is_none() {
            return false;
        }
        let last = bucket.last_message().cloned();
        self.index.refresh_preview(key, temp_id, last.as_ref());
        true
    }

    /// Clear the optimistic entries of sends dropped before completion.
    fn sweep_abandoned(&mut self) -> Vec<CoreEvent> {
        let abandoned = std::mem::take(&mut self.send_slot.lock().abandoned);
        let mut events = Vec::new();
        for (key, temp_id) in abandoned {
            if self.drop_send(&key, &temp_id) {
                events.push(CoreEvent::MessagesChanged { key });
            }
        }
        if !events.is_empty() {
            events.push(CoreEvent::ConversationsChanged);
        }
        events
    }

    fn checkpoint(&mut self, key: &ConversationKey, at: DateTime<Utc>) -> Vec<CoreEvent> {
        let user_id = self.credential.user_id.clone();
        match self.last_seen.mark_seen(key, &user_id, at) {
            Ok(()) => Vec::new(),
            Err(e) => {
                warn!("Failed to persist last-seen for {}: {}", key, e);
                vec![CoreEvent::for_error(&SyncError::LastSeen(e))]
            }
        }
    }

    /// Open the push connection. Idempotent.
    pub fn start(&mut self) {
        info!("Starting chat session for {}", self.credential.user_id);
        self.channel.connect(self.credential.clone());
    }

    /// (Re)build the conversation list from the store and the roster.
    pub async fn load_conversations(&mut self) -> Result<Vec<CoreEvent>, SyncError> {
        let summaries = self
            .store
            .list_conversations()
            .await
            .map_err(store_failure)?;
        let roster = match self.roster.entries().await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Roster unavailable, list shows store data only: {}", e);
                Vec::new()
            }
        };
        self.index.replace_all(summaries, &roster, &self.last_seen);
        Ok(vec![CoreEvent::ConversationsChanged])
    }

    /// Fetch the full history of `key` and merge it into its bucket.
    pub async fn refresh_history(
        &mut self,
        key: &ConversationKey,
    ) -> Result<Vec<CoreEvent>, SyncError> {
        self.bucket_mut(key).begin_load();
        let records = match self.store.fetch_messages(key).await {
            Ok(records) => records,
            Err(e) => {
                self.bucket_mut(key).load_failed();
                return Err(store_failure(e));
            }
        };

        let mut events = vec![CoreEvent::MessagesChanged { key: key.clone() }];
        let bucket = self.bucket_mut(key);
        let lost = bucket.apply_snapshot(records);
        let last = bucket.last_message().cloned();
        let buckets = &self.buckets;
        self.awaiting_echo.retain(|temp_id, pending_in| {
            pending_in != key || buckets.get(key).is_some_and(|b| b.is_pending(temp_id))
        });
        for temp_id in &lost {
            self.index.refresh_preview(key, temp_id, last.as_ref());
        }
        if let Some(last) = &last {
            self.index.observe_latest(last);
        }
        if !lost.is_empty() {
            warn!("{} send(s) to {} were never stored", lost.len(), key);
            events.push(CoreEvent::toast(
                ToastLevel::Warning,
                format!("{} message(s) were not delivered, please resend", lost.len()),
            ));
        }

        if !self.index.is_active(key) {
            let seen = self.last_seen.get(key, &self.credential.user_id);
            let messages = self.messages(key);
            let count = unread_since(&messages, seen, &self.credential.user_id);
            self.index.set_unread(key, count);
            events.push(CoreEvent::ConversationsChanged);
        }
        Ok(events)
    }

    pub async fn refresh_pins(
        &mut self,
        key: &ConversationKey,
    ) -> Result<Vec<CoreEvent>, SyncError> {
        let pins = self.store.list_pins(key).await.map_err(store_failure)?;
        self.resolver.set_pins(key, pins);
        Ok(vec![CoreEvent::PinsChanged { key: key.clone() }])
    }

    /// Make `key` the active conversation.
    ///
    /// The previous topic is left before the new one is joined. The previous
    /// conversation's checkpoint is written on the way out, the new one's on
    /// the way in. History and pins failures are reported as toasts; the
    /// activation itself stands.
    pub async fn activate(&mut self, key: ConversationKey) -> Result<Vec<CoreEvent>, SyncError> {
        if self.index.is_active(&key) {
            return Ok(Vec::new());
        }
        info!("Activating {}", key);
        let mut events = self.sweep_abandoned();

        if let Some((previous, at)) = self.index.deactivate() {
            events.extend(self.checkpoint(&previous, at));
        }

        let subscription = self
            .channel
            .switch(self.subscription.take(), Topic::for_conversation(&key))
            .await;
        self.subscription = Some(subscription);

        let at = self.index.activate(&key);
        events.extend(self.checkpoint(&key, at));
        events.push(CoreEvent::ConversationsChanged);

        let needs_load = self
            .buckets
            .get(&key)
            .map_or(true, |b| b.state() != LoadState::Ready);
        if needs_load {
            match self.refresh_history(&key).await {
                Ok(loaded) => events.extend(loaded),
                Err(e) => {
                    warn!("History of {} not loaded: {}", key, e);
                    events.push(CoreEvent::for_error(&e));
                }
            }
        } else {
            events.push(CoreEvent::MessagesChanged { key: key.clone() });
        }

        match self.refresh_pins(&key).await {
            Ok(loaded) => events.extend(loaded),
            Err(e) => warn!("Pins of {} not loaded: {}", key, e),
        }
        Ok(events)
    }

    /// Leave the active conversation (e.g. the chat view closed).
    pub async fn deactivate(&mut self) -> Vec<CoreEvent> {
        let mut events = Vec::new();
        if let Some(subscription) = self.subscription.take() {
            subscription.leave().await;
        }
        if let Some((key, at)) = self.index.deactivate() {
            debug!("Deactivated {}", key);
            events.extend(self.checkpoint(&key, at));
            events.push(CoreEvent::ConversationsChanged);
        }
        events
    }

    /// Validate, append the optimistic entry and raise the sending guard.
    /// The sequence of the returned send's conversation has changed.
    pub fn prepare_send(&mut self, content: &str) -> Result<PendingSend, SyncError> {
        self.sweep_abandoned();
        if self.is_sending() {
            return Err(SyncError::SendInFlight);
        }
        if content.trim().is_empty() {
            return Err(SyncError::Validation);
        }
        let key = self.active_key()?;
        let reply_to = self.resolver.take_reply(&key);

        let temp_id = new_temp_id();
        let message = Message::optimistic(
            temp_id.clone(),
            key.clone(),
            self.credential.user_id.clone(),
            content.to_string(),
            reply_to.clone(),
        );
        self.index.record_outgoing(&message);
        self.bucket_mut(&key).push_optimistic(message);
        self.send_slot.lock().in_flight = true;

        Ok(PendingSend {
            guard: SendGuard {
                slot: self.send_slot.clone(),
                key: key.clone(),
                temp_id: temp_id.clone(),
                completed: false,
            },
            key,
            temp_id,
            content: content.to_string(),
            reply_to,
            channel: self.channel.handle(),
            store: self.store.clone(),
        })
    }

    /// Apply the network result of a send to its own conversation's bucket,
    /// whether or not that conversation is still active.
    pub fn complete_send(&mut self, sent: DispatchedSend) -> Result<Vec<CoreEvent>, SyncError> {
        let DispatchedSend {
            key,
            temp_id,
            reply_to,
            result,
            guard,
        } = sent;
        guard.complete();

        match result {
            Ok(SendOutcome::Pushed) => {
                let pending = self
                    .buckets
                    .get(&key)
                    .is_some_and(|b| b.is_pending(&temp_id));
                if pending {
                    self.awaiting_echo.insert(temp_id, key.clone());
                }
                Ok(vec![CoreEvent::MessagesChanged { key }])
            }
            Ok(SendOutcome::Stored(record)) => {
                let message = record.clone().into_message(&self.credential.user_id);
                let outcome = self.bucket_mut(&key).confirm_send(&temp_id, record);
                debug!("Send {} confirmed over REST: {:?}", temp_id, outcome);
                self.index.apply_confirmed(&temp_id, &message);
                Ok(vec![
                    CoreEvent::MessagesChanged { key },
                    CoreEvent::ConversationsChanged,
                ])
            }
            Err(error) => {
                warn!("Send {} in {} failed: {}", temp_id, key, error);
                self.drop_send(&key, &temp_id);
                if let Some(reply) = reply_to {
                    if self.index.is_active(&key) && self.resolver.pending_reply(&key).is_none() {
                        self.resolver.restore_reply(&key, reply);
                    }
                }
                Err(error)
            }
        }
    }

    /// Send `content` to the active conversation.
    pub async fn send(&mut self, content: &str) -> Result<Vec<CoreEvent>, SyncError> {
        let pending = self.prepare_send(content)?;
        let dispatched = pending.dispatch().await;
        self.complete_send(dispatched)
    }

    /// Edit one of the local user's messages in the active conversation.
    ///
    /// The new text shows immediately. If the server refuses, the edit is
    /// left in place and `EditRejected` carries the text to restore via
    /// `revert_edit`.
    pub async fn edit(&mut self, id: &str, content: &str) -> Result<Vec<CoreEvent>, SyncError> {
        if content.trim().is_empty() {
            return Err(SyncError::Validation);
        }
        let key = self.active_key()?;
        let user_id = self.credential.user_id.clone();
        let bucket = self.bucket_mut(&key);
        let Some(message) = bucket.find(id) else {
            return Err(SyncError::UnknownMessage(id.to_string()));
        };
        if !message.is_from(&user_id) {
            return Err(SyncError::PermissionDenied(
                "only the author can edit a message".to_string(),
            ));
        }
        if message.is_optimistic {
            return Err(SyncError::SendInFlight);
        }
        let previous_content = bucket.apply_edit_local(id, content).unwrap_or_default();
        self.index.apply_edit(&key, id, content);

        let pushed = if self.channel.is_connected() {
            let command = ClientCommand::EditMessage {
                id: id.to_string(),
                content: content.to_string(),
            };
            self.channel.send(command).await.is_ok()
        } else {
            false
        };

        if !pushed {
            match self.store.edit_message(id, content).await {
                Ok(record) => {
                    self.bucket_mut(&key).apply_edit_confirmed(&record);
                    self.index.apply_edit(&key, id, &record.content);
                }
                Err(e) => {
                    warn!("Edit of {} rejected: {}", id, e);
                    return Err(SyncError::EditRejected {
                        id: id.to_string(),
                        previous_content,
                        reason: e.to_string(),
                    });
                }
            }
        }

        Ok(vec![
            CoreEvent::MessagesChanged { key },
            CoreEvent::ConversationsChanged,
        ])
    }

    /// Restore the text of a message after a rejected edit.
    pub fn revert_edit(
        &mut self,
        key: &ConversationKey,
        id: &str,
        previous_content: &str,
    ) -> Vec<CoreEvent> {
        if self.bucket_mut(key).apply_edit_local(id, previous_content).is_none() {
            return Vec::new();
        }
        self.index.apply_edit(key, id, previous_content);
        vec![
            CoreEvent::MessagesChanged { key: key.clone() },
            CoreEvent::ConversationsChanged,
        ]
    }

    /// Delete one of the local user's messages. It disappears immediately;
    /// if the server refuses, it is put back.
    pub async fn delete(&mut self, id: &str) -> Result<Vec<CoreEvent>, SyncError> {
        let key = self.active_key()?;
        let user_id = self.credential.user_id.clone();
        match self.bucket_mut(&key).find(id) {
            None => return Err(SyncError::UnknownMessage(id.to_string())),
            Some(message) if !message.is_from(&user_id) => {
                return Err(SyncError::PermissionDenied(
                    "only the author can delete a message".to_string(),
                ))
            }
            Some(message) if message.is_optimistic => return Err(SyncError::SendInFlight),
            Some(_) => {}
        }

        let bucket = self.bucket_mut(&key);
        let Some(removed) = bucket.remove(id) else {
            return Err(SyncError::UnknownMessage(id.to_string()));
        };
        let last = bucket.last_message().cloned();
        let unpinned = self.resolver.cascade_delete(&key, id);
        self.index.refresh_preview(&key, id, last.as_ref());

        let pushed = if self.channel.is_connected() {
            let command = ClientCommand::DeleteMessage { id: id.to_string() };
            self.channel.send(command).await.is_ok()
        } else {
            false
        };
        if !pushed {
            if let Err(e) = self.store.delete_message(id).await {
                warn!("Delete of {} failed, restoring it: {}", id, e);
                let restored = removed.clone();
                self.bucket_mut(&key).reinsert(restored);
                for pin in unpinned {
                    self.resolver.insert_pin(pin);
                }
                self.index.record_outgoing(&removed);
                return Err(store_failure(e));
            }
        }

        let mut events = vec![
            CoreEvent::MessagesChanged { key: key.clone() },
            CoreEvent::ConversationsChanged,
        ];
        if !unpinned.is_empty() {
            events.push(CoreEvent::PinsChanged { key });
        }
        Ok(events)
    }

    /// Make `message_id` (in the active conversation) the reply target of the next send.
    pub fn begin_reply(&mut self, message_id: &str) -> Result<(), SyncError> {
        let key = self.active_key()?;
        let target = self
            .buckets
            .get(&key)
            .and_then(|b| b.find(message_id))
            .ok_or_else(|| SyncError::UnknownMessage(message_id.to_string()))?;
        self.resolver.begin_reply(target);
        Ok(())
    }

    pub fn cancel_reply(&mut self) {
        self.resolver.cancel_reply();
    }

    /// Resolve the reply preview shown on `message_id` against the loaded sequence.
    pub fn resolve_reply(&self, message_id: &str) -> Result<Option<ReplyResolution>, SyncError> {
        let key = self.active_key()?;
        let bucket = self
            .buckets
            .get(&key)
            .ok_or_else(|| SyncError::UnknownMessage(message_id.to_string()))?;
        let message = bucket
            .find(message_id)
            .ok_or_else(|| SyncError::UnknownMessage(message_id.to_string()))?;
        Ok(message
            .reply_to
            .as_ref()
            .map(|reply| ReplyPinResolver::resolve(reply, bucket)))
    }

    /// Pin a message of the active conversation. Any participant may pin.
    pub async fn pin(&mut self, message_id: &str) -> Result<Vec<CoreEvent>, SyncError> {
        let key = self.active_key()?;
        let pinnable = self
            .buckets
            .get(&key)
            .and_then(|b| b.find(message_id))
            .is_some_and(|m| !m.is_optimistic);
        if !pinnable {
            return Err(SyncError::UnknownMessage(message_id.to_string()));
        }
        if self.resolver.pin_for_message(&key, message_id).is_some() {
            debug!("{} is already pinned", message_id);
            return Ok(Vec::new());
        }

        let pin = self
            .store
            .pin_message(&key, message_id)
            .await
            .map_err(store_failure)?;
        info!("Pinned {} in {} ({})", message_id, key, pin.pin_id);
        self.resolver.insert_pin(pin);
        Ok(vec![CoreEvent::PinsChanged { key }])
    }

    /// Remove a pin. Only its author, or a captain/admin of the team, may;
    /// anyone else is refused before any network call.
    pub async fn unpin(&mut self, pin_id: &str) -> Result<Vec<CoreEvent>, SyncError> {
        let key = self.active_key()?;
        let pin = self
            .resolver
            .find_pin(&key, pin_id)
            .cloned()
            .ok_or_else(|| SyncError::UnknownPin(pin_id.to_string()))?;

        let role = match &key {
            ConversationKey::Team(team_id) => self
                .roster
                .role_in(team_id, &self.credential.user_id)
                .await
                .unwrap_or_else(|e| {
                    warn!("Role lookup failed, assuming member: {}", e);
                    MemberRole::Member
                }),
            ConversationKey::User(_) => MemberRole::Member,
        };
        ReplyPinResolver::check_unpin(&pin, &self.credential.user_id, role)?;

        self.store
            .unpin_message(&key, pin_id)
            .await
            .map_err(store_failure)?;
        self.resolver.remove_pin(&key, pin_id);
        info!("Unpinned {} in {}", pin_id, key);
        Ok(vec![CoreEvent::PinsChanged { key }])
    }

    /// Typing indicator for the active conversation. Dropped silently while offline.
    pub async fn set_typing(&mut self, is_typing: bool) -> Result<(), SyncError> {
        let key = self.active_key()?;
        if !self.channel.is_connected() {
            return Ok(());
        }
        let command = ClientCommand::Typing {
            target: key,
            is_typing,
        };
        match self.channel.send(command).await {
            Ok(()) | Err(ChannelError::NotConnected) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Route one channel event. Conversation-scoped events are applied to the
    /// bucket of the conversation they belong to, never to whichever one is active.
    pub async fn handle_channel_event(&mut self, event: ChannelEvent) -> Vec<CoreEvent> {
        match event {
            ChannelEvent::Connected => {
                let mut events = vec![CoreEvent::ConnectionChanged { connected: true }];
                if std::mem::take(&mut self.resync_on_connect) {
                    let active = self.index.active().cloned();
                    if let Some(key) = &active {
                        match self.refresh_history(key).await {
                            Ok(loaded) => events.extend(loaded),
                            Err(e) => warn!("Resync of {} failed: {}", key, e),
                        }
                    }
                    events.extend(self.settle_pushed_sends(active.as_ref()).await);
                }
                events
            }
            ChannelEvent::Disconnected => {
                self.resync_on_connect = true;
                vec![CoreEvent::ConnectionChanged { connected: false }]
            }
            ChannelEvent::Error(message) => {
                let mut events = self.settle_pushed_sends(None).await;
                events.push(CoreEvent::toast(ToastLevel::Error, message));
                events
            }
            ChannelEvent::Server(event) => self.apply_server_event(event),
        }
    }

    /// Pushed sends whose echo may have gone down with the link: refetch the
    /// conversations holding them (except `refreshed`), then drop whatever the
    /// server still has not confirmed.
    async fn settle_pushed_sends(
        &mut self,
        refreshed: Option<&ConversationKey>,
    ) -> Vec<CoreEvent> {
        let mut events = Vec::new();
        let mut keys: Vec<ConversationKey> = Vec::new();
        for key in self.awaiting_echo.values() {
            if Some(key) != refreshed && !keys.contains(key) {
                keys.push(key.clone());
            }
        }
        for key in keys {
            match self.refresh_history(&key).await {
                Ok(loaded) => events.extend(loaded),
                Err(e) => warn!("Resync of {} failed: {}", key, e),
            }
        }

        let unconfirmed: Vec<_> = self.awaiting_echo.drain().collect();
        let mut failed = 0;
        for (temp_id, key) in unconfirmed {
            if self.drop_send(&key, &temp_id) {
                debug!("Pushed send {} to {} was never echoed", temp_id, key);
                failed += 1;
                events.push(CoreEvent::MessagesChanged { key });
            }
        }
        if failed > 0 {
            events.push(CoreEvent::ConversationsChanged);
            events.push(CoreEvent::toast(
                ToastLevel::Warning,
                format!("{} message(s) were not delivered, please resend", failed),
            ));
        }
        events
    }

    fn apply_server_event(&mut self, event: ServerEvent) -> Vec<CoreEvent> {
        let user_id = self.credential.user_id.clone();
        match event {
            ServerEvent::MessageReceived { message: record } => {
                let key = record.conversation_for(&user_id);
                let message = record.clone().into_message(&user_id);
                let mut events = Vec::new();

                // Deduplicated by id before it can count towards unread
                match self.bucket_mut(&key).apply_received(record) {
                    ReceiveOutcome::Duplicate => return events,
                    ReceiveOutcome::Reconciled { temp_id } => {
                        self.awaiting_echo.remove(&temp_id);
                        self.index.apply_confirmed(&temp_id, &message);
                    }
                    ReceiveOutcome::Appended => {
                        if self.index.record_incoming(&message) {
                            debug!("Queued backfill for {}", key);
                        }
                    }
                }
                events.push(CoreEvent::MessagesChanged { key: key.clone() });
                events.push(CoreEvent::ConversationsChanged);

                // Auto-reveal the target of a reply from the counterpart
                if self.index.is_active(&key) && !message.is_from(&user_id) {
                    let reveal = message.reply_to.as_ref().and_then(|reply| {
                        let bucket = self.buckets.get(&key)?;
                        match ReplyPinResolver::resolve(reply, bucket) {
                            ReplyResolution::Loaded { message_id } => Some(message_id),
                            ReplyResolution::SnapshotOnly(_) => None,
                        }
                    });
                    if let Some(message_id) = reveal {
                        events.push(CoreEvent::RevealReply { key, message_id });
                    }
                }
                events
            }
            ServerEvent::MessageEdited { message: record } => {
                let key = record.conversation_for(&user_id);
                let applied = self
                    .buckets
                    .get_mut(&key)
                    .is_some_and(|b| b.apply_edit_confirmed(&record));
                let previewed = self.index.apply_edit(&key, &record.id, &record.content);
                let mut events = Vec::new();
                if applied {
                    events.push(CoreEvent::MessagesChanged { key });
                }
                if previewed {
                    events.push(CoreEvent::ConversationsChanged);
                }
                events
            }
            ServerEvent::MessageDeleted {
                id,
                sender_id,
                target,
            } => {
                let key = conversation_for(&sender_id, &target, &user_id);
                let mut events = Vec::new();
                let (removed, last) = match self.buckets.get_mut(&key) {
                    Some(bucket) => {
                        let removed = bucket.remove(&id).is_some();
                        (removed, bucket.last_message().cloned())
                    }
                    None => (false, None),
                };
                if removed {
                    events.push(CoreEvent::MessagesChanged { key: key.clone() });
                }
                if !self.resolver.cascade_delete(&key, &id).is_empty() {
                    events.push(CoreEvent::PinsChanged { key: key.clone() });
                }
                if self.index.refresh_preview(&key, &id, last.as_ref()) {
                    events.push(CoreEvent::ConversationsChanged);
                }
                events
            }
            ServerEvent::Typing {
                sender_id,
                target,
                is_typing,
            } => {
                if sender_id == user_id {
                    return Vec::new();
                }
                let key = conversation_for(&sender_id, &target, &user_id);
                vec![CoreEvent::Typing {
                    key,
                    user_id: sender_id,
                    is_typing,
                }]
            }
            ServerEvent::PresenceChanged { user_id, status } => {
                if self.index.apply_presence(&user_id, status) {
                    vec![CoreEvent::ConversationsChanged]
                } else {
                    Vec::new()
                }
            }
            ServerEvent::Error { message, client_id } => {
                warn!("Server error: {}", message);
                let mut events = Vec::new();
                if let Some(temp_id) = client_id {
                    self.awaiting_echo.remove(&temp_id);
                    let key = self
                        .buckets
                        .iter()
                        .find(|(_, bucket)| bucket.is_pending(&temp_id))
                        .map(|(key, _)| key.clone());
                    if let Some(key) = key {
                        info!("Send {} to {} refused by the server", temp_id, key);
                        self.drop_send(&key, &temp_id);
                        events.push(CoreEvent::MessagesChanged { key });
                        events.push(CoreEvent::ConversationsChanged);
                    }
                }
                events.push(CoreEvent::toast(ToastLevel::Error, message));
                events
            }
        }
    }

    /// Fetch canonical roster data for conversations synthesized from events.
    pub async fn run_backfill(&mut self) -> Vec<CoreEvent> {
        let keys = self.index.take_backfill();
        if keys.is_empty() {
            return Vec::new();
        }
        let mut changed = false;
        for key in keys {
            match self.roster.lookup(&key).await {
                Ok(Some(entry)) => changed |= self.index.apply_roster_entry(&entry),
                Ok(None) => debug!("No roster entry for {}", key),
                Err(e) => warn!("Backfill of {} failed: {}", key, e),
            }
        }
        if changed {
            vec![CoreEvent::ConversationsChanged]
        } else {
            Vec::new()
        }
    }

    /// Logout / auth loss: checkpoint the active conversation and drop the channel.
    pub async fn shutdown(&mut self) -> Vec<CoreEvent> {
        let events = self.deactivate().await;
        self.channel.disconnect().await;
        info!("Chat session for {} closed", self.credential.user_id);
        events
    }
}
