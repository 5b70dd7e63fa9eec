//! In-memory collaborators for driving a full `ChatSession`.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::time::timeout;

use squadlink_core::channel::{
    ChannelError, ChannelEvent, ClientCommand, Credential, PushConnector, PushLink, ServerEvent,
    Topic,
};
use squadlink_core::config::{CoreConfig, ReconnectPolicy};
use squadlink_core::models::{
    ConversationKey, ConversationSummary, MessageRecord, PinnedMessage,
};
use squadlink_core::store::{LastSeenStore, MessageStore, SendRequest, StaticRoster, StoreError};
use squadlink_core::{ChatSession, CoreEvent};

pub const ME: &str = "me";

#[derive(Default)]
pub struct StoreState {
    pub summaries: Vec<ConversationSummary>,
    pub history: HashMap<ConversationKey, Vec<MessageRecord>>,
    pub pins: HashMap<ConversationKey, Vec<PinnedMessage>>,
    pub sent: Vec<SendRequest>,
    pub deleted: Vec<String>,
    pub unpinned: Vec<String>,
    /// Every write answers 503
    pub fail_writes: bool,
    next_id: u64,
}

#[derive(Default)]
pub struct FakeStore {
    pub state: Mutex<StoreState>,
}

fn unavailable() -> StoreError {
    StoreError::Status {
        status: 503,
        body: "maintenance".to_string(),
    }
}

fn not_found(what: &str) -> StoreError {
    StoreError::Status {
        status: 404,
        body: format!("{} not found", what),
    }
}

impl FakeStore {
    pub fn seed_history(&self, key: &ConversationKey, records: Vec<MessageRecord>) {
        self.state.lock().history.insert(key.clone(), records);
    }

    pub fn seed_pins(&self, key: &ConversationKey, pins: Vec<PinnedMessage>) {
        self.state.lock().pins.insert(key.clone(), pins);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.state.lock().fail_writes = fail;
    }
}

#[async_trait]
impl MessageStore for FakeStore {
    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>, StoreError> {
        Ok(self.state.lock().summaries.clone())
    }

    async fn fetch_messages(
        &self,
        key: &ConversationKey,
    ) -> Result<Vec<MessageRecord>, StoreError> {
        Ok(self.state.lock().history.get(key).cloned().unwrap_or_default())
    }

    async fn send_message(&self, request: &SendRequest) -> Result<MessageRecord, StoreError> {
        let mut state = self.state.lock();
        if state.fail_writes {
            return Err(unavailable());
        }
        state.next_id += 1;
        let record = MessageRecord {
            id: format!("srv-{}", state.next_id),
            sender_id: ME.to_string(),
            target: request.target.clone(),
            content: request.content.clone(),
            sent_at: Utc::now(),
            edited_at: None,
            client_id: request.client_id.clone(),
            reply_to: None,
        };
        state.sent.push(request.clone());
        state
            .history
            .entry(request.target.clone())
            .or_default()
            .push(record.clone());
        Ok(record)
    }

    async fn edit_message(&self, id: &str, content: &str) -> Result<MessageRecord, StoreError> {
        let mut state = self.state.lock();
        if state.fail_writes {
            return Err(unavailable());
        }
        let record = state
            .history
            .values_mut()
            .flat_map(|records| records.iter_mut())
            .find(|r| r.id == id)
            .ok_or_else(|| not_found(id))?;
        record.content = content.to_string();
        record.edited_at = Some(Utc::now());
        Ok(record.clone())
    }

    async fn delete_message(&self, id: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        if state.fail_writes {
            return Err(unavailable());
        }
        state.deleted.push(id.to_string());
        Ok(())
    }

    async fn list_pins(&self, key: &ConversationKey) -> Result<Vec<PinnedMessage>, StoreError> {
        Ok(self.state.lock().pins.get(key).cloned().unwrap_or_default())
    }

    async fn pin_message(
        &self,
        key: &ConversationKey,
        message_id: &str,
    ) -> Result<PinnedMessage, StoreError> {
        let mut state = self.state.lock();
        if state.fail_writes {
            return Err(unavailable());
        }
        state.next_id += 1;
        let pin = PinnedMessage {
            pin_id: format!("pin-{}", state.next_id),
            message_id: message_id.to_string(),
            conversation: key.clone(),
            pinned_by: ME.to_string(),
            pinned_at: Utc::now(),
        };
        state.pins.entry(key.clone()).or_default().push(pin.clone());
        Ok(pin)
    }

    async fn unpin_message(&self, key: &ConversationKey, pin_id: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        if state.fail_writes {
            return Err(unavailable());
        }
        if let Some(pins) = state.pins.get_mut(key) {
            pins.retain(|p| p.pin_id != pin_id);
        }
        state.unpinned.push(pin_id.to_string());
        Ok(())
    }
}

/// Server end of one in-memory push link
pub struct FakeServer {
    commands: mpsc::UnboundedReceiver<ClientCommand>,
    events: mpsc::UnboundedSender<ServerEvent>,
}

impl FakeServer {
    pub async fn next_command(&mut self) -> ClientCommand {
        timeout(Duration::from_secs(2), self.commands.recv())
            .await
            .expect("timed out waiting for a client command")
            .expect("push link closed")
    }

    /// Topics joined/left so far, as "+topic" / "-topic"
    pub fn drain_topics(&mut self) -> Vec<String> {
        let mut topics = Vec::new();
        while let Ok(command) = self.commands.try_recv() {
            match command {
                ClientCommand::JoinTopic { topic } => topics.push(format!("+{}", topic)),
                ClientCommand::LeaveTopic { topic } => topics.push(format!("-{}", topic)),
                _ => {}
            }
        }
        topics
    }

    pub fn push(&self, event: ServerEvent) {
        self.events.send(event).expect("client side of link dropped");
    }
}

#[derive(Default)]
pub struct FakeConnector {
    links: Mutex<VecDeque<PushLink>>,
}

impl FakeConnector {
    /// Queue a link for the next connect attempt
    pub fn add_link(&self) -> FakeServer {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        self.links.lock().push_back(PushLink {
            outbound: out_tx,
            inbound: in_rx,
        });
        FakeServer {
            commands: out_rx,
            events: in_tx,
        }
    }
}

#[async_trait]
impl PushConnector for FakeConnector {
    async fn connect(&self, _credential: &Credential) -> Result<PushLink, ChannelError> {
        self.links
            .lock()
            .pop_front()
            .ok_or_else(|| ChannelError::Connect("no server".to_string()))
    }
}

pub struct Harness {
    pub session: ChatSession,
    pub channel_events: mpsc::UnboundedReceiver<ChannelEvent>,
    pub store: Arc<FakeStore>,
    pub roster: Arc<StaticRoster>,
    pub connector: Arc<FakeConnector>,
    pub data_dir: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        let data_dir = tempfile::tempdir().unwrap();
        let mut config = CoreConfig::new(data_dir.path());
        config.reconnect = ReconnectPolicy {
            initial_delay_ms: 1,
            max_delay_ms: 5,
            multiplier: 2.0,
            max_attempts: None,
        };

        let store = Arc::new(FakeStore::default());
        let roster = Arc::new(StaticRoster::default());
        let connector = Arc::new(FakeConnector::default());
        let mut session = ChatSession::new(
            config,
            Credential {
                user_id: ME.to_string(),
                token: "token".to_string(),
            },
            connector.clone(),
            store.clone(),
            roster.clone(),
            LastSeenStore::new(data_dir.path()),
        );
        let channel_events = session.take_channel_events().unwrap();

        Self {
            session,
            channel_events,
            store,
            roster,
            connector,
            data_dir,
        }
    }

    /// Start the session against a fresh fake server and wait until it is live.
    pub async fn connect(&mut self) -> FakeServer {
        let server = self.connector.add_link();
        self.session.start();
        loop {
            let events = self.pump().await;
            if events.contains(&CoreEvent::ConnectionChanged { connected: true }) {
                return server;
            }
        }
    }

    /// Feed the next channel event to the session.
    pub async fn pump(&mut self) -> Vec<CoreEvent> {
        let event = timeout(Duration::from_secs(2), self.channel_events.recv())
            .await
            .expect("timed out waiting for a channel event")
            .expect("channel event stream closed");
        self.session.handle_channel_event(event).await
    }

    pub fn last_seen(&self) -> LastSeenStore {
        LastSeenStore::new(self.data_dir.path())
    }
}

pub fn topic(key: &ConversationKey) -> Topic {
    Topic::for_conversation(key)
}

/// A message from `sender` as the push channel / store describes it
pub fn record(id: &str, sender: &str, target: ConversationKey, content: &str) -> MessageRecord {
    MessageRecord {
        id: id.to_string(),
        sender_id: sender.to_string(),
        target,
        content: content.to_string(),
        sent_at: Utc::now(),
        edited_at: None,
        client_id: None,
        reply_to: None,
    }
}

/// Private message from `sender` to the local user
pub fn dm_from(id: &str, sender: &str, content: &str) -> MessageRecord {
    record(id, sender, ConversationKey::user(ME), content)
}

pub fn pin(pin_id: &str, message_id: &str, key: &ConversationKey, by: &str) -> PinnedMessage {
    PinnedMessage {
        pin_id: pin_id.to_string(),
        message_id: message_id.to_string(),
        conversation: key.clone(),
        pinned_by: by.to_string(),
        pinned_at: Utc::now(),
    }
}
