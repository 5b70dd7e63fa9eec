//! Channel Manager: owns the single push connection of a session.
//!
//! A background supervisor task holds the live link, forwards outgoing
//! commands, publishes incoming events, and reconnects with bounded
//! exponential backoff. Topics are tracked in shared state so that a
//! reconnect restores the user inbox and the active conversation topic
//! without the caller doing anything.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::protocol::{ClientCommand, ServerEvent, Topic};
use super::ChannelError;
use crate::config::ReconnectPolicy;

#[derive(Debug, Clone)]
pub struct Credential {
    pub user_id: String,
    pub token: String,
}

/// One established push connection, as a pair of channels.
/// The connection is considered lost when `inbound` yields `None`.
pub struct PushLink {
    pub outbound: mpsc::UnboundedSender<ClientCommand>,
    pub inbound: mpsc::UnboundedReceiver<ServerEvent>,
}

#[async_trait]
pub trait PushConnector: Send + Sync {
    async fn connect(&self, credential: &Credential) -> Result<PushLink, ChannelError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Connected,
    Disconnected,
    Server(ServerEvent),
    /// Local channel failure (e.g. reconnect attempts exhausted)
    Error(String),
}

struct Outgoing {
    command: ClientCommand,
    ack: Option<oneshot::Sender<Result<(), ChannelError>>>,
}

impl Outgoing {
    fn resolve(self, result: Result<(), ChannelError>) {
        if let Some(ack) = self.ack {
            let _ = ack.send(result);
        }
    }
}

#[derive(Default)]
struct Topics {
    inbox: Option<Topic>,
    active: Option<Topic>,
}

struct Shared {
    connected: AtomicBool,
    topics: Mutex<Topics>,
    command_tx: Mutex<Option<mpsc::UnboundedSender<Outgoing>>>,
}

impl Shared {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Hand a command to the live link and wait until it has been written.
    async fn dispatch(&self, command: ClientCommand) -> Result<(), ChannelError> {
        if !self.is_connected() {
            return Err(ChannelError::NotConnected);
        }
        let tx = self
            .command_tx
            .lock()
            .clone()
            .ok_or(ChannelError::NotConnected)?;
        let (ack_tx, ack_rx) = oneshot::channel();
        tx.send(Outgoing {
            command,
            ack: Some(ack_tx),
        })
        .map_err(|_| ChannelError::Closed)?;
        ack_rx.await.map_err(|_| ChannelError::Closed)?
    }

    /// Fire-and-forget variant usable from `Drop`.
    fn dispatch_detached(&self, command: ClientCommand) {
        if !self.is_connected() {
            return;
        }
        if let Some(tx) = self.command_tx.lock().as_ref() {
            let _ = tx.send(Outgoing { command, ack: None });
        }
    }

    fn clear_active(&self, topic: &Topic) {
        let mut topics = self.topics.lock();
        if topics.active.as_ref() == Some(topic) {
            topics.active = None;
        }
    }

    /// Mark the link live and return the topics it must re-join. Done under the
    /// topics lock so a concurrent `join` is either restored here or dispatched.
    fn go_live(&self) -> Vec<Topic> {
        let topics = self.topics.lock();
        self.connected.store(true, Ordering::SeqCst);
        topics.inbox.iter().chain(topics.active.iter()).cloned().collect()
    }
}

/// Scoped subscription to one conversation topic.
///
/// `leave().await` releases it and waits for the unsubscribe to be written.
/// Dropping it without leaving still enqueues the unsubscribe.
pub struct TopicSubscription {
    topic: Topic,
    shared: Arc<Shared>,
    released: bool,
}

impl TopicSubscription {
    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    pub async fn leave(mut self) {
        self.released = true;
        self.shared.clear_active(&self.topic);
        let command = ClientCommand::LeaveTopic {
            topic: self.topic.clone(),
        };
        match self.shared.dispatch(command).await {
            Ok(()) => debug!("Left topic {}", self.topic),
            Err(ChannelError::NotConnected) => {
                debug!("Offline, nothing to leave for {}", self.topic)
            }
            Err(e) => warn!("Failed to leave topic {}: {}", self.topic, e),
        }
    }
}

impl Drop for TopicSubscription {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.shared.clear_active(&self.topic);
        self.shared.dispatch_detached(ClientCommand::LeaveTopic {
            topic: self.topic.clone(),
        });
    }
}

/// Cloneable sending side of the channel, usable without the manager
#[derive(Clone)]
pub struct ChannelHandle {
    shared: Arc<Shared>,
}

impl ChannelHandle {
    pub fn is_connected(&self) -> bool {
        self.shared.is_connected()
    }

    pub async fn send(&self, command: ClientCommand) -> Result<(), ChannelError> {
        let name = command.name();
        self.shared.dispatch(command).await.inspect_err(|e| {
            debug!("Push command {} not delivered: {}", name, e);
        })
    }
}

struct Supervisor {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

pub struct ChannelManager {
    connector: Arc<dyn PushConnector>,
    policy: ReconnectPolicy,
    shared: Arc<Shared>,
    event_tx: mpsc::UnboundedSender<ChannelEvent>,
    event_rx: Option<mpsc::UnboundedReceiver<ChannelEvent>>,
    supervisor: Option<Supervisor>,
}

impl ChannelManager {
    pub fn new(connector: Arc<dyn PushConnector>, policy: ReconnectPolicy) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            connector,
            policy,
            shared: Arc::new(Shared {
                connected: AtomicBool::new(false),
                topics: Mutex::new(Topics::default()),
                command_tx: Mutex::new(None),
            }),
            event_tx,
            event_rx: Some(event_rx),
            supervisor: None,
        }
    }

    /// The event stream can only be taken once; it survives reconnects.
    pub fn take_event_rx(&mut self) -> Option<mpsc::UnboundedReceiver<ChannelEvent>> {
        self.event_rx.take()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.is_connected()
    }

    pub fn is_running(&self) -> bool {
        self.supervisor
            .as_ref()
            .is_some_and(|s| !s.handle.is_finished())
    }

    pub fn active_topic(&self) -> Option<Topic> {
        self.shared.topics.lock().active.clone()
    }

    /// Start the session's push connection. Idempotent: while a connection
    /// (or its reconnect loop) is alive, further calls do nothing.
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect(&mut self, credential: Credential) {
        if self.is_running() {
            debug!("Push channel already running, reusing it");
            return;
        }

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        *self.shared.command_tx.lock() = Some(command_tx);
        self.shared.topics.lock().inbox = Some(Topic::user_inbox(&credential.user_id));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let context = SupervisorContext {
            connector: self.connector.clone(),
            credential,
            policy: self.policy.clone(),
            shared: self.shared.clone(),
            event_tx: self.event_tx.clone(),
            command_rx,
            shutdown_rx,
        };
        let handle = tokio::spawn(run_supervisor(context));
        self.supervisor = Some(Supervisor {
            handle,
            shutdown_tx,
        });
    }

    /// Subscribe to a conversation topic. Never fails: while offline the topic
    /// is recorded and joined as soon as the connection comes back.
    pub async fn join(&self, topic: Topic) -> TopicSubscription {
        let previous = self.shared.topics.lock().active.replace(topic.clone());
        if let Some(previous) = previous.filter(|p| p != &topic) {
            warn!("Joining {} while {} was never left", topic, previous);
        }

        let command = ClientCommand::JoinTopic {
            topic: topic.clone(),
        };
        match self.shared.dispatch(command).await {
            Ok(()) => info!("Joined topic {}", topic),
            Err(ChannelError::NotConnected) => {
                debug!("Offline, {} will be joined on reconnect", topic)
            }
            Err(e) => warn!("Failed to join {}: {} (retried on reconnect)", topic, e),
        }

        TopicSubscription {
            topic,
            shared: self.shared.clone(),
            released: false,
        }
    }

    /// Move the active subscription to `next`. The previous topic is fully
    /// left before the new one is joined.
    pub async fn switch(
        &self,
        current: Option<TopicSubscription>,
        next: Topic,
    ) -> TopicSubscription {
        if let Some(current) = current {
            current.leave().await;
        }
        self.join(next).await
    }

    pub fn handle(&self) -> ChannelHandle {
        ChannelHandle {
            shared: self.shared.clone(),
        }
    }

    /// Send a conversation command over the live link.
    pub async fn send(&self, command: ClientCommand) -> Result<(), ChannelError> {
        self.handle().send(command).await
    }

    /// Tear the connection down (logout / auth loss).
    pub async fn disconnect(&mut self) {
        if let Some(supervisor) = self.supervisor.take() {
            let _ = supervisor.shutdown_tx.send(true);
            if let Err(e) = supervisor.handle.await {
                warn!("Push supervisor ended abnormally: {}", e);
            }
        }
        *self.shared.command_tx.lock() = None;
        {
            let mut topics = self.shared.topics.lock();
            topics.inbox = None;
            topics.active = None;
        }
        self.shared.connected.store(false, Ordering::SeqCst);
        info!("Push channel disconnected");
    }
}

struct SupervisorContext {
    connector: Arc<dyn PushConnector>,
    credential: Credential,
    policy: ReconnectPolicy,
    shared: Arc<Shared>,
    event_tx: mpsc::UnboundedSender<ChannelEvent>,
    command_rx: mpsc::UnboundedReceiver<Outgoing>,
    shutdown_rx: watch::Receiver<bool>,
}

async fn run_supervisor(context: SupervisorContext) {
    let SupervisorContext {
        connector,
        credential,
        policy,
        shared,
        event_tx,
        mut command_rx,
        mut shutdown_rx,
    } = context;

    let mut failures: u32 = 0;
    loop {
        let attempt = tokio::select! {
            result = connector.connect(&credential) => Some(result),
            _ = shutdown_requested(&mut shutdown_rx) => None,
        };

        match attempt {
            None => break,
            Some(Ok(link)) => {
                failures = 0;
                info!("Push channel connected");
                let stop = serve(link, &shared, &event_tx, &mut command_rx, &mut shutdown_rx).await;
                shared.connected.store(false, Ordering::SeqCst);
                let _ = event_tx.send(ChannelEvent::Disconnected);
                if stop {
                    break;
                }
                warn!("Push channel dropped, reconnecting");
            }
            Some(Err(e)) => {
                failures += 1;
                warn!(attempt = failures, "Push connect failed: {}", e);
                if policy.exhausted(failures) {
                    let _ = event_tx.send(ChannelEvent::Error(format!(
                        "Push channel unavailable after {} attempts",
                        failures
                    )));
                    break;
                }
            }
        }

        let delay = policy.delay_for(failures.saturating_sub(1));
        debug!(?delay, "Waiting before reconnect");
        if !wait_offline(delay, &mut command_rx, &mut shutdown_rx).await {
            break;
        }
    }

    shared.connected.store(false, Ordering::SeqCst);
    debug!("Push supervisor stopped");
}

/// Pump one live link until it drops (returns false) or shutdown (returns true).
async fn serve(
    mut link: PushLink,
    shared: &Shared,
    event_tx: &mpsc::UnboundedSender<ChannelEvent>,
    command_rx: &mut mpsc::UnboundedReceiver<Outgoing>,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> bool {
    for topic in shared.go_live() {
        debug!("Restoring topic {}", topic);
        if link.outbound.send(ClientCommand::JoinTopic { topic }).is_err() {
            return false;
        }
    }
    let _ = event_tx.send(ChannelEvent::Connected);

    loop {
        tokio::select! {
            _ = shutdown_requested(shutdown_rx) => return true,
            outgoing = command_rx.recv() => {
                let Some(Outgoing { command, ack }) = outgoing else {
                    return true;
                };
                let name = command.name();
                let delivered = link.outbound.send(command).is_ok();
                if let Some(ack) = ack {
                    let _ = ack.send(if delivered { Ok(()) } else { Err(ChannelError::Closed) });
                }
                if !delivered {
                    debug!("Link closed while sending {}", name);
                    return false;
                }
            }
            event = link.inbound.recv() => match event {
                Some(event) => {
                    let _ = event_tx.send(ChannelEvent::Server(event));
                }
                None => return false,
            }
        }
    }
}

/// Sleep out a backoff delay, refusing commands meanwhile.
/// Returns false if the supervisor should stop instead of reconnecting.
async fn wait_offline(
    delay: Duration,
    command_rx: &mut mpsc::UnboundedReceiver<Outgoing>,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            _ = shutdown_requested(shutdown_rx) => return false,
            outgoing = command_rx.recv() => match outgoing {
                Some(outgoing) => outgoing.resolve(Err(ChannelError::NotConnected)),
                None => return false,
            }
        }
    }
}

/// Resolves once shutdown was signalled or the manager was dropped.
async fn shutdown_requested(shutdown_rx: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown_rx.borrow() {
            return;
        }
        if shutdown_rx.changed().await.is_err() {
            return;
        }
    }
}
