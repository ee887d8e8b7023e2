use crate::error::ChatError;
use crate::state::{Citation, Message};
use crate::transport::ConnectionState;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    CreateSession,
    SendMessage {
        #[serde(rename = "sessionId")]
        session_id: String,
        message: String,
    },
    GetHistory {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    ClearSession {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceivedMessage {
    #[serde(default)]
    pub session_id: Option<String>,
    pub content: String,
    #[serde(default)]
    pub sources: Vec<Citation>,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl ReceivedMessage {
    pub fn into_message(self) -> Message {
        let mut message = Message::assistant(self.content, self.sources);
        if let Some(timestamp) = self.timestamp {
            message.created_at = timestamp;
        }
        message
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    SessionCreated {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    MessageReceived(ReceivedMessage),
    BotTyping(bool),
    HistoryLoaded {
        #[serde(default)]
        history: Vec<Message>,
    },
    SessionCleared {
        #[serde(rename = "sessionId", default)]
        session_id: Option<String>,
    },
    Error {
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Expect {
    Session,
    Reply,
    History,
    Cleared,
}

impl ClientEvent {
    fn expects(&self) -> Expect {
        match self {
            Self::CreateSession => Expect::Session,
            Self::SendMessage { .. } => Expect::Reply,
            Self::GetHistory { .. } => Expect::History,
            Self::ClearSession { .. } => Expect::Cleared,
        }
    }
}

#[async_trait]
pub trait PushLink: Send + Sync {
    fn state(&self) -> ConnectionState;
    fn watch_state(&self) -> watch::Receiver<ConnectionState>;
    fn subscribe(&self) -> broadcast::Receiver<ServerEvent>;
    async fn emit(&self, event: ClientEvent) -> Result<(), ChatError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum PushReply {
    SessionCreated(String),
    Message(ReceivedMessage),
    History(Vec<Message>),
    Cleared,
}

type ReplySender = oneshot::Sender<Result<PushReply, ChatError>>;

struct PendingRequest {
    id: u64,
    expects: Expect,
    sent_at: Instant,
    reply: ReplySender,
}

impl PendingRequest {
    fn is_abandoned(&self) -> bool {
        self.reply.is_closed()
    }
}

/// Dropping it abandons the request; a reply that arrives later is discarded.
pub struct PendingReply {
    rx: oneshot::Receiver<Result<PushReply, ChatError>>,
}

impl PendingReply {
    pub async fn recv(self) -> Result<PushReply, ChatError> {
        self.rx
            .await
            .unwrap_or_else(|_| Err(ChatError::NetworkFailure("push channel closed".into())))
    }
}

/// The channel has no request ids, so replies are paired with pending
/// requests in emit order.
pub struct PushRouter {
    link: Arc<dyn PushLink>,
    pending: Arc<Mutex<VecDeque<PendingRequest>>>,
    next_id: AtomicU64,
    task: JoinHandle<()>,
}

impl PushRouter {
    /// Must be called inside a Tokio runtime. Abandoned requests older than
    /// `stale_after` stop claiming replies.
    pub fn spawn(link: Arc<dyn PushLink>, stale_after: Duration) -> Self {
        let pending = Arc::new(Mutex::new(VecDeque::new()));
        let events = link.subscribe();
        let mut state = link.watch_state();
        state.borrow_and_update();
        let task = tokio::spawn(route_events(events, state, pending.clone(), stale_after));
        Self {
            link,
            pending,
            next_id: AtomicU64::new(1),
            task,
        }
    }

    pub fn link(&self) -> &Arc<dyn PushLink> {
        &self.link
    }

    pub fn state(&self) -> ConnectionState {
        self.link.state()
    }

    pub async fn request(&self, event: ClientEvent) -> Result<PendingReply, ChatError> {
        if !self.link.state().is_connected() {
            return Err(ChatError::PushUnavailable);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().push_back(PendingRequest {
            id,
            expects: event.expects(),
            sent_at: Instant::now(),
            reply: tx,
        });
        if let Err(err) = self.link.emit(event).await {
            self.pending.lock().retain(|request| request.id != id);
            return Err(err);
        }
        Ok(PendingReply { rx })
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }
}

impl Drop for PushRouter {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn route_events(
    mut events: broadcast::Receiver<ServerEvent>,
    mut state: watch::Receiver<ConnectionState>,
    pending: Arc<Mutex<VecDeque<PendingRequest>>>,
    stale_after: Duration,
) {
    let mut watching_state = true;
    loop {
        let event = tokio::select! {
            changed = state.changed(), if watching_state => {
                if changed.is_err() {
                    watching_state = false;
                    continue;
                }
                // Requests sent on the previous connection will never be answered.
                let current = *state.borrow_and_update();
                fail_all(&pending, &format!("push connection {current:?}"));
                continue;
            }
            event = events.recv() => event,
        };
        let event = match event {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "push router lagged behind server events");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        prune_stale(&pending, stale_after);
        let (expects, reply) = match event {
            ServerEvent::SessionCreated { session_id } => {
                (Expect::Session, Ok(PushReply::SessionCreated(session_id)))
            }
            ServerEvent::MessageReceived(message) => (Expect::Reply, Ok(PushReply::Message(message))),
            ServerEvent::HistoryLoaded { history } => (Expect::History, Ok(PushReply::History(history))),
            ServerEvent::SessionCleared { .. } => (Expect::Cleared, Ok(PushReply::Cleared)),
            ServerEvent::Error { message } => {
                let request = {
                    let mut pending = pending.lock();
                    pending
                        .iter()
                        .position(|request| !request.is_abandoned())
                        .and_then(|position| pending.remove(position))
                };
                match request {
                    Some(request) => {
                        let _ = request.reply.send(Err(ChatError::Backend(message)));
                    }
                    None => warn!(%message, "push channel error with no live request"),
                }
                continue;
            }
            ServerEvent::BotTyping(_) => continue,
        };
        let request = {
            let mut pending = pending.lock();
            pending
                .iter()
                .position(|request| request.expects == expects)
                .and_then(|position| pending.remove(position))
        };
        match request {
            Some(request) => {
                if request.reply.send(reply).is_err() {
                    debug!(request = request.id, ?expects, "discarding late push reply");
                }
            }
            None => debug!(?expects, "unsolicited push event"),
        }
    }
    fail_all(&pending, "push channel closed");
}

fn prune_stale(pending: &Mutex<VecDeque<PendingRequest>>, stale_after: Duration) {
    pending
        .lock()
        .retain(|request| !(request.is_abandoned() && request.sent_at.elapsed() >= stale_after));
}

fn fail_all(pending: &Mutex<VecDeque<PendingRequest>>, reason: &str) {
    let drained: Vec<_> = pending.lock().drain(..).collect();
    if !drained.is_empty() {
        debug!(count = drained.len(), reason, "failing pending push requests");
    }
    for request in drained {
        let _ = request
            .reply
            .send(Err(ChatError::NetworkFailure(reason.to_string())));
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

pub struct WsPushChannel {
    outgoing: mpsc::UnboundedSender<String>,
    events: broadcast::Sender<ServerEvent>,
    state: watch::Receiver<ConnectionState>,
    task: JoinHandle<()>,
}

impl WsPushChannel {
    pub fn spawn(url: Url, policy: ReconnectPolicy) -> Self {
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(64);
        let (state_tx, state) = watch::channel(ConnectionState::Connecting);
        let task = tokio::spawn(run_connection(
            url,
            policy,
            outgoing_rx,
            events.clone(),
            state_tx,
        ));
        Self {
            outgoing,
            events,
            state,
            task,
        }
    }

    pub async fn wait_settled(&self, limit: Duration) -> ConnectionState {
        let mut state = self.state.clone();
        let settled = tokio::time::timeout(
            limit,
            state.wait_for(|state| {
                matches!(state, ConnectionState::Connected | ConnectionState::Disconnected)
            }),
        )
        .await;
        match settled {
            Ok(Ok(state)) => *state,
            _ => *self.state.borrow(),
        }
    }
}

impl Drop for WsPushChannel {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[async_trait]
impl PushLink for WsPushChannel {
    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    async fn emit(&self, event: ClientEvent) -> Result<(), ChatError> {
        if !self.state().is_connected() {
            return Err(ChatError::PushUnavailable);
        }
        let frame = serde_json::to_string(&event)
            .map_err(|err| ChatError::NetworkFailure(err.to_string()))?;
        debug!(?event, "push emit");
        self.outgoing
            .send(frame)
            .map_err(|_| ChatError::PushUnavailable)
    }
}

async fn run_connection(
    url: Url,
    policy: ReconnectPolicy,
    mut outgoing: mpsc::UnboundedReceiver<String>,
    events: broadcast::Sender<ServerEvent>,
    state: watch::Sender<ConnectionState>,
) {
    let mut failures = 0_u32;
    loop {
        let socket = match connect_async(url.as_str()).await {
            Ok((socket, _)) => socket,
            Err(err) => {
                failures += 1;
                warn!(%err, attempt = failures, "push channel connection failed");
                if failures >= policy.attempts {
                    warn!(attempts = failures, "giving up on the push channel");
                    state.send_replace(ConnectionState::Disconnected);
                    return;
                }
                state.send_replace(ConnectionState::Reconnecting);
                tokio::time::sleep(policy.delay).await;
                continue;
            }
        };
        failures = 0;
        info!(%url, "push channel connected");
        state.send_replace(ConnectionState::Connected);

        let (mut sink, mut source) = socket.split();
        loop {
            tokio::select! {
                frame = outgoing.recv() => match frame {
                    Some(text) => {
                        if let Err(err) = sink.send(WsMessage::Text(text.into())).await {
                            warn!(%err, "push channel send failed");
                            break;
                        }
                    }
                    None => {
                        let _ = sink.close().await;
                        state.send_replace(ConnectionState::Disconnected);
                        return;
                    }
                },
                incoming = source.next() => match incoming {
                    Some(Ok(WsMessage::Text(text))) => {
                        match serde_json::from_str::<ServerEvent>(text.as_str()) {
                            Ok(event) => {
                                let _ = events.send(event);
                            }
                            Err(err) => warn!(%err, "ignoring undecodable push event"),
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!(%err, "push channel receive failed");
                        break;
                    }
                },
            }
        }

        info!("push channel disconnected");
        state.send_replace(ConnectionState::Reconnecting);
        tokio::time::sleep(policy.delay).await;
    }
}

/// In-process [`PushLink`] whose server side is driven by the caller.
pub struct LoopbackLink {
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<ServerEvent>,
    emitted: Mutex<Vec<ClientEvent>>,
}

impl LoopbackLink {
    pub fn new(state: ConnectionState) -> Self {
        let (events, _) = broadcast::channel(64);
        let (state, _) = watch::channel(state);
        Self {
            state,
            events,
            emitted: Mutex::new(Vec::new()),
        }
    }

    pub fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    pub fn push(&self, event: ServerEvent) {
        let _ = self.events.send(event);
    }

    pub fn emitted(&self) -> Vec<ClientEvent> {
        self.emitted.lock().clone()
    }
}

#[async_trait]
impl PushLink for LoopbackLink {
    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    async fn emit(&self, event: ClientEvent) -> Result<(), ChatError> {
        if !self.state().is_connected() {
            return Err(ChatError::PushUnavailable);
        }
        self.emitted.lock().push(event);
        Ok(())
    }
}
