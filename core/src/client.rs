//! The conversation owner: session lifecycle, optimistic appends and the
//! per-message transport selection with retry and cancellation.

use crate::api::ChatBackend;
use crate::cancel::CancelToken;
use crate::config::ClientSettings;
use crate::error::ChatError;
use crate::push::{ClientEvent, PushLink, PushReply, PushRouter, ServerEvent};
use crate::session::{Session, SessionInfo, TransportMode};
use crate::state::{Conversation, Message};
use crate::store::SessionStore;
use crate::stream::{Finish, StreamReassembler};
use crate::transport::{ConnectionState, SendMode, Transport};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

pub const DEFAULT_RETRIES: u32 = 3;

/// Progress notifications for the presentation layer.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    UserMessage(Message),
    Typing(bool),
    Snapshot { message: Message, is_final: bool },
    Completed(Message),
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct SendOptions {
    pub mode: SendMode,
    /// Extra attempts after the first one fails with a retryable error.
    pub retries: u32,
    pub progress: Option<UnboundedSender<ChatEvent>>,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            mode: SendMode::Standard,
            retries: DEFAULT_RETRIES,
            progress: None,
        }
    }
}

impl SendOptions {
    pub fn streaming() -> Self {
        Self {
            mode: SendMode::Streaming,
            ..Self::default()
        }
    }

    pub fn with_progress(mut self, progress: UnboundedSender<ChatEvent>) -> Self {
        self.progress = Some(progress);
        self
    }

    fn notify(&self, event: ChatEvent) {
        if let Some(progress) = &self.progress {
            let _ = progress.send(event);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Finished,
    /// Stopped by the user or by a newer send. Not a failure.
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SendOutcome {
    pub completion: Completion,
    /// The finalized assistant message, if one was produced.
    pub message: Option<Message>,
    pub transport: Option<Transport>,
}

impl SendOutcome {
    fn finished(message: Message, transport: Transport) -> Self {
        Self {
            completion: Completion::Finished,
            message: Some(message),
            transport: Some(transport),
        }
    }

    fn cancelled(message: Option<Message>, transport: Option<Transport>) -> Self {
        Self {
            completion: Completion::Cancelled,
            message,
            transport,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.completion == Completion::Cancelled
    }
}

/// Timing and validation limits used by [`ChatClient`].
#[derive(Debug, Clone, Copy)]
pub struct ClientOptions {
    pub request_timeout: Duration,
    pub push_timeout: Duration,
    pub max_message_length: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self::from(&ClientSettings::default())
    }
}

impl From<&ClientSettings> for ClientOptions {
    fn from(settings: &ClientSettings) -> Self {
        Self {
            request_timeout: settings.request_timeout,
            push_timeout: settings.push_timeout,
            max_message_length: settings.max_message_length,
        }
    }
}

#[derive(Default)]
struct InnerState {
    session: Option<Session>,
    conversation: Conversation,
}

#[derive(Clone)]
pub struct ChatClient {
    inner: Arc<RwLock<InnerState>>,
    backend: Arc<dyn ChatBackend>,
    push: Option<Arc<PushRouter>>,
    store: Option<SessionStore>,
    options: ClientOptions,
    in_flight: Arc<Mutex<Option<CancelToken>>>,
    send_gate: Arc<tokio::sync::Mutex<()>>,
}

impl ChatClient {
    pub fn new(backend: Arc<dyn ChatBackend>, options: ClientOptions) -> Self {
        Self {
            inner: Arc::new(RwLock::new(InnerState::default())),
            backend,
            push: None,
            store: None,
            options,
            in_flight: Arc::new(Mutex::new(None)),
            send_gate: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Attaches a push channel. Must be called inside a Tokio runtime.
    pub fn with_push(mut self, link: Arc<dyn PushLink>) -> Self {
        let router = PushRouter::spawn(link, self.options.push_timeout);
        self.push = Some(Arc::new(router));
        self
    }

    pub fn with_store(mut self, store: SessionStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.push
            .as_ref()
            .map(|router| router.state())
            .unwrap_or(ConnectionState::Disconnected)
    }

    pub fn session(&self) -> Option<Session> {
        self.inner.read().session.clone()
    }

    pub fn session_id(&self) -> Option<String> {
        self.inner.read().session.as_ref().map(|s| s.session_id.clone())
    }

    pub fn messages(&self) -> Vec<Message> {
        self.inner.read().conversation.messages.clone()
    }

    pub fn conversation(&self) -> Conversation {
        self.inner.read().conversation.clone()
    }

    pub fn session_info(&self) -> SessionInfo {
        let inner = self.inner.read();
        SessionInfo {
            session_id: inner.session.as_ref().map(|s| s.session_id.clone()),
            message_count: inner.conversation.len(),
            push_connected: self.connection_state().is_connected(),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.lock().is_some()
    }

    /// Stops the in-flight send, if any. Returns whether there was one.
    pub fn cancel(&self) -> bool {
        match self.in_flight.lock().as_ref() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    fn live_push(&self) -> Option<&Arc<PushRouter>> {
        self.push
            .as_ref()
            .filter(|router| router.state().is_connected())
    }

    /// Creates a fresh backend session and makes it current.
    pub async fn create_session(&self) -> Result<String, ChatError> {
        self.cancel();
        let (session_id, mode) = match self.live_push() {
            Some(router) => {
                let reply = self
                    .await_push(router, ClientEvent::CreateSession)
                    .await?;
                match reply {
                    PushReply::SessionCreated(id) => (id, TransportMode::Push),
                    other => return Err(unexpected_reply(&other)),
                }
            }
            None => (
                self.with_ceiling(self.backend.create_session()).await?,
                TransportMode::Http,
            ),
        };
        info!(%session_id, ?mode, "session created");
        {
            let mut inner = self.inner.write();
            inner.session = Some(Session::new(session_id.clone(), mode));
            inner.conversation = Conversation::new();
        }
        if let Some(store) = &self.store {
            if let Err(err) = store.save_session(&session_id) {
                warn!(%err, "failed to persist session descriptor");
            }
            if let Err(err) = store.clear_messages() {
                warn!(%err, "failed to drop persisted messages");
            }
        }
        Ok(session_id)
    }

    /// Drops the message list of the current session, locally and on the backend.
    pub async fn clear_session(&self) -> Result<(), ChatError> {
        let session_id = self.require_session(None)?;
        self.cancel();
        match self.live_push() {
            Some(router) => {
                let event = ClientEvent::ClearSession {
                    session_id: session_id.clone(),
                };
                match self.await_push(router, event).await? {
                    PushReply::Cleared => {}
                    other => return Err(unexpected_reply(&other)),
                }
            }
            None => {
                self.with_ceiling(self.backend.clear_session(&session_id))
                    .await?
            }
        }
        self.inner.write().conversation.clear();
        if let Some(store) = &self.store {
            if let Err(err) = store.clear_messages() {
                warn!(%err, "failed to drop persisted messages");
            }
        }
        info!(%session_id, "session cleared");
        Ok(())
    }

    /// Makes `session_id` current and replaces the message list with its history.
    pub async fn resume_session(&self, session_id: &str) -> Result<usize, ChatError> {
        let session_id = self.require_session(Some(session_id))?;
        self.cancel();
        let mode = TransportMode::for_state(self.connection_state());
        self.inner.write().session = Some(Session::new(session_id.clone(), mode));
        self.load_history().await
    }

    /// Resumes the persisted session when it is still valid, otherwise starts a new one.
    pub async fn resume_or_create(&self) -> Result<String, ChatError> {
        if let Some(store) = &self.store {
            match store.valid_session() {
                Some(descriptor) => {
                    match self.resume_session(&descriptor.session_id).await {
                        Ok(count) => {
                            info!(session_id = %descriptor.session_id, messages = count, "resumed session");
                            return Ok(descriptor.session_id);
                        }
                        Err(err) => warn!(%err, "could not resume persisted session"),
                    }
                }
                None => {
                    if let Err(err) = store.clear() {
                        warn!(%err, "failed to drop expired session");
                    }
                }
            }
        }
        self.create_session().await
    }

    /// Re-fetches the history of the current session.
    pub async fn load_history(&self) -> Result<usize, ChatError> {
        let session_id = self.require_session(None)?;
        let history = match self.live_push() {
            Some(router) => {
                let event = ClientEvent::GetHistory {
                    session_id: session_id.clone(),
                };
                match self.await_push(router, event).await? {
                    PushReply::History(history) => history,
                    other => return Err(unexpected_reply(&other)),
                }
            }
            None => self.with_ceiling(self.backend.history(&session_id)).await?,
        };
        let count = history.len();
        self.inner.write().conversation = Conversation::from_history(history);
        self.persist_messages();
        Ok(count)
    }

    pub async fn stats(&self) -> Result<Value, ChatError> {
        self.with_ceiling(self.backend.stats()).await
    }

    /// Sends `text` in the current session.
    pub async fn send(&self, text: &str, options: SendOptions) -> Result<SendOutcome, ChatError> {
        let session_id = self.session_id().unwrap_or_default();
        self.send_to(&session_id, text, options).await
    }

    /// Delivers `text` and produces the finalized assistant message.
    ///
    /// A send that is still running when a new one starts is cancelled and
    /// fully settled before the new one appends anything.
    pub async fn send_to(
        &self,
        session_id: &str,
        text: &str,
        options: SendOptions,
    ) -> Result<SendOutcome, ChatError> {
        let session_id = self.require_session(Some(session_id))?;
        let text = self.validate(text)?;

        let token = CancelToken::new();
        if let Some(previous) = self.in_flight.lock().replace(token.clone()) {
            debug!("cancelling previous send");
            previous.cancel();
        }
        let _gate = self.send_gate.lock().await;
        if token.is_cancelled() {
            return Ok(SendOutcome::cancelled(None, None));
        }

        let user_message = Message::user(text.clone());
        self.inner
            .write()
            .conversation
            .add_message(user_message.clone());
        options.notify(ChatEvent::UserMessage(user_message));
        self.persist_messages();
        if let Some(store) = &self.store {
            if let Err(err) = store.record_activity() {
                warn!(%err, "failed to record session activity");
            }
        }

        let result = self.deliver(&session_id, &text, &options, &token).await;

        {
            let mut slot = self.in_flight.lock();
            if slot.as_ref().is_some_and(|current| current.same_as(&token)) {
                *slot = None;
            }
        }
        self.persist_messages();

        match &result {
            Ok(outcome) => {
                if let (Completion::Finished, Some(message)) = (outcome.completion, &outcome.message) {
                    options.notify(ChatEvent::Completed(message.clone()));
                }
            }
            Err(err) => {
                warn!(%err, "message send failed");
                options.notify(ChatEvent::Failed(err.user_message()));
            }
        }
        result
    }

    async fn deliver(
        &self,
        session_id: &str,
        text: &str,
        options: &SendOptions,
        token: &CancelToken,
    ) -> Result<SendOutcome, ChatError> {
        let mut attempt = 0_u32;
        loop {
            if token.is_cancelled() {
                return Ok(SendOutcome::cancelled(None, None));
            }
            let transport = Transport::select(self.connection_state(), options.mode);
            debug!(%transport, attempt, "sending message");
            let result = match transport {
                Transport::Push => self.send_via_push(session_id, text, options, token).await,
                Transport::StreamingHttp => {
                    self.send_via_stream(session_id, text, options, token).await
                }
                Transport::PlainHttp => self.send_via_http(session_id, text, token).await,
            };
            match result {
                Err(err) if err.is_retryable() && attempt < options.retries => {
                    attempt += 1;
                    warn!(
                        %err,
                        %transport,
                        remaining = options.retries - attempt,
                        "retrying message send"
                    );
                }
                other => return other,
            }
        }
    }

    async fn send_via_push(
        &self,
        session_id: &str,
        text: &str,
        options: &SendOptions,
        token: &CancelToken,
    ) -> Result<SendOutcome, ChatError> {
        let router = self.live_push().ok_or(ChatError::PushUnavailable)?;
        let mut events = router.link().subscribe();
        let pending = router
            .request(ClientEvent::SendMessage {
                session_id: session_id.to_string(),
                message: text.to_string(),
            })
            .await
            .map_err(|err| match err {
                // The connection dropped between selection and emit.
                ChatError::PushUnavailable => ChatError::NetworkFailure(err.to_string()),
                other => other,
            })?;
        let reply = pending.recv();
        tokio::pin!(reply);
        let deadline = tokio::time::sleep(self.options.push_timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    options.notify(ChatEvent::Typing(false));
                    return Ok(SendOutcome::cancelled(None, Some(Transport::Push)));
                }
                _ = &mut deadline => {
                    options.notify(ChatEvent::Typing(false));
                    return Err(ChatError::TransportTimeout);
                }
                result = &mut reply => {
                    options.notify(ChatEvent::Typing(false));
                    return match result? {
                        PushReply::Message(received) => {
                            let message = received.into_message();
                            self.inner.write().conversation.add_message(message.clone());
                            Ok(SendOutcome::finished(message, Transport::Push))
                        }
                        other => Err(unexpected_reply(&other)),
                    };
                }
                event = events.recv() => match event {
                    Ok(ServerEvent::BotTyping(typing)) => options.notify(ChatEvent::Typing(typing)),
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => debug!(skipped, "typing listener lagged"),
                    Err(RecvError::Closed) => {
                        return Err(ChatError::NetworkFailure("push channel closed".into()));
                    }
                },
            }
        }
    }

    async fn send_via_stream(
        &self,
        session_id: &str,
        text: &str,
        options: &SendOptions,
        token: &CancelToken,
    ) -> Result<SendOutcome, ChatError> {
        let opened = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            opened = self.with_ceiling(self.backend.stream_message(session_id, text)) => Some(opened),
        };
        let source = match opened {
            Some(source) => source?,
            None => return Ok(SendOutcome::cancelled(None, Some(Transport::StreamingHttp))),
        };

        let mut reassembler = StreamReassembler::new(source, Message::placeholder(), token.clone());
        let message_id = reassembler.message().id.clone();
        let mut appended = false;

        loop {
            let next = match tokio::time::timeout(self.options.request_timeout, reassembler.next())
                .await
            {
                Ok(next) => next,
                Err(_) => {
                    self.finalize_streamed(&message_id, appended);
                    if appended {
                        return Err(ChatError::StreamError {
                            message: "stream stalled".to_string(),
                        });
                    }
                    return Err(ChatError::TransportTimeout);
                }
            };
            match next {
                Some(Ok(update)) => {
                    let empty = update.message.text.is_empty() && update.message.citations.is_empty();
                    if appended || !(update.is_final && empty) {
                        self.inner.write().conversation.apply_snapshot(&update.message);
                        appended = true;
                    }
                    options.notify(ChatEvent::Snapshot {
                        message: update.message.clone(),
                        is_final: update.is_final,
                    });
                    if update.is_final {
                        let message = appended.then_some(update.message);
                        return Ok(match (reassembler.finish(), message) {
                            (Some(Finish::Ended), Some(message)) => {
                                SendOutcome::finished(message, Transport::StreamingHttp)
                            }
                            (Some(Finish::Ended), None) => SendOutcome {
                                completion: Completion::Finished,
                                message: None,
                                transport: Some(Transport::StreamingHttp),
                            },
                            (_, message) => {
                                SendOutcome::cancelled(message, Some(Transport::StreamingHttp))
                            }
                        });
                    }
                }
                Some(Err(err)) => {
                    self.finalize_streamed(&message_id, appended);
                    return Err(err);
                }
                None => {
                    self.finalize_streamed(&message_id, appended);
                    return Ok(SendOutcome::cancelled(
                        appended.then(|| reassembler.message().clone()),
                        Some(Transport::StreamingHttp),
                    ));
                }
            }
        }
    }

    async fn send_via_http(
        &self,
        session_id: &str,
        text: &str,
        token: &CancelToken,
    ) -> Result<SendOutcome, ChatError> {
        let reply = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            reply = self.with_ceiling(self.backend.send_message(session_id, text)) => Some(reply),
        };
        let Some(reply) = reply else {
            return Ok(SendOutcome::cancelled(None, Some(Transport::PlainHttp)));
        };
        let reply = reply?;
        let message = Message::assistant(reply.response, reply.sources);
        self.inner.write().conversation.add_message(message.clone());
        Ok(SendOutcome::finished(message, Transport::PlainHttp))
    }

    fn finalize_streamed(&self, message_id: &str, appended: bool) {
        if appended {
            self.inner.write().conversation.finalize(message_id);
        }
    }

    async fn await_push(
        &self,
        router: &PushRouter,
        event: ClientEvent,
    ) -> Result<PushReply, ChatError> {
        let pending = router.request(event).await?;
        tokio::time::timeout(self.options.push_timeout, pending.recv())
            .await
            .unwrap_or(Err(ChatError::TransportTimeout))
    }

    async fn with_ceiling<T>(
        &self,
        call: impl Future<Output = Result<T, ChatError>>,
    ) -> Result<T, ChatError> {
        tokio::time::timeout(self.options.request_timeout, call)
            .await
            .unwrap_or(Err(ChatError::TransportTimeout))
    }

    fn require_session(&self, session_id: Option<&str>) -> Result<String, ChatError> {
        let session_id = match session_id {
            Some(id) => id.to_string(),
            None => self.session_id().unwrap_or_default(),
        };
        if session_id.trim().is_empty() {
            return Err(ChatError::NoActiveSession);
        }
        Ok(session_id)
    }

    fn validate(&self, text: &str) -> Result<String, ChatError> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        let max = self.options.max_message_length;
        if trimmed.chars().count() > max {
            return Err(ChatError::MessageTooLong { max });
        }
        Ok(trimmed.to_string())
    }

    fn persist_messages(&self) {
        if let Some(store) = &self.store {
            let messages = self.messages();
            if let Err(err) = store.save_messages(&messages) {
                warn!(%err, "failed to persist messages");
            }
        }
    }
}

fn unexpected_reply(reply: &PushReply) -> ChatError {
    ChatError::Backend(format!("unexpected push reply: {reply:?}"))
}
