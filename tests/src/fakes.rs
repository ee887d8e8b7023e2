//! Scripted [`ChatBackend`] and stream feeds for driving the client in tests.

use async_trait::async_trait;
use futures::channel::mpsc::{unbounded, UnboundedSender};
use futures::StreamExt;
use newsdesk_core::api::{ChatBackend, MessageReply};
use newsdesk_core::error::ChatError;
use newsdesk_core::state::{Citation, Message};
use newsdesk_core::stream::PayloadStream;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::future::pending;

/// How often each backend operation was invoked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub create: usize,
    pub clear: usize,
    pub send: usize,
    pub stream: usize,
    pub history: usize,
    pub stats: usize,
}

impl CallCounts {
    /// Calls that deliver a message.
    pub fn deliveries(&self) -> usize {
        self.send + self.stream
    }
}

#[derive(Default)]
struct Script {
    counts: CallCounts,
    send_failures: VecDeque<ChatError>,
    streams: VecDeque<Result<PayloadStream, ChatError>>,
    history: Vec<Message>,
    hang_sends: bool,
    next_session: usize,
}

/// Backend whose answers and failures are queued up front.
#[derive(Default)]
pub struct ScriptedBackend {
    script: Mutex<Script>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counts(&self) -> CallCounts {
        self.script.lock().counts
    }

    /// The next `send_message` calls fail with these errors, in order.
    pub fn fail_sends_with(&self, errors: impl IntoIterator<Item = ChatError>) {
        self.script.lock().send_failures.extend(errors);
    }

    /// `send_message` never answers.
    pub fn hang_sends(&self) {
        self.script.lock().hang_sends = true;
    }

    pub fn queue_stream(&self, stream: PayloadStream) {
        self.script.lock().streams.push_back(Ok(stream));
    }

    /// The next `stream_message` call fails before any chunk arrives.
    pub fn queue_stream_failure(&self, error: ChatError) {
        self.script.lock().streams.push_back(Err(error));
    }

    pub fn set_history(&self, history: Vec<Message>) {
        self.script.lock().history = history;
    }

    pub fn answer_for(message: &str) -> String {
        format!("Answer to '{message}'")
    }
}

#[async_trait]
impl ChatBackend for ScriptedBackend {
    async fn create_session(&self) -> Result<String, ChatError> {
        let mut script = self.script.lock();
        script.counts.create += 1;
        script.next_session += 1;
        Ok(format!("session-{}", script.next_session))
    }

    async fn clear_session(&self, _session_id: &str) -> Result<(), ChatError> {
        let mut script = self.script.lock();
        script.counts.clear += 1;
        script.history.clear();
        Ok(())
    }

    async fn send_message(
        &self,
        _session_id: &str,
        message: &str,
    ) -> Result<MessageReply, ChatError> {
        let hang = {
            let mut script = self.script.lock();
            script.counts.send += 1;
            if let Some(err) = script.send_failures.pop_front() {
                return Err(err);
            }
            script.hang_sends
        };
        if hang {
            pending::<()>().await;
        }
        Ok(MessageReply {
            response: Self::answer_for(message),
            sources: vec![Citation::new("Wire", "Source story", None)],
        })
    }

    async fn stream_message(
        &self,
        _session_id: &str,
        _message: &str,
    ) -> Result<PayloadStream, ChatError> {
        let mut script = self.script.lock();
        script.counts.stream += 1;
        script
            .streams
            .pop_front()
            .unwrap_or_else(|| Err(ChatError::Backend("no stream scripted".into())))
    }

    async fn history(&self, _session_id: &str) -> Result<Vec<Message>, ChatError> {
        let mut script = self.script.lock();
        script.counts.history += 1;
        Ok(script.history.clone())
    }

    async fn stats(&self) -> Result<Value, ChatError> {
        let mut script = self.script.lock();
        script.counts.stats += 1;
        Ok(json!({ "sessions": script.next_session }))
    }
}

/// Sending half of a scripted stream. Dropping it ends the stream.
pub struct StreamFeed {
    tx: UnboundedSender<Result<String, ChatError>>,
}

pub fn stream_feed() -> (StreamFeed, PayloadStream) {
    let (tx, rx) = unbounded();
    (StreamFeed { tx }, rx.boxed())
}

impl StreamFeed {
    pub fn raw(&self, payload: impl Into<String>) {
        let _ = self.tx.unbounded_send(Ok(payload.into()));
    }

    pub fn delta(&self, text: &str) {
        self.raw(json!({ "kind": "text_delta", "text": text }).to_string());
    }

    pub fn citations(&self, citations: &[Citation]) {
        self.raw(json!({ "kind": "citations", "citations": citations }).to_string());
    }

    pub fn end(&self) {
        self.raw(json!({ "kind": "end" }).to_string());
    }

    pub fn fail(&self, error: ChatError) {
        let _ = self.tx.unbounded_send(Err(error));
    }
}
