use crate::cancel::CancelToken;
use crate::error::ChatError;
use crate::state::{Citation, Message};
use futures::stream::{self, BoxStream, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use tracing::{debug, warn};

pub type PayloadStream = BoxStream<'static, Result<String, ChatError>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StreamChunk {
    TextDelta { text: String },
    Citations { citations: Vec<Citation> },
    End,
    Error { message: String },
}

impl StreamChunk {
    /// Also accepts the legacy `type` frames and the `[DONE]` sentinel.
    pub fn parse(payload: &str) -> Result<Self, serde_json::Error> {
        let payload = payload.trim();
        if payload == "[DONE]" {
            return Ok(Self::End);
        }
        let mut value: Value = serde_json::from_str(payload)?;
        if let Some(object) = value.as_object_mut() {
            if !object.contains_key("kind") {
                if let Some(legacy) = object.remove("type") {
                    let kind = match legacy.as_str() {
                        Some("chunk") => "text_delta",
                        Some("sources") => "citations",
                        Some(other) => other,
                        None => "",
                    }
                    .to_string();
                    if let Some(sources) = object.remove("sources") {
                        object.insert("citations".into(), sources);
                    }
                    if kind == "error" && !object.contains_key("message") {
                        if let Some(error) = object.remove("error") {
                            object.insert("message".into(), error);
                        }
                    }
                    object.insert("kind".into(), Value::String(kind));
                }
            }
        }
        serde_json::from_value(value)
    }
}

#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);
        let mut payloads = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(payload) = data_payload(&String::from_utf8_lossy(&line)) {
                payloads.push(payload);
            }
        }
        payloads
    }

    /// Flushes a trailing line that was not newline-terminated.
    pub fn finish(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let line = std::mem::take(&mut self.buffer);
        data_payload(&String::from_utf8_lossy(&line))
    }
}

fn data_payload(line: &str) -> Option<String> {
    let line = line.trim_end_matches(['\n', '\r']);
    let rest = line.strip_prefix("data:")?;
    let rest = rest.strip_prefix(' ').unwrap_or(rest);
    if rest.trim().is_empty() {
        return None;
    }
    Some(rest.to_string())
}

pub fn sse_payloads<S, B, E>(body: S) -> PayloadStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Into<ChatError> + Send + 'static,
{
    let state = (body.boxed(), SseDecoder::new(), VecDeque::new(), false);
    stream::unfold(
        state,
        |(mut body, mut decoder, mut pending, mut eof)| async move {
            loop {
                if let Some(payload) = pending.pop_front() {
                    return Some((Ok(payload), (body, decoder, pending, eof)));
                }
                if eof {
                    return None;
                }
                match body.next().await {
                    Some(Ok(bytes)) => pending.extend(decoder.push(bytes.as_ref())),
                    Some(Err(err)) => {
                        eof = true;
                        return Some((Err(err.into()), (body, decoder, pending, eof)));
                    }
                    None => {
                        eof = true;
                        pending.extend(decoder.finish());
                    }
                }
            }
        },
    )
    .boxed()
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamUpdate {
    pub message: Message,
    pub is_final: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Finish {
    Ended,
    Cancelled,
}

/// Folds streamed chunks into one assistant [`Message`].
pub struct StreamReassembler {
    source: PayloadStream,
    message: Message,
    cancel: CancelToken,
    finish: Option<Finish>,
    done: bool,
}

impl StreamReassembler {
    pub fn new(source: PayloadStream, message: Message, cancel: CancelToken) -> Self {
        let mut message = message;
        message.streaming = true;
        Self {
            source,
            message,
            cancel,
            finish: None,
            done: false,
        }
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn finish(&self) -> Option<Finish> {
        self.finish
    }

    pub fn apply(&mut self, chunk: StreamChunk) -> Result<Option<StreamUpdate>, ChatError> {
        if self.done {
            return Ok(None);
        }
        match chunk {
            StreamChunk::TextDelta { text } => {
                self.message.text.push_str(&text);
                Ok(Some(self.snapshot(false)))
            }
            StreamChunk::Citations { citations } => {
                self.message.citations = citations;
                Ok(Some(self.snapshot(false)))
            }
            StreamChunk::End => Ok(Some(self.close(Finish::Ended))),
            StreamChunk::Error { message } => {
                self.fail();
                Err(ChatError::StreamError { message })
            }
        }
    }

    pub async fn next(&mut self) -> Option<Result<StreamUpdate, ChatError>> {
        if self.done {
            return None;
        }
        let cancel = self.cancel.clone();
        loop {
            if cancel.is_cancelled() {
                debug!(message_id = %self.message.id, "stream cancelled");
                return Some(Ok(self.close(Finish::Cancelled)));
            }
            let item = tokio::select! {
                biased;
                _ = cancel.cancelled() => continue,
                item = self.source.next() => item,
            };
            match item {
                None => return Some(Ok(self.close(Finish::Ended))),
                Some(Err(err)) => {
                    let has_content =
                        !self.message.text.is_empty() || !self.message.citations.is_empty();
                    self.fail();
                    // A retry would duplicate an answer the user has already seen.
                    if err.is_retryable() && has_content {
                        return Some(Err(ChatError::StreamError {
                            message: err.to_string(),
                        }));
                    }
                    return Some(Err(err));
                }
                Some(Ok(payload)) => match StreamChunk::parse(&payload) {
                    Ok(chunk) => match self.apply(chunk) {
                        Ok(Some(update)) => return Some(Ok(update)),
                        Ok(None) => continue,
                        Err(err) => return Some(Err(err)),
                    },
                    Err(err) => {
                        warn!(%err, payload = %payload, "skipping malformed stream chunk");
                        continue;
                    }
                },
            }
        }
    }

    pub fn into_updates(self) -> BoxStream<'static, Result<StreamUpdate, ChatError>> {
        stream::unfold(self, |mut reassembler| async move {
            let item = reassembler.next().await?;
            Some((item, reassembler))
        })
        .boxed()
    }

    fn snapshot(&self, is_final: bool) -> StreamUpdate {
        StreamUpdate {
            message: self.message.clone(),
            is_final,
        }
    }

    fn close(&mut self, finish: Finish) -> StreamUpdate {
        self.done = true;
        self.finish = Some(finish);
        self.message.streaming = false;
        self.snapshot(true)
    }

    fn fail(&mut self) {
        self.done = true;
        self.message.streaming = false;
    }
}
