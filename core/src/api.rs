//! REST and streaming-HTTP access to the chat backend.

use crate::error::ChatError;
use crate::state::{Citation, Message};
use crate::stream::{sse_payloads, PayloadStream};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;
use url::Url;
use uuid::Uuid;

/// Body of `POST /api/chat/message`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageReply {
    pub response: String,
    #[serde(default)]
    pub sources: Vec<Citation>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MessageRequest<'a> {
    session_id: &'a str,
    message: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionCreated {
    session_id: String,
}

#[derive(Debug, Deserialize)]
struct HistoryResponse {
    #[serde(default)]
    history: Vec<Message>,
}

#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn create_session(&self) -> Result<String, ChatError>;
    async fn clear_session(&self, session_id: &str) -> Result<(), ChatError>;
    async fn send_message(&self, session_id: &str, message: &str)
        -> Result<MessageReply, ChatError>;
    /// Opens the chunked answer stream; items are the raw `data:` payloads.
    async fn stream_message(
        &self,
        session_id: &str,
        message: &str,
    ) -> Result<PayloadStream, ChatError>;
    async fn history(&self, session_id: &str) -> Result<Vec<Message>, ChatError>;
    async fn stats(&self) -> Result<Value, ChatError>;
}

/// [`ChatBackend`] over reqwest.
#[derive(Clone)]
pub struct HttpBackend {
    client: Client,
    base_url: Url,
    request_timeout: Duration,
}

impl HttpBackend {
    pub fn new(base_url: Url, request_timeout: Duration) -> Result<Self, ChatError> {
        let client = Client::builder()
            .connect_timeout(request_timeout)
            .build()?;
        Ok(Self {
            client,
            base_url,
            request_timeout,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url.as_str().trim_end_matches('/'), path)
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = self.endpoint(path);
        debug!(%method, %url, "api request");
        self.client.request(method, url)
    }

    async fn execute(&self, request: RequestBuilder) -> Result<Response, ChatError> {
        let response = request.timeout(self.request_timeout).send().await?;
        checked(response)
    }
}

fn checked(response: Response) -> Result<Response, ChatError> {
    let status = response.status();
    debug!(status = status.as_u16(), url = %response.url(), "api response");
    Ok(response.error_for_status()?)
}

#[async_trait]
impl ChatBackend for HttpBackend {
    async fn create_session(&self) -> Result<String, ChatError> {
        let response = self
            .execute(self.request(Method::POST, "/api/chat/session"))
            .await?;
        let created: SessionCreated = response.json().await?;
        Ok(created.session_id)
    }

    async fn clear_session(&self, session_id: &str) -> Result<(), ChatError> {
        let path = format!("/api/chat/session/{session_id}");
        self.execute(self.request(Method::DELETE, &path)).await?;
        Ok(())
    }

    async fn send_message(
        &self,
        session_id: &str,
        message: &str,
    ) -> Result<MessageReply, ChatError> {
        let request = self
            .request(Method::POST, "/api/chat/message")
            .json(&MessageRequest {
                session_id,
                message,
            });
        let response = self.execute(request).await?;
        Ok(response.json().await?)
    }

    async fn stream_message(
        &self,
        session_id: &str,
        message: &str,
    ) -> Result<PayloadStream, ChatError> {
        // No whole-request timeout here: the reader applies an idle ceiling per chunk.
        let response = self
            .request(Method::POST, "/api/chat/message/stream")
            .json(&MessageRequest {
                session_id,
                message,
            })
            .send()
            .await?;
        let response = checked(response)?;
        Ok(sse_payloads(response.bytes_stream()))
    }

    async fn history(&self, session_id: &str) -> Result<Vec<Message>, ChatError> {
        let path = format!("/api/chat/history/{session_id}");
        let response = self.execute(self.request(Method::GET, &path)).await?;
        let body: HistoryResponse = response.json().await?;
        Ok(body.history)
    }

    async fn stats(&self) -> Result<Value, ChatError> {
        let response = self
            .execute(self.request(Method::GET, "/api/chat/stats"))
            .await?;
        Ok(response.json().await?)
    }
}

/// Offline backend that answers by echoing the question.
#[derive(Default)]
pub struct MockBackend {
    history: parking_lot::Mutex<Vec<Message>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn answer(message: &str) -> MessageReply {
        MessageReply {
            response: format!("[Mock] Here is what I found about '{message}'."),
            sources: vec![Citation::new(
                "Mock Wire",
                format!("Coverage of {message}"),
                Some("https://example.com/mock".to_string()),
            )],
        }
    }

    fn record(&self, message: &str, reply: &MessageReply) {
        let mut history = self.history.lock();
        history.push(Message::user(message));
        history.push(Message::assistant(
            reply.response.clone(),
            reply.sources.clone(),
        ));
    }
}

#[async_trait]
impl ChatBackend for MockBackend {
    async fn create_session(&self) -> Result<String, ChatError> {
        Ok(Uuid::new_v4().to_string())
    }

    async fn clear_session(&self, _session_id: &str) -> Result<(), ChatError> {
        self.history.lock().clear();
        Ok(())
    }

    async fn send_message(
        &self,
        _session_id: &str,
        message: &str,
    ) -> Result<MessageReply, ChatError> {
        sleep(Duration::from_millis(20)).await;
        let reply = Self::answer(message);
        self.record(message, &reply);
        Ok(reply)
    }

    async fn stream_message(
        &self,
        _session_id: &str,
        message: &str,
    ) -> Result<PayloadStream, ChatError> {
        let reply = Self::answer(message);
        self.record(message, &reply);
        let mut payloads: Vec<String> = reply
            .response
            .split_inclusive(' ')
            .map(|word| serde_json::json!({ "kind": "text_delta", "text": word }).to_string())
            .collect();
        payloads.push(
            serde_json::json!({ "kind": "citations", "citations": reply.sources }).to_string(),
        );
        payloads.push(serde_json::json!({ "kind": "end" }).to_string());
        Ok(stream::iter(payloads)
            .then(|payload| async move {
                sleep(Duration::from_millis(5)).await;
                Ok(payload)
            })
            .boxed())
    }

    async fn history(&self, _session_id: &str) -> Result<Vec<Message>, ChatError> {
        Ok(self.history.lock().clone())
    }

    async fn stats(&self) -> Result<Value, ChatError> {
        Ok(serde_json::json!({
            "backend": "mock",
            "messages": self.history.lock().len(),
        }))
    }
}
