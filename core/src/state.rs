use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    #[serde(alias = "bot")]
    Assistant,
}

/// A news source attached to an assistant answer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Citation {
    #[serde(alias = "source", default = "Citation::default_label")]
    pub label: String,
    #[serde(default)]
    pub title: String,
    #[serde(alias = "link", default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl Citation {
    pub fn new(label: impl Into<String>, title: impl Into<String>, url: Option<String>) -> Self {
        Self {
            label: label.into(),
            title: title.into(),
            url,
        }
    }

    fn default_label() -> String {
        "News".to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    #[serde(default = "Message::fresh_id")]
    pub id: String,
    #[serde(alias = "type")]
    pub role: MessageRole,
    #[serde(alias = "content", default)]
    pub text: String,
    #[serde(alias = "sources", default)]
    pub citations: Vec<Citation>,
    #[serde(
        alias = "timestamp",
        with = "chrono::serde::ts_milliseconds",
        default = "Utc::now"
    )]
    pub created_at: DateTime<Utc>,
    /// Set while a stream is still writing into this message.
    #[serde(skip)]
    pub streaming: bool,
}

impl Message {
    pub fn new(role: MessageRole, text: impl Into<String>) -> Self {
        Self {
            id: Self::fresh_id(),
            role,
            text: text.into(),
            citations: Vec::new(),
            created_at: Utc::now(),
            streaming: false,
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(MessageRole::User, text)
    }

    pub fn assistant(text: impl Into<String>, citations: Vec<Citation>) -> Self {
        let mut message = Self::new(MessageRole::Assistant, text);
        message.citations = citations;
        message
    }

    /// An empty assistant message that a stream will fill in.
    pub fn placeholder() -> Self {
        let mut message = Self::new(MessageRole::Assistant, String::new());
        message.streaming = true;
        message
    }

    pub fn is_final(&self) -> bool {
        !self.streaming
    }

    fn fresh_id() -> String {
        format!("msg_{}", Uuid::new_v4().simple())
    }
}

/// The visible message list of one chat session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Conversation {
    pub messages: Vec<Message>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_history(messages: Vec<Message>) -> Self {
        Self {
            messages,
            updated_at: Some(Utc::now()),
        }
    }

    pub fn add_message(&mut self, message: Message) {
        self.messages.push(message);
        self.updated_at = Some(Utc::now());
    }

    /// Writes a snapshot of an assistant message that is still streaming.
    ///
    /// Finalized messages are never overwritten. Returns `false` when the
    /// snapshot was dropped.
    pub fn apply_snapshot(&mut self, snapshot: &Message) -> bool {
        match self.messages.iter_mut().find(|m| m.id == snapshot.id) {
            Some(existing) if existing.streaming && existing.role == MessageRole::Assistant => {
                existing.text.clone_from(&snapshot.text);
                existing.citations.clone_from(&snapshot.citations);
                existing.streaming = snapshot.streaming;
            }
            Some(_) => return false,
            None => self.messages.push(snapshot.clone()),
        }
        self.updated_at = Some(Utc::now());
        true
    }

    /// Marks a streaming message as complete, keeping whatever text it holds.
    pub fn finalize(&mut self, id: &str) {
        if let Some(message) = self.messages.iter_mut().find(|m| m.id == id) {
            message.streaming = false;
        }
    }

    pub fn in_progress(&self) -> Option<&Message> {
        self.messages.iter().find(|m| m.streaming)
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        self.updated_at = Some(Utc::now());
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
