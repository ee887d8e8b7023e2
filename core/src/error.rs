use thiserror::Error;

/// Failures surfaced by the chat client.
///
/// A cancelled send is not represented here; it completes with
/// [`crate::client::Completion::Cancelled`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChatError {
    #[error("no active session")]
    NoActiveSession,
    #[error("message cannot be empty")]
    EmptyMessage,
    #[error("message is too long (max {max} characters)")]
    MessageTooLong { max: usize },
    #[error("timed out waiting for the assistant")]
    TransportTimeout,
    #[error("stream failed: {message}")]
    StreamError { message: String },
    #[error("network failure: {0}")]
    NetworkFailure(String),
    #[error("request rejected with HTTP {status}: {message}")]
    Rejected { status: u16, message: String },
    #[error("push channel is not connected")]
    PushUnavailable,
    #[error("backend error: {0}")]
    Backend(String),
    #[error("local storage failed: {0}")]
    Persistence(String),
}

impl ChatError {
    /// Whether the send loop may try again with a fresh transport selection.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NetworkFailure(_) | Self::TransportTimeout)
    }

    /// Short notification text for the presentation layer.
    pub fn user_message(&self) -> String {
        match self {
            Self::NoActiveSession => "Start a chat session before sending messages.".to_string(),
            Self::EmptyMessage => "Message cannot be empty.".to_string(),
            Self::MessageTooLong { max } => {
                format!("Message is too long (max {max} characters).")
            }
            Self::TransportTimeout => "The assistant did not answer in time.".to_string(),
            Self::StreamError { message } => format!("The answer was interrupted: {message}"),
            Self::NetworkFailure(_) | Self::PushUnavailable => {
                "Failed to send message. Please try again.".to_string()
            }
            Self::Rejected { message, .. } | Self::Backend(message) => message.clone(),
            Self::Persistence(detail) => format!("Could not save chat locally: {detail}"),
        }
    }
}

impl From<reqwest::Error> for ChatError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return Self::TransportTimeout;
        }
        if let Some(status) = err.status() {
            if status.is_client_error() {
                return Self::Rejected {
                    status: status.as_u16(),
                    message: err.to_string(),
                };
            }
        }
        Self::NetworkFailure(err.to_string())
    }
}

impl From<std::io::Error> for ChatError {
    fn from(err: std::io::Error) -> Self {
        Self::Persistence(err.to_string())
    }
}
