use serde::{Deserialize, Serialize};
use std::fmt;

/// Push-channel connection status, owned by the push channel and observed by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Connected,
    #[default]
    Disconnected,
    Reconnecting,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        self == Self::Connected
    }
}

/// Caller preference between streamed and single-shot HTTP answers.
///
/// Only consulted when the push channel is unavailable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SendMode {
    Streaming,
    #[default]
    Standard,
}

/// Channel used for one delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Push,
    StreamingHttp,
    PlainHttp,
}

impl Transport {
    /// Picks the best available channel for a single attempt.
    pub fn select(push: ConnectionState, mode: SendMode) -> Self {
        if push.is_connected() {
            return Self::Push;
        }
        match mode {
            SendMode::Streaming => Self::StreamingHttp,
            SendMode::Standard => Self::PlainHttp,
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Push => "push",
            Self::StreamingHttp => "http-stream",
            Self::PlainHttp => "http",
        };
        f.write_str(name)
    }
}
