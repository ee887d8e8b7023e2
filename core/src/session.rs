use crate::transport::ConnectionState;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Age after which a persisted session must not be resumed.
pub fn session_max_age() -> Duration {
    Duration::hours(24)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    Push,
    Http,
}

impl TransportMode {
    pub fn for_state(state: ConnectionState) -> Self {
        if state.is_connected() {
            Self::Push
        } else {
            Self::Http
        }
    }
}

/// Server-side conversation context held by this client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub session_id: String,
    pub transport_mode: TransportMode,
}

impl Session {
    pub fn new(session_id: impl Into<String>, transport_mode: TransportMode) -> Self {
        Self {
            session_id: session_id.into(),
            transport_mode,
        }
    }
}

/// Locally persisted record of the last session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDescriptor {
    pub session_id: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_activity: DateTime<Utc>,
}

impl SessionDescriptor {
    pub fn new(session_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            timestamp: now,
            last_activity: now,
        }
    }

    /// Valid while younger than [`session_max_age`], measured from creation.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        !self.session_id.is_empty() && now - self.timestamp < session_max_age()
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid_at(Utc::now())
    }

    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub session_id: Option<String>,
    pub message_count: usize,
    pub push_connected: bool,
}
