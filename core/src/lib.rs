pub mod api;
pub mod cancel;
pub mod client;
pub mod config;
pub mod error;
pub mod push;
pub mod session;
pub mod state;
pub mod store;
pub mod stream;
pub mod telemetry;
pub mod transport;

pub use api::{ChatBackend, HttpBackend, MockBackend};
pub use cancel::CancelToken;
pub use client::{ChatClient, ChatEvent, ClientOptions, Completion, SendOptions, SendOutcome};
pub use config::ClientSettings;
pub use error::ChatError;
pub use push::{PushLink, WsPushChannel};
pub use session::{Session, SessionDescriptor};
pub use state::{Citation, Conversation, Message, MessageRole};
pub use store::SessionStore;
pub use stream::{StreamChunk, StreamReassembler};
pub use transport::{ConnectionState, SendMode, Transport};
