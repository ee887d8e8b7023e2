use crate::session::SessionDescriptor;
use crate::state::Message;
use anyhow::{Context, Result};
use directories::BaseDirs;
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub const SESSION_KEY: &str = "chat-session";
pub const MESSAGES_KEY: &str = "chat-messages";

/// File-backed store for the session descriptor and the visible message list.
#[derive(Clone, Debug)]
pub struct SessionStore {
    root: PathBuf,
}

impl SessionStore {
    pub fn new(root: PathBuf) -> Self {
        fs::create_dir_all(&root).ok();
        Self { root }
    }

    /// Store under the user's data directory.
    pub fn default_location() -> Self {
        let root = BaseDirs::new()
            .map(|base| base.data_dir().join("newsdesk"))
            .unwrap_or_else(|| PathBuf::from(".newsdesk"));
        Self::new(root)
    }

    pub fn in_memory() -> Self {
        let mut path = std::env::temp_dir();
        path.push(format!("newsdesk-{}", Uuid::new_v4()));
        Self::new(path)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn key_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{key}.json"))
    }

    pub fn load_session(&self) -> Result<Option<SessionDescriptor>> {
        let path = self.key_path(SESSION_KEY);
        if !path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let descriptor = serde_json::from_str(&contents)
            .with_context(|| format!("invalid session descriptor at {}", path.display()))?;
        Ok(Some(descriptor))
    }

    /// The persisted session, if it is still young enough to resume.
    pub fn valid_session(&self) -> Option<SessionDescriptor> {
        match self.load_session() {
            Ok(Some(descriptor)) if descriptor.is_valid() => Some(descriptor),
            Ok(_) => None,
            Err(err) => {
                tracing::warn!(%err, "discarding unreadable session descriptor");
                None
            }
        }
    }

    pub fn is_session_valid(&self) -> bool {
        self.valid_session().is_some()
    }

    pub fn save_session(&self, session_id: &str) -> Result<SessionDescriptor> {
        let descriptor = SessionDescriptor::new(session_id);
        self.write_json(SESSION_KEY, &descriptor)?;
        Ok(descriptor)
    }

    /// Refreshes `lastActivity` without changing the session's age.
    pub fn record_activity(&self) -> Result<()> {
        if let Some(mut descriptor) = self.load_session()? {
            descriptor.touch();
            self.write_json(SESSION_KEY, &descriptor)?;
        }
        Ok(())
    }

    pub fn load_messages(&self) -> Result<Vec<Message>> {
        let path = self.key_path(MESSAGES_KEY);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Persists the message list. An empty list leaves the stored one untouched.
    pub fn save_messages(&self, messages: &[Message]) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }
        self.write_json(MESSAGES_KEY, messages)
    }

    pub fn clear_messages(&self) -> Result<()> {
        remove_if_present(&self.key_path(MESSAGES_KEY))
    }

    pub fn clear(&self) -> Result<()> {
        remove_if_present(&self.key_path(SESSION_KEY))?;
        self.clear_messages()
    }

    fn write_json<T: serde::Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        let path = self.key_path(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).ok();
        }
        let serialized = serde_json::to_vec_pretty(value)?;
        fs::write(&path, serialized)
            .with_context(|| format!("failed to write {}", path.display()))
    }
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("failed to remove {}", path.display())),
    }
}
