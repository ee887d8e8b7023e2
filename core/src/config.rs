use crate::transport::SendMode;
use directories::BaseDirs;
use serde::Deserialize;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

pub const DEFAULT_API_BASE_URL: &str = "http://localhost:5000";

/// Runtime settings for the chat client.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub api_base_url: Url,
    /// `None` disables the push channel.
    pub socket_url: Option<Url>,
    pub request_timeout: Duration,
    pub push_timeout: Duration,
    pub max_retries: u32,
    pub max_message_length: usize,
    pub reconnect_attempts: u32,
    pub reconnect_delay: Duration,
    pub default_mode: SendMode,
}

impl Default for ClientSettings {
    fn default() -> Self {
        let api_base_url = Url::parse(DEFAULT_API_BASE_URL).expect("default base url is valid");
        let socket_url = derive_socket_url(&api_base_url);
        Self {
            api_base_url,
            socket_url,
            request_timeout: Duration::from_secs(30),
            push_timeout: Duration::from_secs(30),
            max_retries: 3,
            max_message_length: 1000,
            reconnect_attempts: 5,
            reconnect_delay: Duration::from_millis(1000),
            default_mode: SendMode::Standard,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("configuration invalid: {0}")]
    Invalid(String),
}

impl ConfigError {
    pub fn user_message(&self) -> String {
        match self {
            Self::Invalid(detail) => format!("Newsdesk is not configured: {detail}. Update newsdesk.yaml."),
        }
    }
}

impl ClientSettings {
    /// Loads `newsdesk.yaml` if present, then applies environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut settings = match locate_config_file() {
            Some(path) => {
                let contents = fs::read_to_string(&path).map_err(|err| {
                    ConfigError::Invalid(format!("failed to read {}: {err}", path.display()))
                })?;
                Self::from_yaml(&contents)?
            }
            None => Self::default(),
        };
        settings.apply_overrides(
            std::env::var("NEWSDESK_API_BASE_URL").ok(),
            std::env::var("NEWSDESK_SOCKET_URL").ok(),
        )?;
        Ok(settings)
    }

    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        let config: NewsdeskConfig = serde_yaml::from_str(contents)
            .map_err(|err| ConfigError::Invalid(format!("invalid newsdesk.yaml: {err}")))?;
        resolve_client_section(config.client.unwrap_or_default())
    }

    /// Replaces the endpoints. An empty socket URL disables the push channel.
    pub fn apply_overrides(
        &mut self,
        api_base_url: Option<String>,
        socket_url: Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(raw) = api_base_url {
            self.api_base_url = parse_http_url(&raw)?;
            self.socket_url = derive_socket_url(&self.api_base_url);
        }
        if let Some(raw) = socket_url {
            self.socket_url = parse_socket_url(&raw)?;
        }
        Ok(())
    }
}

fn resolve_client_section(section: ClientSection) -> Result<ClientSettings, ConfigError> {
    let defaults = ClientSettings::default();
    let api_base_url = match section.api_base_url.as_deref() {
        Some(raw) => parse_http_url(raw)?,
        None => defaults.api_base_url,
    };
    let socket_url = match section.socket_url.as_deref() {
        Some(raw) => parse_socket_url(raw)?,
        None => derive_socket_url(&api_base_url),
    };
    let max_message_length = section
        .max_message_length
        .unwrap_or(defaults.max_message_length);
    if max_message_length == 0 {
        return Err(ConfigError::Invalid(
            "max_message_length must be positive".to_string(),
        ));
    }
    Ok(ClientSettings {
        api_base_url,
        socket_url,
        request_timeout: section
            .request_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(defaults.request_timeout),
        push_timeout: section
            .push_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(defaults.push_timeout),
        max_retries: section.max_retries.unwrap_or(defaults.max_retries),
        max_message_length,
        reconnect_attempts: section
            .reconnect_attempts
            .unwrap_or(defaults.reconnect_attempts),
        reconnect_delay: section
            .reconnect_delay_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.reconnect_delay),
        default_mode: if section.streaming.unwrap_or(false) {
            SendMode::Streaming
        } else {
            SendMode::Standard
        },
    })
}

fn parse_http_url(raw: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(raw.trim())
        .map_err(|err| ConfigError::Invalid(format!("invalid api base url `{raw}`: {err}")))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(ConfigError::Invalid(format!(
            "api base url must use http or https, not {other}"
        ))),
    }
}

fn parse_socket_url(raw: &str) -> Result<Option<Url>, ConfigError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    let url = Url::parse(trimmed)
        .map_err(|err| ConfigError::Invalid(format!("invalid socket url `{raw}`: {err}")))?;
    match url.scheme() {
        "ws" | "wss" => Ok(Some(url)),
        other => Err(ConfigError::Invalid(format!(
            "socket url must use ws or wss, not {other}"
        ))),
    }
}

/// `http://host:port` becomes `ws://host:port/ws`.
fn derive_socket_url(api_base_url: &Url) -> Option<Url> {
    let mut url = api_base_url.clone();
    let scheme = if api_base_url.scheme() == "https" {
        "wss"
    } else {
        "ws"
    };
    url.set_scheme(scheme).ok()?;
    url.set_path("/ws");
    Some(url)
}

fn locate_config_file() -> Option<PathBuf> {
    newsdesk_yaml_candidates()
        .into_iter()
        .find(|path| path.exists())
}

fn newsdesk_yaml_candidates() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Some(base) = BaseDirs::new() {
        let config_dir = base.config_dir().join("newsdesk");
        paths.push(config_dir.join("newsdesk.yaml"));
        paths.push(config_dir.join("newsdesk.yml"));
        let home_dir = base.home_dir();
        paths.push(home_dir.join(".newsdesk").join("newsdesk.yaml"));
        paths.push(home_dir.join(".newsdesk").join("newsdesk.yml"));
    } else {
        paths.push(PathBuf::from("newsdesk.yaml"));
        paths.push(PathBuf::from("newsdesk.yml"));
    }
    paths
}

#[derive(Debug, Deserialize)]
struct NewsdeskConfig {
    client: Option<ClientSection>,
}

#[derive(Debug, Default, Deserialize)]
struct ClientSection {
    api_base_url: Option<String>,
    socket_url: Option<String>,
    request_timeout_secs: Option<u64>,
    push_timeout_secs: Option<u64>,
    max_retries: Option<u32>,
    max_message_length: Option<usize>,
    reconnect_attempts: Option<u32>,
    reconnect_delay_ms: Option<u64>,
    streaming: Option<bool>,
}
