use crate::ui::Transcript;
use anyhow::Result;
use newsdesk_core::client::{ChatClient, ChatEvent, SendOptions};
use newsdesk_core::config::ClientSettings;
use newsdesk_core::transport::SendMode;
use std::io::{self, Stdout};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{debug, error};

/// One line of user input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Send(String),
    Stop,
    Clear,
    New,
    History,
    Stats,
    Mode(SendMode),
    Help,
    Quit,
    Unknown(String),
}

pub fn parse_input(line: &str) -> Option<Input> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    let Some(command) = trimmed.strip_prefix('/') else {
        return Some(Input::Send(trimmed.to_string()));
    };
    let mut parts = command.split_whitespace();
    let input = match parts.next().unwrap_or_default() {
        "stop" => Input::Stop,
        "clear" => Input::Clear,
        "new" => Input::New,
        "history" => Input::History,
        "stats" => Input::Stats,
        "stream" => Input::Mode(SendMode::Streaming),
        "standard" => Input::Mode(SendMode::Standard),
        "help" | "?" => Input::Help,
        "quit" | "exit" => Input::Quit,
        other => Input::Unknown(other.to_string()),
    };
    Some(input)
}

/// Send options from the configured default mode and retry budget.
pub fn send_options(settings: &ClientSettings) -> SendOptions {
    SendOptions {
        mode: settings.default_mode,
        retries: settings.max_retries,
        progress: None,
    }
}

const HELP: &str = "commands: /stop /clear /new /history /stats /stream /standard /quit";

pub struct NewsdeskApp {
    client: ChatClient,
    mode: SendMode,
    retries: u32,
    transcript: Transcript<Stdout>,
    tx: UnboundedSender<ChatEvent>,
    rx: UnboundedReceiver<ChatEvent>,
}

impl NewsdeskApp {
    pub fn new(client: ChatClient, settings: &ClientSettings) -> Self {
        let (tx, rx) = unbounded_channel();
        Self {
            client,
            mode: settings.default_mode,
            retries: settings.max_retries,
            transcript: Transcript::new(io::stdout()),
            tx,
            rx,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        let info = self.client.session_info();
        println!(
            "session {} ({} messages, push {})",
            info.session_id.as_deref().unwrap_or("-"),
            info.message_count,
            if info.push_connected { "on" } else { "off" }
        );
        for message in self.client.messages() {
            self.transcript.message(&message)?;
        }
        println!("{HELP}");

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let Some(line) = line? else { break };
                    let Some(input) = parse_input(&line) else { continue };
                    if !self.handle(input).await? {
                        break;
                    }
                }
                Some(event) = self.rx.recv() => self.transcript.render(&event)?,
            }
        }
        self.client.cancel();
        Ok(())
    }

    /// Returns `false` when the user asked to quit.
    async fn handle(&mut self, input: Input) -> Result<bool> {
        match input {
            Input::Send(text) => self.submit_message(text),
            Input::Stop => {
                if !self.client.cancel() {
                    self.transcript.notice("nothing to stop")?;
                }
            }
            Input::Clear => match self.client.clear_session().await {
                Ok(()) => self.transcript.notice("All messages have been cleared")?,
                Err(err) => self.report(&err.user_message())?,
            },
            Input::New => match self.client.create_session().await {
                Ok(id) => self.transcript.notice(&format!("started session {id}"))?,
                Err(err) => self.report(&err.user_message())?,
            },
            Input::History => match self.client.load_history().await {
                Ok(_) => {
                    for message in self.client.messages() {
                        self.transcript.message(&message)?;
                    }
                }
                Err(err) => self.report(&err.user_message())?,
            },
            Input::Stats => match self.client.stats().await {
                Ok(stats) => println!("{}", serde_json::to_string_pretty(&stats)?),
                Err(err) => self.report(&err.user_message())?,
            },
            Input::Mode(mode) => {
                self.mode = mode;
                self.transcript.notice(&format!("send mode: {mode:?}"))?;
            }
            Input::Help => println!("{HELP}"),
            Input::Quit => return Ok(false),
            Input::Unknown(command) => {
                self.transcript
                    .notice(&format!("unknown command /{command}; {HELP}"))?;
            }
        }
        Ok(true)
    }

    fn submit_message(&self, text: String) {
        let client = self.client.clone();
        let options = SendOptions {
            mode: self.mode,
            retries: self.retries,
            progress: Some(self.tx.clone()),
        };
        tokio::spawn(async move {
            match client.send(&text, options).await {
                Ok(outcome) if outcome.is_cancelled() => debug!("send cancelled"),
                Ok(_) => {}
                Err(err) => error!("error" = %err, "Failed to send message"),
            }
        });
    }

    fn report(&mut self, notice: &str) -> io::Result<()> {
        error!(%notice, "request failed");
        self.transcript.notice(notice)
    }
}
