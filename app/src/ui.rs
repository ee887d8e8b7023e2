//! Plain-text rendering of conversation updates.

use newsdesk_core::client::ChatEvent;
use newsdesk_core::state::{Citation, Message, MessageRole};
use std::io::{self, Write};

/// Writes chat progress to a terminal, printing streamed text incrementally.
pub struct Transcript<W: Write> {
    out: W,
    streaming: Option<(String, usize)>,
    last_printed: Option<String>,
}

impl<W: Write> Transcript<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            streaming: None,
            last_printed: None,
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    pub fn render(&mut self, event: &ChatEvent) -> io::Result<()> {
        match event {
            ChatEvent::UserMessage(message) => self.message(message)?,
            ChatEvent::Typing(true) => writeln!(self.out, "  newsdesk is typing…")?,
            ChatEvent::Typing(false) => {}
            ChatEvent::Snapshot { message, is_final } => self.snapshot(message, *is_final)?,
            ChatEvent::Completed(message) => {
                if self.last_printed.as_deref() != Some(message.id.as_str()) {
                    self.message(message)?;
                }
            }
            ChatEvent::Failed(notice) => self.notice(notice)?,
        }
        self.out.flush()
    }

    /// Prints a whole message, e.g. when replaying history.
    pub fn message(&mut self, message: &Message) -> io::Result<()> {
        writeln!(self.out, "{}> {}", speaker(message.role), message.text)?;
        self.citations(&message.citations)?;
        self.last_printed = Some(message.id.clone());
        Ok(())
    }

    pub fn notice(&mut self, text: &str) -> io::Result<()> {
        writeln!(self.out, "[!] {text}")
    }

    fn snapshot(&mut self, message: &Message, is_final: bool) -> io::Result<()> {
        let printed = match &self.streaming {
            Some((id, printed)) if *id == message.id => *printed,
            _ => {
                write!(self.out, "{}> ", speaker(message.role))?;
                0
            }
        };
        let fresh = message.text.get(printed..).unwrap_or_default();
        write!(self.out, "{fresh}")?;
        if is_final {
            writeln!(self.out)?;
            self.citations(&message.citations)?;
            self.streaming = None;
            self.last_printed = Some(message.id.clone());
        } else {
            self.streaming = Some((message.id.clone(), message.text.len()));
        }
        Ok(())
    }

    fn citations(&mut self, citations: &[Citation]) -> io::Result<()> {
        for (index, citation) in citations.iter().enumerate() {
            match &citation.url {
                Some(url) => writeln!(
                    self.out,
                    "  [{}] {}: {} <{}>",
                    index + 1,
                    citation.label,
                    citation.title,
                    url
                )?,
                None => writeln!(
                    self.out,
                    "  [{}] {}: {}",
                    index + 1,
                    citation.label,
                    citation.title
                )?,
            }
        }
        Ok(())
    }
}

fn speaker(role: MessageRole) -> &'static str {
    match role {
        MessageRole::User => "you",
        MessageRole::Assistant => "newsdesk",
    }
}
