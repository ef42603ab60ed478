//! Input line interpretation
//!
//! A committed input line is either a chat message or, when it starts with
//! `/`, a command. [`InputRouter`] sends each kind to its own channel so the
//! event loop can treat them as separate sources.

use tokio::sync::mpsc;
use tracing::debug;

use crate::config::CHANNEL_CAPACITY;
use crate::error::AppError;

/// Prefix marking a command line
pub const COMMAND_PREFIX: char = '/';

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandKind {
    /// `/exit`
    Exit,
    /// `/clear`
    Clear,
    /// `/room <name>`
    SwitchRoom,
    /// `/user <name>`
    RenameUser,
    /// Anything else, with the command word as typed
    Unknown(String),
}

/// A parsed command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UiCommand {
    pub kind: CommandKind,
    /// Text after the command word, trimmed; `None` when blank
    pub argument: Option<String>,
}

impl UiCommand {
    pub fn new(kind: CommandKind, argument: Option<String>) -> Self {
        Self { kind, argument }
    }

    /// Parse a line that starts with [`COMMAND_PREFIX`]
    ///
    /// The command word must follow the prefix directly: `/ room x` is an
    /// unknown empty command, not `/room`.
    pub fn parse(line: &str) -> Self {
        let body = line.strip_prefix(COMMAND_PREFIX).unwrap_or(line);
        let (word, rest) = match body.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (body, ""),
        };

        let kind = match word {
            "exit" => CommandKind::Exit,
            "clear" => CommandKind::Clear,
            "room" => CommandKind::SwitchRoom,
            "user" => CommandKind::RenameUser,
            other => CommandKind::Unknown(other.to_string()),
        };
        let argument = (!rest.is_empty()).then(|| rest.to_string());

        Self { kind, argument }
    }
}

/// What a committed line turned out to be
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Message(String),
    Command(UiCommand),
}

/// Classify a committed input line. Empty lines yield `None`.
pub fn parse_line(line: &str) -> Option<Input> {
    if line.trim().is_empty() {
        return None;
    }
    if line.starts_with(COMMAND_PREFIX) {
        Some(Input::Command(UiCommand::parse(line)))
    } else {
        Some(Input::Message(line.to_string()))
    }
}

/// Routes committed lines to the message or command channel
#[derive(Debug, Clone)]
pub struct InputRouter {
    messages: mpsc::Sender<String>,
    commands: mpsc::Sender<UiCommand>,
}

/// Receiving side of an [`InputRouter`], read by the event loop
#[derive(Debug)]
pub struct InputQueues {
    pub messages: mpsc::Receiver<String>,
    pub commands: mpsc::Receiver<UiCommand>,
}

impl InputRouter {
    pub fn new(messages: mpsc::Sender<String>, commands: mpsc::Sender<UiCommand>) -> Self {
        Self { messages, commands }
    }

    /// A router and the queues it feeds
    pub fn channel() -> (Self, InputQueues) {
        let (msg_tx, messages) = mpsc::channel(CHANNEL_CAPACITY);
        let (cmd_tx, commands) = mpsc::channel(CHANNEL_CAPACITY);
        (Self::new(msg_tx, cmd_tx), InputQueues { messages, commands })
    }

    /// Parse and forward one line
    ///
    /// Fails once the event loop stopped listening.
    pub async fn submit(&self, line: &str) -> Result<(), AppError> {
        match parse_line(line) {
            None => Ok(()),
            Some(Input::Message(text)) => self
                .messages
                .send(text)
                .await
                .map_err(|_| AppError::ChannelSend),
            Some(Input::Command(command)) => {
                debug!(?command, "command entered");
                self.commands
                    .send(command)
                    .await
                    .map_err(|_| AppError::ChannelSend)
            }
        }
    }
}
