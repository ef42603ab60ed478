//! Chat message envelope and diagnostic log entries
//!
//! `ChatMessage` is what travels over a room topic: a JSON object with the
//! keys `message`, `senderid` and `sendername`. Unknown keys are ignored on
//! decode so newer peers can add fields without breaking older ones.
//!
//! `ChatLog` entries are user-facing diagnostics. They are delivered through
//! a `LogSink` handed to each component at construction.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

/// A chat message as published on a room topic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Message text
    pub message: String,
    /// Canonical string form of the sender's peer identity
    #[serde(rename = "senderid")]
    pub sender_id: String,
    /// Sender's display name at publish time
    #[serde(rename = "sendername")]
    pub sender_name: String,
}

impl ChatMessage {
    pub fn new(
        message: impl Into<String>,
        sender_id: impl Into<String>,
        sender_name: impl Into<String>,
    ) -> Self {
        Self {
            message: message.into(),
            sender_id: sender_id.into(),
            sender_name: sender_name.into(),
        }
    }

    /// Serialize to the wire payload
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Parse a wire payload
    pub fn decode(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }
}

/// Category of a diagnostic log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogKind {
    Info,
    Error,
    /// Encoding or publishing an outbound message failed
    PublishError,
    /// Reading or decoding an inbound message failed
    SubscribeError,
}

impl LogKind {
    /// Short tag shown next to the entry
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Error => "error",
            Self::PublishError => "puberr",
            Self::SubscribeError => "suberr",
        }
    }
}

impl std::fmt::Display for LogKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

/// A diagnostic entry surfaced on the display. Never drives control flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatLog {
    pub kind: LogKind,
    pub text: String,
}

impl ChatLog {
    pub fn new(kind: LogKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
        }
    }

    pub fn info(text: impl Into<String>) -> Self {
        Self::new(LogKind::Info, text)
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self::new(LogKind::Error, text)
    }

    pub fn publish_error(text: impl Into<String>) -> Self {
        Self::new(LogKind::PublishError, text)
    }

    pub fn subscribe_error(text: impl Into<String>) -> Self {
        Self::new(LogKind::SubscribeError, text)
    }
}

/// Cloneable sender side of the diagnostic log channel
///
/// Emitting never blocks: an entry that does not fit is dropped and
/// reported through `tracing` instead.
#[derive(Debug, Clone)]
pub struct LogSink {
    sender: mpsc::Sender<ChatLog>,
}

impl LogSink {
    /// Create a sink and the receiver that drains it
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ChatLog>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (Self { sender }, receiver)
    }

    pub fn emit(&self, log: ChatLog) {
        debug!(kind = %log.kind, "{}", log.text);
        match self.sender.try_send(log) {
            Ok(()) => {}
            Err(TrySendError::Full(log)) => {
                warn!(kind = %log.kind, "log channel full, dropping entry: {}", log.text);
            }
            Err(TrySendError::Closed(log)) => {
                debug!(kind = %log.kind, "log channel closed, dropping entry: {}", log.text);
            }
        }
    }

    pub fn info(&self, text: impl Into<String>) {
        self.emit(ChatLog::info(text));
    }

    pub fn error(&self, text: impl Into<String>) {
        self.emit(ChatLog::error(text));
    }
}
