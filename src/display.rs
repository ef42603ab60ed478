//! Display surface interface
//!
//! The event loop never touches the terminal. It queues typed
//! [`DisplayUpdate`]s on a [`DisplayHandle`] and the surface applies them on
//! its own loop, so a slow renderer cannot hold up message intake.

use tokio::sync::mpsc;
use tracing::trace;

use crate::message::{ChatLog, ChatMessage, LogKind};
use crate::types::PeerId;

/// Who a displayed line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    /// Sent by the local user
    Own,
    /// Received from another peer
    Remote,
    /// Diagnostic entry
    Log(LogKind),
}

/// One line of the message box
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatLine {
    pub kind: LineKind,
    /// Display name, or the log tag for log lines
    pub sender: String,
    pub text: String,
}

impl ChatLine {
    pub fn own(sender: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            kind: LineKind::Own,
            sender: sender.into(),
            text: text.into(),
        }
    }

    pub fn remote(message: &ChatMessage) -> Self {
        Self {
            kind: LineKind::Remote,
            sender: message.sender_name.clone(),
            text: message.message.clone(),
        }
    }

    pub fn log(log: &ChatLog) -> Self {
        Self {
            kind: LineKind::Log(log.kind),
            sender: log.kind.tag().to_string(),
            text: log.text.clone(),
        }
    }
}

/// A change for the display surface to apply
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisplayUpdate {
    Append(ChatLine),
    /// Empty the message box
    Clear,
    /// Retitle the message box for a room
    SetRoom(String),
    SetPeers(Vec<PeerId>),
    /// Name shown in front of the input field
    SetUserLabel(String),
    /// Close the surface and restore the terminal
    Stop,
}

/// Cloneable, never-blocking sender of display updates
#[derive(Debug, Clone)]
pub struct DisplayHandle {
    sender: mpsc::UnboundedSender<DisplayUpdate>,
}

impl DisplayHandle {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<DisplayUpdate>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    /// Queue an update. Dropped silently once the surface is gone.
    pub fn queue(&self, update: DisplayUpdate) {
        if self.sender.send(update).is_err() {
            trace!("display surface gone, update dropped");
        }
    }

    pub fn append_line(&self, line: ChatLine) {
        self.queue(DisplayUpdate::Append(line));
    }

    pub fn clear(&self) {
        self.queue(DisplayUpdate::Clear);
    }

    pub fn set_room(&self, room: impl Into<String>) {
        self.queue(DisplayUpdate::SetRoom(room.into()));
    }

    pub fn set_peers(&self, peers: Vec<PeerId>) {
        self.queue(DisplayUpdate::SetPeers(peers));
    }

    pub fn set_user_label(&self, user: impl Into<String>) {
        self.queue(DisplayUpdate::SetUserLabel(user.into()));
    }

    pub fn stop(&self) {
        self.queue(DisplayUpdate::Stop);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_constructors() {
        let msg = ChatMessage::new("hey", "id", "bob");
        assert_eq!(
            ChatLine::remote(&msg),
            ChatLine {
                kind: LineKind::Remote,
                sender: "bob".to_string(),
                text: "hey".to_string(),
            }
        );

        let line = ChatLine::log(&ChatLog::publish_error("failed to publish message"));
        assert_eq!(line.kind, LineKind::Log(LogKind::PublishError));
        assert_eq!(line.sender, "puberr");
    }

    #[test]
    fn test_handle_queues_in_order_and_survives_closed_surface() {
        let (display, mut updates) = DisplayHandle::channel();
        display.set_room("lobby");
        display.clear();
        display.stop();

        assert_eq!(
            updates.try_recv().unwrap(),
            DisplayUpdate::SetRoom("lobby".to_string())
        );
        assert_eq!(updates.try_recv().unwrap(), DisplayUpdate::Clear);
        assert_eq!(updates.try_recv().unwrap(), DisplayUpdate::Stop);

        drop(updates);
        display.append_line(ChatLine::own("me", "nobody sees this"));
    }
}
