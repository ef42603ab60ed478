//! The event multiplexer
//!
//! [`EventLoop`] is the single control loop of the chat client. It owns the
//! active [`RoomSession`] and merges every event source:
//!
//! - chat lines typed by the user
//! - commands typed by the user
//! - messages arriving from the room
//! - diagnostic log entries
//! - the once-a-second peer list refresh
//! - the shutdown token
//!
//! Whatever fires first is dispatched; the shutdown token is checked again
//! after every dispatch so termination always wins on the next iteration.
//! All display changes are queued on the [`DisplayHandle`].

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::command::{CommandKind, InputQueues, UiCommand};
use crate::config::PEER_REFRESH_INTERVAL;
use crate::display::{ChatLine, DisplayHandle};
use crate::message::{ChatLog, LogSink};
use crate::session::RoomSession;
use crate::substrate::Network;
use crate::switch::switch_room;

pub struct EventLoop {
    network: Arc<dyn Network>,
    session: RoomSession,
    /// Cleared when the session's inbound queue closes; set again on switch
    inbound_open: bool,
    display: DisplayHandle,
    logs: LogSink,
    log_rx: mpsc::Receiver<ChatLog>,
    inputs: InputQueues,
    shutdown: CancellationToken,
}

impl EventLoop {
    pub fn new(
        network: Arc<dyn Network>,
        session: RoomSession,
        display: DisplayHandle,
        (logs, log_rx): (LogSink, mpsc::Receiver<ChatLog>),
        inputs: InputQueues,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            network,
            session,
            inbound_open: true,
            display,
            logs,
            log_rx,
            inputs,
            shutdown,
        }
    }

    /// Run until `/exit`, the shutdown token, or the input side going away
    ///
    /// On the way out the active session is exited and the display is told
    /// to stop.
    pub async fn run(mut self) {
        info!(room = %self.session.room_name(), "event loop started");

        let mut ticker = interval(PEER_REFRESH_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                message = self.inputs.messages.recv() => match message {
                    Some(text) => self.handle_message(text).await,
                    None => self.input_closed(),
                },
                command = self.inputs.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => self.input_closed(),
                },
                inbound = self.session.next_inbound(), if self.inbound_open => match inbound {
                    Some(message) => self.display.append_line(ChatLine::remote(&message)),
                    None => {
                        debug!(room = %self.session.room_name(), "inbound closed");
                        self.inbound_open = false;
                    }
                },
                Some(log) = self.log_rx.recv() => {
                    self.display.append_line(ChatLine::log(&log));
                }
                _ = ticker.tick() => self.refresh_peers().await,
            }

            if self.shutdown.is_cancelled() {
                break;
            }
        }

        self.session.exit().await;
        self.display.stop();
        info!("event loop stopped");
    }

    async fn handle_message(&self, text: String) {
        match self.session.publish(text.clone()).await {
            Ok(()) => {
                let line = ChatLine::own(self.session.user_name(), text);
                self.display.append_line(line);
            }
            Err(e) => {
                debug!("outbound rejected: {}", e);
                self.logs
                    .emit(ChatLog::publish_error("failed to publish message"));
            }
        }
    }

    async fn handle_command(&mut self, command: UiCommand) {
        match command.kind {
            CommandKind::Exit => {
                info!("exit requested");
                self.shutdown.cancel();
            }
            CommandKind::Clear => self.display.clear(),
            CommandKind::SwitchRoom => match command.argument {
                Some(room) => self.switch_room(room).await,
                None => self.logs.error("missing room name"),
            },
            CommandKind::RenameUser => match command.argument {
                Some(name) => {
                    self.session.set_user_name(name.clone());
                    self.display.set_user_label(name);
                }
                None => self.logs.error("missing username"),
            },
            CommandKind::Unknown(word) => {
                self.logs.error(format!("unsupported command: /{}", word));
            }
        }
    }

    async fn switch_room(&mut self, room: String) {
        self.logs.info(format!("switching to room '{}'", room));

        let switched = switch_room(
            &mut self.session,
            self.network.as_ref(),
            &room,
            self.logs.clone(),
        )
        .await;
        if let Err(e) = switched {
            self.logs.error(format!("could not switch rooms: {}", e));
            return;
        }

        self.inbound_open = true;
        self.display.clear();
        self.display.set_room(room);
        self.refresh_peers().await;
    }

    async fn refresh_peers(&self) {
        let peers = self.session.peer_list().await;
        self.display.set_peers(peers);
    }

    fn input_closed(&self) {
        debug!("input closed, shutting down");
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::task::JoinHandle;
    use tokio::time::timeout;

    use super::*;
    use crate::command::InputRouter;
    use crate::config::LOG_CAPACITY;
    use crate::display::{DisplayUpdate, LineKind};
    use crate::memory::{MemoryHub, MemoryNetwork};
    use crate::message::{ChatMessage, LogKind};
    use crate::substrate::Topic;
    use crate::types::topic_name;

    const WAIT: Duration = Duration::from_secs(5);

    struct Harness {
        alice: Arc<MemoryNetwork>,
        bob: Arc<MemoryNetwork>,
        router: InputRouter,
        updates: mpsc::UnboundedReceiver<DisplayUpdate>,
        shutdown: CancellationToken,
        task: JoinHandle<()>,
    }

    /// alice runs the event loop in "lobby"; bob is connected to her
    async fn start() -> Harness {
        let hub = MemoryHub::new();
        let alice = hub.node().await.unwrap();
        let bob = hub.node().await.unwrap();
        alice.dial(&bob.info()).await.unwrap();

        let (logs, log_rx) = LogSink::channel(LOG_CAPACITY);
        let session = RoomSession::join(&*alice, "alice", "lobby", logs.clone())
            .await
            .unwrap();
        let (display, updates) = DisplayHandle::channel();
        let (router, inputs) = InputRouter::channel();
        let shutdown = CancellationToken::new();

        let event_loop = EventLoop::new(
            alice.clone(),
            session,
            display,
            (logs, log_rx),
            inputs,
            shutdown.clone(),
        );
        let task = tokio::spawn(event_loop.run());

        Harness {
            alice,
            bob,
            router,
            updates,
            shutdown,
            task,
        }
    }

    /// Next update that is not a peer refresh
    async fn next_update(updates: &mut mpsc::UnboundedReceiver<DisplayUpdate>) -> DisplayUpdate {
        loop {
            let update = timeout(WAIT, updates.recv())
                .await
                .expect("timed out waiting for display update")
                .expect("display channel closed");
            if !matches!(update, DisplayUpdate::SetPeers(_)) {
                return update;
            }
        }
    }

    async fn next_line(updates: &mut mpsc::UnboundedReceiver<DisplayUpdate>) -> ChatLine {
        match next_update(updates).await {
            DisplayUpdate::Append(line) => line,
            other => panic!("expected a line, got {:?}", other),
        }
    }

    async fn bob_says(bob: &MemoryNetwork, topic: &dyn Topic, text: &str) {
        let msg = ChatMessage::new(text, bob.local_peer_id().to_string(), "bob");
        topic.publish(msg.encode().unwrap()).await.unwrap();
    }

    #[tokio::test]
    async fn test_own_message_published_and_echoed() {
        let mut h = start().await;
        let bob_topic = h.bob.join(&topic_name("lobby")).await.unwrap();
        let bob_sub = bob_topic.subscribe().await.unwrap();

        h.router.submit("hello world").await.unwrap();

        assert_eq!(
            next_line(&mut h.updates).await,
            ChatLine::own("alice", "hello world")
        );
        let envelope = timeout(WAIT, bob_sub.next()).await.unwrap().unwrap();
        let received = ChatMessage::decode(&envelope.data).unwrap();
        assert_eq!(received.message, "hello world");
        assert_eq!(received.sender_name, "alice");
    }

    #[tokio::test]
    async fn test_inbound_displayed_as_remote() {
        let mut h = start().await;
        let bob_topic = h.bob.join(&topic_name("lobby")).await.unwrap();

        bob_says(&h.bob, bob_topic.as_ref(), "hi alice").await;

        let line = next_line(&mut h.updates).await;
        assert_eq!(line.kind, LineKind::Remote);
        assert_eq!(line.sender, "bob");
        assert_eq!(line.text, "hi alice");
    }

    #[tokio::test]
    async fn test_room_without_name_logs_error() {
        let mut h = start().await;
        h.router.submit("/room").await.unwrap();

        let line = next_line(&mut h.updates).await;
        assert_eq!(line.kind, LineKind::Log(LogKind::Error));
        assert_eq!(line.text, "missing room name");
    }

    #[tokio::test]
    async fn test_switch_room_retitles_and_moves() {
        let mut h = start().await;
        h.router.submit("/room lounge").await.unwrap();

        assert_eq!(next_update(&mut h.updates).await, DisplayUpdate::Clear);
        assert_eq!(
            next_update(&mut h.updates).await,
            DisplayUpdate::SetRoom("lounge".to_string())
        );
        let line = next_line(&mut h.updates).await;
        assert_eq!(line.kind, LineKind::Log(LogKind::Info));
        assert_eq!(line.text, "switching to room 'lounge'");

        let lounge = h.bob.join(&topic_name("lounge")).await.unwrap();
        bob_says(&h.bob, lounge.as_ref(), "welcome").await;
        assert_eq!(next_line(&mut h.updates).await.text, "welcome");
    }

    #[tokio::test]
    async fn test_failed_switch_keeps_current_room() {
        let mut h = start().await;

        // Rejoining the active room fails in the substrate
        h.router.submit("/room lobby").await.unwrap();

        let info = next_line(&mut h.updates).await;
        assert_eq!(info.kind, LineKind::Log(LogKind::Info));
        let error = next_line(&mut h.updates).await;
        assert_eq!(error.kind, LineKind::Log(LogKind::Error));
        assert!(error.text.starts_with("could not switch rooms: "));

        let bob_topic = h.bob.join(&topic_name("lobby")).await.unwrap();
        bob_says(&h.bob, bob_topic.as_ref(), "still lobby").await;
        assert_eq!(next_line(&mut h.updates).await.text, "still lobby");
    }

    #[tokio::test]
    async fn test_rename_updates_label_and_lines() {
        let mut h = start().await;
        h.router.submit("/user alicia").await.unwrap();
        assert_eq!(
            next_update(&mut h.updates).await,
            DisplayUpdate::SetUserLabel("alicia".to_string())
        );

        h.router.submit("/user").await.unwrap();
        assert_eq!(next_line(&mut h.updates).await.text, "missing username");

        h.router.submit("new name").await.unwrap();
        assert_eq!(
            next_line(&mut h.updates).await,
            ChatLine::own("alicia", "new name")
        );
    }

    #[tokio::test]
    async fn test_clear_and_unknown_command() {
        let mut h = start().await;
        h.router.submit("/clear").await.unwrap();
        assert_eq!(next_update(&mut h.updates).await, DisplayUpdate::Clear);

        h.router.submit("/dance").await.unwrap();
        let line = next_line(&mut h.updates).await;
        assert_eq!(line.kind, LineKind::Log(LogKind::Error));
        assert_eq!(line.text, "unsupported command: /dance");

        h.router.submit("/ room x").await.unwrap();
        let line = next_line(&mut h.updates).await;
        assert_eq!(line.kind, LineKind::Log(LogKind::Error));
        assert_eq!(line.text, "unsupported command: /");
    }

    #[tokio::test]
    async fn test_peer_refresh() {
        let mut h = start().await;
        let _bob_topic = h.bob.join(&topic_name("lobby")).await.unwrap();
        let bob_id = h.bob.local_peer_id();

        let seen = timeout(WAIT, async {
            while let Some(update) = h.updates.recv().await {
                if update == DisplayUpdate::SetPeers(vec![bob_id]) {
                    return true;
                }
            }
            false
        })
        .await
        .unwrap();
        assert!(seen);
    }

    #[tokio::test]
    async fn test_exit_stops_loop_and_display() {
        let mut h = start().await;
        h.router.submit("/exit").await.unwrap();

        assert_eq!(next_update(&mut h.updates).await, DisplayUpdate::Stop);
        timeout(WAIT, h.task).await.unwrap().unwrap();
        assert!(h.shutdown.is_cancelled());

        // The room was left on the way out
        assert!(h.alice.join(&topic_name("lobby")).await.is_ok());
    }

    #[tokio::test]
    async fn test_shutdown_token_and_closed_input_end_loop() {
        let h = start().await;
        h.shutdown.cancel();
        timeout(WAIT, h.task).await.unwrap().unwrap();

        let h = start().await;
        drop(h.router);
        timeout(WAIT, h.task).await.unwrap().unwrap();
        assert!(h.shutdown.is_cancelled());
    }
}
