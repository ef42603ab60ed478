//! Room session
//!
//! A [`RoomSession`] is the live binding of this process to one room's
//! topic. It owns the topic and subscription handles and runs two
//! background loops:
//!
//! - the publish loop drains the outbound queue, wraps each line in a
//!   [`ChatMessage`] carrying the current display name, and publishes it
//! - the receive loop reads the subscription, drops self-echo and
//!   malformed payloads, and forwards everything else to the inbound queue
//!
//! Both loops stop when the session's lifecycle token is cancelled. Per
//! message failures are reported through the [`LogSink`] and never end a
//! loop; a torn-down subscription ends the receive loop and closes inbound.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::CHANNEL_CAPACITY;
use crate::error::{SessionError, SubstrateError};
use crate::message::{ChatLog, ChatMessage, LogSink};
use crate::substrate::{Network, Subscription, Topic};
use crate::types::{topic_name, PeerId};

/// One joined room
pub struct RoomSession {
    room_name: String,
    local_peer: PeerId,
    /// Display name; written here, read by the publish loop
    user_name: watch::Sender<String>,
    topic: Arc<dyn Topic>,
    subscription: Arc<dyn Subscription>,
    outbound: mpsc::Sender<String>,
    inbound: mpsc::Receiver<ChatMessage>,
    lifecycle: CancellationToken,
    /// Publish and receive loop handles, taken by the first `exit`
    loops: Option<(JoinHandle<()>, JoinHandle<()>)>,
}

impl RoomSession {
    /// Join `room_name` and start the session loops
    ///
    /// Fails without side effects: a topic joined before a failed subscribe
    /// is closed again.
    pub async fn join(
        network: &dyn Network,
        user_name: impl Into<String>,
        room_name: &str,
        logs: LogSink,
    ) -> Result<Self, SessionError> {
        if room_name.is_empty() {
            return Err(SessionError::EmptyRoomName);
        }

        let topic = network
            .join(&topic_name(room_name))
            .await
            .map_err(|source| SessionError::Join {
                room: room_name.to_string(),
                source,
            })?;

        let subscription = match topic.subscribe().await {
            Ok(subscription) => subscription,
            Err(source) => {
                if let Err(e) = topic.close().await {
                    warn!(room = %room_name, "failed to close topic after subscribe error: {}", e);
                }
                return Err(SessionError::Subscribe {
                    room: room_name.to_string(),
                    source,
                });
            }
        };

        let local_peer = network.local_peer_id();
        let lifecycle = CancellationToken::new();
        let (user_name, name_rx) = watch::channel(user_name.into());
        let (outbound, outbound_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (inbound_tx, inbound) = mpsc::channel(CHANNEL_CAPACITY);

        let publisher = tokio::spawn(publish_loop(
            topic.clone(),
            local_peer,
            name_rx,
            outbound_rx,
            logs.clone(),
            lifecycle.clone(),
        ));
        let receiver = tokio::spawn(receive_loop(
            subscription.clone(),
            local_peer,
            inbound_tx,
            logs,
            lifecycle.clone(),
        ));

        info!(room = %room_name, topic = %topic.name(), "joined room");

        Ok(Self {
            room_name: room_name.to_string(),
            local_peer,
            user_name,
            topic,
            subscription,
            outbound,
            inbound,
            lifecycle,
            loops: Some((publisher, receiver)),
        })
    }

    pub fn room_name(&self) -> &str {
        &self.room_name
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer
    }

    /// Current display name
    pub fn user_name(&self) -> String {
        self.user_name.borrow().clone()
    }

    /// Change the display name. Later publishes carry the new name.
    pub fn set_user_name(&self, name: impl Into<String>) {
        self.user_name.send_replace(name.into());
    }

    /// Queue a line for publishing
    ///
    /// Waits for room in the outbound queue. Fails once the publish loop
    /// has stopped.
    pub async fn publish(&self, text: impl Into<String>) -> Result<(), SessionError> {
        self.outbound
            .send(text.into())
            .await
            .map_err(|_| SessionError::Closed)
    }

    /// Next message from another peer, or `None` once the receive loop ended
    ///
    /// Cancel safe.
    pub async fn next_inbound(&mut self) -> Option<ChatMessage> {
        self.inbound.recv().await
    }

    /// Peers currently in the room, as the substrate sees them right now
    pub async fn peer_list(&self) -> Vec<PeerId> {
        self.topic.list_peers().await
    }

    /// Tear the session down
    ///
    /// Stops both loops and waits for them, then cancels the subscription
    /// and closes the topic. Safe to call more than once and after the
    /// loops already ended on their own.
    pub async fn exit(&mut self) {
        self.lifecycle.cancel();
        let Some((publisher, receiver)) = self.loops.take() else {
            return;
        };

        for handle in [publisher, receiver] {
            if let Err(e) = handle.await {
                warn!(room = %self.room_name, "session loop ended abnormally: {}", e);
            }
        }

        self.subscription.cancel().await;
        if let Err(e) = self.topic.close().await {
            debug!(room = %self.room_name, "topic close failed: {}", e);
        }

        info!(room = %self.room_name, "left room");
    }
}

impl Drop for RoomSession {
    fn drop(&mut self) {
        // Loops stop even if exit was skipped; handles are not released then
        self.lifecycle.cancel();
    }
}

impl std::fmt::Debug for RoomSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomSession")
            .field("room_name", &self.room_name)
            .field("local_peer", &self.local_peer)
            .field("user_name", &*self.user_name.borrow())
            .field("running", &self.loops.is_some())
            .finish()
    }
}

async fn publish_loop(
    topic: Arc<dyn Topic>,
    local_peer: PeerId,
    user_name: watch::Receiver<String>,
    mut outbound: mpsc::Receiver<String>,
    logs: LogSink,
    lifecycle: CancellationToken,
) {
    let sender_id = local_peer.to_string();

    loop {
        let text = tokio::select! {
            _ = lifecycle.cancelled() => break,
            next = outbound.recv() => match next {
                Some(text) => text,
                None => break,
            },
        };

        let message = ChatMessage::new(text, sender_id.clone(), user_name.borrow().clone());
        let payload = match message.encode() {
            Ok(payload) => payload,
            Err(e) => {
                warn!("failed to encode message: {}", e);
                logs.emit(ChatLog::publish_error("failed to encode message"));
                continue;
            }
        };

        tokio::select! {
            _ = lifecycle.cancelled() => break,
            published = topic.publish(payload) => {
                if let Err(e) = published {
                    warn!(topic = %topic.name(), "failed to publish message: {}", e);
                    logs.emit(ChatLog::publish_error("failed to publish message"));
                }
            }
        }
    }

    debug!(topic = %topic.name(), "publish loop stopped");
}

async fn receive_loop(
    subscription: Arc<dyn Subscription>,
    local_peer: PeerId,
    inbound: mpsc::Sender<ChatMessage>,
    logs: LogSink,
    lifecycle: CancellationToken,
) {
    loop {
        let envelope = tokio::select! {
            _ = lifecycle.cancelled() => break,
            next = subscription.next() => match next {
                Ok(envelope) => envelope,
                Err(e @ SubstrateError::Lagged(_)) => {
                    warn!("inbound messages dropped: {}", e);
                    logs.emit(ChatLog::subscribe_error(e.to_string()));
                    continue;
                }
                Err(e) => {
                    debug!("subscription ended: {}", e);
                    logs.emit(ChatLog::subscribe_error("subscription closed"));
                    break;
                }
            },
        };

        // Self-echo
        if envelope.from == local_peer {
            continue;
        }

        let message = match ChatMessage::decode(&envelope.data) {
            Ok(message) => message,
            Err(e) => {
                warn!(from = %envelope.from, "failed to decode message: {}", e);
                logs.emit(ChatLog::subscribe_error("failed to decode message"));
                continue;
            }
        };

        tokio::select! {
            _ = lifecycle.cancelled() => break,
            sent = inbound.send(message) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }

    // Dropping `inbound` here closes the channel, exactly once
    debug!("receive loop stopped");
}
