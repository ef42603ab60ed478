//! Error types for peerchat
//!
//! One enum per layer:
//! - `SubstrateError`: the pubsub network (broker, relay, in-memory nodes)
//! - `SessionError`: room session setup and use
//! - `AppError`: process-level failures in `main` and the relay handler
//!
//! Uses thiserror for ergonomic error definitions.

use thiserror::Error;

use crate::types::PeerId;

/// Errors reported by the pubsub substrate
#[derive(Debug, Error)]
pub enum SubstrateError {
    /// The substrate (or this node's registration in it) is gone
    #[error("substrate is shut down")]
    Shutdown,

    /// Topic name rejected by the router
    #[error("invalid topic name: {0:?}")]
    InvalidTopic(String),

    /// The local peer already joined this topic
    #[error("topic {0} already joined")]
    AlreadyJoined(String),

    /// Operation on a topic the local peer has not joined
    #[error("topic {0} not joined")]
    NotJoined(String),

    /// Closing a topic that still has live subscriptions
    #[error("topic {0} still has active subscriptions")]
    TopicInUse(String),

    /// The subscription was cancelled or torn down
    #[error("subscription closed")]
    SubscriptionClosed,

    /// The subscriber fell behind and this many payloads were dropped
    #[error("missed {0} messages")]
    Lagged(u64),

    /// Dial target is not registered
    #[error("unknown peer: {0}")]
    UnknownPeer(PeerId),

    /// A peer tried to dial itself
    #[error("cannot dial self")]
    DialSelf,

    /// A peer registered under an identity that is already taken
    #[error("peer {0} is already registered")]
    DuplicatePeer(PeerId),

    /// The relay answered with something we did not ask for
    #[error("relay protocol error: {0}")]
    Protocol(String),

    /// Operation did not complete in time
    #[error("operation timed out")]
    Timeout,

    /// WebSocket transport error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// JSON serialization/deserialization error
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors from creating or using a room session
#[derive(Debug, Error)]
pub enum SessionError {
    /// Room names must be non-empty
    #[error("room name must not be empty")]
    EmptyRoomName,

    /// Joining the room topic failed
    #[error("failed to join room '{room}': {source}")]
    Join {
        room: String,
        #[source]
        source: SubstrateError,
    },

    /// Subscribing to the room topic failed
    #[error("failed to subscribe to room '{room}': {source}")]
    Subscribe {
        room: String,
        #[source]
        source: SubstrateError,
    },

    /// The session has exited; its channels are closed
    #[error("session closed")]
    Closed,
}

/// Application-level errors
///
/// Fatal for whatever task returns them: process startup or a single
/// relay connection.
#[derive(Debug, Error)]
pub enum AppError {
    /// WebSocket protocol error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// JSON serialization/deserialization error
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Substrate error
    #[error(transparent)]
    Substrate(#[from] SubstrateError),

    /// Session error
    #[error(transparent)]
    Session(#[from] SessionError),

    /// Channel send error (internal channel broken)
    #[error("Channel send error")]
    ChannelSend,

    /// Relay client broke the handshake
    #[error("handshake error: {0}")]
    Handshake(String),
}
