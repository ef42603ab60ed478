//! Relay wire protocol
//!
//! JSON frames exchanged between `RelayNetwork` clients and the relay
//! server, using Serde's tagged enums for type-safe (de)serialization.
//! Every client frame carries a request id that the matching reply echoes.

use serde::{Deserialize, Serialize};

use crate::error::SubstrateError;
use crate::types::{PeerId, PeerInfo};

/// Client → Relay frame
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientFrame {
    pub id: u64,
    pub request: Request,
}

/// Operations a client can ask of the relay
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    /// Register under a peer identity (must be the first request)
    Hello { peer_id: PeerId },
    /// Connect to another registered peer
    Dial { peer: PeerId },
    /// Advertise under a rendezvous namespace
    Advertise { namespace: String },
    /// Look up a rendezvous namespace
    FindPeers { namespace: String },
    Join { topic: String },
    Leave { topic: String },
    Subscribe { topic: String },
    Unsubscribe { subscription: u64 },
    Publish { topic: String, data: Vec<u8> },
    ListPeers { topic: String },
}

/// Relay → Client frame
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Answer to the request with the same id
    Reply { id: u64, reply: Reply },
    /// A payload delivered on a subscription
    Message {
        subscription: u64,
        from: PeerId,
        data: Vec<u8>,
    },
    /// The relay dropped `missed` payloads for a slow subscription
    Lagged { subscription: u64, missed: u64 },
    /// The relay tore a subscription down
    SubscriptionClosed { subscription: u64 },
}

/// Outcome of a request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Reply {
    Ok,
    Subscribed { subscription: u64 },
    Peers { peers: Vec<PeerId> },
    Found { peers: Vec<PeerInfo> },
    Error { code: ErrorCode, detail: String },
}

/// Error codes carried by [`Reply::Error`]
///
/// Mirrors the substrate errors a remote caller can act on.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Peer not registered (anymore)
    Shutdown,
    InvalidTopic,
    AlreadyJoined,
    NotJoined,
    TopicInUse,
    UnknownPeer,
    DialSelf,
    DuplicatePeer,
    /// Request not valid in the current connection state
    InvalidRequest,
    /// Anything else
    Internal,
}

impl ErrorCode {
    /// Rebuild the substrate error on the client side
    pub fn into_error(self, detail: String) -> SubstrateError {
        match self {
            Self::Shutdown => SubstrateError::Shutdown,
            Self::InvalidTopic => SubstrateError::InvalidTopic(detail),
            Self::AlreadyJoined => SubstrateError::AlreadyJoined(detail),
            Self::NotJoined => SubstrateError::NotJoined(detail),
            Self::TopicInUse => SubstrateError::TopicInUse(detail),
            Self::UnknownPeer => match detail.parse() {
                Ok(peer) => SubstrateError::UnknownPeer(peer),
                Err(_) => SubstrateError::Protocol(format!("unknown peer: {}", detail)),
            },
            Self::DialSelf => SubstrateError::DialSelf,
            Self::DuplicatePeer => match detail.parse() {
                Ok(peer) => SubstrateError::DuplicatePeer(peer),
                Err(_) => SubstrateError::Protocol(format!("duplicate peer: {}", detail)),
            },
            Self::InvalidRequest | Self::Internal => SubstrateError::Protocol(detail),
        }
    }
}

/// Convert a substrate error to a reply for the remote caller
impl From<&SubstrateError> for Reply {
    fn from(err: &SubstrateError) -> Self {
        let (code, detail) = match err {
            SubstrateError::Shutdown => (ErrorCode::Shutdown, String::new()),
            SubstrateError::InvalidTopic(topic) => (ErrorCode::InvalidTopic, topic.clone()),
            SubstrateError::AlreadyJoined(topic) => (ErrorCode::AlreadyJoined, topic.clone()),
            SubstrateError::NotJoined(topic) => (ErrorCode::NotJoined, topic.clone()),
            SubstrateError::TopicInUse(topic) => (ErrorCode::TopicInUse, topic.clone()),
            SubstrateError::UnknownPeer(peer) => (ErrorCode::UnknownPeer, peer.to_string()),
            SubstrateError::DialSelf => (ErrorCode::DialSelf, String::new()),
            SubstrateError::DuplicatePeer(peer) => (ErrorCode::DuplicatePeer, peer.to_string()),
            SubstrateError::Protocol(detail) => (ErrorCode::InvalidRequest, detail.clone()),
            // Transport-level failures are not meaningful to the remote side
            _ => (ErrorCode::Internal, "internal error".to_string()),
        };
        Reply::Error { code, detail }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_frame_shape() {
        let frame = ClientFrame {
            id: 7,
            request: Request::Join {
                topic: "room-peerchat-lobby".to_string(),
            },
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"id\":7"));
        assert!(json.contains("\"op\":\"join\""));
        assert!(json.contains("\"topic\":\"room-peerchat-lobby\""));
    }

    #[test]
    fn test_client_frame_deserialize() {
        let json = r#"{"id": 3, "request": {"op": "list_peers", "topic": "t"}}"#;
        let frame: ClientFrame = serde_json::from_str(json).unwrap();
        assert_eq!(frame.id, 3);
        assert_eq!(
            frame.request,
            Request::ListPeers {
                topic: "t".to_string()
            }
        );
    }

    #[test]
    fn test_server_reply_shape() {
        let frame = ServerFrame::Reply {
            id: 1,
            reply: Reply::Subscribed { subscription: 9 },
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"type\":\"reply\""));
        assert!(json.contains("\"status\":\"subscribed\""));
        assert!(json.contains("\"subscription\":9"));
    }

    #[test]
    fn test_lagged_frame_shape() {
        let json = r#"{"type":"lagged","subscription":3,"missed":12}"#;
        let frame: ServerFrame = serde_json::from_str(json).unwrap();
        assert!(matches!(
            frame,
            ServerFrame::Lagged {
                subscription: 3,
                missed: 12
            }
        ));
    }

    #[test]
    fn test_error_code_serialize() {
        let reply = Reply::from(&SubstrateError::TopicInUse("t".to_string()));
        let json = serde_json::to_string(&reply).unwrap();
        assert!(json.contains("\"code\":\"topic_in_use\""));
    }

    #[test]
    fn test_error_roundtrip_keeps_meaning() {
        let peer = PeerId::random();
        let cases = [
            SubstrateError::AlreadyJoined("t".to_string()),
            SubstrateError::UnknownPeer(peer),
            SubstrateError::DialSelf,
            SubstrateError::Shutdown,
        ];
        for err in cases {
            let Reply::Error { code, detail } = Reply::from(&err) else {
                panic!("Wrong variant");
            };
            assert_eq!(code.into_error(detail).to_string(), err.to_string());
        }
    }
}
