//! Basic type definitions for peerchat
//!
//! Provides newtype wrappers for type safety:
//! - `PeerId`: UUID-based peer identity, stable for the process lifetime
//! - `PeerInfo`: a peer identity plus the addresses it was seen at
//!
//! Also owns the room → topic naming convention.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Namespace prefix shared by every room topic.
///
/// Changing this breaks interoperability with peers running older builds.
pub const TOPIC_NAMESPACE: &str = "room-peerchat";

/// Derive the pubsub topic name for a room.
///
/// Case-sensitive and exact: `"lobby"` becomes `"room-peerchat-lobby"`.
pub fn topic_name(room_name: &str) -> String {
    format!("{}-{}", TOPIC_NAMESPACE, room_name)
}

/// Unique peer identifier (newtype pattern)
///
/// Wraps a UUID v4. Its canonical string form is what travels in the
/// `senderid` field of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(pub Uuid);

impl PeerId {
    /// Create a new random peer ID
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Last 8 characters of the canonical form, for narrow displays
    pub fn short(&self) -> String {
        let full = self.to_string();
        full[full.len() - 8..].to_string()
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PeerId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// A discovered peer: identity plus the addresses it can be reached at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: PeerId,
    pub addrs: Vec<String>,
}

impl PeerInfo {
    pub fn new(id: PeerId, addrs: Vec<String>) -> Self {
        Self { id, addrs }
    }
}
