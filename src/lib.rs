//! PeerChat Library
//!
//! Room-based terminal chat over a publish/subscribe network, built on
//! tokio with tokio-tungstenite for the relay transport.
//!
//! # Features
//! - Named rooms mapped onto pubsub topics (`room-peerchat-<room>`)
//! - Hot room switching without losing the active session on failure
//! - Display name changes without rejoining
//! - Peer discovery with dial-on-discovery
//! - In-process network for tests, WebSocket relay between processes
//!
//! # Architecture
//! - `RoomSession` owns a topic subscription and runs a publish loop and a
//!   receive loop, both stopped through one `CancellationToken`
//! - `EventLoop` is the single control loop merging user input, inbound
//!   messages, diagnostics and peer list refreshes
//! - The network is reached only through the `Network`/`Topic`/`Subscription`
//!   traits; the `Broker` actor behind them keeps all routing state, no locks
//!
//! # Example
//! ```ignore
//! use peerchat::{LogSink, MemoryHub, RoomSession};
//!
//! #[tokio::main]
//! async fn main() {
//!     let hub = MemoryHub::new();
//!     let node = hub.node().await.unwrap();
//!     let (logs, _log_rx) = LogSink::channel(64);
//!
//!     let mut session = RoomSession::join(&*node, "alice", "lobby", logs).await.unwrap();
//!     session.publish("hello").await.unwrap();
//!     session.exit().await;
//! }
//! ```

pub mod broker;
pub mod command;
pub mod config;
pub mod discovery;
pub mod display;
pub mod error;
pub mod event_loop;
pub mod handler;
pub mod memory;
pub mod message;
pub mod protocol;
pub mod relay;
pub mod session;
pub mod substrate;
pub mod switch;
pub mod tui;
pub mod types;

// Re-export main types for convenience
pub use broker::BrokerHandle;
pub use command::{parse_line, CommandKind, Input, InputQueues, InputRouter, UiCommand};
pub use display::{ChatLine, DisplayHandle, DisplayUpdate, LineKind};
pub use error::{AppError, SessionError, SubstrateError};
pub use event_loop::EventLoop;
pub use handler::{handle_connection, serve};
pub use memory::{MemoryHub, MemoryNetwork};
pub use message::{ChatLog, ChatMessage, LogKind, LogSink};
pub use relay::RelayNetwork;
pub use session::RoomSession;
pub use substrate::{Envelope, Network, Subscription, Topic};
pub use switch::switch_room;
pub use types::{topic_name, PeerId, PeerInfo};
