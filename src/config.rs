//! Command line and tunables
//!
//! The binary has two subcommands: `chat` joins a room through a relay,
//! `relay` runs the WebSocket pubsub relay that chat clients connect to.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};

/// Capacity of the user-paced and substrate-paced channels (inbound,
/// outbound, typed messages, commands).
///
/// A capacity of 1 means a slow consumer briefly stalls its producer. Both
/// producers are paced by a human or by the network, one item at a time.
pub const CHANNEL_CAPACITY: usize = 1;

/// Capacity of the diagnostic log channel
pub const LOG_CAPACITY: usize = 64;

/// How often the multiplexer redraws the peer list
pub const PEER_REFRESH_INTERVAL: Duration = Duration::from_secs(1);

/// Per-subscription delivery buffer inside the broker and relay client
pub const SUBSCRIPTION_BUFFER: usize = 32;

/// Command channel size for the broker actor
pub const BROKER_CHANNEL_SIZE: usize = 256;

/// Upper bound on a single dial attempt
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on a single relay request round-trip
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Default relay listen address
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8080";

/// Default relay URL for chat clients
pub const DEFAULT_RELAY_URL: &str = "ws://127.0.0.1:8080";

#[derive(Debug, Parser)]
#[command(name = "peerchat", version, about = "Room-based chat over a pubsub peer overlay")]
pub struct Cli {
    /// Enable debug logs
    #[arg(long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Join a chat room
    Chat(ChatArgs),
    /// Run the pubsub relay
    Relay(RelayArgs),
}

#[derive(Debug, Args)]
pub struct ChatArgs {
    /// Display name
    #[arg(long, default_value = "user")]
    pub user: String,

    /// Room to join on startup
    #[arg(long, default_value = "lobby")]
    pub room: String,

    /// Peer discovery method
    #[arg(long, value_enum, default_value_t = DiscoveryMethod::Advertise)]
    pub discover: DiscoveryMethod,

    /// Relay to connect through
    #[arg(long, default_value = DEFAULT_RELAY_URL)]
    pub relay: String,

    /// File receiving process logs while the terminal UI is up
    #[arg(long, default_value = "peerchat.log")]
    pub log_file: PathBuf,
}

#[derive(Debug, Args)]
pub struct RelayArgs {
    /// Address to listen on
    #[arg(long, default_value = DEFAULT_LISTEN_ADDR)]
    pub listen: String,
}

/// How this node finds other peers
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DiscoveryMethod {
    /// Announce once and look up providers a single time
    Announce,
    /// Advertise and keep looking up peers periodically
    Advertise,
}

/// Discovery tunables
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Rendezvous namespace every peerchat node advertises under
    pub namespace: String,
    /// Wait after advertising before the first lookup
    pub propagation_delay: Duration,
    /// Interval between lookups in advertise mode
    pub refresh_interval: Duration,
    /// Random extra delay (0..max) added to each refresh
    pub max_jitter: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            namespace: "peernet".to_string(),
            propagation_delay: Duration::from_secs(5),
            refresh_interval: Duration::from_secs(10),
            max_jitter: Duration::from_millis(500),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_defaults() {
        let cli = Cli::try_parse_from(["peerchat", "chat"]).unwrap();
        let Command::Chat(args) = cli.command else {
            panic!("Wrong subcommand");
        };
        assert!(!cli.debug);
        assert_eq!(args.user, "user");
        assert_eq!(args.room, "lobby");
        assert_eq!(args.discover, DiscoveryMethod::Advertise);
        assert_eq!(args.relay, DEFAULT_RELAY_URL);
    }

    #[test]
    fn test_chat_flags() {
        let cli = Cli::try_parse_from([
            "peerchat", "--debug", "chat", "--user", "alice", "--room", "dev", "--discover",
            "announce",
        ])
        .unwrap();
        let Command::Chat(args) = cli.command else {
            panic!("Wrong subcommand");
        };
        assert!(cli.debug);
        assert_eq!(args.user, "alice");
        assert_eq!(args.room, "dev");
        assert_eq!(args.discover, DiscoveryMethod::Announce);
    }

    #[test]
    fn test_relay_listen() {
        let cli = Cli::try_parse_from(["peerchat", "relay", "--listen", "0.0.0.0:9000"]).unwrap();
        let Command::Relay(args) = cli.command else {
            panic!("Wrong subcommand");
        };
        assert_eq!(args.listen, "0.0.0.0:9000");
    }

    #[test]
    fn test_discovery_config_default() {
        let config = DiscoveryConfig::default();
        assert_eq!(config.namespace, "peernet");
        assert_eq!(config.propagation_delay, Duration::from_secs(5));
    }
}
