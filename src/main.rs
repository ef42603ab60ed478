//! PeerChat - Entry Point
//!
//! `peerchat relay` runs the relay server. `peerchat chat` connects to a
//! relay and runs the terminal chat client.

use std::fs::File;
use std::sync::{Arc, Mutex};

use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use peerchat::config::{ChatArgs, Cli, Command, DiscoveryConfig, RelayArgs, LOG_CAPACITY};
use peerchat::discovery::{connect_discovered, spawn_discovery};
use peerchat::tui::{self, Screen};
use peerchat::{
    serve, AppError, BrokerHandle, DisplayHandle, EventLoop, InputRouter, LogSink, Network,
    PeerId, RelayNetwork, RoomSession,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Command::Relay(args) => {
            // Relay logs to stdout
            tracing_subscriber::fmt()
                .with_env_filter(env_filter(cli.debug))
                .init();
            run_relay(args).await?;
        }
        Command::Chat(args) => {
            // The terminal belongs to the UI, so client logs go to a file
            let log_file = File::create(&args.log_file)?;
            tracing_subscriber::fmt()
                .with_env_filter(env_filter(cli.debug))
                .with_writer(Mutex::new(log_file))
                .with_ansi(false)
                .init();
            run_chat(args).await?;
        }
    }

    Ok(())
}

/// Use RUST_LOG when set, e.g. RUST_LOG=peerchat=trace
fn env_filter(debug: bool) -> EnvFilter {
    let default = if debug { "peerchat=debug" } else { "peerchat=info" };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

async fn run_relay(args: RelayArgs) -> Result<(), AppError> {
    let listener = TcpListener::bind(&args.listen).await?;
    info!("PeerChat relay listening on {}", args.listen);

    let broker = BrokerHandle::spawn();
    info!("Broker actor started");

    serve(listener, broker).await;
    Ok(())
}

async fn run_chat(args: ChatArgs) -> Result<(), AppError> {
    let peer_id = PeerId::random();
    let network: Arc<dyn Network> = Arc::new(RelayNetwork::connect(&args.relay, peer_id).await?);
    info!(peer = %peer_id, relay = %args.relay, "connected to relay");

    let shutdown = CancellationToken::new();
    let discovered = spawn_discovery(
        network.clone(),
        args.discover,
        DiscoveryConfig::default(),
        shutdown.clone(),
    );
    let connector = tokio::spawn(connect_discovered(
        network.clone(),
        discovered,
        shutdown.clone(),
    ));

    let (logs, log_rx) = LogSink::channel(LOG_CAPACITY);
    let session = RoomSession::join(network.as_ref(), &args.user, &args.room, logs.clone()).await?;

    let (display, updates) = DisplayHandle::channel();
    let (router, inputs) = InputRouter::channel();
    let surface = tokio::spawn(tui::run(
        Screen::new(&args.room, &args.user),
        updates,
        router,
    ));

    EventLoop::new(
        network,
        session,
        display,
        (logs, log_rx),
        inputs,
        shutdown.clone(),
    )
    .run()
    .await;

    // Stops discovery and any dial still in flight
    shutdown.cancel();
    match connector.await {
        Ok(dialed) => debug!("dialed {} peers this session", dialed.len()),
        Err(e) => warn!("connector task failed: {}", e),
    }

    match surface.await {
        Ok(result) => result,
        Err(e) => {
            warn!("display task failed: {}", e);
            Ok(())
        }
    }
}
