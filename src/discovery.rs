//! Peer discovery and the dial-on-discovery connector
//!
//! Discovery turns rendezvous lookups into a stream of [`PeerInfo`]s. The
//! connector drains that stream and dials every new peer exactly once,
//! one supervised task per attempt. Failed dials are logged, never retried.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{DiscoveryConfig, DiscoveryMethod, DIAL_TIMEOUT};
use crate::error::SubstrateError;
use crate::substrate::Network;
use crate::types::{PeerId, PeerInfo};

/// Buffer between the discovery task and the connector
const DISCOVERY_BUFFER: usize = 16;

/// Start discovering peers in the background
///
/// The returned stream ends when discovery finishes (announce mode), fails,
/// or `shutdown` is cancelled.
pub fn spawn_discovery(
    network: Arc<dyn Network>,
    method: DiscoveryMethod,
    config: DiscoveryConfig,
    shutdown: CancellationToken,
) -> mpsc::Receiver<PeerInfo> {
    let (found_tx, found_rx) = mpsc::channel(DISCOVERY_BUFFER);
    tokio::spawn(async move {
        match discover(network, method, config, found_tx, shutdown).await {
            Ok(()) => debug!("peer discovery finished"),
            Err(e) => warn!("peer discovery stopped: {}", e),
        }
    });
    found_rx
}

async fn discover(
    network: Arc<dyn Network>,
    method: DiscoveryMethod,
    config: DiscoveryConfig,
    found: mpsc::Sender<PeerInfo>,
    shutdown: CancellationToken,
) -> Result<(), SubstrateError> {
    network.advertise(&config.namespace).await?;
    debug!(namespace = %config.namespace, ?method, "advertised service");

    // Give the advertisement time to propagate
    if !pause(config.propagation_delay, &shutdown).await {
        return Ok(());
    }

    loop {
        match network.find_peers(&config.namespace).await {
            Ok(peers) => {
                debug!("found {} advertised peers", peers.len());
                for peer in peers {
                    if found.send(peer).await.is_err() {
                        return Ok(());
                    }
                }
            }
            Err(SubstrateError::Shutdown) => return Err(SubstrateError::Shutdown),
            Err(e) => warn!("peer lookup failed: {}", e),
        }

        if method == DiscoveryMethod::Announce {
            return Ok(());
        }

        let delay = config.refresh_interval + jitter(config.max_jitter);
        if !pause(delay, &shutdown).await {
            return Ok(());
        }
    }
}

/// Random delay in `0..=max`, so peers started together do not look up in lockstep
fn jitter(max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
}

/// Sleep unless shut down first. Returns false on shutdown.
async fn pause(duration: Duration, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => false,
        _ = sleep(duration) => true,
    }
}

/// Dial each newly discovered peer once, ignoring self
///
/// Runs until the discovery stream ends or `shutdown` is cancelled, and
/// returns the set of peers a dial was attempted for.
pub async fn connect_discovered(
    network: Arc<dyn Network>,
    mut discovered: mpsc::Receiver<PeerInfo>,
    shutdown: CancellationToken,
) -> HashSet<PeerId> {
    let local = network.local_peer_id();
    let mut seen = HashSet::new();
    let mut dials = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            next = discovered.recv() => {
                let Some(peer) = next else { break };
                if peer.id == local || !seen.insert(peer.id) {
                    continue;
                }
                dials.spawn(dial(network.clone(), peer));
            }
            Some(_) = dials.join_next(), if !dials.is_empty() => {}
        }
    }

    if shutdown.is_cancelled() {
        dials.shutdown().await;
    } else {
        while dials.join_next().await.is_some() {}
    }
    seen
}

async fn dial(network: Arc<dyn Network>, peer: PeerInfo) {
    match timeout(DIAL_TIMEOUT, network.dial(&peer)).await {
        Ok(Ok(())) => info!(peer = %peer.id, "connected to peer"),
        Ok(Err(e)) => warn!(peer = %peer.id, "dial failed: {}", e),
        Err(_) => warn!(peer = %peer.id, "dial timed out"),
    }
}
