//! Broker actor implementation
//!
//! The central actor that owns all pubsub routing state: registered peers,
//! the connections between them, rendezvous advertisements, joined topics
//! and subscriptions. Both substrates sit on top of it: in-process nodes
//! talk to a [`BrokerHandle`] directly, remote nodes through the relay.
//!
//! Routing follows a gossip router's rules: a payload published on a topic
//! reaches the publisher's own subscriptions and those of peers connected
//! to the publisher. Slow subscribers lose messages instead of stalling
//! the broker; each loss is counted and reported to that subscriber.

use std::collections::{HashMap, HashSet};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::BROKER_CHANNEL_SIZE;
use crate::error::SubstrateError;
use crate::substrate::{Delivery, DeliverySender, Envelope};
use crate::types::{PeerId, PeerInfo};

/// Broker-wide subscription identifier
pub type SubscriptionId = u64;

type Reply<T> = oneshot::Sender<Result<T, SubstrateError>>;

/// Commands sent from handles to the broker actor
#[derive(Debug)]
enum BrokerCommand {
    /// New peer comes online
    Register {
        peer: PeerId,
        addrs: Vec<String>,
        reply: Reply<()>,
    },
    /// Peer goes away; everything it owns is torn down
    Deregister { peer: PeerId },
    /// Connect two peers
    Dial {
        peer: PeerId,
        target: PeerId,
        reply: Reply<()>,
    },
    /// Record a rendezvous advertisement
    Advertise {
        peer: PeerId,
        namespace: String,
        reply: Reply<()>,
    },
    /// Look up a rendezvous namespace
    FindPeers {
        namespace: String,
        reply: oneshot::Sender<Vec<PeerInfo>>,
    },
    Join {
        peer: PeerId,
        topic: String,
        reply: Reply<()>,
    },
    Leave {
        peer: PeerId,
        topic: String,
        reply: Reply<()>,
    },
    Subscribe {
        peer: PeerId,
        topic: String,
        sender: DeliverySender,
        reply: Reply<SubscriptionId>,
    },
    Unsubscribe {
        peer: PeerId,
        subscription: SubscriptionId,
        reply: oneshot::Sender<()>,
    },
    Publish {
        peer: PeerId,
        topic: String,
        data: Vec<u8>,
        reply: Reply<()>,
    },
    ListPeers {
        peer: PeerId,
        topic: String,
        reply: oneshot::Sender<Vec<PeerId>>,
    },
}

/// Handle to the running broker actor
///
/// Cheap to clone: it's just an `mpsc::Sender` wrapper. Every call fails
/// with [`SubstrateError::Shutdown`] once the broker is gone.
#[derive(Debug, Clone)]
pub struct BrokerHandle {
    sender: mpsc::Sender<BrokerCommand>,
}

impl BrokerHandle {
    /// Spawn a broker actor on the current runtime
    pub fn spawn() -> Self {
        let (sender, receiver) = mpsc::channel(BROKER_CHANNEL_SIZE);
        tokio::spawn(Broker::new(receiver).run());
        Self { sender }
    }

    async fn call<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> BrokerCommand,
    ) -> Result<T, SubstrateError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.sender
            .send(command(reply_tx))
            .await
            .map_err(|_| SubstrateError::Shutdown)?;
        reply_rx.await.map_err(|_| SubstrateError::Shutdown)
    }

    pub async fn register(&self, peer: PeerId, addrs: Vec<String>) -> Result<(), SubstrateError> {
        self.call(|reply| BrokerCommand::Register { peer, addrs, reply })
            .await?
    }

    /// Tear down a peer (fire-and-forget)
    pub async fn deregister(&self, peer: PeerId) {
        let _ = self.sender.send(BrokerCommand::Deregister { peer }).await;
    }

    pub async fn dial(&self, peer: PeerId, target: PeerId) -> Result<(), SubstrateError> {
        self.call(|reply| BrokerCommand::Dial {
            peer,
            target,
            reply,
        })
        .await?
    }

    pub async fn advertise(&self, peer: PeerId, namespace: &str) -> Result<(), SubstrateError> {
        let namespace = namespace.to_string();
        self.call(|reply| BrokerCommand::Advertise {
            peer,
            namespace,
            reply,
        })
        .await?
    }

    pub async fn find_peers(&self, namespace: &str) -> Result<Vec<PeerInfo>, SubstrateError> {
        let namespace = namespace.to_string();
        self.call(|reply| BrokerCommand::FindPeers { namespace, reply })
            .await
    }

    pub async fn join(&self, peer: PeerId, topic: &str) -> Result<(), SubstrateError> {
        let topic = topic.to_string();
        self.call(|reply| BrokerCommand::Join { peer, topic, reply })
            .await?
    }

    pub async fn leave(&self, peer: PeerId, topic: &str) -> Result<(), SubstrateError> {
        let topic = topic.to_string();
        self.call(|reply| BrokerCommand::Leave { peer, topic, reply })
            .await?
    }

    /// Subscribe `sender` to a topic; deliveries are pushed into it without waiting
    pub async fn subscribe(
        &self,
        peer: PeerId,
        topic: &str,
        sender: DeliverySender,
    ) -> Result<SubscriptionId, SubstrateError> {
        let topic = topic.to_string();
        self.call(|reply| BrokerCommand::Subscribe {
            peer,
            topic,
            sender,
            reply,
        })
        .await?
    }

    /// Remove a subscription. Unknown ids are ignored.
    pub async fn unsubscribe(&self, peer: PeerId, subscription: SubscriptionId) {
        let _ = self
            .call(|reply| BrokerCommand::Unsubscribe {
                peer,
                subscription,
                reply,
            })
            .await;
    }

    pub async fn publish(
        &self,
        peer: PeerId,
        topic: &str,
        data: Vec<u8>,
    ) -> Result<(), SubstrateError> {
        let topic = topic.to_string();
        self.call(|reply| BrokerCommand::Publish {
            peer,
            topic,
            data,
            reply,
        })
        .await?
    }

    /// Connected peers in a topic. Empty when the broker is gone.
    pub async fn list_peers(&self, peer: PeerId, topic: &str) -> Vec<PeerId> {
        let topic = topic.to_string();
        self.call(|reply| BrokerCommand::ListPeers { peer, topic, reply })
            .await
            .unwrap_or_default()
    }
}

/// Per-peer routing state
#[derive(Debug, Default)]
struct Node {
    addrs: Vec<String>,
    /// Connected peers (symmetric)
    links: HashSet<PeerId>,
    /// Joined topics
    topics: HashSet<String>,
}

#[derive(Debug)]
struct Subscriber {
    peer: PeerId,
    topic: String,
    sender: DeliverySender,
}

/// The broker actor
///
/// Processes commands one at a time; no locks, all state lives here.
struct Broker {
    /// All registered peers: PeerId -> Node
    nodes: HashMap<PeerId, Node>,
    /// Live subscriptions: SubscriptionId -> Subscriber
    subscriptions: HashMap<SubscriptionId, Subscriber>,
    /// Rendezvous namespace -> advertising peers
    adverts: HashMap<String, HashSet<PeerId>>,
    next_subscription: SubscriptionId,
    receiver: mpsc::Receiver<BrokerCommand>,
}

impl Broker {
    fn new(receiver: mpsc::Receiver<BrokerCommand>) -> Self {
        Self {
            nodes: HashMap::new(),
            subscriptions: HashMap::new(),
            adverts: HashMap::new(),
            next_subscription: 1,
            receiver,
        }
    }

    /// Run the broker event loop until all handles are dropped
    async fn run(mut self) {
        info!("broker started");

        while let Some(cmd) = self.receiver.recv().await {
            self.handle_command(cmd);
        }

        info!("broker shutting down");
    }

    fn handle_command(&mut self, cmd: BrokerCommand) {
        match cmd {
            BrokerCommand::Register { peer, addrs, reply } => {
                let _ = reply.send(self.handle_register(peer, addrs));
            }
            BrokerCommand::Deregister { peer } => {
                self.handle_deregister(peer);
            }
            BrokerCommand::Dial {
                peer,
                target,
                reply,
            } => {
                let _ = reply.send(self.handle_dial(peer, target));
            }
            BrokerCommand::Advertise {
                peer,
                namespace,
                reply,
            } => {
                let _ = reply.send(self.handle_advertise(peer, namespace));
            }
            BrokerCommand::FindPeers { namespace, reply } => {
                let _ = reply.send(self.handle_find_peers(&namespace));
            }
            BrokerCommand::Join { peer, topic, reply } => {
                let _ = reply.send(self.handle_join(peer, topic));
            }
            BrokerCommand::Leave { peer, topic, reply } => {
                let _ = reply.send(self.handle_leave(peer, &topic));
            }
            BrokerCommand::Subscribe {
                peer,
                topic,
                sender,
                reply,
            } => {
                let _ = reply.send(self.handle_subscribe(peer, topic, sender));
            }
            BrokerCommand::Unsubscribe {
                peer,
                subscription,
                reply,
            } => {
                self.handle_unsubscribe(peer, subscription);
                let _ = reply.send(());
            }
            BrokerCommand::Publish {
                peer,
                topic,
                data,
                reply,
            } => {
                let _ = reply.send(self.handle_publish(peer, &topic, data));
            }
            BrokerCommand::ListPeers { peer, topic, reply } => {
                let _ = reply.send(self.handle_list_peers(peer, &topic));
            }
        }
    }

    fn handle_register(&mut self, peer: PeerId, addrs: Vec<String>) -> Result<(), SubstrateError> {
        if self.nodes.contains_key(&peer) {
            return Err(SubstrateError::DuplicatePeer(peer));
        }
        self.nodes.insert(
            peer,
            Node {
                addrs,
                ..Node::default()
            },
        );
        info!(%peer, "peer registered");
        debug!("Total peers: {}", self.nodes.len());
        Ok(())
    }

    fn handle_deregister(&mut self, peer: PeerId) {
        let Some(node) = self.nodes.remove(&peer) else {
            return;
        };

        for link in &node.links {
            if let Some(other) = self.nodes.get_mut(link) {
                other.links.remove(&peer);
            }
        }

        // Dropping the senders ends the peer's subscriptions
        self.subscriptions.retain(|_, sub| sub.peer != peer);

        for peers in self.adverts.values_mut() {
            peers.remove(&peer);
        }
        self.adverts.retain(|_, peers| !peers.is_empty());

        info!(%peer, "peer deregistered");
        debug!(
            "Total peers: {}, Total subscriptions: {}",
            self.nodes.len(),
            self.subscriptions.len()
        );
    }

    fn handle_dial(&mut self, peer: PeerId, target: PeerId) -> Result<(), SubstrateError> {
        if !self.nodes.contains_key(&peer) {
            return Err(SubstrateError::Shutdown);
        }
        if peer == target {
            return Err(SubstrateError::DialSelf);
        }
        let Some(remote) = self.nodes.get_mut(&target) else {
            return Err(SubstrateError::UnknownPeer(target));
        };
        remote.links.insert(peer);
        if let Some(local) = self.nodes.get_mut(&peer) {
            if local.links.insert(target) {
                debug!(%peer, %target, "peers connected");
            }
        }
        Ok(())
    }

    fn handle_advertise(&mut self, peer: PeerId, namespace: String) -> Result<(), SubstrateError> {
        if !self.nodes.contains_key(&peer) {
            return Err(SubstrateError::Shutdown);
        }
        self.adverts.entry(namespace).or_default().insert(peer);
        Ok(())
    }

    fn handle_find_peers(&self, namespace: &str) -> Vec<PeerInfo> {
        let Some(peers) = self.adverts.get(namespace) else {
            return Vec::new();
        };
        let mut found: Vec<PeerInfo> = peers
            .iter()
            .filter_map(|id| {
                self.nodes
                    .get(id)
                    .map(|node| PeerInfo::new(*id, node.addrs.clone()))
            })
            .collect();
        found.sort_by_key(|info| info.id);
        found
    }

    fn handle_join(&mut self, peer: PeerId, topic: String) -> Result<(), SubstrateError> {
        validate_topic(&topic)?;
        let Some(node) = self.nodes.get_mut(&peer) else {
            return Err(SubstrateError::Shutdown);
        };
        if node.topics.contains(&topic) {
            return Err(SubstrateError::AlreadyJoined(topic));
        }
        debug!(%peer, %topic, "topic joined");
        node.topics.insert(topic);
        Ok(())
    }

    fn handle_leave(&mut self, peer: PeerId, topic: &str) -> Result<(), SubstrateError> {
        let in_use = self
            .subscriptions
            .values()
            .any(|sub| sub.peer == peer && sub.topic == topic);
        let Some(node) = self.nodes.get_mut(&peer) else {
            return Err(SubstrateError::Shutdown);
        };
        if !node.topics.contains(topic) {
            return Err(SubstrateError::NotJoined(topic.to_string()));
        }
        if in_use {
            return Err(SubstrateError::TopicInUse(topic.to_string()));
        }
        node.topics.remove(topic);
        debug!(%peer, %topic, "topic left");
        Ok(())
    }

    fn handle_subscribe(
        &mut self,
        peer: PeerId,
        topic: String,
        sender: DeliverySender,
    ) -> Result<SubscriptionId, SubstrateError> {
        let Some(node) = self.nodes.get(&peer) else {
            return Err(SubstrateError::Shutdown);
        };
        if !node.topics.contains(&topic) {
            return Err(SubstrateError::NotJoined(topic));
        }

        let id = self.next_subscription;
        self.next_subscription += 1;
        debug!(%peer, %topic, subscription = id, "subscribed");
        self.subscriptions
            .insert(id, Subscriber { peer, topic, sender });
        Ok(id)
    }

    fn handle_unsubscribe(&mut self, peer: PeerId, subscription: SubscriptionId) {
        let owned = self
            .subscriptions
            .get(&subscription)
            .is_some_and(|sub| sub.peer == peer);
        if owned {
            self.subscriptions.remove(&subscription);
            debug!(%peer, subscription, "unsubscribed");
        }
    }

    fn handle_publish(
        &mut self,
        peer: PeerId,
        topic: &str,
        data: Vec<u8>,
    ) -> Result<(), SubstrateError> {
        let Some(node) = self.nodes.get(&peer) else {
            return Err(SubstrateError::Shutdown);
        };
        if !node.topics.contains(topic) {
            return Err(SubstrateError::NotJoined(topic.to_string()));
        }

        let mut closed = Vec::new();
        for (id, sub) in &self.subscriptions {
            if sub.topic != topic || (sub.peer != peer && !node.links.contains(&sub.peer)) {
                continue;
            }
            let envelope = Envelope {
                from: peer,
                data: data.clone(),
            };
            match sub.sender.deliver(envelope) {
                Delivery::Queued => {}
                Delivery::Lost => {
                    warn!(subscriber = %sub.peer, %topic, "subscriber too slow, dropping message");
                }
                Delivery::Closed => closed.push(*id),
            }
        }

        for id in closed {
            self.subscriptions.remove(&id);
        }
        Ok(())
    }

    fn handle_list_peers(&self, peer: PeerId, topic: &str) -> Vec<PeerId> {
        let Some(node) = self.nodes.get(&peer) else {
            return Vec::new();
        };
        let mut peers: Vec<PeerId> = node
            .links
            .iter()
            .filter(|link| {
                self.nodes
                    .get(link)
                    .is_some_and(|other| other.topics.contains(topic))
            })
            .copied()
            .collect();
        peers.sort();
        peers
    }
}

fn validate_topic(topic: &str) -> Result<(), SubstrateError> {
    if topic.is_empty() || topic.chars().any(char::is_control) {
        return Err(SubstrateError::InvalidTopic(topic.to_string()));
    }
    Ok(())
}
