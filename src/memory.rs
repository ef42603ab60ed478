//! In-process substrate
//!
//! A [`MemoryHub`] owns a broker; each [`MemoryNetwork`] it hands out is
//! one node with its own peer identity. Nodes behave like remote peers:
//! they must dial each other before topic traffic flows between them.

use std::sync::Arc;

use async_trait::async_trait;

use crate::broker::{BrokerHandle, SubscriptionId};
use crate::config::SUBSCRIPTION_BUFFER;
use crate::error::SubstrateError;
use crate::substrate::{
    delivery_channel, Envelope, Network, Subscription, SubscriptionQueue, Topic,
};
use crate::types::{PeerId, PeerInfo};

/// Address reported for in-process nodes
const MEMORY_ADDR: &str = "memory";

/// Factory for in-process nodes sharing one broker
#[derive(Debug, Clone)]
pub struct MemoryHub {
    broker: BrokerHandle,
}

impl MemoryHub {
    /// Create a hub. Must be called inside a Tokio runtime.
    pub fn new() -> Self {
        Self {
            broker: BrokerHandle::spawn(),
        }
    }

    /// Register a fresh node
    pub async fn node(&self) -> Result<Arc<MemoryNetwork>, SubstrateError> {
        let peer_id = PeerId::random();
        self.broker
            .register(peer_id, vec![MEMORY_ADDR.to_string()])
            .await?;
        Ok(Arc::new(MemoryNetwork {
            peer_id,
            broker: self.broker.clone(),
        }))
    }
}

impl Default for MemoryHub {
    fn default() -> Self {
        Self::new()
    }
}

/// One in-process node
#[derive(Debug)]
pub struct MemoryNetwork {
    peer_id: PeerId,
    broker: BrokerHandle,
}

impl MemoryNetwork {
    /// Discovery record for this node
    pub fn info(&self) -> PeerInfo {
        PeerInfo::new(self.peer_id, vec![MEMORY_ADDR.to_string()])
    }

    /// Take the node offline: its subscriptions end and further calls fail
    pub async fn shutdown(&self) {
        self.broker.deregister(self.peer_id).await;
    }
}

#[async_trait]
impl Network for MemoryNetwork {
    fn local_peer_id(&self) -> PeerId {
        self.peer_id
    }

    async fn join(&self, topic: &str) -> Result<Arc<dyn Topic>, SubstrateError> {
        self.broker.join(self.peer_id, topic).await?;
        Ok(Arc::new(MemoryTopic {
            peer_id: self.peer_id,
            name: topic.to_string(),
            broker: self.broker.clone(),
        }))
    }

    async fn dial(&self, peer: &PeerInfo) -> Result<(), SubstrateError> {
        self.broker.dial(self.peer_id, peer.id).await
    }

    async fn advertise(&self, namespace: &str) -> Result<(), SubstrateError> {
        self.broker.advertise(self.peer_id, namespace).await
    }

    async fn find_peers(&self, namespace: &str) -> Result<Vec<PeerInfo>, SubstrateError> {
        self.broker.find_peers(namespace).await
    }
}

struct MemoryTopic {
    peer_id: PeerId,
    name: String,
    broker: BrokerHandle,
}

#[async_trait]
impl Topic for MemoryTopic {
    fn name(&self) -> &str {
        &self.name
    }

    async fn subscribe(&self) -> Result<Arc<dyn Subscription>, SubstrateError> {
        let (sender, queue) = delivery_channel(SUBSCRIPTION_BUFFER);
        let id = self
            .broker
            .subscribe(self.peer_id, &self.name, sender)
            .await?;
        Ok(Arc::new(MemorySubscription {
            id,
            peer_id: self.peer_id,
            broker: self.broker.clone(),
            queue,
        }))
    }

    async fn publish(&self, data: Vec<u8>) -> Result<(), SubstrateError> {
        self.broker.publish(self.peer_id, &self.name, data).await
    }

    async fn list_peers(&self) -> Vec<PeerId> {
        self.broker.list_peers(self.peer_id, &self.name).await
    }

    async fn close(&self) -> Result<(), SubstrateError> {
        self.broker.leave(self.peer_id, &self.name).await
    }
}

struct MemorySubscription {
    id: SubscriptionId,
    peer_id: PeerId,
    broker: BrokerHandle,
    queue: SubscriptionQueue,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next(&self) -> Result<Envelope, SubstrateError> {
        self.queue.next().await
    }

    async fn cancel(&self) {
        self.broker.unsubscribe(self.peer_id, self.id).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connected_nodes_exchange_messages() {
        let hub = MemoryHub::new();
        let alice = hub.node().await.unwrap();
        let bob = hub.node().await.unwrap();
        alice.dial(&bob.info()).await.unwrap();

        let alice_topic = alice.join("room").await.unwrap();
        let bob_topic = bob.join("room").await.unwrap();
        let bob_sub = bob_topic.subscribe().await.unwrap();

        alice_topic.publish(b"ping".to_vec()).await.unwrap();

        let envelope = bob_sub.next().await.unwrap();
        assert_eq!(envelope.from, alice.local_peer_id());
        assert_eq!(envelope.data, b"ping");
        assert_eq!(alice_topic.list_peers().await, vec![bob.local_peer_id()]);
    }

    #[tokio::test]
    async fn test_cancel_ends_subscription_and_allows_close() {
        let hub = MemoryHub::new();
        let node = hub.node().await.unwrap();
        let topic = node.join("room").await.unwrap();
        let sub = topic.subscribe().await.unwrap();

        sub.cancel().await;
        sub.cancel().await;

        assert!(matches!(
            sub.next().await,
            Err(SubstrateError::SubscriptionClosed)
        ));
        topic.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_tears_down_node() {
        let hub = MemoryHub::new();
        let node = hub.node().await.unwrap();
        let topic = node.join("room").await.unwrap();
        let sub = topic.subscribe().await.unwrap();

        node.shutdown().await;

        assert!(sub.next().await.is_err());
        assert!(matches!(
            node.join("other").await,
            Err(SubstrateError::Shutdown)
        ));
    }
}
