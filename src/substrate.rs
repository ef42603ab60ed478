//! Network substrate interface
//!
//! The room session engine only ever talks to the network through these
//! traits. Two implementations ship with the crate: the in-process
//! [`MemoryNetwork`](crate::memory::MemoryNetwork) and the WebSocket
//! [`RelayNetwork`](crate::relay::RelayNetwork).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio::sync::{mpsc, Mutex, Notify};

use crate::error::SubstrateError;
use crate::types::{PeerId, PeerInfo};

/// A payload received on a topic, tagged with the peer that published it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub from: PeerId,
    pub data: Vec<u8>,
}

/// A node's handle on the pubsub overlay
#[async_trait]
pub trait Network: Send + Sync {
    /// Identity of this node, stable for the process lifetime
    fn local_peer_id(&self) -> PeerId;

    /// Join a topic. A node may join a given topic at most once.
    async fn join(&self, topic: &str) -> Result<Arc<dyn Topic>, SubstrateError>;

    /// Open a connection to a peer. Connected peers exchange topic traffic.
    async fn dial(&self, peer: &PeerInfo) -> Result<(), SubstrateError>;

    /// Make this node findable under a rendezvous namespace
    async fn advertise(&self, namespace: &str) -> Result<(), SubstrateError>;

    /// Look up peers advertised under a namespace
    async fn find_peers(&self, namespace: &str) -> Result<Vec<PeerInfo>, SubstrateError>;
}

/// A joined topic
#[async_trait]
pub trait Topic: Send + Sync {
    fn name(&self) -> &str;

    async fn subscribe(&self) -> Result<Arc<dyn Subscription>, SubstrateError>;

    async fn publish(&self, data: Vec<u8>) -> Result<(), SubstrateError>;

    /// Connected peers currently in the topic, excluding self, sorted
    async fn list_peers(&self) -> Vec<PeerId>;

    /// Leave the topic. Fails while subscriptions are still live.
    async fn close(&self) -> Result<(), SubstrateError>;
}

/// A live subscription to a topic
#[async_trait]
pub trait Subscription: Send + Sync {
    /// Wait for the next payload. Fails once the subscription is torn down.
    ///
    /// [`SubstrateError::Lagged`] reports payloads dropped because this
    /// subscriber fell behind; the subscription stays usable after it.
    ///
    /// Cancel-safe: dropping the future loses no message.
    async fn next(&self) -> Result<Envelope, SubstrateError>;

    /// Tear the subscription down. Idempotent.
    async fn cancel(&self);
}

/// Create a bounded delivery buffer for one subscription
///
/// Deliveries never wait: an envelope that does not fit is counted as lost,
/// and the count is handed to the subscriber by [`SubscriptionQueue::next`].
pub fn delivery_channel(capacity: usize) -> (DeliverySender, SubscriptionQueue) {
    let (sender, receiver) = mpsc::channel(capacity);
    let lost = Arc::new(LostCounter::default());
    (
        DeliverySender {
            sender,
            lost: lost.clone(),
        },
        SubscriptionQueue {
            receiver: Mutex::new(receiver),
            lost,
        },
    )
}

/// Envelopes dropped since the subscriber last heard about it
#[derive(Debug, Default)]
struct LostCounter {
    count: AtomicU64,
    /// Wakes a subscriber parked on an empty queue
    notify: Notify,
}

/// Outcome of [`DeliverySender::deliver`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// Buffer full; counted as lost
    Lost,
    /// Subscriber is gone
    Closed,
}

/// Pushing end of a subscription's delivery buffer
#[derive(Debug, Clone)]
pub struct DeliverySender {
    sender: mpsc::Sender<Envelope>,
    lost: Arc<LostCounter>,
}

impl DeliverySender {
    pub fn deliver(&self, envelope: Envelope) -> Delivery {
        match self.sender.try_send(envelope) {
            Ok(()) => Delivery::Queued,
            Err(TrySendError::Full(_)) => {
                self.record_lost(1);
                Delivery::Lost
            }
            Err(TrySendError::Closed(_)) => Delivery::Closed,
        }
    }

    /// Count envelopes that were lost before reaching this buffer
    pub fn record_lost(&self, count: u64) {
        if count == 0 {
            return;
        }
        self.lost.count.fetch_add(count, Ordering::AcqRel);
        self.lost.notify.notify_one();
    }
}

/// Receiving end of a subscription's delivery buffer
///
/// When every [`DeliverySender`] is dropped the subscription is over.
#[derive(Debug)]
pub struct SubscriptionQueue {
    receiver: Mutex<mpsc::Receiver<Envelope>>,
    lost: Arc<LostCounter>,
}

impl SubscriptionQueue {
    /// Next queued envelope
    ///
    /// Losses are reported once the envelopes queued ahead of them have
    /// been handed out, as [`SubstrateError::Lagged`]. Cancel-safe.
    pub async fn next(&self) -> Result<Envelope, SubstrateError> {
        let mut receiver = self.receiver.lock().await;
        loop {
            match receiver.try_recv() {
                Ok(envelope) => return Ok(envelope),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => {}
            }

            let lost = self.lost.count.swap(0, Ordering::AcqRel);
            if lost > 0 {
                return Err(SubstrateError::Lagged(lost));
            }

            tokio::select! {
                envelope = receiver.recv() => match envelope {
                    Some(envelope) => return Ok(envelope),
                    // Report outstanding losses before the close
                    None if self.lost.count.load(Ordering::Acquire) > 0 => {}
                    None => return Err(SubstrateError::SubscriptionClosed),
                },
                _ = self.lost.notify.notified() => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(from: PeerId, data: &[u8]) -> Envelope {
        Envelope {
            from,
            data: data.to_vec(),
        }
    }

    #[tokio::test]
    async fn test_queue_yields_then_closes() {
        let (tx, queue) = delivery_channel(4);
        let from = PeerId::random();

        assert_eq!(tx.deliver(envelope(from, b"one")), Delivery::Queued);
        drop(tx);

        let envelope = queue.next().await.unwrap();
        assert_eq!(envelope.from, from);
        assert_eq!(envelope.data, b"one");
        assert!(matches!(
            queue.next().await,
            Err(SubstrateError::SubscriptionClosed)
        ));
    }

    #[tokio::test]
    async fn test_overflow_reported_after_queued_envelopes() {
        let (tx, queue) = delivery_channel(2);
        let from = PeerId::random();

        for data in [b"1", b"2", b"3", b"4", b"5"] {
            tx.deliver(envelope(from, data));
        }

        assert_eq!(queue.next().await.unwrap().data, b"1");
        assert_eq!(queue.next().await.unwrap().data, b"2");
        assert!(matches!(queue.next().await, Err(SubstrateError::Lagged(3))));

        // Still usable afterwards
        assert_eq!(tx.deliver(envelope(from, b"6")), Delivery::Queued);
        assert_eq!(queue.next().await.unwrap().data, b"6");
    }

    #[tokio::test]
    async fn test_upstream_losses_and_close() {
        let (tx, queue) = delivery_channel(2);
        tx.record_lost(7);
        drop(tx);

        assert!(matches!(queue.next().await, Err(SubstrateError::Lagged(7))));
        assert!(matches!(
            queue.next().await,
            Err(SubstrateError::SubscriptionClosed)
        ));
    }

    #[tokio::test]
    async fn test_deliver_after_subscriber_gone() {
        let (tx, queue) = delivery_channel(2);
        drop(queue);
        assert_eq!(tx.deliver(envelope(PeerId::random(), b"x")), Delivery::Closed);
    }

    #[tokio::test]
    async fn test_parked_subscriber_hears_about_losses() {
        let (tx, queue) = delivery_channel(2);
        let waiter = tokio::spawn(async move { queue.next().await });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        tx.record_lost(4);

        let result = tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(SubstrateError::Lagged(4))));
    }
}
