//! WebSocket relay substrate (client side)
//!
//! A [`RelayNetwork`] is one node whose broker lives in a relay process.
//! A single driver task owns the socket: it numbers outgoing requests,
//! matches replies back to their callers, and routes subscription
//! deliveries into per-subscription queues.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::config::{REQUEST_TIMEOUT, SUBSCRIPTION_BUFFER};
use crate::error::SubstrateError;
use crate::protocol::{ClientFrame, Reply, Request, ServerFrame};
use crate::substrate::{
    delivery_channel, Delivery, DeliverySender, Envelope, Network, Subscription, SubscriptionQueue,
    Topic,
};
use crate::types::{PeerId, PeerInfo};

/// Requests queued for the driver
const OUTGOING_BUFFER: usize = 32;

type RelayStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Work handed to the driver task
#[derive(Debug)]
enum Outgoing {
    Call {
        request: Request,
        reply: oneshot::Sender<Result<Reply, SubstrateError>>,
    },
    Subscribe {
        topic: String,
        deliver: DeliverySender,
        reply: oneshot::Sender<Result<u64, SubstrateError>>,
    },
}

/// A request on the wire, waiting for its reply
enum Pending {
    Call(oneshot::Sender<Result<Reply, SubstrateError>>),
    Subscribe {
        deliver: DeliverySender,
        reply: oneshot::Sender<Result<u64, SubstrateError>>,
    },
}

impl Pending {
    /// The caller stopped waiting, e.g. after a timeout
    fn is_abandoned(&self) -> bool {
        match self {
            Self::Call(reply) => reply.is_closed(),
            Self::Subscribe { reply, .. } => reply.is_closed(),
        }
    }

    fn fail(self, err: SubstrateError) {
        match self {
            Self::Call(reply) => {
                let _ = reply.send(Err(err));
            }
            Self::Subscribe { reply, .. } => {
                let _ = reply.send(Err(err));
            }
        }
    }
}

/// Cloneable request path into the driver
#[derive(Debug, Clone)]
struct RelayClient {
    outgoing: mpsc::Sender<Outgoing>,
}

impl RelayClient {
    async fn call(&self, request: Request) -> Result<Reply, SubstrateError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.outgoing
            .send(Outgoing::Call {
                request,
                reply: reply_tx,
            })
            .await
            .map_err(|_| SubstrateError::Shutdown)?;
        await_reply(reply_rx).await
    }

    async fn call_ok(&self, request: Request) -> Result<(), SubstrateError> {
        match self.call(request).await? {
            Reply::Ok => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn subscribe(
        &self,
        topic: &str,
        deliver: DeliverySender,
    ) -> Result<u64, SubstrateError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.outgoing
            .send(Outgoing::Subscribe {
                topic: topic.to_string(),
                deliver,
                reply: reply_tx,
            })
            .await
            .map_err(|_| SubstrateError::Shutdown)?;
        await_reply(reply_rx).await
    }
}

async fn await_reply<T>(
    reply_rx: oneshot::Receiver<Result<T, SubstrateError>>,
) -> Result<T, SubstrateError> {
    match timeout(REQUEST_TIMEOUT, reply_rx).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err(SubstrateError::Shutdown),
        Err(_) => Err(SubstrateError::Timeout),
    }
}

/// Turn a reply of the wrong shape into an error
fn unexpected(reply: Reply) -> SubstrateError {
    match reply {
        Reply::Error { code, detail } => code.into_error(detail),
        other => SubstrateError::Protocol(format!("unexpected reply: {:?}", other)),
    }
}

/// A node connected through a relay
#[derive(Debug)]
pub struct RelayNetwork {
    peer_id: PeerId,
    client: RelayClient,
}

impl RelayNetwork {
    /// Connect to a relay and register under `peer_id`
    pub async fn connect(url: &str, peer_id: PeerId) -> Result<Self, SubstrateError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(url).await?;
        let (outgoing_tx, outgoing_rx) = mpsc::channel(OUTGOING_BUFFER);
        tokio::spawn(drive(ws_stream, outgoing_rx));

        let client = RelayClient {
            outgoing: outgoing_tx,
        };
        client.call_ok(Request::Hello { peer_id }).await?;
        info!(peer = %peer_id, "registered with relay {}", url);

        Ok(Self { peer_id, client })
    }
}

#[async_trait]
impl Network for RelayNetwork {
    fn local_peer_id(&self) -> PeerId {
        self.peer_id
    }

    async fn join(&self, topic: &str) -> Result<Arc<dyn Topic>, SubstrateError> {
        self.client
            .call_ok(Request::Join {
                topic: topic.to_string(),
            })
            .await?;
        Ok(Arc::new(RelayTopic {
            name: topic.to_string(),
            client: self.client.clone(),
        }))
    }

    async fn dial(&self, peer: &PeerInfo) -> Result<(), SubstrateError> {
        self.client.call_ok(Request::Dial { peer: peer.id }).await
    }

    async fn advertise(&self, namespace: &str) -> Result<(), SubstrateError> {
        self.client
            .call_ok(Request::Advertise {
                namespace: namespace.to_string(),
            })
            .await
    }

    async fn find_peers(&self, namespace: &str) -> Result<Vec<PeerInfo>, SubstrateError> {
        let reply = self
            .client
            .call(Request::FindPeers {
                namespace: namespace.to_string(),
            })
            .await?;
        match reply {
            Reply::Found { peers } => Ok(peers),
            other => Err(unexpected(other)),
        }
    }
}

struct RelayTopic {
    name: String,
    client: RelayClient,
}

#[async_trait]
impl Topic for RelayTopic {
    fn name(&self) -> &str {
        &self.name
    }

    async fn subscribe(&self) -> Result<Arc<dyn Subscription>, SubstrateError> {
        let (deliver, queue) = delivery_channel(SUBSCRIPTION_BUFFER);
        let id = self.client.subscribe(&self.name, deliver).await?;
        Ok(Arc::new(RelaySubscription {
            id,
            client: self.client.clone(),
            queue,
        }))
    }

    async fn publish(&self, data: Vec<u8>) -> Result<(), SubstrateError> {
        self.client
            .call_ok(Request::Publish {
                topic: self.name.clone(),
                data,
            })
            .await
    }

    async fn list_peers(&self) -> Vec<PeerId> {
        let request = Request::ListPeers {
            topic: self.name.clone(),
        };
        match self.client.call(request).await {
            Ok(Reply::Peers { peers }) => peers,
            Ok(other) => {
                warn!(topic = %self.name, "list peers failed: {}", unexpected(other));
                Vec::new()
            }
            Err(e) => {
                debug!(topic = %self.name, "list peers failed: {}", e);
                Vec::new()
            }
        }
    }

    async fn close(&self) -> Result<(), SubstrateError> {
        self.client
            .call_ok(Request::Leave {
                topic: self.name.clone(),
            })
            .await
    }
}

struct RelaySubscription {
    id: u64,
    client: RelayClient,
    queue: SubscriptionQueue,
}

#[async_trait]
impl Subscription for RelaySubscription {
    async fn next(&self) -> Result<Envelope, SubstrateError> {
        self.queue.next().await
    }

    async fn cancel(&self) {
        let request = Request::Unsubscribe {
            subscription: self.id,
        };
        if let Err(e) = self.client.call_ok(request).await {
            debug!(subscription = self.id, "unsubscribe failed: {}", e);
        }
    }
}

/// Own the socket until either the relay or every local handle goes away
async fn drive(ws_stream: RelayStream, mut outgoing: mpsc::Receiver<Outgoing>) {
    let (mut sink, mut stream) = ws_stream.split();
    let mut next_id: u64 = 1;
    let mut pending: HashMap<u64, Pending> = HashMap::new();
    let mut subscriptions: HashMap<u64, DeliverySender> = HashMap::new();

    loop {
        sweep_abandoned(&mut pending);

        tokio::select! {
            out = outgoing.recv() => {
                let Some(out) = out else {
                    debug!("all relay handles dropped, closing connection");
                    break;
                };
                let (request, waiter) = match out {
                    Outgoing::Call { request, reply } => (request, Pending::Call(reply)),
                    Outgoing::Subscribe { topic, deliver, reply } => {
                        (Request::Subscribe { topic }, Pending::Subscribe { deliver, reply })
                    }
                };

                // Local side of an unsubscribe takes effect immediately
                if let Request::Unsubscribe { subscription } = &request {
                    subscriptions.remove(subscription);
                }

                let id = next_id;
                next_id += 1;
                let json = match serde_json::to_string(&ClientFrame { id, request }) {
                    Ok(json) => json,
                    Err(e) => {
                        waiter.fail(e.into());
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Text(json.into())).await {
                    warn!("relay send failed: {}", e);
                    waiter.fail(e.into());
                    break;
                }
                pending.insert(id, waiter);
            }
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<ServerFrame>(&text) {
                    Ok(frame) => {
                        let Some(subscription) = route(frame, &mut pending, &mut subscriptions) else {
                            continue;
                        };
                        // Nobody is waiting for this subscription, release it on the relay
                        let id = next_id;
                        next_id += 1;
                        let frame = ClientFrame { id, request: Request::Unsubscribe { subscription } };
                        match serde_json::to_string(&frame) {
                            Ok(json) => {
                                if let Err(e) = sink.send(Message::Text(json.into())).await {
                                    warn!("relay send failed: {}", e);
                                    break;
                                }
                            }
                            Err(e) => warn!("failed to encode unsubscribe: {}", e),
                        }
                    }
                    Err(e) => warn!("invalid frame from relay: {}", e),
                },
                Some(Ok(Message::Close(_))) | None => {
                    debug!("relay closed the connection");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("relay connection error: {}", e);
                    break;
                }
            }
        }
    }

    for (_, waiter) in pending.drain() {
        waiter.fail(SubstrateError::Shutdown);
    }
    // Dropping the delivery senders ends every subscription
    subscriptions.clear();
    let _ = sink.close().await;
}

/// Forget requests whose callers gave up waiting
fn sweep_abandoned(pending: &mut HashMap<u64, Pending>) {
    pending.retain(|id, waiter| {
        let abandoned = waiter.is_abandoned();
        if abandoned {
            debug!(request = id, "dropping abandoned request");
        }
        !abandoned
    });
}

/// Apply one frame from the relay
///
/// Returns a relay subscription that nobody locally owns any more; the
/// caller should unsubscribe it.
fn route(
    frame: ServerFrame,
    pending: &mut HashMap<u64, Pending>,
    subscriptions: &mut HashMap<u64, DeliverySender>,
) -> Option<u64> {
    match frame {
        ServerFrame::Reply { id, reply } => match pending.remove(&id) {
            None => {
                debug!("reply for unknown request {}", id);
                match reply {
                    Reply::Subscribed { subscription } => Some(subscription),
                    _ => None,
                }
            }
            Some(Pending::Call(waiter)) => {
                let _ = waiter.send(Ok(reply));
                None
            }
            Some(Pending::Subscribe { deliver, reply: waiter }) => match reply {
                Reply::Subscribed { subscription } => {
                    if waiter.send(Ok(subscription)).is_err() {
                        return Some(subscription);
                    }
                    subscriptions.insert(subscription, deliver);
                    None
                }
                other => {
                    let _ = waiter.send(Err(unexpected(other)));
                    None
                }
            },
        },
        ServerFrame::Message {
            subscription,
            from,
            data,
        } => {
            let deliver = subscriptions.get(&subscription)?;
            match deliver.deliver(Envelope { from, data }) {
                Delivery::Queued => {}
                Delivery::Lost => {
                    warn!(subscription, "subscriber too slow, dropping message");
                }
                Delivery::Closed => {
                    subscriptions.remove(&subscription);
                }
            }
            None
        }
        ServerFrame::Lagged {
            subscription,
            missed,
        } => {
            if let Some(deliver) = subscriptions.get(&subscription) {
                warn!(subscription, missed, "relay dropped messages for slow subscriber");
                deliver.record_lost(missed);
            }
            None
        }
        ServerFrame::SubscriptionClosed { subscription } => {
            subscriptions.remove(&subscription);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::net::TcpListener;

    use super::*;
    use crate::broker::BrokerHandle;
    use crate::handler::serve;

    async fn start_relay() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(listener, BrokerHandle::spawn()));
        format!("ws://{}", addr)
    }

    async fn connected_pair(url: &str) -> (RelayNetwork, RelayNetwork) {
        let alice = RelayNetwork::connect(url, PeerId::random()).await.unwrap();
        let bob = RelayNetwork::connect(url, PeerId::random()).await.unwrap();
        alice
            .dial(&PeerInfo::new(bob.local_peer_id(), Vec::new()))
            .await
            .unwrap();
        (alice, bob)
    }

    #[tokio::test]
    async fn test_publish_reaches_remote_subscriber() {
        let url = start_relay().await;
        let (alice, bob) = connected_pair(&url).await;

        let alice_topic = alice.join("room-peerchat-lobby").await.unwrap();
        let bob_topic = bob.join("room-peerchat-lobby").await.unwrap();
        let bob_sub = bob_topic.subscribe().await.unwrap();

        alice_topic.publish(b"hello".to_vec()).await.unwrap();

        let envelope = tokio::time::timeout(Duration::from_secs(5), bob_sub.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(envelope.from, alice.local_peer_id());
        assert_eq!(envelope.data, b"hello");
        assert_eq!(bob_topic.list_peers().await, vec![alice.local_peer_id()]);
    }

    #[tokio::test]
    async fn test_errors_cross_the_wire() {
        let url = start_relay().await;
        let node = RelayNetwork::connect(&url, PeerId::random()).await.unwrap();

        node.join("t").await.unwrap();
        assert!(matches!(
            node.join("t").await,
            Err(SubstrateError::AlreadyJoined(topic)) if topic == "t"
        ));
        assert!(matches!(
            node.dial(&PeerInfo::new(node.local_peer_id(), Vec::new())).await,
            Err(SubstrateError::DialSelf)
        ));
    }

    #[tokio::test]
    async fn test_duplicate_identity_rejected() {
        let url = start_relay().await;
        let peer_id = PeerId::random();
        let _first = RelayNetwork::connect(&url, peer_id).await.unwrap();
        assert!(matches!(
            RelayNetwork::connect(&url, peer_id).await,
            Err(SubstrateError::DuplicatePeer(p)) if p == peer_id
        ));
    }

    #[tokio::test]
    async fn test_cancel_closes_subscription_then_topic() {
        let url = start_relay().await;
        let node = RelayNetwork::connect(&url, PeerId::random()).await.unwrap();
        let topic = node.join("t").await.unwrap();
        let sub = topic.subscribe().await.unwrap();

        sub.cancel().await;

        assert!(matches!(
            sub.next().await,
            Err(SubstrateError::SubscriptionClosed)
        ));
        topic.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_rendezvous_lookup() {
        let url = start_relay().await;
        let node = RelayNetwork::connect(&url, PeerId::random()).await.unwrap();
        node.advertise("peernet").await.unwrap();

        let found = node.find_peers("peernet").await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, node.local_peer_id());
        assert!(!found[0].addrs.is_empty());
    }

    #[test]
    fn test_sweep_forgets_timed_out_requests() {
        let mut pending = HashMap::new();
        let (live_tx, _live_rx) = oneshot::channel();
        let (gone_tx, gone_rx) = oneshot::channel();
        let (deliver, _queue) = delivery_channel(1);
        let (sub_tx, sub_rx) = oneshot::channel();
        pending.insert(1, Pending::Call(live_tx));
        pending.insert(2, Pending::Call(gone_tx));
        pending.insert(
            3,
            Pending::Subscribe {
                deliver,
                reply: sub_tx,
            },
        );

        // What await_reply leaves behind after its timeout fires
        drop(gone_rx);
        drop(sub_rx);
        sweep_abandoned(&mut pending);

        assert_eq!(pending.len(), 1);
        assert!(pending.contains_key(&1));
    }

    #[test]
    fn test_late_subscribed_reply_is_released() {
        let mut pending = HashMap::new();
        let mut subscriptions = HashMap::new();

        // Swept before the reply arrived
        let frame = ServerFrame::Reply {
            id: 7,
            reply: Reply::Subscribed { subscription: 40 },
        };
        assert_eq!(route(frame, &mut pending, &mut subscriptions), Some(40));

        // Caller gave up between sweeps
        let (deliver, _queue) = delivery_channel(1);
        let (reply, reply_rx) = oneshot::channel();
        drop(reply_rx);
        pending.insert(8, Pending::Subscribe { deliver, reply });
        let frame = ServerFrame::Reply {
            id: 8,
            reply: Reply::Subscribed { subscription: 41 },
        };
        assert_eq!(route(frame, &mut pending, &mut subscriptions), Some(41));
        assert!(subscriptions.is_empty());

        let frame = ServerFrame::Reply {
            id: 9,
            reply: Reply::Ok,
        };
        assert_eq!(route(frame, &mut pending, &mut subscriptions), None);
    }

    #[tokio::test]
    async fn test_lagged_frame_reaches_subscriber() {
        let mut pending = HashMap::new();
        let mut subscriptions = HashMap::new();
        let (deliver, queue) = delivery_channel(1);
        subscriptions.insert(5, deliver);

        let from = PeerId::random();
        for data in [b"a", b"b"] {
            let frame = ServerFrame::Message {
                subscription: 5,
                from,
                data: data.to_vec(),
            };
            route(frame, &mut pending, &mut subscriptions);
        }
        let frame = ServerFrame::Lagged {
            subscription: 5,
            missed: 3,
        };
        route(frame, &mut pending, &mut subscriptions);

        assert_eq!(queue.next().await.unwrap().data, b"a");
        // One dropped locally plus three dropped by the relay
        assert!(matches!(queue.next().await, Err(SubstrateError::Lagged(4))));
    }

    #[tokio::test]
    async fn test_unread_subscriber_accounts_for_every_message() {
        let url = start_relay().await;
        let (alice, bob) = connected_pair(&url).await;
        let alice_topic = alice.join("t").await.unwrap();
        let bob_topic = bob.join("t").await.unwrap();
        let bob_sub = bob_topic.subscribe().await.unwrap();

        let total = (SUBSCRIPTION_BUFFER * 4) as u64;
        for i in 0..total {
            alice_topic.publish(i.to_string().into_bytes()).await.unwrap();
        }

        let mut delivered = 0;
        let mut missed = 0;
        loop {
            match tokio::time::timeout(Duration::from_millis(500), bob_sub.next()).await {
                Ok(Ok(_)) => delivered += 1,
                Ok(Err(SubstrateError::Lagged(n))) => missed += n,
                Ok(Err(e)) => panic!("subscription failed: {}", e),
                Err(_) => break,
            }
        }

        assert!(missed > 0);
        assert_eq!(delivered + missed, total);
    }
}
