//! Relay connection handler
//!
//! Handles individual relay clients: WebSocket handshake, the `hello`
//! registration, request dispatch to the broker, and forwarding of
//! subscription deliveries back over the socket.

use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

use crate::broker::{BrokerHandle, SubscriptionId};
use crate::config::SUBSCRIPTION_BUFFER;
use crate::error::{AppError, SubstrateError};
use crate::protocol::{ClientFrame, ErrorCode, Reply, Request, ServerFrame};
use crate::substrate::{delivery_channel, Envelope, SubscriptionQueue};
use crate::types::PeerId;

/// Outgoing frame buffer per connection
const FRAME_BUFFER: usize = 64;

/// Accept relay connections forever, one handler task per connection
pub async fn serve(listener: TcpListener, broker: BrokerHandle) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                info!("New connection from {}", addr);
                let broker = broker.clone();

                // Spawn handler task for each connection
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, broker).await {
                        error!("Connection handler error: {}", e);
                    }
                });
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}

/// Handle a new TCP connection to the relay
///
/// Performs the WebSocket handshake, registers the client's peer identity
/// with the broker, then serves requests until either side closes. The
/// peer is deregistered on the way out, which ends its subscriptions.
pub async fn handle_connection(stream: TcpStream, broker: BrokerHandle) -> Result<(), AppError> {
    let peer_addr = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    debug!("New TCP connection from {}", peer_addr);

    // WebSocket handshake
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    // Registration
    let (hello_id, peer_id) = read_hello(&mut ws_receiver).await?;
    let registered = broker.register(peer_id, vec![peer_addr.clone()]).await;
    let reply = match &registered {
        Ok(()) => Reply::Ok,
        Err(e) => Reply::from(e),
    };
    let json = serde_json::to_string(&ServerFrame::Reply {
        id: hello_id,
        reply,
    })?;
    ws_sender.send(Message::Text(json.into())).await?;
    registered?;

    info!(peer = %peer_id, "peer connected from {}", peer_addr);

    // Channel for relay -> client frames
    let (frame_tx, mut frame_rx) = mpsc::channel::<ServerFrame>(FRAME_BUFFER);

    // Spawn read task (WebSocket -> broker)
    let read_broker = broker.clone();
    let mut read_task = tokio::spawn(async move {
        while let Some(msg_result) = ws_receiver.next().await {
            match msg_result {
                Ok(Message::Text(text)) => match serde_json::from_str::<ClientFrame>(&text) {
                    Ok(frame) => {
                        if !serve_request(&read_broker, peer_id, frame, &frame_tx).await {
                            debug!("Write side closed, ending read task for {}", peer_id);
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("Invalid frame from {}: {}", peer_id, e);
                    }
                },
                Ok(Message::Close(_)) => {
                    debug!("Peer {} sent close frame", peer_id);
                    break;
                }
                Ok(_) => {
                    // Ping/pong are handled by tungstenite, binary is not part of the protocol
                }
                Err(e) => {
                    error!("WebSocket error for {}: {}", peer_id, e);
                    break;
                }
            }
        }
        debug!("Read task ended for {}", peer_id);
    });

    // Spawn write task (frames -> WebSocket)
    let mut write_task = tokio::spawn(async move {
        while let Some(frame) = frame_rx.recv().await {
            match serde_json::to_string(&frame) {
                Ok(json) => {
                    if ws_sender.send(Message::Text(json.into())).await.is_err() {
                        debug!("WebSocket send failed, ending write task");
                        break;
                    }
                }
                Err(e) => {
                    error!("Failed to serialize frame: {}", e);
                }
            }
        }
        let _ = ws_sender.close().await;
    });

    // Wait for either task to complete
    tokio::select! {
        _ = &mut read_task => {
            debug!("Read task completed for {}", peer_id);
        }
        _ = &mut write_task => {
            debug!("Write task completed for {}", peer_id);
        }
    }
    read_task.abort();
    write_task.abort();

    broker.deregister(peer_id).await;

    info!(peer = %peer_id, "peer disconnected");

    Ok(())
}

/// Wait for the `hello` request that must open every connection
async fn read_hello(
    ws_receiver: &mut SplitStream<WebSocketStream<TcpStream>>,
) -> Result<(u64, PeerId), AppError> {
    while let Some(msg_result) = ws_receiver.next().await {
        match msg_result? {
            Message::Text(text) => {
                let frame: ClientFrame = serde_json::from_str(&text)?;
                return match frame.request {
                    Request::Hello { peer_id } => Ok((frame.id, peer_id)),
                    other => Err(AppError::Handshake(format!(
                        "expected hello, got {:?}",
                        other
                    ))),
                };
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
    Err(AppError::Handshake("connection closed before hello".to_string()))
}

/// Dispatch one request and queue its reply
///
/// Returns false once the write side is gone.
async fn serve_request(
    broker: &BrokerHandle,
    peer_id: PeerId,
    frame: ClientFrame,
    frames: &mpsc::Sender<ServerFrame>,
) -> bool {
    let mut forward = None;
    let reply = match frame.request {
        Request::Subscribe { topic } => {
            let (sender, queue) = delivery_channel(SUBSCRIPTION_BUFFER);
            match broker.subscribe(peer_id, &topic, sender).await {
                Ok(subscription) => {
                    forward = Some((subscription, queue));
                    Reply::Subscribed { subscription }
                }
                Err(e) => Reply::from(&e),
            }
        }
        request => dispatch(broker, peer_id, request).await,
    };

    if frames
        .send(ServerFrame::Reply {
            id: frame.id,
            reply,
        })
        .await
        .is_err()
    {
        return false;
    }

    // Deliveries start only after the client has seen the subscription id
    if let Some((subscription, queue)) = forward {
        tokio::spawn(forward_subscription(subscription, queue, frames.clone()));
    }
    true
}

async fn dispatch(broker: &BrokerHandle, peer_id: PeerId, request: Request) -> Reply {
    match request {
        Request::Hello { .. } => Reply::Error {
            code: ErrorCode::InvalidRequest,
            detail: "already registered".to_string(),
        },
        Request::Dial { peer } => outcome(broker.dial(peer_id, peer).await),
        Request::Advertise { namespace } => outcome(broker.advertise(peer_id, &namespace).await),
        Request::FindPeers { namespace } => match broker.find_peers(&namespace).await {
            Ok(peers) => Reply::Found { peers },
            Err(e) => Reply::from(&e),
        },
        Request::Join { topic } => outcome(broker.join(peer_id, &topic).await),
        Request::Leave { topic } => outcome(broker.leave(peer_id, &topic).await),
        Request::Subscribe { .. } => Reply::Error {
            code: ErrorCode::InvalidRequest,
            detail: "subscribe is served separately".to_string(),
        },
        Request::Unsubscribe { subscription } => {
            broker.unsubscribe(peer_id, subscription).await;
            Reply::Ok
        }
        Request::Publish { topic, data } => outcome(broker.publish(peer_id, &topic, data).await),
        Request::ListPeers { topic } => Reply::Peers {
            peers: broker.list_peers(peer_id, &topic).await,
        },
    }
}

fn outcome(result: Result<(), SubstrateError>) -> Reply {
    match result {
        Ok(()) => Reply::Ok,
        Err(e) => Reply::from(&e),
    }
}

/// Pump a broker subscription into the connection's outgoing frames
///
/// Messages the broker dropped for this subscription are passed on as a
/// `lagged` frame so the client can report them.
async fn forward_subscription(
    subscription: SubscriptionId,
    queue: SubscriptionQueue,
    frames: mpsc::Sender<ServerFrame>,
) {
    loop {
        let frame = match queue.next().await {
            Ok(Envelope { from, data }) => ServerFrame::Message {
                subscription,
                from,
                data,
            },
            Err(SubstrateError::Lagged(missed)) => {
                debug!(subscription, missed, "relay subscriber lagged");
                ServerFrame::Lagged {
                    subscription,
                    missed,
                }
            }
            Err(_) => break,
        };
        if frames.send(frame).await.is_err() {
            return;
        }
    }
    let _ = frames
        .send(ServerFrame::SubscriptionClosed { subscription })
        .await;
}
