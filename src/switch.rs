//! Room switching
//!
//! Swaps the active [`RoomSession`] for one in another room. The new room is
//! joined first; only once that succeeded is the old session torn down.

use std::mem;

use tracing::info;

use crate::error::SessionError;
use crate::message::LogSink;
use crate::session::RoomSession;
use crate::substrate::Network;

/// Replace `current` with a session in `new_room`
///
/// On failure `current` is left exactly as it was. On success the old
/// session has fully exited (loops stopped, subscription cancelled, topic
/// closed) before this returns.
pub async fn switch_room(
    current: &mut RoomSession,
    network: &dyn Network,
    new_room: &str,
    logs: LogSink,
) -> Result<(), SessionError> {
    let next = RoomSession::join(network, current.user_name(), new_room, logs).await?;

    let mut previous = mem::replace(current, next);
    previous.exit().await;

    info!(from = %previous.room_name(), to = %new_room, "switched rooms");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;
    use crate::config::LOG_CAPACITY;
    use crate::message::ChatMessage;
    use crate::memory::MemoryHub;
    use crate::types::topic_name;

    #[tokio::test]
    async fn test_switch_moves_to_new_room() {
        let hub = MemoryHub::new();
        let alice = hub.node().await.unwrap();
        let bob = hub.node().await.unwrap();
        alice.dial(&bob.info()).await.unwrap();
        let (logs, _log_rx) = LogSink::channel(LOG_CAPACITY);

        let mut session = RoomSession::join(&*alice, "alice", "lobby", logs.clone())
            .await
            .unwrap();
        session.set_user_name("alicia");

        switch_room(&mut session, &*alice, "lounge", logs).await.unwrap();
        assert_eq!(session.room_name(), "lounge");
        assert_eq!(session.user_name(), "alicia");

        // Old topic is closed, new one is live
        alice.join(&topic_name("lobby")).await.unwrap();
        let bob_topic = bob.join(&topic_name("lounge")).await.unwrap();
        let msg = ChatMessage::new("welcome", bob.local_peer_id().to_string(), "bob");
        bob_topic.publish(msg.encode().unwrap()).await.unwrap();

        let received = timeout(Duration::from_secs(5), session.next_inbound())
            .await
            .unwrap();
        assert_eq!(received, Some(msg));
        session.exit().await;
    }

    #[tokio::test]
    async fn test_failed_switch_leaves_session_untouched() {
        let hub = MemoryHub::new();
        let alice = hub.node().await.unwrap();
        let bob = hub.node().await.unwrap();
        alice.dial(&bob.info()).await.unwrap();
        let (logs, _log_rx) = LogSink::channel(LOG_CAPACITY);

        let mut session = RoomSession::join(&*alice, "alice", "lobby", logs.clone())
            .await
            .unwrap();

        // Already joined under the hood, so the join fails
        assert!(switch_room(&mut session, &*alice, "lobby", logs.clone())
            .await
            .is_err());
        assert!(switch_room(&mut session, &*alice, "", logs).await.is_err());
        assert_eq!(session.room_name(), "lobby");

        // Still receiving in the original room
        let bob_topic = bob.join(&topic_name("lobby")).await.unwrap();
        let msg = ChatMessage::new("still here?", bob.local_peer_id().to_string(), "bob");
        bob_topic.publish(msg.encode().unwrap()).await.unwrap();

        let received = timeout(Duration::from_secs(5), session.next_inbound())
            .await
            .unwrap();
        assert_eq!(received, Some(msg));
        session.exit().await;
    }
}
