use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{RwLock, mpsc};
use uuid::Uuid;

use parley_types::events::ServerEvent;

/// Manages live connections and their channel subscriptions.
///
/// Every connection owns a personal mpsc channel. A user may hold several
/// connections at once (multi-device); the personal channel of a user fans
/// out to all of them. Each conversation is a broadcast group of
/// connection ids — join subscribes, disconnect implicitly leaves.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct ConnectionHandle {
    user_id: Uuid,
    tx: mpsc::UnboundedSender<ServerEvent>,
}

struct DispatcherInner {
    /// conn_id -> owning user + outbound channel
    connections: RwLock<HashMap<Uuid, ConnectionHandle>>,

    /// user_id -> that user's live connections (personal channel)
    user_connections: RwLock<HashMap<Uuid, HashSet<Uuid>>>,

    /// conversation_id -> subscribed connections (broadcast group)
    groups: RwLock<HashMap<Uuid, HashSet<Uuid>>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                connections: RwLock::new(HashMap::new()),
                user_connections: RwLock::new(HashMap::new()),
                groups: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Register a new connection for `user_id`. Returns (conn_id, receiver).
    pub async fn register(&self, user_id: Uuid) -> (Uuid, mpsc::UnboundedReceiver<ServerEvent>) {
        let conn_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();

        self.inner
            .connections
            .write()
            .await
            .insert(conn_id, ConnectionHandle { user_id, tx });
        self.inner
            .user_connections
            .write()
            .await
            .entry(user_id)
            .or_default()
            .insert(conn_id);

        (conn_id, rx)
    }

    /// Drop a connection: personal channel unbinding plus implicit leave of
    /// every conversation group.
    pub async fn unregister(&self, conn_id: Uuid) {
        let removed = self.inner.connections.write().await.remove(&conn_id);

        if let Some(handle) = removed {
            let mut users = self.inner.user_connections.write().await;
            if let Some(conns) = users.get_mut(&handle.user_id) {
                conns.remove(&conn_id);
                if conns.is_empty() {
                    users.remove(&handle.user_id);
                }
            }
        }

        let mut groups = self.inner.groups.write().await;
        groups.retain(|_, members| {
            members.remove(&conn_id);
            !members.is_empty()
        });
    }

    /// Subscribe a connection to a conversation's broadcast group.
    /// Membership was already verified by the caller.
    pub async fn join_conversation(&self, conversation_id: Uuid, conn_id: Uuid) {
        self.inner
            .groups
            .write()
            .await
            .entry(conversation_id)
            .or_default()
            .insert(conn_id);
    }

    /// Send a targeted event to one connection.
    pub async fn send_to_conn(&self, conn_id: Uuid, event: ServerEvent) {
        let connections = self.inner.connections.read().await;
        if let Some(handle) = connections.get(&conn_id) {
            let _ = handle.tx.send(event);
        }
    }

    /// Send to every live connection of one user (personal channel).
    pub async fn send_to_user(&self, user_id: Uuid, event: ServerEvent) {
        let conn_ids: Vec<Uuid> = {
            let users = self.inner.user_connections.read().await;
            users.get(&user_id).map(|set| set.iter().copied().collect()).unwrap_or_default()
        };

        let connections = self.inner.connections.read().await;
        for conn_id in conn_ids {
            if let Some(handle) = connections.get(&conn_id) {
                let _ = handle.tx.send(event.clone());
            }
        }
    }

    /// Deliver an event to every connection in a conversation's group —
    /// including the sender's own other connections. Returns how many
    /// receiving connections belong to users other than `sender_id`, so the
    /// caller can tell whether the message reached another device.
    pub async fn broadcast_to_conversation(
        &self,
        conversation_id: Uuid,
        sender_id: Uuid,
        event: ServerEvent,
    ) -> usize {
        let members = self.group_snapshot(conversation_id).await;

        let connections = self.inner.connections.read().await;
        let mut delivered_to_others = 0;
        for conn_id in members {
            if let Some(handle) = connections.get(&conn_id) {
                if handle.tx.send(event.clone()).is_ok() && handle.user_id != sender_id {
                    delivered_to_others += 1;
                }
            }
        }
        delivered_to_others
    }

    /// Deliver to the group minus one connection. Used for typing
    /// indicators, which the originating socket should not echo back.
    pub async fn broadcast_to_conversation_except(
        &self,
        conversation_id: Uuid,
        except_conn: Uuid,
        event: ServerEvent,
    ) {
        let members = self.group_snapshot(conversation_id).await;

        let connections = self.inner.connections.read().await;
        for conn_id in members {
            if conn_id == except_conn {
                continue;
            }
            if let Some(handle) = connections.get(&conn_id) {
                let _ = handle.tx.send(event.clone());
            }
        }
    }

    async fn group_snapshot(&self, conversation_id: Uuid) -> Vec<Uuid> {
        let groups = self.inner.groups.read().await;
        groups
            .get(&conversation_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn typing(user_id: Uuid, conversation_id: Uuid) -> ServerEvent {
        ServerEvent::Typing {
            user_id,
            conversation_id,
        }
    }

    #[tokio::test]
    async fn broadcast_reaches_only_subscribed_connections() {
        let dispatcher = Dispatcher::new();
        let conv = Uuid::new_v4();
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());

        let (alice_conn, mut alice_rx) = dispatcher.register(alice).await;
        let (bob_conn, mut bob_rx) = dispatcher.register(bob).await;
        let (_stranger_conn, mut stranger_rx) = dispatcher.register(Uuid::new_v4()).await;

        dispatcher.join_conversation(conv, alice_conn).await;
        dispatcher.join_conversation(conv, bob_conn).await;

        let others = dispatcher
            .broadcast_to_conversation(conv, alice, typing(alice, conv))
            .await;
        assert_eq!(others, 1); // bob only; alice's own conn doesn't count

        assert!(alice_rx.try_recv().is_ok()); // sender's conn still receives
        assert!(bob_rx.try_recv().is_ok());
        assert!(stranger_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn typing_excludes_the_originating_connection() {
        let dispatcher = Dispatcher::new();
        let conv = Uuid::new_v4();
        let alice = Uuid::new_v4();

        // alice has two devices in the conversation
        let (phone, mut phone_rx) = dispatcher.register(alice).await;
        let (laptop, mut laptop_rx) = dispatcher.register(alice).await;
        dispatcher.join_conversation(conv, phone).await;
        dispatcher.join_conversation(conv, laptop).await;

        dispatcher
            .broadcast_to_conversation_except(conv, phone, typing(alice, conv))
            .await;

        assert!(phone_rx.try_recv().is_err());
        assert!(laptop_rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn personal_channel_fans_out_to_all_devices() {
        let dispatcher = Dispatcher::new();
        let alice = Uuid::new_v4();
        let conv = Uuid::new_v4();

        let (_c1, mut rx1) = dispatcher.register(alice).await;
        let (_c2, mut rx2) = dispatcher.register(alice).await;

        dispatcher
            .send_to_user(alice, ServerEvent::ConversationJoined { conversation_id: conv })
            .await;

        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());
    }

    #[tokio::test]
    async fn disconnect_implicitly_leaves_groups() {
        let dispatcher = Dispatcher::new();
        let conv = Uuid::new_v4();
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());

        let (alice_conn, _alice_rx) = dispatcher.register(alice).await;
        let (bob_conn, mut bob_rx) = dispatcher.register(bob).await;
        dispatcher.join_conversation(conv, alice_conn).await;
        dispatcher.join_conversation(conv, bob_conn).await;

        dispatcher.unregister(alice_conn).await;

        let others = dispatcher
            .broadcast_to_conversation(conv, bob, typing(bob, conv))
            .await;
        assert_eq!(others, 0);
        assert!(bob_rx.try_recv().is_ok()); // bob's own conn still in group
    }
}
