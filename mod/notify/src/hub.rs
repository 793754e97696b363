use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, warn};

use docpipe_core::ServiceError;

use crate::protocol::ServerMessage;

/// Identifier of one physical live connection.
pub type ConnectionId = String;

/// Outbound half of a live connection. The transport (websocket writer,
/// SSE channel, test buffer) lives behind this seam.
#[async_trait]
pub trait ConnectionSink: Send + Sync {
    async fn send(&self, message: &ServerMessage) -> Result<(), ServiceError>;
}

struct Connection {
    user_id: String,
    sink: Arc<dyn ConnectionSink>,
}

/// Fan-out hub mapping users to their live connections and tasks to
/// their subscribed users.
///
/// An injectable instance with no global state: construct one per
/// serving process and hand it to every consumer. Indices are sharded
/// maps; delivery never sends while holding a shard entry — sinks are
/// collected first, sent after release — so a slow connection cannot
/// block structural changes.
#[derive(Default)]
pub struct NotificationHub {
    /// conn id -> owning user + sink.
    connections: DashMap<ConnectionId, Connection>,
    /// user -> that user's live connection ids.
    user_connections: DashMap<String, HashSet<ConnectionId>>,
    /// task -> users subscribed to it.
    task_subscribers: DashMap<String, HashSet<String>>,
    /// user -> tasks the user is subscribed to (reverse index).
    user_subscriptions: DashMap<String, HashSet<String>>,
}

impl NotificationHub {
    pub fn new() -> Self {
        Self::default()
    }

    // -----------------------------------------------------------------------
    // Connection lifecycle
    // -----------------------------------------------------------------------

    /// Register a live connection for a user. Idempotent per connection
    /// id: a second call with an id already present is ignored.
    pub fn connect(&self, conn_id: &str, user_id: &str, sink: Arc<dyn ConnectionSink>) {
        if self.connections.contains_key(conn_id) {
            debug!("connection {conn_id} already registered");
            return;
        }
        self.connections.insert(
            conn_id.to_string(),
            Connection {
                user_id: user_id.to_string(),
                sink,
            },
        );
        self.user_connections
            .entry(user_id.to_string())
            .or_default()
            .insert(conn_id.to_string());
        debug!("connection {conn_id} registered for user {user_id}");
    }

    /// Remove a connection. When it was the user's last one, the user's
    /// entry and all of their task subscriptions are removed too, so no
    /// empty buckets linger.
    pub fn disconnect(&self, conn_id: &str) {
        let Some((_, connection)) = self.connections.remove(conn_id) else {
            return;
        };
        let user_id = connection.user_id;

        if let Some(mut conns) = self.user_connections.get_mut(&user_id) {
            conns.remove(conn_id);
        }
        // Emptiness check and removal under one shard acquisition: a
        // connect landing in between keeps the bucket alive.
        let removed = self
            .user_connections
            .remove_if(&user_id, |_, conns| conns.is_empty())
            .is_some();
        if !removed && self.user_connections.contains_key(&user_id) {
            return;
        }

        // Last connection closed: drop every subscription this user held.
        if let Some((_, tasks)) = self.user_subscriptions.remove(&user_id) {
            for task_id in tasks {
                self.remove_task_subscriber(&task_id, &user_id);
            }
        }
        debug!("user {user_id} fully disconnected");
    }

    // -----------------------------------------------------------------------
    // Subscriptions
    // -----------------------------------------------------------------------

    /// Subscribe a user to a task's events.
    pub fn subscribe(&self, user_id: &str, task_id: &str) {
        self.task_subscribers
            .entry(task_id.to_string())
            .or_default()
            .insert(user_id.to_string());
        self.user_subscriptions
            .entry(user_id.to_string())
            .or_default()
            .insert(task_id.to_string());
    }

    /// Drop one (user, task) subscription, removing buckets that empty.
    pub fn unsubscribe(&self, user_id: &str, task_id: &str) {
        self.remove_task_subscriber(task_id, user_id);
        if let Some(mut tasks) = self.user_subscriptions.get_mut(user_id) {
            tasks.remove(task_id);
        }
        self.user_subscriptions
            .remove_if(user_id, |_, tasks| tasks.is_empty());
    }

    fn remove_task_subscriber(&self, task_id: &str, user_id: &str) {
        if let Some(mut users) = self.task_subscribers.get_mut(task_id) {
            users.remove(user_id);
        }
        // Same atomic discipline as disconnect: a subscribe landing
        // between the membership removal and this call survives.
        self.task_subscribers
            .remove_if(task_id, |_, users| users.is_empty());
    }

    // -----------------------------------------------------------------------
    // Delivery
    // -----------------------------------------------------------------------

    /// Push a message to every live connection of a user. A connection
    /// whose sink fails is disconnected; the rest still receive.
    pub async fn send_to_user(&self, user_id: &str, message: &ServerMessage) {
        // Two lookups, never holding both maps at once: connect() touches
        // them in the opposite order.
        let conn_ids: Vec<ConnectionId> = match self.user_connections.get(user_id) {
            Some(conns) => conns.iter().cloned().collect(),
            None => return,
        };
        let mut targets: Vec<(ConnectionId, Arc<dyn ConnectionSink>)> = Vec::new();
        for conn_id in conn_ids {
            if let Some(connection) = self.connections.get(&conn_id) {
                targets.push((conn_id.clone(), Arc::clone(&connection.sink)));
            }
        }

        for (conn_id, sink) in targets {
            if let Err(e) = sink.send(message).await {
                warn!("send to connection {conn_id} failed: {e}, dropping it");
                self.disconnect(&conn_id);
            }
        }
    }

    /// Push a message to every user subscribed to a task.
    pub async fn broadcast_to_task_subscribers(&self, task_id: &str, message: &ServerMessage) {
        let users: Vec<String> = match self.task_subscribers.get(task_id) {
            Some(users) => users.iter().cloned().collect(),
            None => return,
        };
        for user_id in users {
            self.send_to_user(&user_id, message).await;
        }
    }

    // -----------------------------------------------------------------------
    // Introspection (used by serving loops and tests)
    // -----------------------------------------------------------------------

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn subscriber_count(&self, task_id: &str) -> usize {
        self.task_subscribers
            .get(task_id)
            .map(|users| users.len())
            .unwrap_or(0)
    }

    pub fn is_subscribed(&self, user_id: &str, task_id: &str) -> bool {
        self.task_subscribers
            .get(task_id)
            .is_some_and(|users| users.contains(user_id))
    }
}
