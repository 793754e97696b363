use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::KvError;

/// A message delivered by a pattern subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubSubMessage {
    /// Concrete channel the message was published on.
    pub channel: String,
    pub payload: Vec<u8>,
}

/// One entry claimed from a stream read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    /// Store-assigned monotonic entry id.
    pub id: String,
    pub payload: Vec<u8>,
}

/// KeyValueStore abstracts the shared key/value + list + publish/subscribe
/// + stream service every process talks to.
///
/// Keys follow a namespaced convention: `task:{id}`, `user:{id}:tasks`,
/// `task:events:{id}`, etc. Every operation is a network call and may fail
/// with [`KvError::Unavailable`]; callers must treat that as "unknown
/// state, retry", never as "entity absent".
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Get the value for a key. Returns None if the key does not exist.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError>;

    /// Set a key with a time-to-live in seconds.
    async fn set_ex(&self, key: &str, value: &[u8], ttl_secs: u64) -> Result<(), KvError>;

    /// Refresh the time-to-live of an existing key. No-op if absent.
    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<(), KvError>;

    /// Push a value to the head of a list, creating it if absent.
    async fn list_push_left(&self, key: &str, value: &[u8]) -> Result<(), KvError>;

    /// Trim a list to the inclusive index range `[start, stop]`.
    /// Negative indices count from the tail (-1 is the last element).
    async fn list_trim(&self, key: &str, start: i64, stop: i64) -> Result<(), KvError>;

    /// Read the inclusive index range `[start, stop]` of a list.
    async fn list_range(&self, key: &str, start: i64, stop: i64) -> Result<Vec<Vec<u8>>, KvError>;

    /// Publish a message on a channel. Returns the subscriber count.
    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<u64, KvError>;

    /// Subscribe to every channel matching a glob pattern (`*` wildcard).
    /// The subscription ends when the returned receiver is dropped.
    async fn subscribe_pattern(
        &self,
        pattern: &str,
    ) -> Result<mpsc::Receiver<PubSubMessage>, KvError>;

    /// Create a stream and consumer group if either is absent. Idempotent:
    /// an already-existing group is not an error.
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), KvError>;

    /// Append an entry to a stream. Returns the assigned entry id.
    async fn stream_append(&self, stream: &str, payload: &[u8]) -> Result<String, KvError>;

    /// Read entries on behalf of a consumer within a group.
    ///
    /// With `new_only`, blocks up to `block_ms` for entries not yet
    /// delivered to any consumer in the group. Without it, returns this
    /// consumer's already-delivered, unacknowledged backlog immediately.
    /// Fails with [`KvError::MissingGroup`] if the group does not exist.
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: u64,
        new_only: bool,
    ) -> Result<Vec<StreamEntry>, KvError>;

    /// Acknowledge an entry for a group. Idempotent: returns false when the
    /// entry was not pending (already acknowledged or never delivered).
    async fn acknowledge(&self, stream: &str, group: &str, entry_id: &str)
        -> Result<bool, KvError>;
}
