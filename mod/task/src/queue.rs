use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use docpipe_kv::{KeyValueStore, KvError};

/// A unit of work enqueued for the worker pool.
///
/// The payload stays deliberately thin: the task id plus execution
/// arguments. Everything else about the task lives in its durable record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkItem {
    pub task_id: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

/// What to do with an entry whose payload cannot be deserialized.
///
/// Either way the entry is acknowledged: a poison message must never
/// block the consumer group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoisonPolicy {
    /// Log the entry and acknowledge it.
    AckAndDrop,
    /// Push the raw payload to a dead-letter list, then acknowledge.
    DeadLetter(String),
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub stream: String,
    pub group: String,
    pub poison: PoisonPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            stream: "tasks:work".into(),
            group: "workers".into(),
            poison: PoisonPolicy::AckAndDrop,
        }
    }
}

/// An entry whose payload failed to decode. Carries the raw bytes so the
/// dead-letter policy can preserve them.
#[derive(Debug, Clone)]
pub struct PoisonPayload {
    pub raw: Vec<u8>,
    pub reason: String,
}

/// One entry claimed from the queue: its stream id and the decode attempt.
/// Undecodable payloads surface as `Err` so the caller can apply the
/// poison policy instead of losing the entry id.
pub type ClaimedEntry = (String, Result<WorkItem, PoisonPayload>);

/// Durable, ordered, at-least-once work queue over one (stream, group)
/// pair of the shared store.
///
/// Entries are claimed by exactly one consumer in the group until
/// acknowledged; unacknowledged entries stay in that consumer's pending
/// backlog and are redelivered via [`StreamQueue::read_backlog`] after a
/// crash.
pub struct StreamQueue {
    kv: Arc<dyn KeyValueStore>,
    config: QueueConfig,
}

impl StreamQueue {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self::with_config(kv, QueueConfig::default())
    }

    pub fn with_config(kv: Arc<dyn KeyValueStore>, config: QueueConfig) -> Self {
        Self { kv, config }
    }

    pub fn stream(&self) -> &str {
        &self.config.stream
    }

    pub fn group(&self) -> &str {
        &self.config.group
    }

    /// Create the stream and consumer group if either is absent.
    pub async fn ensure_group(&self) -> Result<(), KvError> {
        self.kv
            .ensure_group(&self.config.stream, &self.config.group)
            .await
    }

    /// Append a work item. Returns the store-assigned entry id.
    pub async fn publish(&self, item: &WorkItem) -> Result<String, KvError> {
        let payload =
            serde_json::to_vec(item).map_err(|e| KvError::Serialization(e.to_string()))?;
        let id = self.kv.stream_append(&self.config.stream, &payload).await?;
        debug!("enqueued task {} as entry {id}", item.task_id);
        Ok(id)
    }

    /// Block up to `block_ms` for entries not yet delivered to any
    /// consumer in the group.
    ///
    /// A missing group (lost store state, first run against a fresh
    /// store) is recreated transparently and the read retried once.
    pub async fn read_new(
        &self,
        consumer: &str,
        max: usize,
        block_ms: u64,
    ) -> Result<Vec<ClaimedEntry>, KvError> {
        match self.read(consumer, max, block_ms, true).await {
            Err(KvError::MissingGroup(_)) => {
                info!(
                    "group {}/{} missing, recreating",
                    self.config.stream, self.config.group
                );
                self.ensure_group().await?;
                self.read(consumer, max, block_ms, true).await
            }
            other => other,
        }
    }

    /// This consumer's already-delivered, unacknowledged entries.
    /// Drained once at startup to recover work lost to a crash.
    pub async fn read_backlog(&self, consumer: &str) -> Result<Vec<ClaimedEntry>, KvError> {
        match self.read(consumer, 64, 0, false).await {
            Err(KvError::MissingGroup(_)) => {
                self.ensure_group().await?;
                Ok(Vec::new())
            }
            other => other,
        }
    }

    async fn read(
        &self,
        consumer: &str,
        max: usize,
        block_ms: u64,
        new_only: bool,
    ) -> Result<Vec<ClaimedEntry>, KvError> {
        let entries = self
            .kv
            .read_group(
                &self.config.stream,
                &self.config.group,
                consumer,
                max,
                block_ms,
                new_only,
            )
            .await?;
        Ok(entries
            .into_iter()
            .map(|entry| {
                let item = match serde_json::from_slice(&entry.payload) {
                    Ok(item) => Ok(item),
                    Err(e) => Err(PoisonPayload {
                        raw: entry.payload,
                        reason: e.to_string(),
                    }),
                };
                (entry.id, item)
            })
            .collect())
    }

    /// Mark an entry processed. Idempotent.
    pub async fn acknowledge(&self, entry_id: &str) -> Result<(), KvError> {
        let acked = self
            .kv
            .acknowledge(&self.config.stream, &self.config.group, entry_id)
            .await?;
        if !acked {
            debug!("entry {entry_id} was not pending");
        }
        Ok(())
    }

    /// Apply the poison policy to an undecodable entry, then acknowledge
    /// it so it cannot block the group.
    pub async fn discard_poison(
        &self,
        entry_id: &str,
        poison: &PoisonPayload,
    ) -> Result<(), KvError> {
        match &self.config.poison {
            PoisonPolicy::AckAndDrop => {
                warn!("dropping poison entry {entry_id}: {}", poison.reason);
            }
            PoisonPolicy::DeadLetter(list_key) => {
                warn!(
                    "dead-lettering poison entry {entry_id} to {list_key}: {}",
                    poison.reason
                );
                let record = serde_json::json!({
                    "entryId": entry_id,
                    "stream": self.config.stream,
                    "reason": poison.reason,
                    "payload": String::from_utf8_lossy(&poison.raw),
                });
                let bytes = serde_json::to_vec(&record)
                    .map_err(|e| KvError::Serialization(e.to_string()))?;
                self.kv.list_push_left(list_key, &bytes).await?;
            }
        }
        self.acknowledge(entry_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docpipe_kv::MemoryStore;

    fn make_queue() -> (Arc<MemoryStore>, StreamQueue) {
        let kv = Arc::new(MemoryStore::new());
        let queue = StreamQueue::new(Arc::clone(&kv) as Arc<dyn KeyValueStore>);
        (kv, queue)
    }

    fn item(task_id: &str) -> WorkItem {
        WorkItem {
            task_id: task_id.into(),
            args: serde_json::json!({"pages": 12}),
        }
    }

    #[tokio::test]
    async fn publish_then_read_new() {
        let (_kv, queue) = make_queue();
        queue.ensure_group().await.unwrap();
        queue.publish(&item("t1")).await.unwrap();

        let claimed = queue.read_new("c1", 10, 0).await.unwrap();
        assert_eq!(claimed.len(), 1);
        let (_, decoded) = &claimed[0];
        assert_eq!(decoded.as_ref().unwrap(), &item("t1"));
    }

    #[tokio::test]
    async fn ensure_group_is_idempotent() {
        let (_kv, queue) = make_queue();
        queue.ensure_group().await.unwrap();
        queue.ensure_group().await.unwrap();
    }

    #[tokio::test]
    async fn read_new_recreates_missing_group() {
        let (_kv, queue) = make_queue();
        // No ensure_group call: first read hits NOGROUP and recovers.
        let claimed = queue.read_new("c1", 10, 0).await.unwrap();
        assert!(claimed.is_empty());

        queue.publish(&item("t1")).await.unwrap();
        let claimed = queue.read_new("c1", 10, 0).await.unwrap();
        assert_eq!(claimed.len(), 1);
    }

    #[tokio::test]
    async fn entry_claimed_by_one_consumer() {
        let (_kv, queue) = make_queue();
        queue.ensure_group().await.unwrap();
        queue.publish(&item("t1")).await.unwrap();

        let first = queue.read_new("c1", 10, 0).await.unwrap();
        let second = queue.read_new("c2", 10, 0).await.unwrap();
        assert_eq!(first.len(), 1);
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn unacked_entry_stays_in_backlog() {
        let (_kv, queue) = make_queue();
        queue.ensure_group().await.unwrap();
        queue.publish(&item("t1")).await.unwrap();

        let claimed = queue.read_new("c1", 10, 0).await.unwrap();
        let (entry_id, _) = &claimed[0];

        // Simulated restart: the pending entry is redelivered to c1.
        let backlog = queue.read_backlog("c1").await.unwrap();
        assert_eq!(backlog.len(), 1);
        assert_eq!(&backlog[0].0, entry_id);

        queue.acknowledge(entry_id).await.unwrap();
        assert!(queue.read_backlog("c1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn double_acknowledge_is_a_noop() {
        let (_kv, queue) = make_queue();
        queue.ensure_group().await.unwrap();
        queue.publish(&item("t1")).await.unwrap();

        let claimed = queue.read_new("c1", 10, 0).await.unwrap();
        let (entry_id, _) = &claimed[0];
        queue.acknowledge(entry_id).await.unwrap();
        queue.acknowledge(entry_id).await.unwrap();
    }

    #[tokio::test]
    async fn bad_payload_surfaces_as_err_with_entry_id() {
        let (kv, queue) = make_queue();
        queue.ensure_group().await.unwrap();
        kv.stream_append("tasks:work", b"{not json").await.unwrap();

        let claimed = queue.read_new("c1", 10, 0).await.unwrap();
        assert_eq!(claimed.len(), 1);
        let (entry_id, decoded) = &claimed[0];
        let poison = decoded.as_ref().unwrap_err();
        assert_eq!(poison.raw, b"{not json");

        queue.discard_poison(entry_id, poison).await.unwrap();
        assert!(queue.read_backlog("c1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn dead_letter_policy_records_the_entry() {
        let kv = Arc::new(MemoryStore::new());
        let queue = StreamQueue::with_config(
            Arc::clone(&kv) as Arc<dyn KeyValueStore>,
            QueueConfig {
                poison: PoisonPolicy::DeadLetter("tasks:dead".into()),
                ..Default::default()
            },
        );
        queue.ensure_group().await.unwrap();
        kv.stream_append("tasks:work", b"garbage").await.unwrap();

        let claimed = queue.read_new("c1", 10, 0).await.unwrap();
        let (entry_id, decoded) = &claimed[0];
        let poison = decoded.as_ref().unwrap_err();
        queue.discard_poison(entry_id, poison).await.unwrap();

        let dead = kv.list_range("tasks:dead", 0, -1).await.unwrap();
        assert_eq!(dead.len(), 1);
        let record: serde_json::Value = serde_json::from_slice(&dead[0]).unwrap();
        assert_eq!(record["entryId"], *entry_id);
        assert_eq!(record["payload"], "garbage");
    }

    #[tokio::test]
    async fn work_item_wire_shape() {
        let json = serde_json::to_value(item("t1")).unwrap();
        assert_eq!(json["taskId"], "t1");
        assert_eq!(json["args"]["pages"], 12);

        // args is optional on the wire
        let thin: WorkItem = serde_json::from_str(r#"{"taskId":"t2"}"#).unwrap();
        assert_eq!(thin.task_id, "t2");
        assert!(thin.args.is_null());
    }
}
