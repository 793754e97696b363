use async_trait::async_trait;
use futures::StreamExt;
use redis::{AsyncCommands, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::KvError;
use crate::traits::{KeyValueStore, PubSubMessage, StreamEntry};

/// Field name queue payloads are stored under in stream entries.
const PAYLOAD_FIELD: &str = "payload";

/// ValkeyStore is a [`KeyValueStore`] backed by a Redis-protocol server
/// (Valkey/Redis). Command traffic shares one multiplexed connection;
/// each pattern subscription drives its own pub/sub connection.
pub struct ValkeyStore {
    client: redis::Client,
    conn: redis::aio::MultiplexedConnection,
}

impl ValkeyStore {
    /// Connect to the store at the given URL (`redis://host:port/db`).
    pub async fn connect(url: &str) -> Result<Self, KvError> {
        let client = redis::Client::open(url)
            .map_err(|e| KvError::Storage(format!("invalid store url {url}: {e}")))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(map_err)?;
        Ok(Self { client, conn })
    }
}

/// Map a driver error to the boundary taxonomy: transport failures are
/// retryable Unavailable, a NOGROUP reply is MissingGroup, the rest are
/// plain storage errors.
fn map_err(e: redis::RedisError) -> KvError {
    if e.code() == Some("NOGROUP") {
        return KvError::MissingGroup(e.to_string());
    }
    if e.is_io_error() || e.is_timeout() {
        return KvError::Unavailable(e.to_string());
    }
    KvError::Storage(e.to_string())
}

fn is_busy_group_error(e: &redis::RedisError) -> bool {
    e.to_string().to_ascii_uppercase().contains("BUSYGROUP")
}

impl ValkeyStore {
    fn conn(&self) -> redis::aio::MultiplexedConnection {
        self.conn.clone()
    }
}

#[async_trait]
impl KeyValueStore for ValkeyStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        self.conn().get(key).await.map_err(map_err)
    }

    async fn set_ex(&self, key: &str, value: &[u8], ttl_secs: u64) -> Result<(), KvError> {
        self.conn()
            .set_ex::<_, _, ()>(key, value, ttl_secs)
            .await
            .map_err(map_err)
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<(), KvError> {
        self.conn()
            .expire::<_, ()>(key, ttl_secs as i64)
            .await
            .map_err(map_err)
    }

    async fn list_push_left(&self, key: &str, value: &[u8]) -> Result<(), KvError> {
        self.conn()
            .lpush::<_, _, ()>(key, value)
            .await
            .map_err(map_err)
    }

    async fn list_trim(&self, key: &str, start: i64, stop: i64) -> Result<(), KvError> {
        self.conn()
            .ltrim::<_, ()>(key, start as isize, stop as isize)
            .await
            .map_err(map_err)
    }

    async fn list_range(&self, key: &str, start: i64, stop: i64) -> Result<Vec<Vec<u8>>, KvError> {
        self.conn()
            .lrange(key, start as isize, stop as isize)
            .await
            .map_err(map_err)
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<u64, KvError> {
        self.conn().publish(channel, payload).await.map_err(map_err)
    }

    async fn subscribe_pattern(
        &self,
        pattern: &str,
    ) -> Result<mpsc::Receiver<PubSubMessage>, KvError> {
        let mut pubsub = self.client.get_async_pubsub().await.map_err(map_err)?;
        pubsub.psubscribe(pattern).await.map_err(map_err)?;

        let (tx, rx) = mpsc::channel(256);
        let pattern = pattern.to_string();
        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let message = PubSubMessage {
                    channel: msg.get_channel_name().to_string(),
                    payload: msg.get_payload::<Vec<u8>>().unwrap_or_default(),
                };
                if tx.send(message).await.is_err() {
                    // Receiver dropped — subscription is over.
                    break;
                }
            }
            debug!("pattern subscription '{pattern}' ended");
        });
        Ok(rx)
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), KvError> {
        let result: redis::RedisResult<String> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut self.conn())
            .await;

        match result {
            Ok(_) => {
                debug!("consumer group '{group}' created on stream '{stream}'");
                Ok(())
            }
            Err(e) if is_busy_group_error(&e) => Ok(()),
            Err(e) => Err(map_err(e)),
        }
    }

    async fn stream_append(&self, stream: &str, payload: &[u8]) -> Result<String, KvError> {
        redis::cmd("XADD")
            .arg(stream)
            .arg("*")
            .arg(PAYLOAD_FIELD)
            .arg(payload)
            .query_async(&mut self.conn())
            .await
            .map_err(map_err)
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: u64,
        new_only: bool,
    ) -> Result<Vec<StreamEntry>, KvError> {
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(group)
            .arg(consumer)
            .arg("COUNT")
            .arg(count);
        if new_only {
            // Only new reads block; a backlog read returns immediately.
            cmd.arg("BLOCK").arg(block_ms);
        }
        cmd.arg("STREAMS")
            .arg(stream)
            .arg(if new_only { ">" } else { "0" });

        let reply: Value = cmd.query_async(&mut self.conn()).await.map_err(map_err)?;
        parse_read_reply(reply)
    }

    async fn acknowledge(
        &self,
        stream: &str,
        group: &str,
        entry_id: &str,
    ) -> Result<bool, KvError> {
        let acked: u64 = redis::cmd("XACK")
            .arg(stream)
            .arg(group)
            .arg(entry_id)
            .query_async(&mut self.conn())
            .await
            .map_err(map_err)?;
        Ok(acked > 0)
    }
}

// ── XREADGROUP reply parsing ────────────────────────────────────────
//
// The reply nests streams → entries → field/value pairs, and arrives
// either as arrays (RESP2) or maps (RESP3).

fn parse_read_reply(reply: Value) -> Result<Vec<StreamEntry>, KvError> {
    match reply {
        Value::Nil => Ok(Vec::new()),
        Value::Array(streams) => {
            let mut entries = Vec::new();
            for stream in streams {
                if let Value::Array(parts) = stream
                    && parts.len() >= 2
                {
                    parse_entries(&parts[1], &mut entries);
                }
            }
            Ok(entries)
        }
        Value::Map(streams) => {
            let mut entries = Vec::new();
            for (_, stream_entries) in streams {
                parse_entries(&stream_entries, &mut entries);
            }
            Ok(entries)
        }
        other => Err(KvError::Storage(format!(
            "unexpected stream read reply: {other:?}"
        ))),
    }
}

fn parse_entries(value: &Value, out: &mut Vec<StreamEntry>) {
    let Value::Array(items) = value else { return };
    for item in items {
        let Value::Array(parts) = item else { continue };
        let (Some(id), Some(fields)) = (parts.first(), parts.get(1)) else {
            continue;
        };
        let Some(id) = value_to_string(id) else {
            continue;
        };
        if let Some(payload) = field_bytes(fields, PAYLOAD_FIELD) {
            out.push(StreamEntry { id, payload });
        } else {
            warn!("stream entry {id} has no '{PAYLOAD_FIELD}' field, skipping");
        }
    }
}

/// Extract one named field from an entry's field list (array or map form).
fn field_bytes(fields: &Value, name: &str) -> Option<Vec<u8>> {
    match fields {
        Value::Map(pairs) => pairs
            .iter()
            .find(|(k, _)| value_to_string(k).as_deref() == Some(name))
            .and_then(|(_, v)| value_to_bytes(v)),
        Value::Array(parts) => parts
            .chunks(2)
            .find(|pair| pair.first().and_then(value_to_string).as_deref() == Some(name))
            .and_then(|pair| pair.get(1).and_then(value_to_bytes)),
        _ => None,
    }
}

fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::BulkString(bytes) => Some(String::from_utf8_lossy(bytes).to_string()),
        Value::SimpleString(s) => Some(s.clone()),
        _ => None,
    }
}

fn value_to_bytes(value: &Value) -> Option<Vec<u8>> {
    match value {
        Value::BulkString(bytes) => Some(bytes.clone()),
        Value::SimpleString(s) => Some(s.as_bytes().to_vec()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bulk(s: &str) -> Value {
        Value::BulkString(s.as_bytes().to_vec())
    }

    #[test]
    fn parse_resp2_reply() {
        // [[stream, [[id, [field, value]]]]]
        let reply = Value::Array(vec![Value::Array(vec![
            bulk("doc:parse:stream"),
            Value::Array(vec![Value::Array(vec![
                bulk("1-0"),
                Value::Array(vec![bulk("payload"), bulk("{\"taskId\":\"t1\"}")]),
            ])]),
        ])]);

        let entries = parse_read_reply(reply).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, "1-0");
        assert_eq!(entries[0].payload, b"{\"taskId\":\"t1\"}");
    }

    #[test]
    fn parse_resp3_map_reply() {
        let reply = Value::Map(vec![(
            bulk("doc:parse:stream"),
            Value::Array(vec![Value::Array(vec![
                bulk("2-0"),
                Value::Map(vec![(bulk("payload"), bulk("x"))]),
            ])]),
        )]);

        let entries = parse_read_reply(reply).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, "2-0");
        assert_eq!(entries[0].payload, b"x");
    }

    #[test]
    fn io_failures_map_to_unavailable() {
        let e = redis::RedisError::from(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "connection refused",
        ));
        assert!(matches!(map_err(e), KvError::Unavailable(_)));
    }

    #[test]
    fn parse_nil_reply_is_empty() {
        assert!(parse_read_reply(Value::Nil).unwrap().is_empty());
    }

    #[test]
    fn entries_without_payload_field_are_skipped() {
        let reply = Value::Array(vec![Value::Array(vec![
            bulk("s"),
            Value::Array(vec![Value::Array(vec![
                bulk("3-0"),
                Value::Array(vec![bulk("other"), bulk("x")]),
            ])]),
        ])]);
        assert!(parse_read_reply(reply).unwrap().is_empty());
    }
}
