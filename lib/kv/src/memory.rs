use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Notify, mpsc};
use tokio::time::Instant;
use tracing::debug;

use crate::error::KvError;
use crate::traits::{KeyValueStore, PubSubMessage, StreamEntry};

/// MemoryStore is a complete in-process [`KeyValueStore`] implementation:
/// TTL bookkeeping, bounded lists, glob-pattern pub/sub, and streams with
/// consumer-group pending bookkeeping.
///
/// It backs every test in the workspace and works as the store for
/// single-process deployments where no external service is wanted.
/// Expiry uses lazy purging: expired keys are dropped on access.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    /// Wakes blocked group reads when a stream gains an entry.
    stream_signal: Notify,
}

#[derive(Default)]
struct Inner {
    strings: HashMap<String, Record>,
    lists: HashMap<String, ListRecord>,
    streams: HashMap<String, Stream>,
    subscribers: Vec<PatternSub>,
}

struct Record {
    value: Vec<u8>,
    expires: Option<Instant>,
}

struct ListRecord {
    items: VecDeque<Vec<u8>>,
    expires: Option<Instant>,
}

#[derive(Default)]
struct Stream {
    next_seq: u64,
    entries: Vec<(u64, Vec<u8>)>,
    groups: HashMap<String, Group>,
}

#[derive(Default)]
struct Group {
    /// Highest sequence number delivered to any consumer in the group.
    cursor: u64,
    /// entry id -> (consumer, payload); cleared on acknowledge.
    pending: HashMap<String, (String, Vec<u8>)>,
}

struct PatternSub {
    pattern: String,
    tx: mpsc::Sender<PubSubMessage>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The store stays usable even if a holder panicked mid-update.
    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn expired(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|d| Instant::now() >= d)
}

fn deadline(ttl_secs: u64) -> Option<Instant> {
    Some(Instant::now() + Duration::from_secs(ttl_secs))
}

/// Glob matching with `*` as the only metacharacter.
fn glob_match(pattern: &str, text: &str) -> bool {
    if !pattern.contains('*') {
        return pattern == text;
    }
    let parts: Vec<&str> = pattern.split('*').collect();
    let mut rest = text;
    let last = parts.len() - 1;
    for (i, part) in parts.iter().enumerate() {
        if i == 0 {
            let Some(stripped) = rest.strip_prefix(part) else {
                return false;
            };
            rest = stripped;
        } else if i == last {
            return part.is_empty() || rest.ends_with(part);
        } else if !part.is_empty() {
            match rest.find(part) {
                Some(idx) => rest = &rest[idx + part.len()..],
                None => return false,
            }
        }
    }
    true
}

/// Resolve a possibly-negative inclusive range against a list length.
/// Returns None when the range selects nothing.
fn resolve_range(len: usize, start: i64, stop: i64) -> Option<(usize, usize)> {
    let len = len as i64;
    let mut start = if start < 0 { len + start } else { start };
    let mut stop = if stop < 0 { len + stop } else { stop };
    start = start.max(0);
    stop = stop.min(len - 1);
    if len == 0 || start > stop || start >= len {
        return None;
    }
    Some((start as usize, stop as usize))
}

fn entry_id(seq: u64) -> String {
    format!("{seq}-0")
}

impl Inner {
    fn live_list(&mut self, key: &str) -> Option<&mut ListRecord> {
        if self.lists.get(key).is_some_and(|l| expired(l.expires)) {
            self.lists.remove(key);
        }
        self.lists.get_mut(key)
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        let mut inner = self.lock();
        if inner.strings.get(key).is_some_and(|r| expired(r.expires)) {
            inner.strings.remove(key);
        }
        Ok(inner.strings.get(key).map(|r| r.value.clone()))
    }

    async fn set_ex(&self, key: &str, value: &[u8], ttl_secs: u64) -> Result<(), KvError> {
        let mut inner = self.lock();
        inner.strings.insert(
            key.to_string(),
            Record {
                value: value.to_vec(),
                expires: deadline(ttl_secs),
            },
        );
        Ok(())
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<(), KvError> {
        let mut inner = self.lock();
        if let Some(record) = inner.strings.get_mut(key) {
            record.expires = deadline(ttl_secs);
        }
        if let Some(list) = inner.lists.get_mut(key) {
            list.expires = deadline(ttl_secs);
        }
        Ok(())
    }

    async fn list_push_left(&self, key: &str, value: &[u8]) -> Result<(), KvError> {
        let mut inner = self.lock();
        if inner.lists.get(key).is_some_and(|l| expired(l.expires)) {
            inner.lists.remove(key);
        }
        inner
            .lists
            .entry(key.to_string())
            .or_insert_with(|| ListRecord {
                items: VecDeque::new(),
                expires: None,
            })
            .items
            .push_front(value.to_vec());
        Ok(())
    }

    async fn list_trim(&self, key: &str, start: i64, stop: i64) -> Result<(), KvError> {
        let mut inner = self.lock();
        if let Some(list) = inner.live_list(key) {
            match resolve_range(list.items.len(), start, stop) {
                Some((start, stop)) => {
                    list.items = list.items.range(start..=stop).cloned().collect();
                }
                None => {
                    list.items.clear();
                }
            }
        }
        Ok(())
    }

    async fn list_range(&self, key: &str, start: i64, stop: i64) -> Result<Vec<Vec<u8>>, KvError> {
        let mut inner = self.lock();
        let Some(list) = inner.live_list(key) else {
            return Ok(Vec::new());
        };
        Ok(match resolve_range(list.items.len(), start, stop) {
            Some((start, stop)) => list.items.range(start..=stop).cloned().collect(),
            None => Vec::new(),
        })
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<u64, KvError> {
        let mut inner = self.lock();
        inner.subscribers.retain(|s| !s.tx.is_closed());
        let mut delivered = 0u64;
        for sub in &inner.subscribers {
            if !glob_match(&sub.pattern, channel) {
                continue;
            }
            let message = PubSubMessage {
                channel: channel.to_string(),
                payload: payload.to_vec(),
            };
            // A full subscriber drops the message, like real pub/sub
            // under backpressure.
            if sub.tx.try_send(message).is_ok() {
                delivered += 1;
            } else {
                debug!("dropping pub/sub message for slow subscriber '{}'", sub.pattern);
            }
        }
        Ok(delivered)
    }

    async fn subscribe_pattern(
        &self,
        pattern: &str,
    ) -> Result<mpsc::Receiver<PubSubMessage>, KvError> {
        let (tx, rx) = mpsc::channel(256);
        self.lock().subscribers.push(PatternSub {
            pattern: pattern.to_string(),
            tx,
        });
        Ok(rx)
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), KvError> {
        let mut inner = self.lock();
        inner
            .streams
            .entry(stream.to_string())
            .or_default()
            .groups
            .entry(group.to_string())
            .or_default();
        Ok(())
    }

    async fn stream_append(&self, stream: &str, payload: &[u8]) -> Result<String, KvError> {
        let id = {
            let mut inner = self.lock();
            let stream = inner.streams.entry(stream.to_string()).or_default();
            stream.next_seq += 1;
            let seq = stream.next_seq;
            stream.entries.push((seq, payload.to_vec()));
            entry_id(seq)
        };
        self.stream_signal.notify_waiters();
        Ok(id)
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
        let deadline = Instant::now() + Duration::from_millis(block_ms);
        loop {
            // Arm the wakeup before checking, so an append between the
            // check and the wait is not missed.
            let notified = self.stream_signal.notified();
            {
                let mut inner = self.lock();
                let Some(state) = inner.streams.get_mut(stream) else {
                    return Err(KvError::MissingGroup(format!("{stream}/{group}")));
                };
                let Some(grp) = state.groups.get_mut(group) else {
                    return Err(KvError::MissingGroup(format!("{stream}/{group}")));
                };

                if !new_only {
                    // Backlog: this consumer's delivered-but-unacked entries.
                    let mut backlog: Vec<StreamEntry> = grp
                        .pending
                        .iter()
                        .filter(|(_, (owner, _))| owner == consumer)
                        .map(|(id, (_, payload))| StreamEntry {
                            id: id.clone(),
                            payload: payload.clone(),
                        })
                        .collect();
                    // Ids are "{seq}-0"; order numerically, not lexically.
                    backlog.sort_by_key(|e| {
                        e.id.split('-')
                            .next()
                            .and_then(|s| s.parse::<u64>().ok())
                            .unwrap_or(u64::MAX)
                    });
                    backlog.truncate(count);
                    return Ok(backlog);
                }

                let fresh: Vec<(u64, Vec<u8>)> = state
                    .entries
                    .iter()
                    .filter(|(seq, _)| *seq > grp.cursor)
                    .take(count)
                    .cloned()
                    .collect();
                if !fresh.is_empty() {
                    let mut claimed = Vec::with_capacity(fresh.len());
                    for (seq, payload) in fresh {
                        grp.cursor = seq;
                        let id = entry_id(seq);
                        grp.pending
                            .insert(id.clone(), (consumer.to_string(), payload.clone()));
                        claimed.push(StreamEntry { id, payload });
                    }
                    return Ok(claimed);
                }
            }

            if Instant::now() >= deadline {
                return Ok(Vec::new());
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(deadline) => return Ok(Vec::new()),
            }
        }
    }

    async fn acknowledge(
        &self,
        stream: &str,
        group: &str,
        entry_id: &str,
    ) -> Result<bool, KvError> {
        let mut inner = self.lock();
        let Some(grp) = inner
            .streams
            .get_mut(stream)
            .and_then(|s| s.groups.get_mut(group))
        else {
            return Ok(false);
        };
        Ok(grp.pending.remove(entry_id).is_some())
    }
}
