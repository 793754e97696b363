use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::orchestrator::TaskOrchestrator;
use crate::queue::{ClaimedEntry, StreamQueue};

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Consumer name within the group. Must be stable across restarts of
    /// the same process slot so the pending backlog is redelivered to it.
    pub consumer: String,
    /// Max entries claimed per read.
    pub max_batch: usize,
    /// How long one read blocks waiting for new entries.
    pub block_ms: u64,
    /// Pause after a connectivity failure before the next read.
    pub backoff: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            consumer: format!("worker-{}", std::process::id()),
            max_batch: 16,
            block_ms: 1000,
            backoff: Duration::from_secs(1),
        }
    }
}

/// Spawn the consumer loop for one queue. Returns the token that stops it.
///
/// The loop drains this consumer's pending backlog once (work claimed
/// before a crash), then alternates bounded blocking reads with
/// cancellation checks, so shutdown is never delayed by more than one
/// read timeout.
pub fn start_consumer(
    queue: Arc<StreamQueue>,
    orchestrator: Arc<TaskOrchestrator>,
    config: ConsumerConfig,
) -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        run(queue, orchestrator, config, token).await;
    });
    cancel
}

async fn run(
    queue: Arc<StreamQueue>,
    orchestrator: Arc<TaskOrchestrator>,
    config: ConsumerConfig,
    cancel: CancellationToken,
) {
    info!(
        "consumer {} starting on {}/{}",
        config.consumer,
        queue.stream(),
        queue.group()
    );
    if let Err(e) = queue.ensure_group().await {
        warn!("could not ensure group at startup: {e}");
    }

    match queue.read_backlog(&config.consumer).await {
        Ok(backlog) => {
            if !backlog.is_empty() {
                info!("redelivering {} pending entries", backlog.len());
            }
            for entry in backlog {
                process(&queue, &orchestrator, entry).await;
            }
        }
        Err(e) => warn!("backlog read failed: {e}"),
    }

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("consumer {} stopping", config.consumer);
                return;
            }
            read = queue.read_new(&config.consumer, config.max_batch, config.block_ms) => {
                match read {
                    Ok(entries) => {
                        for entry in entries {
                            process(&queue, &orchestrator, entry).await;
                        }
                    }
                    Err(e) => {
                        warn!("queue read failed: {e}, backing off");
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            _ = tokio::time::sleep(config.backoff) => {}
                        }
                    }
                }
            }
        }
    }
}

/// Handle one claimed entry. The entry is acknowledged on every path
/// except a store failure during start, which leaves it pending for
/// redelivery.
async fn process(queue: &StreamQueue, orchestrator: &Arc<TaskOrchestrator>, entry: ClaimedEntry) {
    let (entry_id, item) = entry;
    let item = match item {
        Ok(item) => item,
        Err(poison) => {
            if let Err(e) = queue.discard_poison(&entry_id, &poison).await {
                warn!("could not discard poison entry {entry_id}: {e}");
            }
            return;
        }
    };

    match orchestrator.start(&item.task_id).await {
        Ok(started) => {
            if !started {
                // Missing, already running, or unhandled type: the entry
                // is spent either way.
                debug!("entry {entry_id}: task {} was not started", item.task_id);
            }
            if let Err(e) = queue.acknowledge(&entry_id).await {
                warn!("ack of {entry_id} failed: {e}");
            }
        }
        Err(e) => {
            warn!(
                "start of task {} failed: {e}; leaving entry {entry_id} pending",
                item.task_id
            );
        }
    }
}
