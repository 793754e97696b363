use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use docpipe_kv::KeyValueStore;
use docpipe_task::model::{EVENT_CHANNEL_PREFIX, TaskEvent, TaskEventKind};

use crate::hub::NotificationHub;
use crate::protocol::ServerMessage;

/// Pause before re-subscribing after the pub/sub channel drops.
const RESUBSCRIBE_BACKOFF: Duration = Duration::from_secs(1);

struct BridgeState {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Pump between the shared publish/subscribe channel and the local hub.
///
/// One per serving process: pattern-subscribes to every per-task event
/// channel and pushes each event to the connections subscribed to that
/// task on this process's hub. Workers on other processes publish to the
/// same channels, so locally-connected clients see every event no matter
/// where it was produced.
pub struct ProgressBridge {
    kv: Arc<dyn KeyValueStore>,
    hub: Arc<NotificationHub>,
    state: tokio::sync::Mutex<Option<BridgeState>>,
}

impl ProgressBridge {
    pub fn new(kv: Arc<dyn KeyValueStore>, hub: Arc<NotificationHub>) -> Self {
        Self {
            kv,
            hub,
            state: tokio::sync::Mutex::new(None),
        }
    }

    /// Start the pump loop. Idempotent: a second call while running is a
    /// no-op.
    pub async fn start(&self) {
        let mut state = self.state.lock().await;
        if state.is_some() {
            debug!("progress bridge already running");
            return;
        }
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run(
            Arc::clone(&self.kv),
            Arc::clone(&self.hub),
            cancel.clone(),
        ));
        *state = Some(BridgeState { cancel, handle });
        info!("progress bridge started");
    }

    /// Stop the pump loop and wait for it to finish. Idempotent.
    pub async fn stop(&self) {
        let Some(BridgeState { cancel, handle }) = self.state.lock().await.take() else {
            return;
        };
        cancel.cancel();
        if let Err(e) = handle.await {
            error!("progress bridge loop panicked: {e}");
        }
        info!("progress bridge stopped");
    }
}

async fn run(kv: Arc<dyn KeyValueStore>, hub: Arc<NotificationHub>, cancel: CancellationToken) {
    let pattern = format!("{EVENT_CHANNEL_PREFIX}*");
    loop {
        let mut rx = match kv.subscribe_pattern(&pattern).await {
            Ok(rx) => rx,
            Err(e) => {
                warn!("event subscription failed: {e}, retrying");
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(RESUBSCRIBE_BACKOFF) => continue,
                }
            }
        };
        debug!("subscribed to {pattern}");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                msg = rx.recv() => {
                    let Some(msg) = msg else {
                        warn!("event subscription ended, re-subscribing");
                        break;
                    };
                    dispatch(&hub, &msg.channel, &msg.payload).await;
                }
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(RESUBSCRIBE_BACKOFF) => {}
        }
    }
}

/// Decode one published event and broadcast it. Malformed input is
/// logged and skipped; the pump never dies on bad data.
async fn dispatch(hub: &NotificationHub, channel: &str, payload: &[u8]) {
    let Some(task_id) = channel.strip_prefix(EVENT_CHANNEL_PREFIX) else {
        warn!("event on unexpected channel {channel}, skipping");
        return;
    };
    let event: TaskEvent = match serde_json::from_slice(payload) {
        Ok(event) => event,
        Err(e) => {
            warn!("malformed event on {channel}: {e}, skipping");
            return;
        }
    };

    let message = to_server_message(task_id, event);
    hub.broadcast_to_task_subscribers(task_id, &message).await;
}

fn to_server_message(task_id: &str, event: TaskEvent) -> ServerMessage {
    let task_id = task_id.to_string();
    match event.kind {
        TaskEventKind::Progress => ServerMessage::TaskProgress {
            task_id,
            progress: event.progress.unwrap_or(0),
            message: event.message,
        },
        TaskEventKind::Completed => ServerMessage::TaskCompleted {
            task_id,
            result: event.result,
        },
        TaskEventKind::Failed => ServerMessage::TaskFailed {
            task_id,
            error: event.error,
        },
        TaskEventKind::Cancelled => ServerMessage::TaskCancelled { task_id },
    }
}
