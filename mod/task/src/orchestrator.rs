use std::collections::HashMap;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use docpipe_core::{ServiceError, now_rfc3339};
use docpipe_kv::KeyValueStore;

use crate::model::{Task, TaskEvent, TaskEventKind, TaskStatus, event_channel};
use crate::registry::TaskRegistry;

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

pub type HandlerResult = Result<serde_json::Value, ServiceError>;
pub type HandlerFuture = BoxFuture<'static, HandlerResult>;

/// Async handler for one task type. Receives the task snapshot and a
/// [`HandlerContext`] restricted to progress reporting and cancellation
/// observation.
pub type HandlerFn = Arc<dyn Fn(Task, HandlerContext) -> HandlerFuture + Send + Sync>;

/// The slice of orchestrator capability a running handler sees.
///
/// Cancellation is cooperative: the handler is expected to check or wait
/// on the token at reasonable intervals. A handler that never looks at it
/// is not preempted — a known limitation of this design.
pub struct HandlerContext {
    task_id: String,
    orchestrator: Arc<TaskOrchestrator>,
    cancel: CancellationToken,
}

impl HandlerContext {
    /// Report progress (clamped to 0–100) with an optional message.
    pub async fn update_progress(
        &self,
        percent: i64,
        message: Option<&str>,
    ) -> Result<(), ServiceError> {
        self.orchestrator
            .update_progress(&self.task_id, percent, message)
            .await
    }

    /// The cooperative cancellation token for this execution.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

// ---------------------------------------------------------------------------
// TaskOrchestrator — state machine
// ---------------------------------------------------------------------------

/// How a finished execution reached its terminal state.
enum Outcome {
    Completed(serde_json::Value),
    Failed(String),
    Cancelled,
}

/// The task lifecycle state machine.
///
/// Owns every task mutation after creation: `pending -> running ->
/// {completed, failed, cancelled}`, with no way out of a terminal state.
/// Handlers run as cancellable background executions tracked in a local
/// running table; whichever of {handler completion, cancellation} first
/// persists a terminal status wins, the loser re-reads the record,
/// observes it terminal, and abandons without overwriting.
pub struct TaskOrchestrator {
    registry: Arc<TaskRegistry>,
    kv: Arc<dyn KeyValueStore>,
    /// Registered handlers by task type (in-memory, last registration wins).
    handlers: Mutex<HashMap<String, HandlerFn>>,
    /// Cancellation tokens for executions running in this process.
    /// Removal of an entry doubles as the terminal-write claim.
    running: Mutex<HashMap<String, CancellationToken>>,
}

impl TaskOrchestrator {
    pub fn new(registry: Arc<TaskRegistry>, kv: Arc<dyn KeyValueStore>) -> Self {
        Self {
            registry,
            kv,
            handlers: Mutex::new(HashMap::new()),
            running: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    // =======================================================================
    // Handler registration
    // =======================================================================

    /// Associate a task type with a handler. Last registration wins.
    pub async fn register_handler(&self, task_type: &str, handler: HandlerFn) {
        self.handlers
            .lock()
            .await
            .insert(task_type.to_string(), handler);
    }

    /// Convenience wrapper for plain async closures.
    pub async fn register<F, Fut>(&self, task_type: &str, handler: F)
    where
        F: Fn(Task, HandlerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.register_handler(task_type, Arc::new(move |task, ctx| handler(task, ctx).boxed()))
            .await;
    }

    // =======================================================================
    // Lifecycle
    // =======================================================================

    /// Start a PENDING task: persist RUNNING and launch its handler as a
    /// cancellable background execution.
    ///
    /// Returns false — with no state change — when the task does not
    /// exist, has no registered handler, or is not PENDING.
    pub async fn start(self: &Arc<Self>, task_id: &str) -> Result<bool, ServiceError> {
        let Some(task) = self.registry.get(task_id).await? else {
            warn!("start: task {task_id} not found");
            return Ok(false);
        };

        let handler = self.handlers.lock().await.get(&task.task_type).cloned();
        let Some(handler) = handler else {
            warn!("start: no handler registered for type '{}'", task.task_type);
            return Ok(false);
        };

        // The running lock is held across the status check and save so two
        // local starts cannot both claim the task.
        let mut running = self.running.lock().await;
        if running.contains_key(task_id) {
            debug!("start: task {task_id} already running here");
            return Ok(false);
        }
        let Some(mut task) = self.registry.get(task_id).await? else {
            return Ok(false);
        };
        if task.status != TaskStatus::Pending {
            debug!("start: task {task_id} is {}, not PENDING", task.status);
            return Ok(false);
        }

        task.status = TaskStatus::Running;
        task.started_at = Some(now_rfc3339());
        self.registry.save(&task).await?;

        let cancel = CancellationToken::new();
        running.insert(task_id.to_string(), cancel.clone());
        drop(running);

        info!("task {task_id} ({}) started", task.task_type);
        self.spawn_execution(task, handler, cancel);
        Ok(true)
    }

    fn spawn_execution(self: &Arc<Self>, task: Task, handler: HandlerFn, cancel: CancellationToken) {
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            let task_id = task.id.clone();
            let ctx = HandlerContext {
                task_id: task_id.clone(),
                orchestrator: Arc::clone(&orchestrator),
                cancel: cancel.clone(),
            };
            tokio::select! {
                _ = cancel.cancelled() => {
                    // cancel() persists the terminal state; nothing to do.
                    debug!("task {task_id} execution stopped by cancellation");
                }
                result = handler(task, ctx) => {
                    // A woken handler can return after the token fired; the
                    // cancellation requested first takes precedence over
                    // whatever the handler produced on its way out.
                    if cancel.is_cancelled() {
                        debug!("task {task_id} cancelled before its handler result was recorded");
                        return;
                    }
                    let outcome = match result {
                        Ok(value) => Outcome::Completed(value),
                        Err(e) => Outcome::Failed(e.to_string()),
                    };
                    if let Err(e) = orchestrator.finalize(&task_id, outcome).await {
                        error!("task {task_id}: failed to persist terminal state: {e}");
                    }
                }
            }
        });
    }

    /// Report progress for a running task. Clamps percent to [0, 100],
    /// never decreases progress, and publishes a progress event.
    /// Silently returns if the record no longer exists (expired or raced
    /// with retention).
    pub async fn update_progress(
        &self,
        task_id: &str,
        percent: i64,
        message: Option<&str>,
    ) -> Result<(), ServiceError> {
        let Some(mut task) = self.registry.get(task_id).await? else {
            debug!("progress for vanished task {task_id}, ignoring");
            return Ok(());
        };
        if task.status.is_terminal() {
            return Ok(());
        }

        let clamped = percent.clamp(0, 100) as u8;
        task.progress = task.progress.max(clamped);
        if let Some(message) = message {
            task.description = message.to_string();
        }
        self.registry.save(&task).await?;

        self.publish_event(TaskEvent {
            kind: TaskEventKind::Progress,
            task_id: task_id.to_string(),
            progress: Some(task.progress),
            message: message.map(str::to_string),
            result: None,
            error: None,
            timestamp: now_rfc3339(),
        })
        .await;
        Ok(())
    }

    /// Mark a task COMPLETED with its result payload.
    pub async fn complete(
        &self,
        task_id: &str,
        result: serde_json::Value,
    ) -> Result<(), ServiceError> {
        self.finalize(task_id, Outcome::Completed(result)).await?;
        Ok(())
    }

    /// Mark a task FAILED with an error description.
    pub async fn fail(&self, task_id: &str, error: &str) -> Result<(), ServiceError> {
        self.finalize(task_id, Outcome::Failed(error.to_string()))
            .await?;
        Ok(())
    }

    /// Cancel a task running in this process.
    ///
    /// Returns false when the task is not in the local running table, or
    /// when the handler's own completion won the race and persisted a
    /// terminal state first.
    pub async fn cancel(&self, task_id: &str) -> Result<bool, ServiceError> {
        let token = { self.running.lock().await.get(task_id).cloned() };
        let Some(token) = token else {
            debug!("cancel: task {task_id} is not running here");
            return Ok(false);
        };

        token.cancel();
        let won = self.finalize(task_id, Outcome::Cancelled).await?;
        if won {
            info!("task {task_id} cancelled");
        }
        Ok(won)
    }

    /// Persist a terminal state, first-writer-wins.
    ///
    /// The running-table lock serializes terminal writers; the re-read
    /// under that lock is the authoritative "already terminal" guard.
    /// Returns whether this call performed the terminal write.
    async fn finalize(&self, task_id: &str, outcome: Outcome) -> Result<bool, ServiceError> {
        let mut running = self.running.lock().await;
        let Some(mut task) = self.registry.get(task_id).await? else {
            running.remove(task_id);
            warn!("finalize: task {task_id} record vanished");
            return Ok(false);
        };
        if task.status.is_terminal() {
            running.remove(task_id);
            return Ok(false);
        }

        let (kind, final_progress) = match outcome {
            Outcome::Completed(result) => {
                task.status = TaskStatus::Completed;
                task.result = Some(result);
                task.progress = 100;
                (TaskEventKind::Completed, 100)
            }
            Outcome::Failed(error) => {
                task.status = TaskStatus::Failed;
                task.error = Some(error);
                (TaskEventKind::Failed, task.progress)
            }
            Outcome::Cancelled => {
                task.status = TaskStatus::Cancelled;
                (TaskEventKind::Cancelled, task.progress)
            }
        };
        task.completed_at = Some(now_rfc3339());
        self.registry.save(&task).await?;
        running.remove(task_id);
        drop(running);

        self.publish_event(TaskEvent {
            kind,
            task_id: task_id.to_string(),
            progress: Some(final_progress),
            message: None,
            result: task.result.clone(),
            error: task.error.clone(),
            timestamp: now_rfc3339(),
        })
        .await;
        Ok(true)
    }

    /// Publish an event on the task's channel. Publication is best-effort:
    /// the durable record is already consistent, subscribers converge on
    /// their next snapshot poll.
    async fn publish_event(&self, event: TaskEvent) {
        let channel = event_channel(&event.task_id);
        let payload = match serde_json::to_vec(&event) {
            Ok(payload) => payload,
            Err(e) => {
                error!("unserializable task event on {channel}: {e}");
                return;
            }
        };
        if let Err(e) = self.kv.publish(&channel, &payload).await {
            warn!("publish on {channel} failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::NewTask;
    use docpipe_kv::MemoryStore;
    use std::time::Duration;
    use tokio::sync::Notify;

    struct Fixture {
        kv: Arc<MemoryStore>,
        registry: Arc<TaskRegistry>,
        orchestrator: Arc<TaskOrchestrator>,
    }

    fn make_fixture() -> Fixture {
        let kv = Arc::new(MemoryStore::new());
        let store: Arc<dyn KeyValueStore> = Arc::clone(&kv) as Arc<dyn KeyValueStore>;
        let registry = Arc::new(TaskRegistry::new(Arc::clone(&store)));
        let orchestrator = Arc::new(TaskOrchestrator::new(Arc::clone(&registry), store));
        Fixture {
            kv,
            registry,
            orchestrator,
        }
    }

    async fn make_task(f: &Fixture, task_type: &str) -> Task {
        f.registry
            .create(NewTask {
                task_type: task_type.into(),
                project_id: "p1".into(),
                tenant_id: "tn1".into(),
                user_id: "u1".into(),
                title: "test".into(),
                ..Default::default()
            })
            .await
            .unwrap()
    }

    async fn wait_terminal(f: &Fixture, id: &str) -> Task {
        for _ in 0..500 {
            let task = f.registry.get(id).await.unwrap().unwrap();
            if task.status.is_terminal() {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("task {id} never reached a terminal state");
    }

    #[tokio::test]
    async fn start_without_handler_returns_false() {
        let f = make_fixture();
        let task = make_task(&f, "doc.generate").await;

        assert!(!f.orchestrator.start(&task.id).await.unwrap());
        let task = f.registry.get(&task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn start_missing_task_returns_false() {
        let f = make_fixture();
        assert!(!f.orchestrator.start("nope").await.unwrap());
    }

    #[tokio::test]
    async fn handler_completion_persists_result() {
        let f = make_fixture();
        f.orchestrator
            .register("doc.parse", |_task, _ctx| async {
                tokio::time::sleep(Duration::from_millis(5)).await;
                Ok(serde_json::json!({"sections": 7}))
            })
            .await;
        let task = make_task(&f, "doc.parse").await;

        assert!(f.orchestrator.start(&task.id).await.unwrap());
        let done = wait_terminal(&f, &task.id).await;
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.result, Some(serde_json::json!({"sections": 7})));
        assert_eq!(done.progress, 100);
        assert!(done.error.is_none());
        assert!(done.completed_at.is_some());
    }

    #[tokio::test]
    async fn second_start_returns_false() {
        let f = make_fixture();
        let gate = Arc::new(Notify::new());
        let release = Arc::clone(&gate);
        f.orchestrator
            .register("doc.parse", move |_task, _ctx| {
                let gate = Arc::clone(&gate);
                async move {
                    gate.notified().await;
                    Ok(serde_json::Value::Null)
                }
            })
            .await;
        let task = make_task(&f, "doc.parse").await;

        assert!(f.orchestrator.start(&task.id).await.unwrap());
        // Second call sees RUNNING, not PENDING.
        assert!(!f.orchestrator.start(&task.id).await.unwrap());
        release.notify_one();
        wait_terminal(&f, &task.id).await;
        // And a third call after the terminal state.
        assert!(!f.orchestrator.start(&task.id).await.unwrap());
    }

    #[tokio::test]
    async fn handler_error_persists_failure() {
        let f = make_fixture();
        f.orchestrator
            .register("doc.parse", |_task, _ctx| async {
                Err(ServiceError::Internal("parser exploded".into()))
            })
            .await;
        let task = make_task(&f, "doc.parse").await;

        assert!(f.orchestrator.start(&task.id).await.unwrap());
        let done = wait_terminal(&f, &task.id).await;
        assert_eq!(done.status, TaskStatus::Failed);
        assert_eq!(done.error.as_deref(), Some("parser exploded"));
        assert!(done.result.is_none());
    }

    #[tokio::test]
    async fn progress_clamps_and_never_decreases() {
        let f = make_fixture();
        let mut task = make_task(&f, "doc.parse").await;
        task.status = TaskStatus::Running;
        f.registry.save(&task).await.unwrap();

        f.orchestrator.update_progress(&task.id, -5, None).await.unwrap();
        assert_eq!(f.registry.get(&task.id).await.unwrap().unwrap().progress, 0);

        f.orchestrator.update_progress(&task.id, 150, None).await.unwrap();
        assert_eq!(f.registry.get(&task.id).await.unwrap().unwrap().progress, 100);

        f.orchestrator.update_progress(&task.id, 30, None).await.unwrap();
        assert_eq!(f.registry.get(&task.id).await.unwrap().unwrap().progress, 100);
    }

    #[tokio::test]
    async fn progress_updates_description_and_publishes() {
        let f = make_fixture();
        let mut rx = f.kv.subscribe_pattern("task:events:*").await.unwrap();
        let mut task = make_task(&f, "doc.parse").await;
        task.status = TaskStatus::Running;
        f.registry.save(&task).await.unwrap();

        f.orchestrator
            .update_progress(&task.id, 42, Some("step2"))
            .await
            .unwrap();

        let saved = f.registry.get(&task.id).await.unwrap().unwrap();
        assert_eq!(saved.progress, 42);
        assert_eq!(saved.description, "step2");

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.channel, event_channel(&task.id));
        let event: TaskEvent = serde_json::from_slice(&msg.payload).unwrap();
        assert_eq!(event.kind, TaskEventKind::Progress);
        assert_eq!(event.progress, Some(42));
        assert_eq!(event.message.as_deref(), Some("step2"));
    }

    #[tokio::test]
    async fn progress_on_missing_task_is_silent() {
        let f = make_fixture();
        f.orchestrator.update_progress("ghost", 10, None).await.unwrap();
    }

    #[tokio::test]
    async fn cancel_interrupts_running_handler() {
        let f = make_fixture();
        f.orchestrator
            .register("doc.parse", |_task, ctx| async move {
                // A cooperative handler: waits on work or cancellation.
                ctx.cancellation().cancelled().await;
                Err(ServiceError::Internal("should never surface".into()))
            })
            .await;
        let task = make_task(&f, "doc.parse").await;
        assert!(f.orchestrator.start(&task.id).await.unwrap());

        assert!(f.orchestrator.cancel(&task.id).await.unwrap());
        let done = f.registry.get(&task.id).await.unwrap().unwrap();
        assert_eq!(done.status, TaskStatus::Cancelled);
        assert!(done.result.is_none());
        assert!(done.error.is_none());
    }

    #[tokio::test]
    async fn cancel_wins_over_handler_result_after_token_fires() {
        // A parked handler that wakes on the token and returns an error
        // on its way out must not turn a requested cancellation into a
        // FAILED record, whichever select branch runs first.
        for _ in 0..25 {
            let f = make_fixture();
            f.orchestrator
                .register("doc.parse", |_task, ctx| async move {
                    ctx.cancellation().cancelled().await;
                    Err(ServiceError::Internal("aborted mid-step".into()))
                })
                .await;
            let task = make_task(&f, "doc.parse").await;
            assert!(f.orchestrator.start(&task.id).await.unwrap());

            assert!(f.orchestrator.cancel(&task.id).await.unwrap());
            let done = f.registry.get(&task.id).await.unwrap().unwrap();
            assert_eq!(done.status, TaskStatus::Cancelled);
            assert!(done.error.is_none());
        }
    }

    #[tokio::test]
    async fn cancel_unknown_task_returns_false() {
        let f = make_fixture();
        assert!(!f.orchestrator.cancel("nope").await.unwrap());
    }

    #[tokio::test]
    async fn cancel_after_completion_is_a_noop() {
        let f = make_fixture();
        f.orchestrator
            .register("doc.parse", |_task, _ctx| async { Ok(serde_json::json!("done")) })
            .await;
        let task = make_task(&f, "doc.parse").await;
        assert!(f.orchestrator.start(&task.id).await.unwrap());
        let done = wait_terminal(&f, &task.id).await;
        assert_eq!(done.status, TaskStatus::Completed);

        assert!(!f.orchestrator.cancel(&task.id).await.unwrap());
        let task = f.registry.get(&task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn concurrent_finish_and_cancel_persist_exactly_one_terminal() {
        for _ in 0..25 {
            let f = make_fixture();
            let gate = Arc::new(Notify::new());
            let release = Arc::clone(&gate);
            f.orchestrator
                .register("doc.parse", move |_task, _ctx| {
                    let gate = Arc::clone(&gate);
                    async move {
                        gate.notified().await;
                        Ok(serde_json::json!("winner"))
                    }
                })
                .await;
            let task = make_task(&f, "doc.parse").await;
            assert!(f.orchestrator.start(&task.id).await.unwrap());

            let orchestrator = Arc::clone(&f.orchestrator);
            let id = task.id.clone();
            let canceller = tokio::spawn(async move { orchestrator.cancel(&id).await.unwrap() });
            release.notify_one();
            let cancel_won = canceller.await.unwrap();

            let done = wait_terminal(&f, &task.id).await;
            if cancel_won {
                assert_eq!(done.status, TaskStatus::Cancelled);
                assert!(done.result.is_none());
            } else {
                assert_eq!(done.status, TaskStatus::Completed);
                assert_eq!(done.result, Some(serde_json::json!("winner")));
            }
            // Never both, never neither.
            assert!(!(done.result.is_some() && done.error.is_some()));
        }
    }

    #[tokio::test]
    async fn last_handler_registration_wins() {
        let f = make_fixture();
        f.orchestrator
            .register("doc.parse", |_t, _c| async { Ok(serde_json::json!("first")) })
            .await;
        f.orchestrator
            .register("doc.parse", |_t, _c| async { Ok(serde_json::json!("second")) })
            .await;
        let task = make_task(&f, "doc.parse").await;
        assert!(f.orchestrator.start(&task.id).await.unwrap());
        let done = wait_terminal(&f, &task.id).await;
        assert_eq!(done.result, Some(serde_json::json!("second")));
    }

    #[tokio::test]
    async fn handler_can_report_progress_through_context() {
        let f = make_fixture();
        f.orchestrator
            .register("doc.parse", |_task, ctx| async move {
                ctx.update_progress(55, Some("halfway")).await?;
                Ok(serde_json::Value::Null)
            })
            .await;
        let task = make_task(&f, "doc.parse").await;
        assert!(f.orchestrator.start(&task.id).await.unwrap());
        let done = wait_terminal(&f, &task.id).await;
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.description, "halfway");
    }
}
