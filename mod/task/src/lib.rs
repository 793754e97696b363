pub mod model;
pub mod orchestrator;
pub mod queue;
pub mod registry;
pub mod worker;

use std::sync::Arc;

use docpipe_kv::KeyValueStore;

use orchestrator::TaskOrchestrator;
use queue::{QueueConfig, StreamQueue};
use registry::{RegistryConfig, TaskRegistry};
use worker::ConsumerConfig;

/// The task module — durable task records, the lifecycle state machine,
/// and the stream-queue consumer that feeds it.
///
/// Embed this in a worker or serving process to get task creation,
/// handler dispatch, progress publication, and cancellation. Producers
/// enqueue work through [`StreamQueue`]; worker processes run the
/// consumer loop via [`worker::start_consumer`].
pub struct TaskModule {
    registry: Arc<TaskRegistry>,
    orchestrator: Arc<TaskOrchestrator>,
    queue: Arc<StreamQueue>,
    _consumer_cancel: tokio_util::sync::CancellationToken,
}

impl TaskModule {
    /// Assemble the module on a shared store and start the consumer loop.
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self::with_config(
            kv,
            RegistryConfig::default(),
            QueueConfig::default(),
            ConsumerConfig::default(),
        )
    }

    /// Assemble with explicit per-component configuration.
    pub fn with_config(
        kv: Arc<dyn KeyValueStore>,
        registry_config: RegistryConfig,
        queue_config: QueueConfig,
        consumer_config: ConsumerConfig,
    ) -> Self {
        let registry = Arc::new(TaskRegistry::with_config(Arc::clone(&kv), registry_config));
        let orchestrator = Arc::new(TaskOrchestrator::new(Arc::clone(&registry), Arc::clone(&kv)));
        let queue = Arc::new(StreamQueue::with_config(kv, queue_config));
        let cancel = worker::start_consumer(
            Arc::clone(&queue),
            Arc::clone(&orchestrator),
            consumer_config,
        );

        Self {
            registry,
            orchestrator,
            queue,
            _consumer_cancel: cancel,
        }
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    /// The orchestrator, for programmatic handler registration.
    pub fn orchestrator(&self) -> &Arc<TaskOrchestrator> {
        &self.orchestrator
    }

    /// The work queue, for producers.
    pub fn queue(&self) -> &Arc<StreamQueue> {
        &self.queue
    }
}
