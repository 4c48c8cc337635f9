#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use analysis_worker::pipeline::AnalysisPipeline;
use analysis_worker::progress::ProgressSynchronizer;
use analysis_worker::queue::{QueueKeys, QueueManager, DEFAULT_LEASE_DURATION};
use analysis_worker::service::TaskService;
use analysis_worker::store::{InMemoryCache, InMemoryDurableStore};
use analysis_worker::task::TaskRecord;
use analysis_worker::worker::{ExecutorOptions, PipelineExecutor};

/// Every dispatch component wired to shared in-memory stores.
pub struct Harness {
    pub cache: InMemoryCache,
    pub durable: InMemoryDurableStore,
    pub keys: QueueKeys,
    pub queue: QueueManager,
    pub progress: ProgressSynchronizer,
    pub service: TaskService,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_lease(DEFAULT_LEASE_DURATION)
    }

    pub fn with_lease(lease: Duration) -> Self {
        let cache = InMemoryCache::new();
        let durable = InMemoryDurableStore::new();
        let keys = QueueKeys::default();

        let queue = QueueManager::new(Arc::new(cache.clone()), keys.clone(), lease)
            .with_durable(Arc::new(durable.clone()));
        let progress = ProgressSynchronizer::new(
            Arc::new(cache.clone()),
            Arc::new(durable.clone()),
            keys.clone(),
        );
        let service = TaskService::new(queue.clone(), Arc::new(durable.clone()));

        Self {
            cache,
            durable,
            keys,
            queue,
            progress,
            service,
        }
    }

    /// Submit `task_id` through the service (durable insert + enqueue).
    pub async fn submit(&self, task_id: &str, source_ref: &str) -> TaskRecord {
        self.service
            .submit_with_id(task_id, source_ref)
            .await
            .expect("submit failed")
    }

    pub async fn cached(&self, task_id: &str) -> TaskRecord {
        self.queue
            .record(task_id)
            .await
            .expect("cache read failed")
            .unwrap_or_else(|| panic!("no cache record for {task_id}"))
    }

    pub async fn stored(&self, task_id: &str) -> TaskRecord {
        use analysis_worker::store::DurableStore;
        self.durable
            .get(task_id)
            .await
            .expect("durable read failed")
            .unwrap_or_else(|| panic!("no durable record for {task_id}"))
    }

    pub fn executor(
        &self,
        pipeline: Arc<dyn AnalysisPipeline>,
        options: ExecutorOptions,
    ) -> PipelineExecutor {
        PipelineExecutor::new(
            self.queue.clone(),
            self.progress.clone(),
            pipeline,
            options,
        )
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

/// Executor options with short waits, for tests.
pub fn fast_options(concurrency: usize) -> ExecutorOptions {
    ExecutorOptions {
        concurrency,
        poll_timeout: Duration::from_millis(20),
        idle_wait: Duration::from_millis(10),
        busy_wait: Duration::from_millis(5),
        error_backoff: Duration::from_millis(50),
    }
}
