use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use analysis_worker::errors::Result;
use analysis_worker::progress::{ProgressSynchronizer, ProgressUpdate};
use analysis_worker::queue::{QueueKeys, QueueManager};
use analysis_worker::store::{save_cached, DurableStore, FastCache, InMemoryCache};
use analysis_worker::task::{KpiField, RecordPatch, TaskRecord, TaskStatus};
use analysis_worker_test_utils::builders::TaskRecordBuilder;
use analysis_worker_test_utils::harness::Harness;
use analysis_worker_test_utils::{init_tracing, with_timeout};

const POLL: Duration = Duration::from_millis(20);

#[tokio::test]
async fn enqueue_then_dequeue_leases_the_task() {
    init_tracing();
    let h = Harness::new();

    assert!(h.queue.enqueue("t1", "ref-a").await);
    let queued = h.cached("t1").await;
    assert_eq!(queued.status, TaskStatus::Pending);
    assert_eq!(queued.progress, 0.0);
    assert_eq!(queued.message, "Task queued, waiting for processing");

    let before = Utc::now();
    let leased = h.queue.dequeue(POLL).await.expect("task should be dequeued");

    assert_eq!(leased.task_id, "t1");
    assert_eq!(leased.source_ref, "ref-a");
    assert_eq!(leased.status, TaskStatus::Processing);
    assert_eq!(leased.message, "Task processing started");

    let lease = leased.lease_expires.expect("lease should be set");
    let expected = before + chrono::Duration::minutes(25);
    assert!((lease - expected).num_seconds().abs() <= 5, "lease {lease} not ~ {expected}");

    assert_eq!(h.queue.pending_len().await.unwrap(), 0);
    assert_eq!(h.queue.processing_ids().await.unwrap(), vec!["t1".to_string()]);
    assert_eq!(h.cached("t1").await, leased);
}

#[tokio::test(start_paused = true)]
async fn dequeue_on_empty_queue_times_out_with_none() {
    let h = Harness::new();
    assert!(h.queue.dequeue(Duration::from_secs(1)).await.is_none());
}

#[tokio::test]
async fn dequeue_waits_for_a_late_enqueue() {
    let h = Harness::new();
    let queue = h.queue.clone();

    let waiter = tokio::spawn(async move { queue.dequeue(Duration::from_secs(2)).await });
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(h.queue.enqueue("late", "ref-late").await);

    let task = with_timeout(waiter).await.unwrap().expect("waiter should get the task");
    assert_eq!(task.task_id, "late");
}

#[tokio::test]
async fn dequeue_preserves_fifo_order() {
    let h = Harness::new();
    for id in ["a", "b", "c"] {
        assert!(h.queue.enqueue(id, "src").await);
    }

    let mut order = Vec::new();
    while let Some(task) = h.queue.dequeue(POLL).await {
        order.push(task.task_id);
    }
    assert_eq!(order, vec!["a", "b", "c"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_dequeues_never_hand_out_the_same_task() {
    init_tracing();
    let h = Harness::new();
    for i in 0..60 {
        assert!(h.queue.enqueue(&format!("task-{i}"), "src").await);
    }

    let mut workers = Vec::new();
    for _ in 0..8 {
        let queue = h.queue.clone();
        workers.push(tokio::spawn(async move {
            let mut got = Vec::new();
            while let Some(task) = queue.dequeue(POLL).await {
                got.push(task.task_id);
            }
            got
        }));
    }

    let mut all = Vec::new();
    for worker in workers {
        all.extend(with_timeout(worker).await.unwrap());
    }

    let unique: HashSet<_> = all.iter().cloned().collect();
    assert_eq!(all.len(), 60);
    assert_eq!(unique.len(), 60);
    assert_eq!(h.queue.processing_len().await.unwrap(), 60);
}

#[tokio::test]
async fn ack_is_idempotent() {
    let h = Harness::new();
    h.queue.enqueue("t1", "src").await;
    h.queue.dequeue(POLL).await.unwrap();

    assert!(h.queue.ack("t1").await);
    assert_eq!(h.queue.processing_len().await.unwrap(), 0);

    assert!(h.queue.ack("t1").await);
    assert_eq!(h.queue.processing_len().await.unwrap(), 0);
    assert_eq!(h.queue.pending_len().await.unwrap(), 0);
}

#[tokio::test]
async fn requeue_stale_only_moves_expired_leases() {
    init_tracing();
    let h = Harness::new();
    h.queue.enqueue("old", "src-old").await;
    h.queue.enqueue("fresh", "src-fresh").await;
    h.queue.dequeue(POLL).await.unwrap();
    h.queue.dequeue(POLL).await.unwrap();

    let mut old = h.cached("old").await;
    old.lease_expires = Some(Utc::now() - chrono::Duration::hours(1));
    save_cached(&h.cache, &h.keys.record("old"), &old).await.unwrap();

    let recovered = h.queue.requeue_stale(Utc::now()).await.unwrap();
    assert_eq!(recovered, 1);

    let old = h.cached("old").await;
    assert_eq!(old.status, TaskStatus::Pending);
    assert!(old.lease_expires.is_none());

    let fresh = h.cached("fresh").await;
    assert_eq!(fresh.status, TaskStatus::Processing);
    assert!(fresh.lease_expires.is_some());

    assert_eq!(h.queue.pending_ids().await.unwrap(), vec!["old".to_string()]);
    assert_eq!(h.queue.processing_ids().await.unwrap(), vec!["fresh".to_string()]);
}

#[tokio::test]
async fn requeued_tasks_go_to_the_tail() {
    let h = Harness::new();
    h.queue.enqueue("first", "src").await;
    h.queue.dequeue(POLL).await.unwrap();
    h.queue.enqueue("second", "src").await;

    let later = Utc::now() + chrono::Duration::hours(1);
    assert_eq!(h.queue.requeue_stale(later).await.unwrap(), 1);

    assert_eq!(
        h.queue.pending_ids().await.unwrap(),
        vec!["second".to_string(), "first".to_string()]
    );
}

#[tokio::test]
async fn get_status_follows_the_t1_lifecycle() {
    init_tracing();
    let h = Harness::new();

    h.submit("t1", "ref-a").await;
    let status = h.service.get_status("t1").await.unwrap().unwrap();
    assert_eq!(status.status, TaskStatus::Pending);
    assert_eq!(status.progress, 0.0);

    let task = h.queue.dequeue(POLL).await.unwrap();
    assert_eq!(task.task_id, "t1");
    assert_eq!(task.status, TaskStatus::Processing);

    let mut forced = h.cached("t1").await;
    forced.lease_expires = Some(Utc::now() - chrono::Duration::hours(1));
    save_cached(&h.cache, &h.keys.record("t1"), &forced).await.unwrap();

    assert_eq!(h.queue.requeue_stale(Utc::now()).await.unwrap(), 1);

    let status = h.service.get_status("t1").await.unwrap().unwrap();
    assert_eq!(status.status, TaskStatus::Pending);
    assert!(h.queue.pending_ids().await.unwrap().contains(&"t1".to_string()));
    assert!(!h.queue.processing_ids().await.unwrap().contains(&"t1".to_string()));
}

#[tokio::test]
async fn terminal_tasks_are_dropped_from_processing_without_requeue() {
    let h = Harness::new();
    h.queue.enqueue("done", "src").await;
    h.queue.dequeue(POLL).await.unwrap();

    let finished = TaskRecordBuilder::new("done")
        .status(TaskStatus::Failed)
        .lease_expires(Utc::now() - chrono::Duration::hours(1))
        .build();
    save_cached(&h.cache, &h.keys.record("done"), &finished).await.unwrap();

    assert_eq!(h.queue.requeue_stale(Utc::now()).await.unwrap(), 0);
    assert_eq!(h.queue.processing_len().await.unwrap(), 0);
    assert_eq!(h.queue.pending_len().await.unwrap(), 0);

    let record = h.cached("done").await;
    assert_eq!(record.status, TaskStatus::Failed);
    assert!(record.lease_expires.is_none());
}

#[tokio::test]
async fn ids_without_a_record_are_left_in_place() {
    let h = Harness::new();
    h.cache.push_tail(&h.keys.processing(), "ghost").await.unwrap();

    let later = Utc::now() + chrono::Duration::hours(2);
    assert_eq!(h.queue.requeue_stale(later).await.unwrap(), 0);
    assert_eq!(h.queue.processing_ids().await.unwrap(), vec!["ghost".to_string()]);
}

#[tokio::test]
async fn unleased_ids_get_a_lease_and_are_recovered_once_it_expires() {
    init_tracing();
    let h = Harness::with_lease(Duration::from_secs(60));

    // The server moved the id but the worker never wrote its lease.
    h.submit("stranded", "ref-s").await;
    h.cache
        .move_head_to_tail(&h.keys.pending(), &h.keys.processing(), Duration::ZERO)
        .await
        .unwrap();

    let now = Utc::now();
    assert_eq!(h.queue.requeue_stale(now).await.unwrap(), 0);
    let stamped = h.cached("stranded").await;
    assert_eq!(stamped.lease_expires, Some(now + chrono::Duration::seconds(60)));
    assert_eq!(h.queue.processing_ids().await.unwrap(), vec!["stranded".to_string()]);

    let later = now + chrono::Duration::seconds(61);
    assert_eq!(h.queue.requeue_stale(later).await.unwrap(), 1);
    assert_eq!(h.queue.pending_ids().await.unwrap(), vec!["stranded".to_string()]);
    assert_eq!(h.queue.processing_len().await.unwrap(), 0);

    let again = h.queue.dequeue(POLL).await.unwrap();
    assert_eq!(again.task_id, "stranded");
    assert_eq!(again.source_ref, "ref-s");
}

/// Cache wrapper whose first read of `key` lets a worker finish the task
/// (publish `completed`, then ack) before the reader sees the result.
#[derive(Debug)]
struct FinishesOnFirstRead {
    inner: InMemoryCache,
    key: String,
    queue: QueueManager,
    progress: ProgressSynchronizer,
    fired: AtomicBool,
}

#[async_trait]
impl FastCache for FinishesOnFirstRead {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let value = self.inner.get(key).await?;
        if key == self.key && !self.fired.swap(true, Ordering::SeqCst) {
            let task_id = key.trim_start_matches("task:");
            let done = ProgressUpdate::new(
                TaskStatus::Completed,
                Some(1.0),
                "Analysis completed successfully",
            )
            .with_patch(RecordPatch::ReportRef(format!("report://{task_id}.html")));
            self.progress.publish(task_id, done).await;
            self.queue.ack(task_id).await;
        }
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.inner.set(key, value).await
    }

    async fn push_tail(&self, list: &str, value: &str) -> Result<()> {
        self.inner.push_tail(list, value).await
    }

    async fn move_head_to_tail(
        &self,
        src: &str,
        dst: &str,
        timeout: Duration,
    ) -> Result<Option<String>> {
        self.inner.move_head_to_tail(src, dst, timeout).await
    }

    async fn remove_all(&self, list: &str, value: &str) -> Result<usize> {
        self.inner.remove_all(list, value).await
    }

    async fn list(&self, list: &str) -> Result<Vec<String>> {
        self.inner.list(list).await
    }

    async fn list_len(&self, list: &str) -> Result<usize> {
        self.inner.list_len(list).await
    }
}

#[tokio::test]
async fn a_run_finishing_mid_sweep_keeps_its_terminal_state() {
    init_tracing();
    let h = Harness::new();
    h.submit("t1", "ref-a").await;
    h.queue.dequeue(POLL).await.unwrap();

    let racing = FinishesOnFirstRead {
        inner: h.cache.clone(),
        key: h.keys.record("t1"),
        queue: h.queue.clone(),
        progress: h.progress.clone(),
        fired: AtomicBool::new(false),
    };
    let sweeper = QueueManager::new(Arc::new(racing), h.keys.clone(), Duration::from_secs(60));

    let later = Utc::now() + chrono::Duration::hours(1);
    assert_eq!(sweeper.requeue_stale(later).await.unwrap(), 0);

    let status = h.service.get_status("t1").await.unwrap().unwrap();
    assert_eq!(status.status, TaskStatus::Completed);
    assert_eq!(status.report_ref.as_deref(), Some("report://t1.html"));
    assert!(h.queue.pending_ids().await.unwrap().is_empty());
    assert!(h.queue.processing_ids().await.unwrap().is_empty());
}

#[tokio::test]
async fn dequeue_synthesizes_missing_or_corrupt_records() {
    init_tracing();
    let h = Harness::new();
    let pending = h.keys.pending();

    h.cache.push_tail(&pending, "missing").await.unwrap();
    h.cache.insert_raw(&h.keys.record("corrupt"), "{not json");
    h.cache.push_tail(&pending, "corrupt").await.unwrap();

    for id in ["missing", "corrupt"] {
        let task = h.queue.dequeue(POLL).await.unwrap();
        assert_eq!(task.task_id, id);
        assert_eq!(task.source_ref, "");
        assert_eq!(task.status, TaskStatus::Processing);
        assert!(task.lease_expires.is_some());
        assert_eq!(h.cached(id).await, task);
    }
}

#[tokio::test]
async fn dequeue_recovers_the_source_ref_from_the_durable_store() {
    let h = Harness::new();
    h.durable
        .insert(&TaskRecord::new("lost", "blob://uploads/lost.csv"))
        .await
        .unwrap();
    h.cache.push_tail(&h.keys.pending(), "lost").await.unwrap();

    let task = h.queue.dequeue(POLL).await.unwrap();
    assert_eq!(task.task_id, "lost");
    assert_eq!(task.source_ref, "blob://uploads/lost.csv");
    assert_eq!(task.status, TaskStatus::Processing);
}

#[tokio::test]
async fn leasing_a_redelivered_task_clears_the_previous_attempt() {
    let h = Harness::new();
    h.submit("t1", "ref-a").await;
    h.queue.dequeue(POLL).await.unwrap();

    let update = ProgressUpdate::processing(0.5, "Generated business insights for: Revenue")
        .with_patch(RecordPatch::IdentifiedKpis(vec!["Revenue".to_string()]))
        .with_patch(RecordPatch::CurrentKpi(Some("Revenue".to_string())))
        .with_patch(RecordPatch::kpi("Revenue", KpiField::Insights, "up 4%"));
    h.progress.publish("t1", update).await;

    let later = Utc::now() + chrono::Duration::hours(1);
    assert_eq!(h.queue.requeue_stale(later).await.unwrap(), 1);

    let again = h.queue.dequeue(POLL).await.unwrap();
    assert_eq!(again.source_ref, "ref-a");
    assert_eq!(again.progress, 0.0);
    assert!(again.identified_kpis.is_empty());
    assert!(again.partial_results.is_empty());
    assert!(again.current_kpi.is_none());
}

#[tokio::test]
async fn cache_failures_are_reported_not_raised() {
    init_tracing();
    let cache = InMemoryCache::new();
    let queue = QueueManager::new(
        Arc::new(cache.clone()),
        QueueKeys::new("jobs"),
        Duration::from_secs(60),
    );

    cache.set_failing(true);
    assert!(!queue.enqueue("t1", "src").await);
    assert!(queue.dequeue(POLL).await.is_none());
    assert!(queue.try_dequeue(POLL).await.is_err());
    assert!(!queue.ack("t1").await);
    assert!(queue.requeue_stale(Utc::now()).await.is_err());

    cache.set_failing(false);
    assert!(queue.enqueue("t1", "src").await);
    assert_eq!(
        cache.list("jobs:pending").await.unwrap(),
        vec!["t1".to_string()]
    );
}
