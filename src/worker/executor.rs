// src/worker/executor.rs

//! Executor loop.
//!
//! One loop per worker process. Each iteration:
//!
//! 1. reaps finished runs (errors and panics are logged, never propagated)
//! 2. below the concurrency limit, dequeues one task and spawns
//!    [`run_and_ack`] for it, or idles briefly when the queue is empty
//! 3. at the limit, waits briefly (or until a run finishes) and re-checks
//!
//! Shutdown is requested through a `watch` channel: the loop stops
//! dequeuing, waits for every in-flight run, then returns.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::pipeline::{AnalysisPipeline, PipelineContext, PipelineOutcome};
use crate::progress::{ProgressSynchronizer, ProgressUpdate};
use crate::queue::QueueManager;
use crate::task::{RecordPatch, TaskRecord, TaskStatus};
use crate::worker::stats::ExecutorStats;

#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    /// Maximum number of pipeline runs in flight.
    pub concurrency: usize,
    /// How long a single dequeue blocks waiting for work.
    pub poll_timeout: Duration,
    /// Pause after an empty dequeue.
    pub idle_wait: Duration,
    /// Pause when the in-flight set is full.
    pub busy_wait: Duration,
    /// Pause after a loop-level error.
    pub error_backoff: Duration,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            concurrency: 2,
            poll_timeout: Duration::from_secs(1),
            idle_wait: Duration::from_secs(1),
            busy_wait: Duration::from_millis(500),
            error_backoff: Duration::from_secs(5),
        }
    }
}

#[derive(Clone)]
pub struct PipelineExecutor {
    queue: QueueManager,
    progress: ProgressSynchronizer,
    pipeline: Arc<dyn AnalysisPipeline>,
    options: ExecutorOptions,
    stats: Arc<ExecutorStats>,
}

impl std::fmt::Debug for PipelineExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineExecutor")
            .field("queue", &self.queue)
            .field("options", &self.options)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl PipelineExecutor {
    pub fn new(
        queue: QueueManager,
        progress: ProgressSynchronizer,
        pipeline: Arc<dyn AnalysisPipeline>,
        options: ExecutorOptions,
    ) -> Self {
        Self {
            queue,
            progress,
            pipeline,
            options: ExecutorOptions {
                concurrency: options.concurrency.max(1),
                ..options
            },
            stats: Arc::new(ExecutorStats::new()),
        }
    }

    pub fn stats(&self) -> Arc<ExecutorStats> {
        Arc::clone(&self.stats)
    }

    pub fn options(&self) -> &ExecutorOptions {
        &self.options
    }

    /// Run until `shutdown` flips to `true` (or its sender is dropped), then
    /// drain in-flight runs.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let concurrency = self.options.concurrency;
        let mut in_flight: JoinSet<()> = JoinSet::new();

        info!(concurrency, "executor loop started");

        while !shutdown_requested(&shutdown) {
            while let Some(joined) = in_flight.try_join_next() {
                reap(joined);
            }

            if in_flight.len() >= concurrency {
                tokio::select! {
                    Some(joined) = in_flight.join_next() => reap(joined),
                    _ = sleep(self.options.busy_wait) => {}
                    _ = shutdown.changed() => {}
                }
                continue;
            }

            match self.queue.try_dequeue(self.options.poll_timeout).await {
                Ok(Some(task)) => {
                    let in_flight_now = self.stats.started();
                    debug!(task_id = %task.task_id, in_flight = in_flight_now, "dispatching task");
                    in_flight.spawn(supervise(
                        self.queue.clone(),
                        self.progress.clone(),
                        Arc::clone(&self.pipeline),
                        Arc::clone(&self.stats),
                        task,
                    ));
                }
                Ok(None) => pause(&mut shutdown, self.options.idle_wait).await,
                Err(err) => {
                    error!(
                        error = %err,
                        backoff_ms = self.options.error_backoff.as_millis() as u64,
                        "executor loop error; backing off"
                    );
                    pause(&mut shutdown, self.options.error_backoff).await;
                }
            }
        }

        info!(in_flight = in_flight.len(), "executor shutting down; waiting for in-flight tasks");
        while let Some(joined) = in_flight.join_next().await {
            reap(joined);
        }
        info!("executor loop finished");
    }
}

fn shutdown_requested(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow() || shutdown.has_changed().is_err()
}

/// Sleep for `wait`, waking early when shutdown is requested.
async fn pause(shutdown: &mut watch::Receiver<bool>, wait: Duration) {
    tokio::select! {
        _ = sleep(wait) => {}
        _ = shutdown.changed() => {}
    }
}

fn reap(joined: Result<(), JoinError>) {
    if let Err(err) = joined {
        error!(error = %err, "task supervisor terminated abnormally");
    }
}

/// Run one task in its own Tokio task so a panicking pipeline is contained
/// and still ends with a failed record and an ack.
async fn supervise(
    queue: QueueManager,
    progress: ProgressSynchronizer,
    pipeline: Arc<dyn AnalysisPipeline>,
    stats: Arc<ExecutorStats>,
    task: TaskRecord,
) {
    let task_id = task.task_id.clone();
    let run = tokio::spawn({
        let queue = queue.clone();
        let progress = progress.clone();
        async move { run_and_ack(&queue, &progress, pipeline.as_ref(), task).await }
    });

    let success = match run.await {
        Ok(outcome) => outcome.is_success(),
        Err(err) => {
            error!(task_id = %task_id, error = %err, "pipeline run panicked or was cancelled");
            let detail = if err.is_panic() {
                "pipeline panicked".to_string()
            } else {
                "pipeline run was cancelled".to_string()
            };
            publish_failure(&progress, &task_id, &detail, &err.to_string()).await;
            queue.ack(&task_id).await;
            false
        }
    };

    stats.finished(success);
}

/// Invoke the pipeline for `task`, publish its terminal state to both stores
/// and release the lease. Failed tasks are acknowledged too.
pub async fn run_and_ack(
    queue: &QueueManager,
    progress: &ProgressSynchronizer,
    pipeline: &dyn AnalysisPipeline,
    task: TaskRecord,
) -> PipelineOutcome {
    let task_id = task.task_id.clone();
    info!(task_id = %task_id, source_ref = %task.source_ref, "running analysis pipeline");

    // A redelivered task must not inherit KPIs or results from the attempt
    // whose lease expired.
    let start = ProgressUpdate::new(TaskStatus::Processing, None, task.message.clone())
        .with_patch(RecordPatch::StartAttempt);
    progress.publish(&task_id, start).await;

    let ctx = PipelineContext::new(task.task_id, task.source_ref, progress.clone());
    let outcome = pipeline.run(ctx).await;

    match &outcome {
        PipelineOutcome::Success(report) => {
            let mut update = ProgressUpdate::new(
                TaskStatus::Completed,
                Some(1.0),
                "Analysis completed successfully",
            )
            .with_patch(RecordPatch::ReportRef(report.report_ref.clone()))
            .with_patch(RecordPatch::RawDataRef(report.raw_data_ref.clone()))
            .with_patch(RecordPatch::CurrentKpi(None));
            if let Some(summary) = &report.summary {
                update = update.with_patch(RecordPatch::Summary(summary.clone()));
            }
            progress.publish(&task_id, update).await;
            info!(task_id = %task_id, report_ref = %report.report_ref, "analysis completed");
        }
        PipelineOutcome::Failure(failure) => {
            warn!(task_id = %task_id, error = %failure.error_detail, "analysis failed");
            publish_failure(progress, &task_id, &failure.error_detail, &failure.error_trace)
                .await;
        }
    }

    queue.ack(&task_id).await;
    outcome
}

async fn publish_failure(
    progress: &ProgressSynchronizer,
    task_id: &str,
    detail: &str,
    trace: &str,
) {
    let update = ProgressUpdate::new(
        TaskStatus::Failed,
        None,
        format!("Analysis failed: {detail}"),
    )
    .with_patch(RecordPatch::ErrorDetail(detail.to_string()))
    .with_patch(RecordPatch::ErrorTrace(trace.to_string()));
    progress.publish(task_id, update).await;
}
