use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use analysis_worker::pipeline::{
    AnalysisPipeline, PipelineContext, PipelineFailure, PipelineOutcome, PipelineReport,
};
use analysis_worker::progress::ProgressUpdate;

/// What a [`ScriptedPipeline`] does for one task id.
#[derive(Debug, Clone)]
pub enum Script {
    Succeed,
    Fail(String),
    Panic,
}

/// A fake pipeline that:
/// - records which tasks were run, in order
/// - publishes any configured intermediate updates
/// - then succeeds, fails or panics as scripted per task id (default: succeed)
#[derive(Clone, Default)]
pub struct ScriptedPipeline {
    scripts: Arc<Mutex<HashMap<String, Script>>>,
    updates: Arc<Mutex<HashMap<String, Vec<ProgressUpdate>>>>,
    executed: Arc<Mutex<Vec<String>>>,
    delay: Duration,
}

impl ScriptedPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn fail_on(self, task_id: &str, detail: &str) -> Self {
        self.script(task_id, Script::Fail(detail.to_string()))
    }

    pub fn panic_on(self, task_id: &str) -> Self {
        self.script(task_id, Script::Panic)
    }

    pub fn script(self, task_id: &str, script: Script) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(task_id.to_string(), script);
        self
    }

    /// Publish `update` for `task_id` before finishing.
    pub fn report_on(self, task_id: &str, update: ProgressUpdate) -> Self {
        self.updates
            .lock()
            .unwrap()
            .entry(task_id.to_string())
            .or_default()
            .push(update);
        self
    }

    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }

    pub fn report_for(task_id: &str) -> PipelineReport {
        PipelineReport {
            report_ref: format!("report://{task_id}.html"),
            raw_data_ref: format!("raw://{task_id}.json"),
            summary: Some(format!("summary of {task_id}")),
        }
    }
}

impl AnalysisPipeline for ScriptedPipeline {
    fn run(
        &self,
        ctx: PipelineContext,
    ) -> Pin<Box<dyn Future<Output = PipelineOutcome> + Send + '_>> {
        Box::pin(async move {
            self.executed.lock().unwrap().push(ctx.task_id.clone());

            let updates = self
                .updates
                .lock()
                .unwrap()
                .get(&ctx.task_id)
                .cloned()
                .unwrap_or_default();
            for update in updates {
                ctx.report(update).await;
            }

            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }

            let script = self
                .scripts
                .lock()
                .unwrap()
                .get(&ctx.task_id)
                .cloned()
                .unwrap_or(Script::Succeed);

            match script {
                Script::Succeed => PipelineOutcome::Success(Self::report_for(&ctx.task_id)),
                Script::Fail(detail) => PipelineOutcome::Failure(PipelineFailure::new(
                    detail,
                    format!("trace for {}", ctx.task_id),
                )),
                Script::Panic => panic!("scripted panic for {}", ctx.task_id),
            }
        })
    }
}

/// A pipeline that tracks how many runs overlap.
#[derive(Clone, Default)]
pub struct ConcurrencyProbe {
    current: Arc<AtomicUsize>,
    max_seen: Arc<AtomicUsize>,
    runs: Arc<AtomicUsize>,
    delay: Duration,
}

impl ConcurrencyProbe {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn max_seen(&self) -> usize {
        self.max_seen.load(Ordering::SeqCst)
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

impl AnalysisPipeline for ConcurrencyProbe {
    fn run(
        &self,
        ctx: PipelineContext,
    ) -> Pin<Box<dyn Future<Output = PipelineOutcome> + Send + '_>> {
        Box::pin(async move {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_seen.fetch_max(now, Ordering::SeqCst);

            tokio::time::sleep(self.delay).await;

            self.current.fetch_sub(1, Ordering::SeqCst);
            self.runs.fetch_add(1, Ordering::SeqCst);
            PipelineOutcome::Success(ScriptedPipeline::report_for(&ctx.task_id))
        })
    }
}
