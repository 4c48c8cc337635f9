// src/pipeline/command.rs

//! External-program pipeline.
//!
//! Each task runs `<program> <args...> <task_id> <source_ref>` as a child
//! process:
//!
//! - stdout is read line by line; protocol events (see [`super::protocol`])
//!   become progress updates, anything else is logged at debug.
//! - stderr is always drained so the pipe never fills; the last lines are
//!   kept as the error trace for failed runs.
//! - the child is killed if the run future is dropped.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::pipeline::protocol::{parse_line, EventTranslator, Translated};
use crate::pipeline::{AnalysisPipeline, PipelineContext, PipelineFailure, PipelineOutcome};

const DEFAULT_STDERR_TAIL: usize = 40;

#[derive(Debug, Clone)]
pub struct CommandPipeline {
    program: String,
    args: Vec<String>,
    stderr_tail: usize,
}

impl CommandPipeline {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            stderr_tail: DEFAULT_STDERR_TAIL,
        }
    }

    /// Number of trailing stderr lines kept for the error trace.
    pub fn with_stderr_tail(mut self, lines: usize) -> Self {
        self.stderr_tail = lines;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    async fn run_inner(&self, ctx: &PipelineContext) -> Result<PipelineOutcome> {
        info!(
            task_id = %ctx.task_id,
            program = %self.program,
            "starting pipeline process"
        );

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(&ctx.task_id)
            .arg(&ctx.source_ref)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawning pipeline program '{}'", self.program))?;

        let stdout = child
            .stdout
            .take()
            .context("pipeline stdout was not captured")?;

        let stderr_task = child.stderr.take().map(|stderr| {
            let task_id = ctx.task_id.clone();
            let keep = self.stderr_tail;
            tokio::spawn(async move {
                let mut tail = VecDeque::with_capacity(keep);
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(task_id = %task_id, "stderr: {}", line);
                    if keep == 0 {
                        continue;
                    }
                    if tail.len() == keep {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
                tail
            })
        });

        let mut translator = EventTranslator::new();
        let mut reported: Option<PipelineOutcome> = None;
        let mut lines = BufReader::new(stdout).lines();

        while let Some(line) = lines
            .next_line()
            .await
            .context("reading pipeline stdout")?
        {
            let Some(event) = parse_line(&line) else {
                debug!(task_id = %ctx.task_id, "stdout: {}", line);
                continue;
            };

            match translator.translate(event) {
                Translated::Update(update) => ctx.report(update).await,
                Translated::Completed(report) => {
                    reported = Some(PipelineOutcome::Success(report));
                }
                Translated::Failed(failure) => {
                    reported = Some(PipelineOutcome::Failure(failure));
                }
            }
        }

        let status = child
            .wait()
            .await
            .with_context(|| format!("waiting for pipeline program '{}'", self.program))?;

        let stderr_tail = match stderr_task {
            Some(handle) => handle
                .await
                .map(|tail| Vec::from(tail).join("\n"))
                .unwrap_or_default(),
            None => String::new(),
        };

        info!(
            task_id = %ctx.task_id,
            exit_code = status.code().unwrap_or(-1),
            success = status.success(),
            "pipeline process exited"
        );

        let outcome = match reported {
            Some(PipelineOutcome::Failure(mut failure)) => {
                if failure.error_trace.is_empty() {
                    failure.error_trace = stderr_tail;
                }
                PipelineOutcome::Failure(failure)
            }
            _ if !status.success() => PipelineOutcome::Failure(PipelineFailure::new(
                format!("pipeline program exited with {status}"),
                stderr_tail,
            )),
            Some(success) => success,
            None => {
                warn!(task_id = %ctx.task_id, "pipeline exited without reporting completion");
                PipelineOutcome::Failure(PipelineFailure::new(
                    "pipeline exited without reporting completion",
                    stderr_tail,
                ))
            }
        };

        Ok(outcome)
    }
}

impl AnalysisPipeline for CommandPipeline {
    fn run(
        &self,
        ctx: PipelineContext,
    ) -> Pin<Box<dyn Future<Output = PipelineOutcome> + Send + '_>> {
        Box::pin(async move {
            match self.run_inner(&ctx).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    warn!(task_id = %ctx.task_id, error = %err, "pipeline process error");
                    PipelineOutcome::Failure(PipelineFailure::from_error(&err))
                }
            }
        })
    }
}
