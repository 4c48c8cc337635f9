// src/lib.rs

pub mod cli;
pub mod config;
pub mod errors;
pub mod logging;
pub mod pipeline;
pub mod progress;
pub mod queue;
pub mod service;
pub mod store;
pub mod task;
pub mod watchdog;
pub mod worker;

use std::future::Future;
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::cli::{CliArgs, Command};
use crate::config::{load_and_validate, CliOverrides, WorkerConfig};
use crate::pipeline::CommandPipeline;
use crate::progress::ProgressSynchronizer;
use crate::queue::QueueManager;
use crate::service::TaskService;
use crate::store::{PgDurableStore, RedisCache, StoreHandles};
use crate::watchdog::Watchdog;
use crate::worker::PipelineExecutor;

/// High-level entry point used by `main.rs`.
///
/// This wires together:
/// - config loading
/// - store connections
/// - worker processes (executor + watchdog each)
/// - Ctrl-C handling
pub fn run(args: CliArgs) -> Result<()> {
    let overrides = match &args.command {
        Some(Command::Worker {
            concurrency,
            processes,
        }) => CliOverrides {
            concurrency: *concurrency,
            processes: *processes,
        },
        _ => CliOverrides::default(),
    };

    let config = load_and_validate(args.config.as_deref(), &overrides)
        .context("loading worker configuration")?;

    match args.command {
        None | Some(Command::Worker { .. }) => run_workers(config),
        Some(Command::Submit { source_ref }) => block_on(submit(&config, &source_ref)),
        Some(Command::Status { task_id }) => block_on(status(&config, &task_id)),
        Some(Command::Sweep) => block_on(sweep(&config)),
    }
}

fn block_on<F>(fut: F) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building Tokio runtime")?
        .block_on(fut)
}

fn queue_for(config: &WorkerConfig, cache: Arc<RedisCache>) -> QueueManager {
    QueueManager::new(cache, config.queue_keys(), config.lease_duration)
}

/// Start `config.processes` worker threads, each with its own runtime, and
/// block until all of them have shut down.
pub fn run_workers(config: WorkerConfig) -> Result<()> {
    let database_url = config.database_url()?.to_string();
    config.pipeline_program()?;

    block_on(async {
        let durable = PgDurableStore::connect(&database_url).await?;
        durable.migrate().await?;
        durable.close().await;
        Ok::<(), anyhow::Error>(())
    })
    .context("preparing durable store schema")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_signal_listener(shutdown_tx)?;

    info!(
        processes = config.processes,
        concurrency = config.concurrency,
        "starting worker processes"
    );

    let mut handles = Vec::with_capacity(config.processes);
    for index in 0..config.processes {
        let config = config.clone();
        let shutdown = shutdown_rx.clone();
        let handle = thread::Builder::new()
            .name(format!("worker-{index}"))
            .spawn(move || worker_process(index, config, shutdown))
            .with_context(|| format!("spawning worker process {index}"))?;
        handles.push(handle);
    }

    let mut failures = 0;
    for handle in handles {
        match handle.join() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                error!(error = ?err, "worker process failed");
                failures += 1;
            }
            Err(_) => {
                error!("worker process panicked");
                failures += 1;
            }
        }
    }

    if failures == config.processes {
        anyhow::bail!("all {failures} worker processes failed");
    }
    info!("all worker processes stopped");
    Ok(())
}

fn spawn_signal_listener(shutdown_tx: watch::Sender<bool>) -> Result<()> {
    thread::Builder::new()
        .name("signals".to_string())
        .spawn(move || {
            let listen = async {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => info!("received Ctrl-C; shutting down"),
                    Err(err) => warn!(error = %err, "failed to listen for Ctrl-C; shutting down"),
                }
                let _ = shutdown_tx.send(true);
                Ok::<(), anyhow::Error>(())
            };
            if let Err(err) = block_on(listen) {
                error!(error = ?err, "signal listener failed");
            }
        })
        .context("spawning signal listener")?;
    Ok(())
}

/// One worker process: its own runtime, store handles, executor and
/// watchdog.
fn worker_process(index: usize, config: WorkerConfig, shutdown: watch::Receiver<bool>) -> Result<()> {
    block_on(async move {
        let stores = StoreHandles::open(&config.cache_url, config.database_url()?)
            .await
            .with_context(|| format!("opening stores for worker process {index}"))?;

        let keys = config.queue_keys();
        let queue = queue_for(&config, stores.cache.clone()).with_durable(stores.durable.clone());
        let progress = ProgressSynchronizer::new(stores.cache.clone(), stores.durable.clone(), keys);
        let pipeline = CommandPipeline::new(config.pipeline_program()?, config.pipeline.args.clone());

        let executor = PipelineExecutor::new(
            queue.clone(),
            progress,
            Arc::new(pipeline),
            config.executor_options(),
        );
        let watchdog = Watchdog::new(queue, config.watchdog_interval);

        info!(worker = index, "worker process ready");
        tokio::join!(executor.run(shutdown.clone()), watchdog.run(shutdown));

        let stats = executor.stats().snapshot();
        info!(
            worker = index,
            completed = stats.completed,
            failed = stats.failed,
            max_in_flight = stats.max_in_flight,
            "worker process stopped"
        );
        stores.close().await;
        Ok::<(), anyhow::Error>(())
    })
}

async fn submit(config: &WorkerConfig, source_ref: &str) -> Result<()> {
    let stores = StoreHandles::open(&config.cache_url, config.database_url()?).await?;
    stores.durable.migrate().await?;

    let queue = queue_for(config, stores.cache.clone()).with_durable(stores.durable.clone());
    let service = TaskService::new(queue, stores.durable.clone());
    let record = service.submit(source_ref).await?;
    println!("{}", serde_json::to_string_pretty(&record)?);

    stores.close().await;
    Ok(())
}

async fn status(config: &WorkerConfig, task_id: &str) -> Result<()> {
    let stores = StoreHandles::open(&config.cache_url, config.database_url()?).await?;

    let queue = queue_for(config, stores.cache.clone()).with_durable(stores.durable.clone());
    let service = TaskService::new(queue, stores.durable.clone());
    let record = service.get_status(task_id).await;
    stores.close().await;

    match record? {
        Some(record) => {
            println!("{}", serde_json::to_string_pretty(&record)?);
            Ok(())
        }
        None => anyhow::bail!("task {task_id} not found"),
    }
}

async fn sweep(config: &WorkerConfig) -> Result<()> {
    let cache = RedisCache::connect(&config.cache_url).await?;
    let watchdog = Watchdog::new(
        queue_for(config, Arc::new(cache)),
        config.watchdog_interval,
    );
    let recovered = watchdog.sweep_once().await?;
    println!("{recovered}");
    Ok(())
}
