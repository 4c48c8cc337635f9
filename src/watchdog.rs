// src/watchdog.rs

//! Stale-lease sweeper.
//!
//! Runs [`QueueManager::requeue_stale`] on a fixed interval so tasks leased by
//! a crashed worker go back to the pending queue once their lease expires.

use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::errors::Result;
use crate::queue::QueueManager;

pub const DEFAULT_WATCHDOG_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct Watchdog {
    queue: QueueManager,
    interval: Duration,
}

impl Watchdog {
    pub fn new(queue: QueueManager, interval: Duration) -> Self {
        Self { queue, interval }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// One sweep against the current time.
    pub async fn sweep_once(&self) -> Result<usize> {
        let recovered = self.queue.requeue_stale(Utc::now()).await?;
        if recovered > 0 {
            info!(recovered, "re-queued tasks with expired leases");
        } else {
            debug!(recovered, "watchdog sweep found nothing to recover");
        }
        Ok(recovered)
    }

    /// Sweep every `interval` until shutdown is requested. Sweep errors are
    /// logged and the loop carries on.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(interval_ms = self.interval.as_millis() as u64, "watchdog started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.sweep_once().await {
                        error!(error = %err, "watchdog sweep failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("watchdog stopped");
    }
}
