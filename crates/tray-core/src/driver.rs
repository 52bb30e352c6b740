//! Periodic driver for the scheduler.
//!
//! One loop waits for either the tick interval or a forced sync, plans a
//! tick, and spawns each dispatched sync as its own task. Slow network calls
//! therefore overlap later ticks; the scheduler's in-flight set keeps the
//! total under `max_concurrent`. Once a tick's syncs have finished, backup
//! retention is applied to the log.

use crate::now_ms;
use crate::scheduler::SyncScheduler;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

pub struct SyncDriver;

impl SyncDriver {
    /// Start the scheduler and drive it every `interval`.
    pub fn spawn(scheduler: Arc<SyncScheduler>, interval: Duration) -> DriverHandle {
        scheduler.start();
        let task = tokio::spawn(run_loop(Arc::clone(&scheduler), interval));
        info!("Sync driver running every {:?}", interval);
        DriverHandle { scheduler, task }
    }
}

/// Handle to a running driver loop.
pub struct DriverHandle {
    scheduler: Arc<SyncScheduler>,
    task: JoinHandle<()>,
}

impl DriverHandle {
    pub fn scheduler(&self) -> &Arc<SyncScheduler> {
        &self.scheduler
    }

    /// Trigger a tick now.
    pub fn force_sync(&self) {
        self.scheduler.force_sync();
    }

    /// Stop the scheduler and the loop. Syncs already dispatched run to
    /// completion but are discarded.
    pub fn stop(self) {
        self.scheduler.stop();
        self.task.abort();
        info!("Sync driver stopped");
    }
}

async fn run_loop(scheduler: Arc<SyncScheduler>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = scheduler.forced() => {
                debug!("Forced sync tick");
            }
        }

        if !scheduler.is_running() {
            break;
        }

        let syncs: Vec<_> = scheduler
            .plan_tick(now_ms())
            .into_iter()
            .map(|ticket| {
                let scheduler = Arc::clone(&scheduler);
                tokio::spawn(async move {
                    let node_id = ticket.node_id.clone();
                    if let Err(e) = scheduler.execute(ticket, now_ms()).await {
                        debug!("Sync task for {} ended with error: {}", node_id, e);
                    }
                })
            })
            .collect();

        let pruner = Arc::clone(&scheduler);
        tokio::spawn(async move {
            join_all(syncs).await;
            pruner.prune_backups(now_ms()).await;
        });
    }
}
