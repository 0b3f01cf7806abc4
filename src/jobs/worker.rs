//! Background worker pool.
//!
//! Each worker is an independent tokio task that pulls pending jobs and runs
//! them one at a time. Workers wake on enqueue notifications and otherwise
//! poll. A separate maintenance task releases jobs whose lease expired and
//! runs the retention sweep.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::manager::{JobManager, ProcessOutcome};

/// Back-off after a failed poll so a down database is not hammered.
const POLL_ERROR_DELAY: Duration = Duration::from_secs(1);

pub struct WorkerPool {
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `worker_count` workers plus the maintenance task.
    pub fn start(manager: Arc<JobManager>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker_count = manager.config().worker_count.max(1);

        let mut handles = Vec::with_capacity(worker_count + 1);
        for worker_id in 0..worker_count {
            handles.push(tokio::spawn(worker_loop(
                worker_id,
                manager.clone(),
                shutdown_rx.clone(),
            )));
        }
        handles.push(tokio::spawn(maintenance_loop(manager, shutdown_rx)));

        info!(workers = worker_count, "Job worker pool started");
        Self { shutdown_tx, handles }
    }

    /// Signal shutdown and wait for workers to finish their current job.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for result in futures::future::join_all(self.handles).await {
            if let Err(e) = result {
                error!(error = %e, "Worker task panicked");
            }
        }
        info!("Job worker pool stopped");
    }
}

async fn worker_loop(worker_id: usize, manager: Arc<JobManager>, mut shutdown: watch::Receiver<bool>) {
    let notify = manager.notifier();
    let poll_interval = manager.config().poll_interval;
    let batch = i64::try_from(manager.config().worker_count.max(1)).unwrap_or(1);
    debug!(worker_id, "Worker started");

    loop {
        if *shutdown.borrow() {
            break;
        }

        let pending = match manager.pending_jobs(batch).await {
            Ok(ids) => ids,
            Err(e) => {
                error!(worker_id, error = %e, "Failed to poll pending jobs");
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(POLL_ERROR_DELAY) => {}
                }
                continue;
            }
        };

        let mut ran_any = false;
        for job_id in pending {
            if *shutdown.borrow() {
                break;
            }
            match manager.process(job_id).await {
                Ok(ProcessOutcome::Finished(status)) => {
                    ran_any = true;
                    debug!(worker_id, job_id = %job_id, status = %status, "Worker finished job");
                }
                // Claimed by another worker in the meantime
                Ok(ProcessOutcome::Skipped(_)) => {}
                Err(e) => {
                    ran_any = true;
                    warn!(worker_id, job_id = %job_id, error = %e, "Job processing failed");
                }
            }
        }

        if !ran_any {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = notify.notified() => {}
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }
    }

    debug!(worker_id, "Worker stopped");
}

/// Both timers fire immediately on start, so jobs left `PROCESSING` by a
/// previous process are released once their lease has run out.
async fn maintenance_loop(manager: Arc<JobManager>, mut shutdown: watch::Receiver<bool>) {
    let mut sweep = tokio::time::interval(manager.config().sweep_interval);
    let mut recovery = tokio::time::interval(manager.config().heartbeat_interval());
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = recovery.tick() => {
                if let Err(e) = manager.recover_stale().await {
                    warn!(error = %e, "Stale job recovery failed");
                }
            }
            _ = sweep.tick() => {
                if let Err(e) = manager.sweep_expired().await {
                    warn!(error = %e, "Retention sweep failed");
                }
            }
        }
    }
}
