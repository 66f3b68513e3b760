//! Worker pool and background result sweeper.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::worker::queue::JobQueue;
use crate::worker::worker::Worker;

/// How often the sweeper prunes finished results.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Pool sizing and polling.
#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    pub workers: usize,
    /// Idle wait between empty claims.
    pub poll_interval: Duration,
    /// Lease taken on each claim. Must exceed the job timeout.
    pub lease: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            poll_interval: Duration::from_millis(250),
            lease: Duration::from_secs(300),
        }
    }
}

/// N independent consumers of one queue.
///
/// Workers share nothing but the queue handle; each loop claims, processes,
/// and acknowledges one item at a time.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    shutdown: watch::Sender<bool>,
}

impl WorkerPool {
    pub fn spawn(worker: Worker, config: PoolConfig) -> Self {
        let (shutdown, rx) = watch::channel(false);
        let count = config.workers.max(1);
        let handles = (0..count)
            .map(|index| tokio::spawn(run_loop(index, worker.clone(), config, rx.clone())))
            .collect();
        info!(workers = count, lease_secs = config.lease.as_secs(), "Worker pool started");
        Self { handles, shutdown }
    }

    /// A receiver that flips to `true` when the pool shuts down.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn size(&self) -> usize {
        self.handles.len()
    }

    /// Stop claiming new work and wait for in-flight attempts to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for result in join_all(self.handles).await {
            if let Err(e) = result {
                warn!(error = %e, "Worker loop exited abnormally");
            }
        }
        info!("Worker pool stopped");
    }
}

async fn run_loop(index: usize, worker: Worker, config: PoolConfig, mut shutdown: watch::Receiver<bool>) {
    debug!(worker = index, "Worker loop started");
    loop {
        if *shutdown.borrow() {
            break;
        }

        match worker.queue().claim(config.lease).await {
            Ok(Some(job)) => {
                debug!(worker = index, job_id = %job.job_id, "Claimed job");
                worker.process(job).await;
                continue;
            }
            Ok(None) => {}
            Err(e) => warn!(worker = index, error = %e, "Failed to claim job"),
        }

        tokio::select! {
            _ = tokio::time::sleep(config.poll_interval) => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
    debug!(worker = index, "Worker loop stopped");
}

/// Periodically drop terminal results older than `ttl`.
pub fn spawn_result_sweeper(
    queue: Arc<dyn JobQueue>,
    ttl: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match queue.prune_finished(ttl).await {
                        Ok(0) => {}
                        Ok(pruned) => info!(pruned, "Pruned expired job results"),
                        Err(e) => warn!(error = %e, "Failed to prune job results"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    })
}

/// Wait for a background task to end. A panic or cancellation is logged,
/// not propagated. Returns whether the task exited cleanly.
pub async fn join_background(task: &'static str, handle: JoinHandle<()>) -> bool {
    match handle.await {
        Ok(()) => true,
        Err(e) => {
            warn!(task, error = %e, "Background task exited abnormally");
            false
        }
    }
}
