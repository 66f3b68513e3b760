//! Per-attempt worker execution.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinError;
use tracing::{error, info, warn};

use crate::error::PipelineError;
use crate::notify::{NotificationPayload, NotificationSink};
use crate::pipeline::AgentPipeline;
use crate::worker::queue::JobQueue;
use crate::worker::state::ClaimedJob;

/// Shared dependencies for worker execution.
#[derive(Clone)]
pub struct WorkerDeps {
    pub queue: Arc<dyn JobQueue>,
    pub pipeline: Arc<AgentPipeline>,
    pub notifier: Option<Arc<dyn NotificationSink>>,
    /// Deadline for one pipeline attempt.
    pub job_timeout: Duration,
}

/// How one attempt ended, from the worker's side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// The pipeline produced a reply. `accepted` is false when another
    /// attempt already wrote a terminal result.
    Completed { accepted: bool },
    /// The attempt failed with `reason`.
    Failed { reason: String },
}

/// Runs claimed jobs through the pipeline and acknowledges them.
#[derive(Clone)]
pub struct Worker {
    deps: WorkerDeps,
}

impl Worker {
    pub fn new(deps: WorkerDeps) -> Self {
        Self { deps }
    }

    pub fn queue(&self) -> &Arc<dyn JobQueue> {
        &self.deps.queue
    }

    /// Execute one attempt end to end: pipeline, acknowledgement, notification.
    ///
    /// The pipeline runs in its own task so a panic inside any stage is
    /// caught and recorded as a failure rather than taking the worker down.
    pub async fn process(&self, job: ClaimedJob) -> AttemptOutcome {
        let pipeline = Arc::clone(&self.deps.pipeline);
        let item = job.item.clone();
        let handle = tokio::spawn(async move { pipeline.run(&item).await });
        let abort = handle.abort_handle();

        let run = match tokio::time::timeout(self.deps.job_timeout, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(PipelineError::Stage {
                stage: "worker".to_string(),
                reason: describe_join_error(join_err),
            }),
            Err(_) => {
                abort.abort();
                Err(PipelineError::Timeout(self.deps.job_timeout))
            }
        };

        match run {
            Ok(outcome) => {
                let reply = outcome.reply.content;
                let accepted = match self.deps.queue.complete(&job, &reply).await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!(job_id = %job.job_id, error = %e, "Failed to record job completion");
                        false
                    }
                };
                if accepted {
                    info!(
                        job_id = %job.job_id,
                        intent = %outcome.intent,
                        attempt = job.item.attempt,
                        "Job completed"
                    );
                    self.notify(&job, &reply).await;
                } else {
                    info!(job_id = %job.job_id, attempt = job.item.attempt, "Job already finished; result discarded");
                }
                AttemptOutcome::Completed { accepted }
            }
            Err(e) => {
                let reason = e.to_string();
                warn!(
                    job_id = %job.job_id,
                    attempt = job.item.attempt,
                    error = %reason,
                    "Job attempt failed"
                );
                if let Err(store_err) = self.deps.queue.fail(&job, &reason).await {
                    error!(job_id = %job.job_id, error = %store_err, "Failed to record job failure");
                }
                AttemptOutcome::Failed { reason }
            }
        }
    }

    async fn notify(&self, job: &ClaimedJob, reply: &str) {
        let Some(notifier) = &self.deps.notifier else {
            return;
        };
        let payload = NotificationPayload::new(&job.item.lead_context, reply);
        if let Err(e) = notifier.notify(&payload).await {
            warn!(job_id = %job.job_id, error = %e, "Webhook notification failed");
        }
    }
}

fn describe_join_error(err: JoinError) -> String {
    if err.is_cancelled() {
        return "pipeline task was cancelled".to_string();
    }
    match err.try_into_panic() {
        Ok(payload) => format!("pipeline panicked: {}", panic_text(payload.as_ref())),
        Err(err) => err.to_string(),
    }
}

fn panic_text(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
