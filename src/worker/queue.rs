//! Job queue contract and the in-process implementation.
//!
//! Delivery is at-least-once. A claim holds a lease; if the lease lapses
//! before the attempt reaches a terminal write, the item is handed out
//! again with `attempt + 1` until `max_attempts` is spent.
//!
//! Terminal writes are forward-only. The first `complete`/`fail` that lands
//! wins; later writes for the same job return `false`.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::QueueError;
use crate::pipeline::types::LeadContext;
use crate::worker::state::{ClaimedJob, JobResult, JobStatus, WorkItem};

/// Durable mailbox between ingestion and workers.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Store a new work item and return its job id. Never waits for processing.
    async fn enqueue(&self, message: &str, lead_context: LeadContext) -> Result<String, QueueError>;

    /// Current result for a job.
    async fn get_result(&self, job_id: &str) -> Result<JobResult, QueueError>;

    /// Claim the oldest deliverable item under a lease of `lease`.
    async fn claim(&self, lease: Duration) -> Result<Option<ClaimedJob>, QueueError>;

    /// Record a reply. Returns whether this write moved the job to `completed`.
    async fn complete(&self, job: &ClaimedJob, reply: &str) -> Result<bool, QueueError>;

    /// Record a failed attempt. Returns whether the write was accepted; a job
    /// with attempts left stays `processing` and is redelivered.
    async fn fail(&self, job: &ClaimedJob, error: &str) -> Result<bool, QueueError>;

    /// Drop terminal jobs that finished more than `older_than` ago.
    async fn prune_finished(&self, older_than: Duration) -> Result<usize, QueueError>;
}

/// Reject items that could never produce a useful turn.
pub(crate) fn validate_message(message: &str) -> Result<(), QueueError> {
    if message.trim().is_empty() {
        return Err(QueueError::InvalidItem("message is empty".to_string()));
    }
    Ok(())
}

/// Convert a std duration for timestamp arithmetic, saturating at ten years.
pub(crate) fn chrono_span(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d)
        .ok()
        .filter(|span| *span <= chrono::Duration::days(3650))
        .unwrap_or_else(|| chrono::Duration::days(3650))
}

pub(crate) fn exhausted_message(attempts: u32) -> String {
    format!("lease expired after {attempts} attempt(s) without acknowledgement")
}

// ── In-memory queue ─────────────────────────────────────────────────

#[derive(Debug)]
struct Entry {
    item: WorkItem,
    status: JobStatus,
    result: Option<String>,
    error: Option<String>,
    /// `None` while queued or when a retry is immediately deliverable.
    lease_until: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

impl Entry {
    fn transition(&mut self, target: JobStatus) -> bool {
        if !self.status.can_transition_to(target) {
            return false;
        }
        self.status = target;
        if target.is_terminal() {
            self.finished_at = Some(Utc::now());
            self.lease_until = None;
        }
        true
    }

    fn deliverable(&self, now: DateTime<Utc>, max_attempts: u32) -> bool {
        match self.status {
            JobStatus::Queued => true,
            JobStatus::Processing => {
                self.item.attempt < max_attempts && self.lease_until.is_none_or(|l| l <= now)
            }
            _ => false,
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    jobs: HashMap<String, Entry>,
    /// Job ids in enqueue order.
    order: Vec<String>,
}

/// Queue held in process memory. Loses its contents on restart.
#[derive(Debug)]
pub struct InMemoryQueue {
    inner: Mutex<Inner>,
    max_attempts: u32,
}

impl InMemoryQueue {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            max_attempts: max_attempts.max(1),
        }
    }

    /// Jobs not yet in a terminal state.
    pub async fn in_flight(&self) -> usize {
        self.inner
            .lock()
            .await
            .jobs
            .values()
            .filter(|e| !e.status.is_terminal())
            .count()
    }
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new(1)
    }
}

#[async_trait]
impl JobQueue for InMemoryQueue {
    async fn enqueue(&self, message: &str, lead_context: LeadContext) -> Result<String, QueueError> {
        validate_message(message)?;
        let id = Uuid::new_v4().to_string();
        let entry = Entry {
            item: WorkItem {
                message: message.to_string(),
                lead_context: lead_context.normalized(),
                enqueued_at: Utc::now(),
                attempt: 0,
            },
            status: JobStatus::Queued,
            result: None,
            error: None,
            lease_until: None,
            finished_at: None,
        };

        let mut inner = self.inner.lock().await;
        inner.jobs.insert(id.clone(), entry);
        inner.order.push(id.clone());
        info!(job_id = %id, "Job enqueued");
        Ok(id)
    }

    async fn get_result(&self, job_id: &str) -> Result<JobResult, QueueError> {
        let inner = self.inner.lock().await;
        let entry = inner.jobs.get(job_id).ok_or_else(|| QueueError::NotFound {
            id: job_id.to_string(),
        })?;
        Ok(JobResult::from_parts(
            entry.status,
            entry.result.clone(),
            entry.error.clone(),
        ))
    }

    async fn claim(&self, lease: Duration) -> Result<Option<ClaimedJob>, QueueError> {
        let now = Utc::now();
        let max_attempts = self.max_attempts;
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;

        for (id, entry) in inner.jobs.iter_mut() {
            let lapsed = entry.status == JobStatus::Processing
                && entry.item.attempt >= max_attempts
                && entry.lease_until.is_some_and(|l| l <= now);
            if lapsed && entry.transition(JobStatus::Failed) {
                entry.error = Some(exhausted_message(entry.item.attempt));
                warn!(job_id = %id, attempts = entry.item.attempt, "Job lease expired with no attempts left");
            }
        }

        let Some(id) = inner
            .order
            .iter()
            .find(|id| {
                inner
                    .jobs
                    .get(*id)
                    .is_some_and(|e| e.deliverable(now, max_attempts))
            })
            .cloned()
        else {
            return Ok(None);
        };

        let Some(entry) = inner.jobs.get_mut(&id) else {
            return Ok(None);
        };
        if !entry.transition(JobStatus::Processing) {
            return Ok(None);
        }
        entry.item.attempt += 1;
        let lease_until = now + chrono_span(lease);
        entry.lease_until = Some(lease_until);

        if entry.item.attempt > 1 {
            info!(job_id = %id, attempt = entry.item.attempt, "Redelivering job");
        } else {
            debug!(job_id = %id, "Job claimed");
        }

        Ok(Some(ClaimedJob {
            job_id: id,
            item: entry.item.clone(),
            lease_until,
        }))
    }

    async fn complete(&self, job: &ClaimedJob, reply: &str) -> Result<bool, QueueError> {
        let mut inner = self.inner.lock().await;
        let entry = inner.jobs.get_mut(&job.job_id).ok_or_else(|| QueueError::NotFound {
            id: job.job_id.clone(),
        })?;

        if !entry.transition(JobStatus::Completed) {
            debug!(job_id = %job.job_id, status = %entry.status, "Late completion ignored");
            return Ok(false);
        }
        entry.result = Some(reply.to_string());
        entry.error = None;
        Ok(true)
    }

    async fn fail(&self, job: &ClaimedJob, error: &str) -> Result<bool, QueueError> {
        let max_attempts = self.max_attempts;
        let mut inner = self.inner.lock().await;
        let entry = inner.jobs.get_mut(&job.job_id).ok_or_else(|| QueueError::NotFound {
            id: job.job_id.clone(),
        })?;

        if entry.status.is_terminal() || entry.item.attempt != job.item.attempt {
            debug!(
                job_id = %job.job_id,
                attempt = job.item.attempt,
                current = entry.item.attempt,
                "Stale failure ignored"
            );
            return Ok(false);
        }

        entry.error = Some(error.to_string());
        if entry.item.attempt < max_attempts {
            entry.lease_until = None;
            info!(job_id = %job.job_id, attempt = entry.item.attempt, "Attempt failed; job will be retried");
            return Ok(true);
        }
        Ok(entry.transition(JobStatus::Failed))
    }

    async fn prune_finished(&self, older_than: Duration) -> Result<usize, QueueError> {
        let cutoff = Utc::now() - chrono_span(older_than);
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;

        let before = inner.jobs.len();
        inner
            .jobs
            .retain(|_, e| !(e.status.is_terminal() && e.finished_at.is_some_and(|f| f <= cutoff)));
        let jobs = &inner.jobs;
        inner.order.retain(|id| jobs.contains_key(id));
        Ok(before - inner.jobs.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LEASE: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn enqueue_then_poll() {
        let queue = InMemoryQueue::default();
        let id = queue.enqueue("hello", LeadContext::new("1")).await.unwrap();
        assert_eq!(queue.get_result(&id).await.unwrap(), JobResult::queued());
    }

    #[tokio::test]
    async fn empty_message_rejected() {
        let queue = InMemoryQueue::default();
        let err = queue.enqueue("   ", LeadContext::default()).await.unwrap_err();
        assert!(matches!(err, QueueError::InvalidItem(_)));
    }

    #[tokio::test]
    async fn unknown_job_not_found() {
        let queue = InMemoryQueue::default();
        assert!(matches!(
            queue.get_result("nope").await,
            Err(QueueError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn claims_in_fifo_order() {
        let queue = InMemoryQueue::default();
        let first = queue.enqueue("one", LeadContext::default()).await.unwrap();
        let second = queue.enqueue("two", LeadContext::default()).await.unwrap();

        let a = queue.claim(LEASE).await.unwrap().unwrap();
        let b = queue.claim(LEASE).await.unwrap().unwrap();
        assert_eq!(a.job_id, first);
        assert_eq!(b.job_id, second);
        assert_eq!(a.item.attempt, 1);
        assert!(queue.claim(LEASE).await.unwrap().is_none());
        assert_eq!(queue.get_result(&first).await.unwrap(), JobResult::processing());
    }

    #[tokio::test]
    async fn first_terminal_write_wins() {
        let queue = InMemoryQueue::default();
        let id = queue.enqueue("hi", LeadContext::default()).await.unwrap();
        let claim = queue.claim(LEASE).await.unwrap().unwrap();

        assert!(queue.complete(&claim, "hello!").await.unwrap());
        assert!(!queue.complete(&claim, "again").await.unwrap());
        assert!(!queue.fail(&claim, "boom").await.unwrap());
        assert_eq!(queue.get_result(&id).await.unwrap(), JobResult::completed("hello!"));
    }

    #[tokio::test]
    async fn failure_is_terminal_with_single_attempt() {
        let queue = InMemoryQueue::new(1);
        let id = queue.enqueue("hi", LeadContext::default()).await.unwrap();
        let claim = queue.claim(LEASE).await.unwrap().unwrap();

        assert!(queue.fail(&claim, "provider down").await.unwrap());
        assert_eq!(queue.get_result(&id).await.unwrap(), JobResult::failed("provider down"));
        assert!(queue.claim(LEASE).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failed_attempt_is_retried_when_allowed() {
        let queue = InMemoryQueue::new(2);
        let id = queue.enqueue("hi", LeadContext::default()).await.unwrap();
        let first = queue.claim(LEASE).await.unwrap().unwrap();
        assert!(queue.fail(&first, "timeout").await.unwrap());
        assert_eq!(queue.get_result(&id).await.unwrap(), JobResult::processing());

        let second = queue.claim(LEASE).await.unwrap().unwrap();
        assert_eq!(second.item.attempt, 2);
        assert!(queue.complete(&second, "ok").await.unwrap());
        assert_eq!(queue.get_result(&id).await.unwrap(), JobResult::completed("ok"));
    }

    #[tokio::test]
    async fn lapsed_lease_is_redelivered() {
        let queue = InMemoryQueue::new(2);
        let id = queue.enqueue("hi", LeadContext::default()).await.unwrap();
        let first = queue.claim(Duration::ZERO).await.unwrap().unwrap();

        let second = queue.claim(LEASE).await.unwrap().unwrap();
        assert_eq!(second.job_id, id);
        assert_eq!(second.item.attempt, 2);

        // The stale attempt cannot fail the job, but its reply still counts.
        assert!(!queue.fail(&first, "late crash").await.unwrap());
        assert!(queue.complete(&first, "late reply").await.unwrap());
        assert!(!queue.complete(&second, "second reply").await.unwrap());
        assert_eq!(queue.get_result(&id).await.unwrap(), JobResult::completed("late reply"));
    }

    #[tokio::test]
    async fn exhausted_lease_marks_failed() {
        let queue = InMemoryQueue::new(1);
        let id = queue.enqueue("hi", LeadContext::default()).await.unwrap();
        queue.claim(Duration::ZERO).await.unwrap().unwrap();

        assert!(queue.claim(LEASE).await.unwrap().is_none());
        let result = queue.get_result(&id).await.unwrap();
        assert_eq!(result.status, JobStatus::Failed);
        assert!(result.error.unwrap().contains("lease expired"));
        assert_eq!(queue.in_flight().await, 0);
    }

    #[tokio::test]
    async fn prune_drops_only_finished_jobs() {
        let queue = InMemoryQueue::default();
        let done = queue.enqueue("one", LeadContext::default()).await.unwrap();
        let waiting = queue.enqueue("two", LeadContext::default()).await.unwrap();
        let claim = queue.claim(LEASE).await.unwrap().unwrap();
        queue.complete(&claim, "ok").await.unwrap();

        assert_eq!(queue.prune_finished(Duration::from_secs(3600)).await.unwrap(), 0);
        assert_eq!(queue.prune_finished(Duration::ZERO).await.unwrap(), 1);
        assert!(matches!(
            queue.get_result(&done).await,
            Err(QueueError::NotFound { .. })
        ));
        assert_eq!(queue.get_result(&waiting).await.unwrap(), JobResult::queued());
    }
}
