//! libSQL backend: durable job queue and conversation log.
//!
//! Supports local file and in-memory databases. Claims are a single
//! `UPDATE … RETURNING` statement, so two workers can never take the same
//! lease.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{params, Connection, Database as LibSqlDatabase};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{DatabaseError, QueueError};
use crate::pipeline::types::LeadContext;
use crate::store::migrations;
use crate::store::traits::{ConversationRecord, ConversationRepository};
use crate::worker::queue::{chrono_span, validate_message, JobQueue};
use crate::worker::state::{ClaimedJob, JobResult, JobStatus, WorkItem};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    max_attempts: u32,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db)?;
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let backend = Self::from_database(db)?;
        backend.init_schema().await?;
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
            max_attempts: 1,
        })
    }

    /// Deliveries allowed per job before a lapsed lease fails it.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    async fn init_schema(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn job_status(&self, job_id: &str) -> Result<Option<JobStatus>, DatabaseError> {
        let mut rows = self
            .conn()
            .query("SELECT status FROM jobs WHERE id = ?1", params![job_id])
            .await
            .map_err(|e| DatabaseError::Query(format!("job_status: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let status: String = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("job_status row parse: {e}")))?;
                Ok(JobStatus::parse(&status))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("job_status: {e}"))),
        }
    }

    /// Fail jobs whose lease lapsed on their last allowed attempt.
    async fn expire_exhausted(&self, now_ms: i64) -> Result<u64, DatabaseError> {
        let expired = self
            .conn()
            .execute(
                "UPDATE jobs SET status = 'failed', lease_until = NULL, finished_at = ?1, \
                 error = 'lease expired after ' || attempt || ' attempt(s) without acknowledgement' \
                 WHERE status = 'processing' AND attempt >= ?2 \
                 AND lease_until IS NOT NULL AND lease_until <= ?1",
                params![now_ms, self.max_attempts as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("expire_exhausted: {e}")))?;
        if expired > 0 {
            warn!(count = expired, "Jobs failed after lease expiry");
        }
        Ok(expired)
    }

    async fn missing_or(&self, job_id: &str, accepted: bool) -> Result<bool, QueueError> {
        if !accepted && self.job_status(job_id).await?.is_none() {
            return Err(QueueError::NotFound {
                id: job_id.to_string(),
            });
        }
        Ok(accepted)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn row_to_work_item(row: &libsql::Row) -> Result<(String, WorkItem), DatabaseError> {
    let parse = |e: libsql::Error| DatabaseError::Query(format!("job row parse: {e}"));
    let id: String = row.get(0).map_err(parse)?;
    let message: String = row.get(1).map_err(parse)?;
    let context_json: String = row.get(2).map_err(parse)?;
    let enqueued_at: String = row.get(3).map_err(parse)?;
    let attempt: i64 = row.get(4).map_err(parse)?;

    let lead_context: LeadContext = serde_json::from_str(&context_json)
        .map_err(|e| DatabaseError::Serialization(format!("lead_context for {id}: {e}")))?;

    Ok((
        id,
        WorkItem {
            message,
            lead_context,
            enqueued_at: parse_datetime(&enqueued_at),
            attempt: u32::try_from(attempt).unwrap_or(u32::MAX),
        },
    ))
}

// ── Job queue ───────────────────────────────────────────────────────

#[async_trait]
impl JobQueue for LibSqlBackend {
    async fn enqueue(&self, message: &str, lead_context: LeadContext) -> Result<String, QueueError> {
        validate_message(message)?;
        let id = Uuid::new_v4().to_string();
        let context_json = serde_json::to_string(&lead_context.normalized())
            .map_err(|e| DatabaseError::Serialization(format!("lead_context: {e}")))?;

        self.conn()
            .execute(
                "INSERT INTO jobs (id, message, lead_context, enqueued_at, attempt, status) \
                 VALUES (?1, ?2, ?3, ?4, 0, 'queued')",
                params![id.as_str(), message, context_json, Utc::now().to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("enqueue: {e}")))?;

        info!(job_id = %id, "Job enqueued");
        Ok(id)
    }

    async fn get_result(&self, job_id: &str) -> Result<JobResult, QueueError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT status, result, error FROM jobs WHERE id = ?1",
                params![job_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_result: {e}")))?;

        let row = match rows.next().await {
            Ok(Some(row)) => row,
            Ok(None) => {
                return Err(QueueError::NotFound {
                    id: job_id.to_string(),
                });
            }
            Err(e) => return Err(DatabaseError::Query(format!("get_result: {e}")).into()),
        };

        let status_str: String = row
            .get(0)
            .map_err(|e| DatabaseError::Query(format!("get_result row parse: {e}")))?;
        let status = JobStatus::parse(&status_str).ok_or_else(|| {
            DatabaseError::Serialization(format!("unknown job status {status_str:?}"))
        })?;
        let result: Option<String> = row.get(1).ok();
        let error: Option<String> = row.get(2).ok();
        Ok(JobResult::from_parts(status, result, error))
    }

    async fn claim(&self, lease: Duration) -> Result<Option<ClaimedJob>, QueueError> {
        let now = Utc::now();
        let now_ms = now.timestamp_millis();
        self.expire_exhausted(now_ms).await?;

        let lease_until = now + chrono_span(lease);
        let mut rows = self
            .conn()
            .query(
                "UPDATE jobs SET status = 'processing', attempt = attempt + 1, lease_until = ?1 \
                 WHERE id = ( \
                     SELECT id FROM jobs \
                     WHERE status = 'queued' \
                        OR (status = 'processing' AND attempt < ?2 \
                            AND (lease_until IS NULL OR lease_until <= ?3)) \
                     ORDER BY rowid LIMIT 1 \
                 ) \
                 RETURNING id, message, lead_context, enqueued_at, attempt",
                params![
                    lease_until.timestamp_millis(),
                    self.max_attempts as i64,
                    now_ms
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("claim: {e}")))?;

        let row = match rows.next().await {
            Ok(Some(row)) => row,
            Ok(None) => return Ok(None),
            Err(e) => return Err(DatabaseError::Query(format!("claim: {e}")).into()),
        };
        let (job_id, item) = row_to_work_item(&row)?;

        if item.attempt > 1 {
            info!(job_id = %job_id, attempt = item.attempt, "Redelivering job");
        } else {
            debug!(job_id = %job_id, "Job claimed");
        }

        Ok(Some(ClaimedJob {
            job_id,
            item,
            lease_until,
        }))
    }

    async fn complete(&self, job: &ClaimedJob, reply: &str) -> Result<bool, QueueError> {
        let updated = self
            .conn()
            .execute(
                "UPDATE jobs SET status = 'completed', result = ?2, error = NULL, \
                 lease_until = NULL, finished_at = ?3 \
                 WHERE id = ?1 AND status = 'processing'",
                params![job.job_id.as_str(), reply, Utc::now().timestamp_millis()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("complete: {e}")))?;

        if updated == 0 {
            debug!(job_id = %job.job_id, "Late completion ignored");
        }
        self.missing_or(&job.job_id, updated > 0).await
    }

    async fn fail(&self, job: &ClaimedJob, error: &str) -> Result<bool, QueueError> {
        let updated = self
            .conn()
            .execute(
                "UPDATE jobs SET error = ?2, lease_until = NULL, \
                 status = CASE WHEN attempt < ?4 THEN 'processing' ELSE 'failed' END, \
                 finished_at = CASE WHEN attempt < ?4 THEN NULL ELSE ?5 END \
                 WHERE id = ?1 AND status = 'processing' AND attempt = ?3",
                params![
                    job.job_id.as_str(),
                    error,
                    job.item.attempt as i64,
                    self.max_attempts as i64,
                    Utc::now().timestamp_millis()
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("fail: {e}")))?;

        if updated == 0 {
            debug!(job_id = %job.job_id, attempt = job.item.attempt, "Stale failure ignored");
        } else if job.item.attempt < self.max_attempts {
            info!(job_id = %job.job_id, attempt = job.item.attempt, "Attempt failed; job will be retried");
        }
        self.missing_or(&job.job_id, updated > 0).await
    }

    async fn prune_finished(&self, older_than: Duration) -> Result<usize, QueueError> {
        let cutoff = (Utc::now() - chrono_span(older_than)).timestamp_millis();
        let pruned = self
            .conn()
            .execute(
                "DELETE FROM jobs WHERE status IN ('completed', 'failed') \
                 AND finished_at IS NOT NULL AND finished_at <= ?1",
                params![cutoff],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("prune_finished: {e}")))?;
        Ok(usize::try_from(pruned).unwrap_or(usize::MAX))
    }
}

// ── Conversation log ────────────────────────────────────────────────

#[async_trait]
impl ConversationRepository for LibSqlBackend {
    async fn append(&self, record: &ConversationRecord) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO conversation_log (id, lead_id, role, content, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    Uuid::new_v4().to_string(),
                    record.lead_id.as_str(),
                    record.role.as_str(),
                    record.content.as_str(),
                    record.timestamp.to_rfc3339()
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("append_conversation: {e}")))?;
        Ok(())
    }

    async fn history(&self, lead_id: &str) -> Result<Vec<ConversationRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT lead_id, role, content, created_at FROM conversation_log \
                 WHERE lead_id = ?1 ORDER BY rowid",
                params![lead_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("history: {e}")))?;

        let mut records = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("history: {e}")))?
        {
            let parse = |e: libsql::Error| DatabaseError::Query(format!("history row parse: {e}"));
            let created_at: String = row.get(3).map_err(parse)?;
            records.push(ConversationRecord {
                lead_id: row.get(0).map_err(parse)?,
                role: row.get(1).map_err(parse)?,
                content: row.get(2).map_err(parse)?,
                timestamp: parse_datetime(&created_at),
            });
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LEASE: Duration = Duration::from_secs(60);

    async fn backend() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    #[tokio::test]
    async fn enqueue_claim_complete() {
        let db = backend().await;
        let context = LeadContext::new("42").with_name("Ana").with_attr("phone", "555");
        let id = db.enqueue("hola", context.clone()).await.unwrap();
        assert_eq!(db.get_result(&id).await.unwrap(), JobResult::queued());

        let job = db.claim(LEASE).await.unwrap().unwrap();
        assert_eq!(job.job_id, id);
        assert_eq!(job.item.message, "hola");
        assert_eq!(job.item.lead_context, context);
        assert_eq!(job.item.attempt, 1);
        assert_eq!(db.get_result(&id).await.unwrap(), JobResult::processing());
        assert!(db.claim(LEASE).await.unwrap().is_none());

        assert!(db.complete(&job, "¡Hola!").await.unwrap());
        assert!(!db.complete(&job, "again").await.unwrap());
        assert_eq!(db.get_result(&id).await.unwrap(), JobResult::completed("¡Hola!"));
    }

    #[tokio::test]
    async fn numeric_lead_id_survives_storage() {
        let db = backend().await;
        let context: LeadContext = serde_json::from_str(r#"{"id": 17, "name": "Bo"}"#).unwrap();
        db.enqueue("hi", context).await.unwrap();
        let job = db.claim(LEASE).await.unwrap().unwrap();
        assert_eq!(job.item.lead_context.lead_id(), Some("17"));
    }

    #[tokio::test]
    async fn colliding_context_keys_do_not_break_claim() {
        let db = backend().await;

        let mut anonymous = LeadContext::default();
        anonymous.extra.insert("id".into(), serde_json::json!("from-extra"));
        let mut named = LeadContext::new("5");
        named.extra.insert("id".into(), serde_json::json!("6"));
        named.extra.insert("name".into(), serde_json::json!("Zed"));

        db.enqueue("first", anonymous).await.unwrap();
        db.enqueue("second", named).await.unwrap();

        let first = db.claim(LEASE).await.unwrap().unwrap();
        assert_eq!(first.item.lead_context.lead_id(), None);
        assert!(first.item.lead_context.extra.is_empty());

        let second = db.claim(LEASE).await.unwrap().unwrap();
        assert_eq!(second.item.lead_context.lead_id(), Some("5"));
        assert_eq!(second.item.lead_context.name, None);
    }

    #[tokio::test]
    async fn claims_in_enqueue_order() {
        let db = backend().await;
        let first = db.enqueue("one", LeadContext::default()).await.unwrap();
        let second = db.enqueue("two", LeadContext::default()).await.unwrap();
        assert_eq!(db.claim(LEASE).await.unwrap().unwrap().job_id, first);
        assert_eq!(db.claim(LEASE).await.unwrap().unwrap().job_id, second);
    }

    #[tokio::test]
    async fn empty_message_rejected() {
        let db = backend().await;
        assert!(matches!(
            db.enqueue("", LeadContext::default()).await,
            Err(QueueError::InvalidItem(_))
        ));
    }

    #[tokio::test]
    async fn unknown_job_not_found() {
        let db = backend().await;
        assert!(matches!(
            db.get_result("missing").await,
            Err(QueueError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn lapsed_lease_redelivers_then_stale_fail_is_ignored() {
        let db = backend().await.with_max_attempts(2);
        let id = db.enqueue("hi", LeadContext::default()).await.unwrap();
        let first = db.claim(Duration::ZERO).await.unwrap().unwrap();
        let second = db.claim(LEASE).await.unwrap().unwrap();
        assert_eq!(second.job_id, id);
        assert_eq!(second.item.attempt, 2);

        assert!(!db.fail(&first, "crashed late").await.unwrap());
        assert_eq!(db.get_result(&id).await.unwrap(), JobResult::processing());

        assert!(db.complete(&second, "done").await.unwrap());
        assert_eq!(db.get_result(&id).await.unwrap(), JobResult::completed("done"));
    }

    #[tokio::test]
    async fn exhausted_lease_fails_job() {
        let db = backend().await;
        let id = db.enqueue("hi", LeadContext::default()).await.unwrap();
        db.claim(Duration::ZERO).await.unwrap().unwrap();

        assert!(db.claim(LEASE).await.unwrap().is_none());
        let result = db.get_result(&id).await.unwrap();
        assert_eq!(result.status, JobStatus::Failed);
        assert_eq!(
            result.error.as_deref(),
            Some("lease expired after 1 attempt(s) without acknowledgement")
        );
    }

    #[tokio::test]
    async fn failed_attempt_retried_until_exhausted() {
        let db = backend().await.with_max_attempts(2);
        let id = db.enqueue("hi", LeadContext::default()).await.unwrap();

        let first = db.claim(LEASE).await.unwrap().unwrap();
        assert!(db.fail(&first, "timeout").await.unwrap());
        assert_eq!(db.get_result(&id).await.unwrap(), JobResult::processing());

        let second = db.claim(LEASE).await.unwrap().unwrap();
        assert_eq!(second.item.attempt, 2);
        assert!(db.fail(&second, "timeout again").await.unwrap());
        assert_eq!(db.get_result(&id).await.unwrap(), JobResult::failed("timeout again"));
        assert!(db.claim(LEASE).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn prune_removes_old_results_only() {
        let db = backend().await;
        let done = db.enqueue("a", LeadContext::default()).await.unwrap();
        let queued = db.enqueue("b", LeadContext::default()).await.unwrap();
        let job = db.claim(LEASE).await.unwrap().unwrap();
        db.complete(&job, "ok").await.unwrap();

        assert_eq!(db.prune_finished(Duration::from_secs(3600)).await.unwrap(), 0);
        assert_eq!(db.prune_finished(Duration::ZERO).await.unwrap(), 1);
        assert!(matches!(
            db.get_result(&done).await,
            Err(QueueError::NotFound { .. })
        ));
        assert_eq!(db.get_result(&queued).await.unwrap(), JobResult::queued());
    }

    #[tokio::test]
    async fn conversation_duplicates_are_kept() {
        let db = backend().await;
        let record = ConversationRecord::new("lead-1", "assistant", "See you Monday");
        db.append(&record).await.unwrap();
        db.append(&record).await.unwrap();
        db.append(&ConversationRecord::new("lead-2", "user", "hi")).await.unwrap();

        let history = db.history("lead-1").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, "assistant");
        assert_eq!(history[1].content, "See you Monday");
    }

    #[tokio::test]
    async fn jobs_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("agent.db");

        let id = {
            let db = LibSqlBackend::new_local(&path).await.unwrap();
            db.enqueue("persist me", LeadContext::new("9")).await.unwrap()
        };

        let db = LibSqlBackend::new_local(&path).await.unwrap();
        assert_eq!(db.get_result(&id).await.unwrap(), JobResult::queued());
        let job = db.claim(LEASE).await.unwrap().unwrap();
        assert_eq!(job.item.message, "persist me");
    }
}
