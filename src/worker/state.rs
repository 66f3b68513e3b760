//! Job status state machine and the work item carried by the queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::pipeline::types::LeadContext;

/// Status of a queued job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for a worker.
    Queued,
    /// Claimed by a worker attempt (or awaiting redelivery).
    Processing,
    /// Reply generated.
    Completed,
    /// Failed and will not be retried.
    Failed,
}

impl JobStatus {
    /// Check if this state allows transitioning to another state.
    ///
    /// `Processing → Processing` is a redelivery. Nothing leaves a terminal state.
    pub fn can_transition_to(&self, target: JobStatus) -> bool {
        use JobStatus::*;

        matches!(
            (self, target),
            (Queued, Processing)
                | (Processing, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<JobStatus> {
        match s {
            "queued" => Some(Self::Queued),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pollable job result, shaped for the ingestion side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResult {
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobResult {
    pub fn queued() -> Self {
        Self {
            status: JobStatus::Queued,
            result: None,
            error: None,
        }
    }

    pub fn processing() -> Self {
        Self {
            status: JobStatus::Processing,
            result: None,
            error: None,
        }
    }

    pub fn completed(reply: impl Into<String>) -> Self {
        Self {
            status: JobStatus::Completed,
            result: Some(reply.into()),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: JobStatus::Failed,
            result: None,
            error: Some(error.into()),
        }
    }

    /// Build the visible result from stored columns. Result and error text are
    /// only exposed once the job is terminal.
    pub fn from_parts(status: JobStatus, result: Option<String>, error: Option<String>) -> Self {
        match status {
            JobStatus::Queued => Self::queued(),
            JobStatus::Processing => Self::processing(),
            JobStatus::Completed => Self::completed(result.unwrap_or_default()),
            JobStatus::Failed => Self::failed(error.unwrap_or_else(|| "unknown error".to_string())),
        }
    }
}

/// One unit of queued work. Everything a worker needs travels inside it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub message: String,
    pub lead_context: LeadContext,
    pub enqueued_at: DateTime<Utc>,
    /// Delivery attempt, starting at 1 on first claim.
    pub attempt: u32,
}

/// A work item claimed by one worker attempt.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub job_id: String,
    pub item: WorkItem,
    /// When the lease lapses and the item becomes eligible for redelivery.
    pub lease_until: DateTime<Utc>,
}
