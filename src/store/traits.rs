//! Storage traits for conversation memory.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DatabaseError;

/// One persisted conversation turn.
///
/// Records are append-only. Identical records may appear more than once when
/// a work item is redelivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub lead_id: String,
    pub role: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl ConversationRecord {
    pub fn new(lead_id: impl Into<String>, role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            lead_id: lead_id.into(),
            role: role.into(),
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Append-only conversation log.
#[async_trait]
pub trait ConversationRepository: Send + Sync {
    /// Append one record. Never deduplicates.
    async fn append(&self, record: &ConversationRecord) -> Result<(), DatabaseError>;

    /// All records for a lead, oldest first.
    async fn history(&self, lead_id: &str) -> Result<Vec<ConversationRecord>, DatabaseError>;
}
