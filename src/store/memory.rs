//! In-memory conversation log, for tests and ephemeral runs.

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::DatabaseError;
use crate::store::traits::{ConversationRecord, ConversationRepository};

#[derive(Debug, Default)]
pub struct InMemoryConversations {
    records: RwLock<Vec<ConversationRecord>>,
}

impl InMemoryConversations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records across all leads.
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl ConversationRepository for InMemoryConversations {
    async fn append(&self, record: &ConversationRecord) -> Result<(), DatabaseError> {
        self.records.write().await.push(record.clone());
        Ok(())
    }

    async fn history(&self, lead_id: &str) -> Result<Vec<ConversationRecord>, DatabaseError> {
        Ok(self
            .records
            .read()
            .await
            .iter()
            .filter(|r| r.lead_id == lead_id)
            .cloned()
            .collect())
    }
}
