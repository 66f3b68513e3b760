//! Application context: collaborators built once at startup.
//!
//! Everything a worker needs is reachable from here and handed out by
//! reference; nothing is stored in globals.

use std::sync::Arc;

use tracing::{info, warn};

use crate::config::AppConfig;
use crate::error::Error;
use crate::llm::{create_provider, LlmProvider};
use crate::notify::{NotificationSink, WebhookNotifier};
use crate::pipeline::{AgentPipeline, PipelineSettings};
use crate::safety::SafetyLayer;
use crate::store::{ConversationRepository, LibSqlBackend};
use crate::worker::{JobQueue, Worker, WorkerDeps};

/// Immutable wiring shared by the worker pool and the ingestion side.
pub struct AppContext {
    pub config: AppConfig,
    pub queue: Arc<dyn JobQueue>,
    pub conversations: Arc<dyn ConversationRepository>,
    pub pipeline: Arc<AgentPipeline>,
    pub notifier: Option<Arc<dyn NotificationSink>>,
}

impl AppContext {
    /// Open the database, create the provider, and wire everything up.
    pub async fn build(config: AppConfig) -> Result<Self, Error> {
        let db = Arc::new(
            LibSqlBackend::new_local(&config.db_path)
                .await?
                .with_max_attempts(config.queue.max_attempts),
        );
        let llm = create_provider(&config.llm)?;
        Self::from_parts(config, db.clone(), db, llm)
    }

    /// Wire a context around caller-supplied storage and provider.
    pub fn from_parts(
        config: AppConfig,
        queue: Arc<dyn JobQueue>,
        conversations: Arc<dyn ConversationRepository>,
        llm: Arc<dyn LlmProvider>,
    ) -> Result<Self, Error> {
        let safety = SafetyLayer::from_config(&config.safety);
        if !safety.pii_available() {
            warn!("PII redaction is off; user text reaches the LLM unredacted");
        }
        if !safety.validation_available() {
            warn!("Output validation is off; replies are not checked");
        }

        let pipeline = AgentPipeline::new(llm, Arc::new(safety), Arc::clone(&conversations))
            .with_settings(PipelineSettings {
                reply_temperature: config.llm.reply_temperature,
                ..PipelineSettings::default()
            });

        let notifier: Option<Arc<dyn NotificationSink>> = match &config.webhook {
            Some(webhook) => {
                let sink = WebhookNotifier::new(webhook.url.as_str(), webhook.timeout)?;
                info!(url = %webhook.url, "Webhook notifications enabled");
                Some(Arc::new(sink))
            }
            None => None,
        };

        Ok(Self {
            config,
            queue,
            conversations,
            pipeline: Arc::new(pipeline),
            notifier,
        })
    }

    /// A worker bound to this context.
    pub fn worker(&self) -> Worker {
        Worker::new(WorkerDeps {
            queue: Arc::clone(&self.queue),
            pipeline: Arc::clone(&self.pipeline),
            notifier: self.notifier.clone(),
            job_timeout: self.config.queue.job_timeout,
        })
    }
}
