//! Agent pipeline: intent classification, reply generation, memory persistence.
//!
//! One invocation per work item, stages strictly in order:
//! `Intent → Reply → Persist → Done`. A job-fatal error in any stage moves
//! straight to `Failed` without running later stages.
//!
//! Only reply generation can fail a turn. Classification errors degrade to
//! `Intent::Unknown`, and persistence errors are logged and swallowed.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::{LlmError, PipelineError};
use crate::llm::prompts::{build_reply_system_prompt, CLASSIFY_SYSTEM_PROMPT, FALLBACK_REPLY};
use crate::llm::provider::{estimate_cost, CompletionRequest, CompletionResponse, LlmProvider};
use crate::pipeline::types::{History, Intent, LeadContext, Message, Role, Stage, TurnOutcome};
use crate::safety::SafetyLayer;
use crate::store::traits::{ConversationRecord, ConversationRepository};
use crate::worker::state::WorkItem;

/// Classification is deterministic.
const CLASSIFY_TEMPERATURE: f32 = 0.0;

/// A single label is all the classifier needs to emit.
const CLASSIFY_MAX_TOKENS: u32 = 8;

/// Tunables for the LLM calls.
#[derive(Debug, Clone, Copy)]
pub struct PipelineSettings {
    pub reply_temperature: f32,
    pub reply_max_tokens: Option<u32>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            reply_temperature: 0.7,
            reply_max_tokens: None,
        }
    }
}

/// The three-stage conversation pipeline.
///
/// Holds only shared, immutable collaborators; invocations share no state.
pub struct AgentPipeline {
    llm: Arc<dyn LlmProvider>,
    safety: Arc<SafetyLayer>,
    conversations: Arc<dyn ConversationRepository>,
    settings: PipelineSettings,
}

impl AgentPipeline {
    pub fn new(
        llm: Arc<dyn LlmProvider>,
        safety: Arc<SafetyLayer>,
        conversations: Arc<dyn ConversationRepository>,
    ) -> Self {
        Self {
            llm,
            safety,
            conversations,
            settings: PipelineSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: PipelineSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Run all stages for one work item.
    pub async fn run(&self, item: &WorkItem) -> Result<TurnOutcome, PipelineError> {
        let lead = item.lead_context.lead_id().unwrap_or("-");
        info!(lead_id = lead, attempt = item.attempt, "Pipeline started");

        let history = History::from_inbound(item.message.as_str());
        let mut stage = Stage::Intent;

        let intent = self.classify_intent(&history).await;
        stage = self.advance(stage, lead);

        let reply = match self.generate_reply(&history, &item.lead_context, intent).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(lead_id = lead, stage = %stage, error = %e, "Pipeline stage failed");
                debug!(lead_id = lead, from = %stage, to = %Stage::Failed, "Stage transition");
                return Err(e);
            }
        };
        let history = history.append(reply.clone());
        stage = self.advance(stage, lead);

        let persisted = self.persist_memory(&history, &item.lead_context).await;
        stage = self.advance(stage, lead);

        info!(
            lead_id = lead,
            intent = %intent,
            persisted,
            stage = %stage,
            "Pipeline finished"
        );

        Ok(TurnOutcome {
            intent,
            reply,
            history,
            persisted,
        })
    }

    fn advance(&self, stage: Stage, lead: &str) -> Stage {
        let next = stage.next();
        debug!(lead_id = lead, from = %stage, to = %next, "Stage transition");
        next
    }

    // ── Stage 1: intent ─────────────────────────────────────────────

    /// Classify the latest user message. Always returns a member of the
    /// allow-list; drift and provider errors yield `Intent::Unknown`.
    pub async fn classify_intent(&self, history: &History) -> Intent {
        let Some(latest) = history.last_user() else {
            debug!("No user message to classify");
            return Intent::Unknown;
        };

        let redacted = self.safety.redact_pii(&latest.content).await;
        let request = CompletionRequest::new(vec![
            Message::system(CLASSIFY_SYSTEM_PROMPT),
            Message::user(redacted),
        ])
        .with_temperature(CLASSIFY_TEMPERATURE)
        .with_max_tokens(CLASSIFY_MAX_TOKENS);

        let response = match self.llm.complete(request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(
                    error = %e,
                    timeout = e.is_timeout(),
                    "Intent classification failed; using unknown"
                );
                return Intent::Unknown;
            }
        };
        self.record_usage("classify", &response);

        match Intent::try_from_label(&response.content) {
            Some(intent) => {
                debug!(intent = %intent, "Intent classified");
                intent
            }
            None => {
                warn!(raw = %response.content.trim(), "Classifier returned label outside allow-list; using unknown");
                Intent::Unknown
            }
        }
    }

    // ── Stage 2: reply ──────────────────────────────────────────────

    /// Generate the assistant reply for `intent`.
    ///
    /// User messages are redacted again on the way out; the lead context is
    /// rendered into the system prompt read-only. A reply that fails output
    /// validation is replaced with [`FALLBACK_REPLY`].
    pub async fn generate_reply(
        &self,
        history: &History,
        context: &LeadContext,
        intent: Intent,
    ) -> Result<Message, PipelineError> {
        let mut messages = Vec::with_capacity(history.len() + 1);
        messages.push(Message::system(build_reply_system_prompt(context, intent)));
        for message in history.messages() {
            let forwarded = match message.role {
                Role::User => Message::user(self.safety.redact_pii(&message.content).await),
                _ => message.clone(),
            };
            messages.push(forwarded);
        }

        let mut request =
            CompletionRequest::new(messages).with_temperature(self.settings.reply_temperature);
        if let Some(max_tokens) = self.settings.reply_max_tokens {
            request = request.with_max_tokens(max_tokens);
        }

        let response = self.llm.complete(request).await?;
        self.record_usage("generate", &response);

        let content = response.content.trim();
        if content.is_empty() {
            return Err(PipelineError::Generation(LlmError::InvalidResponse {
                provider: self.llm.model_name().to_string(),
                reason: "empty reply".to_string(),
            }));
        }

        if self.safety.validate_output(content).await {
            Ok(Message::assistant(content))
        } else {
            info!(intent = %intent, "Generated reply replaced with fallback");
            Ok(Message::assistant(FALLBACK_REPLY))
        }
    }

    // ── Stage 3: persist ────────────────────────────────────────────

    /// Write the last message of `history` to the conversation log.
    ///
    /// Returns whether a record was written. A missing lead id or a storage
    /// error is logged and never propagated.
    pub async fn persist_memory(&self, history: &History, context: &LeadContext) -> bool {
        let Some(lead_id) = context.lead_id() else {
            warn!("No lead_id in lead context; skipping conversation save");
            return false;
        };
        let Some(last) = history.last() else {
            debug!(lead_id, "Empty history; nothing to save");
            return false;
        };

        let record = ConversationRecord::new(lead_id, record_role(last.role), last.content.as_str());
        match self.conversations.append(&record).await {
            Ok(()) => {
                debug!(lead_id, role = %record.role, "Conversation record saved");
                true
            }
            Err(e) => {
                warn!(lead_id, error = %e, "Failed to save conversation record");
                false
            }
        }
    }

    fn record_usage(&self, purpose: &str, response: &CompletionResponse) {
        debug!(
            purpose,
            model = self.llm.model_name(),
            input_tokens = response.input_tokens,
            output_tokens = response.output_tokens,
            cost = %estimate_cost(self.llm.as_ref(), response),
            "LLM call complete"
        );
    }
}

/// Role label stored with a conversation record.
fn record_role(role: Role) -> &'static str {
    match role {
        Role::Assistant => "assistant",
        Role::User => "user",
        Role::System => "unknown",
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::Utc;
    use rust_decimal::Decimal;

    use super::*;
    use crate::error::DatabaseError;
    use crate::llm::provider::FinishReason;
    use crate::safety::{Capability, ContentValidator, OutputPolicy};
    use crate::store::memory::InMemoryConversations;

    // ── Test doubles ────────────────────────────────────────────────

    /// Answers classification calls with `label` and reply calls with `reply`.
    struct ScriptedLlm {
        label: Result<String, ()>,
        reply: Result<String, ()>,
        seen: Mutex<Vec<CompletionRequest>>,
    }

    impl ScriptedLlm {
        fn new(label: &str, reply: &str) -> Self {
            Self {
                label: Ok(label.to_string()),
                reply: Ok(reply.to_string()),
                seen: Mutex::new(Vec::new()),
            }
        }

        fn failing_classify(reply: &str) -> Self {
            Self {
                label: Err(()),
                ..Self::new("", reply)
            }
        }

        fn failing_reply(label: &str) -> Self {
            Self {
                reply: Err(()),
                ..Self::new(label, "")
            }
        }

        fn requests(&self) -> Vec<CompletionRequest> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedLlm {
        fn model_name(&self) -> &str {
            "scripted"
        }

        fn cost_per_token(&self) -> (Decimal, Decimal) {
            (Decimal::ZERO, Decimal::ZERO)
        }

        async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
            let classify = request.temperature == Some(CLASSIFY_TEMPERATURE);
            self.seen.lock().unwrap().push(request);
            let scripted = if classify { &self.label } else { &self.reply };
            match scripted {
                Ok(content) => Ok(CompletionResponse {
                    content: content.clone(),
                    input_tokens: 10,
                    output_tokens: 2,
                    finish_reason: FinishReason::Stop,
                    response_id: None,
                }),
                Err(()) => Err(LlmError::Timeout {
                    provider: "scripted".into(),
                    timeout: std::time::Duration::from_secs(30),
                }),
            }
        }
    }

    struct AlwaysUnsafe;

    #[async_trait]
    impl ContentValidator for AlwaysUnsafe {
        async fn score(&self, _text: &str) -> Result<f32, crate::error::SafetyError> {
            Ok(1.0)
        }
    }

    struct BrokenRepo;

    #[async_trait]
    impl ConversationRepository for BrokenRepo {
        async fn append(&self, _record: &ConversationRecord) -> Result<(), DatabaseError> {
            Err(DatabaseError::Query("connection reset".into()))
        }

        async fn history(&self, _lead_id: &str) -> Result<Vec<ConversationRecord>, DatabaseError> {
            Ok(Vec::new())
        }
    }

    fn pipeline(llm: Arc<ScriptedLlm>, repo: Arc<dyn ConversationRepository>) -> AgentPipeline {
        AgentPipeline::new(llm, Arc::new(SafetyLayer::default()), repo)
    }

    fn item(message: &str, context: LeadContext) -> WorkItem {
        WorkItem {
            message: message.to_string(),
            lead_context: context,
            enqueued_at: Utc::now(),
            attempt: 1,
        }
    }

    // ── Classification ──────────────────────────────────────────────

    #[tokio::test]
    async fn drifted_label_becomes_unknown() {
        let llm = Arc::new(ScriptedLlm::new("maybe", "ok"));
        let p = pipeline(llm.clone(), Arc::new(InMemoryConversations::new()));
        let intent = p.classify_intent(&History::from_inbound("I want it")).await;
        assert_eq!(intent, Intent::Unknown);
    }

    #[tokio::test]
    async fn valid_label_is_kept() {
        let llm = Arc::new(ScriptedLlm::new(" Buy\n", "ok"));
        let p = pipeline(llm.clone(), Arc::new(InMemoryConversations::new()));
        assert_eq!(p.classify_intent(&History::from_inbound("sign me up")).await, Intent::Buy);

        let request = &llm.requests()[0];
        assert_eq!(request.temperature, Some(0.0));
        assert_eq!(request.messages[0].content, CLASSIFY_SYSTEM_PROMPT);
    }

    #[tokio::test]
    async fn classify_error_becomes_unknown() {
        let llm = Arc::new(ScriptedLlm::failing_classify("ok"));
        let p = pipeline(llm, Arc::new(InMemoryConversations::new()));
        assert_eq!(p.classify_intent(&History::from_inbound("hi")).await, Intent::Unknown);
    }

    #[tokio::test]
    async fn empty_history_skips_provider() {
        let llm = Arc::new(ScriptedLlm::new("buy", "ok"));
        let p = pipeline(llm.clone(), Arc::new(InMemoryConversations::new()));
        assert_eq!(p.classify_intent(&History::new()).await, Intent::Unknown);
        assert!(llm.requests().is_empty());
    }

    // ── Redaction on the wire ───────────────────────────────────────

    #[tokio::test]
    async fn pii_never_reaches_provider() {
        let llm = Arc::new(ScriptedLlm::new("doubt", "Sure, we will reach out."));
        let p = pipeline(llm.clone(), Arc::new(InMemoryConversations::new()));
        p.run(&item("call me at john@x.com or 555-123-4567", LeadContext::default()))
            .await
            .unwrap();

        let requests = llm.requests();
        assert_eq!(requests.len(), 2);
        for request in &requests {
            for message in &request.messages {
                assert!(!message.content.contains("john@x.com"));
                assert!(!message.content.contains("555-123-4567"));
            }
            let user = request.messages.last().unwrap();
            assert!(user.content.contains("<EMAIL>"));
            assert!(user.content.contains("<PHONE_NUMBER>"));
        }
    }

    #[tokio::test]
    async fn dates_and_amounts_reach_provider_intact() {
        let llm = Arc::new(ScriptedLlm::new("buy", "Booked."));
        let p = pipeline(llm.clone(), Arc::new(InMemoryConversations::new()));
        let text = "book a call on 2024-03-15, budget 1.500.000, order 12345678";
        p.run(&item(text, LeadContext::default())).await.unwrap();

        for request in llm.requests() {
            assert_eq!(request.messages.last().unwrap().content, text);
        }
    }

    // ── Reply generation ────────────────────────────────────────────

    #[tokio::test]
    async fn reply_prompt_follows_intent() {
        let llm = Arc::new(ScriptedLlm::new("buy", "Let's book a call!"));
        let p = pipeline(llm.clone(), Arc::new(InMemoryConversations::new()));
        let context = LeadContext::new("42").with_name("Ana");
        let reply = p
            .generate_reply(&History::from_inbound("I'll take it"), &context, Intent::Buy)
            .await
            .unwrap();

        assert_eq!(reply.role, Role::Assistant);
        assert_eq!(reply.content, "Let's book a call!");
        let system = &llm.requests()[0].messages[0];
        assert_eq!(system.role, Role::System);
        assert!(system.content.contains("book a call"));
        assert!(system.content.contains("Ana"));
    }

    #[tokio::test]
    async fn unsafe_reply_replaced_with_fallback() {
        let llm = Arc::new(ScriptedLlm::new("doubt", "some rude reply"));
        let safety = SafetyLayer::new(
            Capability::unavailable("n/a"),
            Capability::available(Arc::new(AlwaysUnsafe) as Arc<dyn ContentValidator>),
            OutputPolicy::default(),
        );
        let repo = Arc::new(InMemoryConversations::new());
        let p = AgentPipeline::new(llm, Arc::new(safety), repo.clone());

        let outcome = p.run(&item("is it worth it?", LeadContext::new("7"))).await.unwrap();
        assert_eq!(outcome.reply.content, FALLBACK_REPLY);

        let saved = repo.history("7").await.unwrap();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].content, FALLBACK_REPLY);
    }

    #[tokio::test]
    async fn generation_error_fails_turn() {
        let llm = Arc::new(ScriptedLlm::failing_reply("buy"));
        let repo = Arc::new(InMemoryConversations::new());
        let p = pipeline(llm, repo.clone());

        let err = p.run(&item("buy", LeadContext::new("1"))).await.unwrap_err();
        assert!(matches!(err, PipelineError::Generation(ref e) if e.is_timeout()));
        assert!(repo.is_empty().await);
    }

    #[tokio::test]
    async fn empty_reply_is_generation_error() {
        let llm = Arc::new(ScriptedLlm::new("buy", "   "));
        let p = pipeline(llm, Arc::new(InMemoryConversations::new()));
        let err = p
            .generate_reply(&History::from_inbound("hi"), &LeadContext::default(), Intent::Buy)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Generation(LlmError::InvalidResponse { .. })));
    }

    // ── Persistence ─────────────────────────────────────────────────

    #[tokio::test]
    async fn persist_twice_writes_twice() {
        let repo = Arc::new(InMemoryConversations::new());
        let p = pipeline(Arc::new(ScriptedLlm::new("buy", "ok")), repo.clone());
        let history = History::from_inbound("hi").append(Message::assistant("hello!"));
        let context = LeadContext::new("lead-9");

        assert!(p.persist_memory(&history, &context).await);
        assert!(p.persist_memory(&history, &context).await);

        let saved = repo.history("lead-9").await.unwrap();
        assert_eq!(saved.len(), 2);
        assert_eq!(saved[0].role, "assistant");
        assert_eq!(saved[0].content, saved[1].content);
    }

    #[tokio::test]
    async fn persist_without_lead_id_is_noop() {
        let repo = Arc::new(InMemoryConversations::new());
        let p = pipeline(Arc::new(ScriptedLlm::new("buy", "ok")), repo.clone());
        let history = History::from_inbound("hi").append(Message::assistant("hello!"));

        assert!(!p.persist_memory(&history, &LeadContext::default()).await);
        assert!(!p.persist_memory(&history, &LeadContext::new("   ")).await);
        assert!(repo.is_empty().await);
    }

    #[tokio::test]
    async fn persistence_failure_does_not_fail_turn() {
        let p = pipeline(Arc::new(ScriptedLlm::new("buy", "Great!")), Arc::new(BrokenRepo));
        let outcome = p.run(&item("I want it", LeadContext::new("3"))).await.unwrap();
        assert_eq!(outcome.reply.content, "Great!");
        assert!(!outcome.persisted);
    }

    #[test]
    fn role_labels() {
        assert_eq!(record_role(Role::Assistant), "assistant");
        assert_eq!(record_role(Role::User), "user");
        assert_eq!(record_role(Role::System), "unknown");
    }

    // ── Whole turn ──────────────────────────────────────────────────

    #[tokio::test]
    async fn spanish_greeting_without_context() {
        let llm = Arc::new(ScriptedLlm::new(
            "unknown",
            "¡Hola! ¿Podrías contarme qué servicio te interesa?",
        ));
        let repo = Arc::new(InMemoryConversations::new());
        let p = pipeline(llm.clone(), repo.clone());

        let outcome = p
            .run(&item("Hola, me interesa el servicio", LeadContext::default()))
            .await
            .unwrap();

        assert_eq!(outcome.intent, Intent::Unknown);
        assert!(!outcome.reply.content.is_empty());
        assert!(!outcome.persisted);
        assert!(repo.is_empty().await);
        assert_eq!(outcome.history.len(), 2);
        assert!(llm.requests()[1].messages[0].content.contains("clarify"));
    }
}
