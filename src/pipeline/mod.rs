//! Conversation pipeline.
//!
//! Every claimed work item flows through [`AgentPipeline::run`]:
//! 1. `classify_intent`: allow-listed intent, redacted input, zero temperature
//! 2. `generate_reply`: per-intent system prompt, output validation
//! 3. `persist_memory`: best-effort append to the conversation log

pub mod processor;
pub mod types;

pub use processor::{AgentPipeline, PipelineSettings};
pub use types::{History, Intent, LeadContext, Message, Role, Stage, TurnOutcome};
