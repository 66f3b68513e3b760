//! Bridges rig's `CompletionModel` to our `LlmProvider` trait.

use std::time::Duration;

use async_trait::async_trait;
use rig::completion::CompletionModel;
use rig::message::{AssistantContent, Message as RigMessage};
use rust_decimal::Decimal;

use super::costs::pricing_for;
use super::provider::{
    CompletionRequest, CompletionResponse, FinishReason, LlmProvider, Message, Role,
};
use crate::error::LlmError;

/// Any rig completion model, exposed as an [`LlmProvider`].
pub struct RigAdapter<M> {
    model: M,
    model_name: String,
    provider: &'static str,
    timeout: Duration,
}

impl<M: CompletionModel> RigAdapter<M> {
    pub fn new(model: M, model_name: &str, provider: &'static str, timeout: Duration) -> Self {
        Self {
            model,
            model_name: model_name.to_string(),
            provider,
            timeout,
        }
    }
}

/// A request reshaped the way rig takes it: system text as the preamble,
/// the newest user turn as the prompt, everything before it as history.
#[derive(Debug, PartialEq)]
struct Turn {
    preamble: Option<String>,
    history: Vec<Message>,
    prompt: String,
}

fn split_turn(messages: &[Message]) -> Option<Turn> {
    let system: Vec<&str> = messages
        .iter()
        .filter(|m| m.role == Role::System)
        .map(|m| m.content.as_str())
        .collect();
    let mut dialogue: Vec<Message> = messages
        .iter()
        .filter(|m| m.role != Role::System)
        .cloned()
        .collect();

    let last = dialogue.pop()?;
    if last.role != Role::User {
        return None;
    }
    Some(Turn {
        preamble: (!system.is_empty()).then(|| system.join("\n\n")),
        history: dialogue,
        prompt: last.content,
    })
}

fn to_rig(message: &Message) -> RigMessage {
    match message.role {
        Role::Assistant => RigMessage::assistant(message.content.clone()),
        Role::User | Role::System => RigMessage::user(message.content.clone()),
    }
}

#[async_trait]
impl<M> LlmProvider for RigAdapter<M>
where
    M: CompletionModel + 'static,
{
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn cost_per_token(&self) -> (Decimal, Decimal) {
        pricing_for(&self.model_name)
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let turn = split_turn(&request.messages).ok_or_else(|| LlmError::RequestFailed {
            provider: self.provider.to_string(),
            reason: "request must end with a user message".to_string(),
        })?;

        let history: Vec<RigMessage> = turn.history.iter().map(to_rig).collect();
        let mut builder = self
            .model
            .completion_request(RigMessage::user(turn.prompt))
            .messages(history);
        if let Some(preamble) = turn.preamble {
            builder = builder.preamble(preamble);
        }
        if let Some(temperature) = request.temperature {
            builder = builder.temperature(f64::from(temperature));
        }
        if let Some(max_tokens) = request.max_tokens {
            builder = builder.max_tokens(u64::from(max_tokens));
        }
        let rig_request = builder.build();

        let response = tokio::time::timeout(self.timeout, self.model.completion(rig_request))
            .await
            .map_err(|_| LlmError::Timeout {
                provider: self.provider.to_string(),
                timeout: self.timeout,
            })?
            .map_err(|e| LlmError::RequestFailed {
                provider: self.provider.to_string(),
                reason: e.to_string(),
            })?;

        let content: String = response
            .choice
            .iter()
            .filter_map(|part| match part {
                AssistantContent::Text(text) => Some(text.text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("");
        let finish_reason = if content.is_empty() {
            FinishReason::Unknown
        } else {
            FinishReason::Stop
        };

        Ok(CompletionResponse {
            content,
            input_tokens: u32::try_from(response.usage.input_tokens).unwrap_or(u32::MAX),
            output_tokens: u32::try_from(response.usage.output_tokens).unwrap_or(u32::MAX),
            finish_reason,
            response_id: None,
        })
    }
}
