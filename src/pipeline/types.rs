//! Shared types for the conversation pipeline.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub use crate::llm::provider::{Message, Role};

// ── Intent ──────────────────────────────────────────────────────────

/// Classified purpose of the lead's latest message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Intent {
    /// Wants to purchase, book, or sign up.
    Buy,
    /// Has a question or objection.
    Doubt,
    /// Anything else.
    Unknown,
}

impl Intent {
    pub const ALL: [Intent; 3] = [Intent::Buy, Intent::Doubt, Intent::Unknown];

    pub fn label(&self) -> &'static str {
        match self {
            Self::Buy => "buy",
            Self::Doubt => "doubt",
            Self::Unknown => "unknown",
        }
    }

    /// Parse a raw label against the allow-list. Surrounding whitespace,
    /// quotes, and a trailing period are tolerated; nothing else is.
    pub fn try_from_label(raw: &str) -> Option<Intent> {
        let cleaned = raw
            .trim()
            .trim_matches(|c| c == '"' || c == '\'' || c == '`' || c == '.')
            .trim()
            .to_lowercase();
        Self::ALL.into_iter().find(|i| i.label() == cleaned)
    }

    /// Parse a raw label, coercing anything outside the allow-list to `Unknown`.
    pub fn from_label(raw: &str) -> Intent {
        Self::try_from_label(raw).unwrap_or(Intent::Unknown)
    }
}

impl std::fmt::Display for Intent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

// ── History ─────────────────────────────────────────────────────────

/// Ordered, append-only conversation history.
///
/// There is no way to edit or remove a message once it is in the history;
/// `append` consumes the history and returns the extended one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct History {
    messages: Vec<Message>,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    /// History holding a single inbound user message.
    pub fn from_inbound(content: impl Into<String>) -> Self {
        Self::new().append(Message::user(content))
    }

    pub fn append(mut self, message: Message) -> Self {
        self.messages.push(message);
        self
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Most recent user-authored message.
    pub fn last_user(&self) -> Option<&Message> {
        self.messages.iter().rev().find(|m| m.role == Role::User)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

// ── Lead context ────────────────────────────────────────────────────

/// Keys owned by `LeadContext` fields; never stored in `extra`.
const RESERVED_KEYS: [&str; 2] = ["id", "name"];

/// What is known about the lead for one pipeline invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LeadContext {
    #[serde(
        default,
        deserialize_with = "string_or_number",
        skip_serializing_if = "Option::is_none"
    )]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Arbitrary extra attributes (phone, campaign, locale, ...).
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl LeadContext {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Add an extra attribute. `id` and `name` are fields, not attributes,
    /// and are ignored here.
    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        let key = key.into();
        if !RESERVED_KEYS.contains(&key.as_str()) {
            self.extra.insert(key, value.into());
        }
        self
    }

    /// Drop extra attributes that would collide with the `id` and `name`
    /// fields once flattened.
    pub fn normalized(mut self) -> Self {
        self.extra.retain(|key, _| !RESERVED_KEYS.contains(&key.as_str()));
        self
    }

    /// Lead identifier, if present and non-blank.
    pub fn lead_id(&self) -> Option<&str> {
        self.id.as_deref().map(str::trim).filter(|s| !s.is_empty())
    }

    /// Contact phone number from the extra attributes.
    pub fn phone(&self) -> Option<String> {
        match self.extra.get("phone")? {
            serde_json::Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

/// Accept lead ids stored either as strings or as integers.
fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    match Option::<serde_json::Value>::deserialize(deserializer)? {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::String(s)) => Ok(Some(s)),
        Some(serde_json::Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(serde::de::Error::custom(format!(
            "lead id must be a string or number, got {other}"
        ))),
    }
}

// ── Stage ───────────────────────────────────────────────────────────

/// Position in the linear pipeline `Intent → Reply → Persist → Done`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Intent,
    Reply,
    Persist,
    Done,
    Failed,
}

impl Stage {
    /// Next stage after a successful step. `Done` and `Failed` are absorbing.
    pub fn next(self) -> Stage {
        match self {
            Self::Intent => Self::Reply,
            Self::Reply => Self::Persist,
            Self::Persist => Self::Done,
            Self::Done => Self::Done,
            Self::Failed => Self::Failed,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Intent => "intent",
            Self::Reply => "reply",
            Self::Persist => "persist",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Result of one successful pipeline invocation.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub intent: Intent,
    pub reply: Message,
    pub history: History,
    /// Whether a conversation record was written.
    pub persisted: bool,
}
