//! Content-safety validation of generated replies.

use async_trait::async_trait;
use regex::{Regex, RegexBuilder};

use crate::error::SafetyError;

/// Terms that make a sales reply unacceptable regardless of context.
pub const DEFAULT_BLOCKED_TERMS: &[&str] = &[
    "idiot",
    "stupid",
    "moron",
    "shut up",
    "hate you",
    "go to hell",
    "worthless",
    "loser",
    "damn you",
];

/// Score contributed by each distinct blocked term found.
const TERM_WEIGHT: f32 = 0.5;

/// Scores text for unsafe content.
#[async_trait]
pub trait ContentValidator: Send + Sync {
    /// Unsafety score in `[0.0, 1.0]`; higher is worse.
    async fn score(&self, text: &str) -> Result<f32, SafetyError>;
}

/// Threshold policy applied to validator scores.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OutputPolicy {
    /// Scores at or above this are unsafe.
    pub threshold: f32,
    /// Verdict when the validator is unavailable or errors.
    pub fail_open: bool,
}

impl Default for OutputPolicy {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            fail_open: true,
        }
    }
}

impl OutputPolicy {
    pub fn is_safe(&self, score: f32) -> bool {
        score < self.threshold
    }
}

/// Blocked-term validator.
#[derive(Debug, Clone)]
pub struct KeywordValidator {
    terms: Vec<(String, Regex)>,
}

impl KeywordValidator {
    pub fn new<I, S>(terms: I) -> Result<Self, SafetyError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut compiled = Vec::new();
        for term in terms {
            let term = term.as_ref().trim();
            if term.is_empty() {
                continue;
            }
            let pattern = format!(r"\b{}\b", regex::escape(term));
            let re = RegexBuilder::new(&pattern)
                .case_insensitive(true)
                .build()
                .map_err(|e| SafetyError::Validator(format!("bad term {term:?}: {e}")))?;
            compiled.push((term.to_string(), re));
        }
        Ok(Self { terms: compiled })
    }

    /// Validator over the built-in term list plus `extra`.
    pub fn with_defaults<S: AsRef<str>>(extra: &[S]) -> Result<Self, SafetyError> {
        let terms = DEFAULT_BLOCKED_TERMS
            .iter()
            .map(|t| t.to_string())
            .chain(extra.iter().map(|t| t.as_ref().to_string()));
        Self::new(terms)
    }

    /// Blocked terms present in `text`.
    pub fn matches<'a>(&'a self, text: &str) -> Vec<&'a str> {
        self.terms
            .iter()
            .filter(|(_, re)| re.is_match(text))
            .map(|(term, _)| term.as_str())
            .collect()
    }
}

#[async_trait]
impl ContentValidator for KeywordValidator {
    async fn score(&self, text: &str) -> Result<f32, SafetyError> {
        let hits = self.matches(text).len() as f32;
        Ok((hits * TERM_WEIGHT).min(1.0))
    }
}
