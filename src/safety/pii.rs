//! PII detection and placeholder substitution.

use async_trait::async_trait;
use regex::Regex;

use crate::error::SafetyError;

/// Categories of personal data that are redacted before text reaches the LLM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PiiKind {
    PhoneNumber,
    Email,
    CreditCard,
}

impl PiiKind {
    /// Typed placeholder substituted for a detected span.
    pub fn placeholder(&self) -> &'static str {
        match self {
            Self::PhoneNumber => "<PHONE_NUMBER>",
            Self::Email => "<EMAIL>",
            Self::CreditCard => "<CREDIT_CARD>",
        }
    }

    /// Tie-break when two spans of equal length overlap (lower wins).
    fn priority(&self) -> u8 {
        match self {
            Self::CreditCard => 0,
            Self::Email => 1,
            Self::PhoneNumber => 2,
        }
    }
}

/// A detected span, as byte offsets into the scanned text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PiiSpan {
    pub kind: PiiKind,
    pub start: usize,
    pub end: usize,
}

/// Something that can find PII in free text.
#[async_trait]
pub trait PiiDetector: Send + Sync {
    async fn detect(&self, text: &str) -> Result<Vec<PiiSpan>, SafetyError>;
}

/// Replace detected spans with their placeholders.
///
/// Overlapping spans are resolved longest-first; spans that are out of
/// bounds or not on character boundaries are dropped.
pub fn apply_redactions(text: &str, spans: &[PiiSpan]) -> String {
    let mut candidates: Vec<PiiSpan> = spans
        .iter()
        .copied()
        .filter(|s| {
            s.start < s.end
                && s.end <= text.len()
                && text.is_char_boundary(s.start)
                && text.is_char_boundary(s.end)
        })
        .collect();
    candidates.sort_by(|a, b| {
        (b.end - b.start)
            .cmp(&(a.end - a.start))
            .then(a.kind.priority().cmp(&b.kind.priority()))
            .then(a.start.cmp(&b.start))
    });

    let mut chosen: Vec<PiiSpan> = Vec::with_capacity(candidates.len());
    for span in candidates {
        if chosen.iter().all(|c| span.end <= c.start || span.start >= c.end) {
            chosen.push(span);
        }
    }
    chosen.sort_by_key(|s| s.start);

    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    for span in chosen {
        out.push_str(&text[cursor..span.start]);
        out.push_str(span.kind.placeholder());
        cursor = span.end;
    }
    out.push_str(&text[cursor..]);
    out
}

// ── Regex detector ──────────────────────────────────────────────────

/// Built-in pattern-based detector.
///
/// A digit run only counts as a phone number when it is written like one:
/// a leading `+` or `(`, or at least two separator-delimited groups of at
/// most four digits. Dates and dot-grouped amounts are never phones.
#[derive(Debug, Clone)]
pub struct RegexPiiDetector {
    email: Regex,
    card: Regex,
    phone: Regex,
    date: Regex,
    thousands: Regex,
}

impl RegexPiiDetector {
    pub fn new() -> Result<Self, SafetyError> {
        let compile = |pattern: &str| {
            Regex::new(pattern).map_err(|e| SafetyError::Detector(format!("bad pattern: {e}")))
        };
        Ok(Self {
            email: compile(r"[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}")?,
            card: compile(r"\b(?:\d[ \-]?){12,18}\d\b")?,
            phone: compile(r"\+?\(?\d[\d\s().\-]{5,}\d")?,
            date: compile(r"\b(?:\d{4}-\d{1,2}-\d{1,2}|\d{1,2}[./\-]\d{1,2}[./\-]\d{2,4})\b")?,
            thousands: compile(r"^\d{1,3}(?:\.\d{3})+$")?,
        })
    }

    fn is_phone(&self, candidate: &str) -> bool {
        let digit_count = candidate.chars().filter(char::is_ascii_digit).count();
        if !(7..=15).contains(&digit_count) {
            return false;
        }
        if self.date.is_match(candidate) || self.thousands.is_match(candidate) {
            return false;
        }
        if candidate.starts_with('+') || candidate.starts_with('(') {
            return true;
        }
        let groups: Vec<&str> = candidate
            .split(|c: char| !c.is_ascii_digit())
            .filter(|g| !g.is_empty())
            .collect();
        groups.len() >= 2 && groups.iter().all(|g| g.len() <= 4)
    }

    fn scan(&self, text: &str) -> Vec<PiiSpan> {
        let mut spans = Vec::new();

        for m in self.email.find_iter(text) {
            spans.push(PiiSpan {
                kind: PiiKind::Email,
                start: m.start(),
                end: m.end(),
            });
        }

        for m in self.card.find_iter(text) {
            let digits = digits_of(m.as_str());
            if (13..=19).contains(&digits.len()) && luhn_valid(&digits) {
                spans.push(PiiSpan {
                    kind: PiiKind::CreditCard,
                    start: m.start(),
                    end: m.end(),
                });
            }
        }

        for m in self.phone.find_iter(text) {
            if self.is_phone(m.as_str()) {
                spans.push(PiiSpan {
                    kind: PiiKind::PhoneNumber,
                    start: m.start(),
                    end: m.end(),
                });
            }
        }

        spans
    }
}

#[async_trait]
impl PiiDetector for RegexPiiDetector {
    async fn detect(&self, text: &str) -> Result<Vec<PiiSpan>, SafetyError> {
        Ok(self.scan(text))
    }
}

fn digits_of(s: &str) -> Vec<u32> {
    s.chars().filter_map(|c| c.to_digit(10)).collect()
}

fn luhn_valid(digits: &[u32]) -> bool {
    let sum: u32 = digits
        .iter()
        .rev()
        .enumerate()
        .map(|(i, &d)| {
            if i % 2 == 1 {
                let doubled = d * 2;
                if doubled > 9 { doubled - 9 } else { doubled }
            } else {
                d
            }
        })
        .sum();
    sum % 10 == 0
}
