//! Safety gates around LLM calls.
//!
//! Two independent gates:
//! - `redact_pii`: strips phone numbers, e-mails, and card numbers from
//!   user-authored text before it is sent to the provider.
//! - `validate_output`: scores a generated reply against the content policy.
//!
//! Both are optional capabilities. Each carries an explicit `available`
//! flag and the layer branches on it. When a capability is missing or
//! errors, the gate fails open and logs a warning.

pub mod output;
pub mod pii;

pub use output::{ContentValidator, KeywordValidator, OutputPolicy, DEFAULT_BLOCKED_TERMS};
pub use pii::{apply_redactions, PiiDetector, PiiKind, PiiSpan, RegexPiiDetector};

use std::sync::Arc;

use tracing::{debug, warn};

/// An optional collaborator plus its availability flag.
pub struct Capability<T: ?Sized> {
    pub available: bool,
    handle: Option<Arc<T>>,
    /// Why the capability is unavailable, for logs.
    reason: Option<String>,
}

impl<T: ?Sized> Capability<T> {
    pub fn available(handle: Arc<T>) -> Self {
        Self {
            available: true,
            handle: Some(handle),
            reason: None,
        }
    }

    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self {
            available: false,
            handle: None,
            reason: Some(reason.into()),
        }
    }

    pub fn get(&self) -> Option<&Arc<T>> {
        if self.available {
            self.handle.as_ref()
        } else {
            None
        }
    }

    pub fn reason(&self) -> &str {
        self.reason.as_deref().unwrap_or("not configured")
    }
}

impl<T: ?Sized> Clone for Capability<T> {
    fn clone(&self) -> Self {
        Self {
            available: self.available,
            handle: self.handle.clone(),
            reason: self.reason.clone(),
        }
    }
}

/// Settings for building the default safety layer.
#[derive(Debug, Clone)]
pub struct SafetyConfig {
    pub pii_redaction: bool,
    pub output_validation: bool,
    pub policy: OutputPolicy,
    pub extra_blocked_terms: Vec<String>,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            pii_redaction: true,
            output_validation: true,
            policy: OutputPolicy::default(),
            extra_blocked_terms: Vec::new(),
        }
    }
}

/// PII redaction and output validation, built once per process.
#[derive(Clone)]
pub struct SafetyLayer {
    detector: Capability<dyn PiiDetector>,
    validator: Capability<dyn ContentValidator>,
    policy: OutputPolicy,
}

impl SafetyLayer {
    pub fn new(
        detector: Capability<dyn PiiDetector>,
        validator: Capability<dyn ContentValidator>,
        policy: OutputPolicy,
    ) -> Self {
        Self {
            detector,
            validator,
            policy,
        }
    }

    /// Layer with both gates unavailable (pure passthrough).
    pub fn disabled() -> Self {
        Self::new(
            Capability::unavailable("disabled"),
            Capability::unavailable("disabled"),
            OutputPolicy::default(),
        )
    }

    /// Build the built-in detector and validator. A capability that fails
    /// to initialise is recorded as unavailable rather than aborting startup.
    pub fn from_config(config: &SafetyConfig) -> Self {
        let detector: Capability<dyn PiiDetector> = if !config.pii_redaction {
            Capability::unavailable("disabled by configuration")
        } else {
            match RegexPiiDetector::new() {
                Ok(d) => Capability::available(Arc::new(d) as Arc<dyn PiiDetector>),
                Err(e) => {
                    warn!(error = %e, "PII detector failed to initialise; redaction disabled");
                    Capability::unavailable(e.to_string())
                }
            }
        };

        let validator: Capability<dyn ContentValidator> = if !config.output_validation {
            Capability::unavailable("disabled by configuration")
        } else {
            match KeywordValidator::with_defaults(&config.extra_blocked_terms) {
                Ok(v) => Capability::available(Arc::new(v) as Arc<dyn ContentValidator>),
                Err(e) => {
                    warn!(error = %e, "Content validator failed to initialise; validation disabled");
                    Capability::unavailable(e.to_string())
                }
            }
        };

        Self::new(detector, validator, config.policy)
    }

    pub fn pii_available(&self) -> bool {
        self.detector.available
    }

    pub fn validation_available(&self) -> bool {
        self.validator.available
    }

    /// Replace PII in user-authored text with typed placeholders.
    ///
    /// Returns the input unchanged when the detector is unavailable or fails.
    pub async fn redact_pii(&self, text: &str) -> String {
        if text.is_empty() {
            return String::new();
        }
        let Some(detector) = self.detector.get() else {
            warn!(
                reason = self.detector.reason(),
                "PII detector unavailable; forwarding text unredacted"
            );
            return text.to_string();
        };

        match detector.detect(text).await {
            Ok(spans) => {
                if !spans.is_empty() {
                    debug!(count = spans.len(), "Redacted PII spans");
                }
                apply_redactions(text, &spans)
            }
            Err(e) => {
                warn!(error = %e, "PII detection failed; forwarding text unredacted");
                text.to_string()
            }
        }
    }

    /// Whether a generated reply may be shown to the lead. Never mutates text.
    pub async fn validate_output(&self, text: &str) -> bool {
        let Some(validator) = self.validator.get() else {
            warn!(
                reason = self.validator.reason(),
                fail_open = self.policy.fail_open,
                "Content validator unavailable"
            );
            return self.policy.fail_open;
        };

        match validator.score(text).await {
            Ok(score) => {
                let safe = self.policy.is_safe(score);
                if !safe {
                    warn!(score, threshold = self.policy.threshold, "Reply failed output validation");
                }
                safe
            }
            Err(e) => {
                warn!(error = %e, fail_open = self.policy.fail_open, "Output validation failed");
                self.policy.fail_open
            }
        }
    }
}

impl Default for SafetyLayer {
    fn default() -> Self {
        Self::from_config(&SafetyConfig::default())
    }
}
