//! Configuration types.
//!
//! Everything is read from `LEAD_AGENT_*` environment variables once at
//! startup. `from_lookup` takes the variable source as a closure so tests
//! never touch the process environment.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;
use crate::llm::{LlmBackend, LlmConfig, DEFAULT_ENDPOINT};
use crate::safety::{OutputPolicy, SafetyConfig};
use crate::worker::PoolConfig;

const DEFAULT_MODEL: &str = "gpt-4o-mini";
const DEFAULT_ANTHROPIC_MODEL: &str = "claude-3-5-haiku-latest";
const DEFAULT_DB_PATH: &str = "./data/lead-agent.db";

/// Queue and worker settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QueueConfig {
    pub workers: usize,
    /// Bound on one pipeline attempt.
    pub job_timeout: Duration,
    /// Visibility timeout for a claim.
    pub lease: Duration,
    pub max_attempts: u32,
    pub poll_interval: Duration,
    /// How long terminal results stay pollable.
    pub result_ttl: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            job_timeout: Duration::from_secs(120),
            lease: Duration::from_secs(300),
            max_attempts: 1,
            poll_interval: Duration::from_millis(250),
            result_ttl: Duration::from_secs(3600),
        }
    }
}

/// Outbound webhook settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookConfig {
    pub url: String,
    pub timeout: Duration,
}

/// Console output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(format!("expected 'pretty' or 'json', got '{other}'")),
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogConfig {
    pub format: LogFormat,
    /// Directory for daily-rotated JSON logs. Console only when unset.
    pub dir: Option<PathBuf>,
}

/// Process configuration, built once in `main` and never mutated.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub llm: LlmConfig,
    pub db_path: PathBuf,
    pub queue: QueueConfig,
    pub webhook: Option<WebhookConfig>,
    pub safety: SafetyConfig,
    pub logging: LogConfig,
}

impl AppConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary variable source. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let api_key = get("LEAD_AGENT_LLM_API_KEY")
            .ok_or_else(|| ConfigError::MissingEnvVar("LEAD_AGENT_LLM_API_KEY".to_string()))?;

        let reply_temperature: f32 = parse_or(&get, "LEAD_AGENT_LLM_TEMPERATURE", 0.7)?;
        if !(0.0..=2.0).contains(&reply_temperature) {
            return Err(invalid("LEAD_AGENT_LLM_TEMPERATURE", "must be between 0.0 and 2.0"));
        }

        let base_url = get("LEAD_AGENT_LLM_BASE_URL");
        // A custom base URL without an explicit backend means a compatible gateway.
        let implied = if base_url.is_some() {
            LlmBackend::Compatible
        } else {
            LlmBackend::OpenAi
        };
        let backend = parse_or(&get, "LEAD_AGENT_LLM_BACKEND", implied)?;
        let default_model = match backend {
            LlmBackend::Anthropic => DEFAULT_ANTHROPIC_MODEL,
            LlmBackend::OpenAi | LlmBackend::Compatible => DEFAULT_MODEL,
        };

        let llm = LlmConfig {
            backend,
            api_key: SecretString::from(api_key),
            model: get("LEAD_AGENT_LLM_MODEL").unwrap_or_else(|| default_model.to_string()),
            endpoint: base_url.unwrap_or_else(|| DEFAULT_ENDPOINT.to_string()),
            reply_temperature,
            timeout: Duration::from_secs(positive(&get, "LEAD_AGENT_LLM_TIMEOUT_SECS", 30)?),
        };

        let defaults = QueueConfig::default();
        let queue = QueueConfig {
            workers: positive(&get, "LEAD_AGENT_WORKERS", defaults.workers as u64)? as usize,
            job_timeout: Duration::from_secs(positive(&get, "LEAD_AGENT_JOB_TIMEOUT_SECS", 120)?),
            lease: Duration::from_secs(positive(&get, "LEAD_AGENT_LEASE_SECS", 300)?),
            max_attempts: positive(&get, "LEAD_AGENT_MAX_ATTEMPTS", 1)? as u32,
            poll_interval: Duration::from_millis(positive(&get, "LEAD_AGENT_POLL_MS", 250)?),
            result_ttl: Duration::from_secs(parse_or(&get, "LEAD_AGENT_RESULT_TTL_SECS", 3600u64)?),
        };
        if queue.lease <= queue.job_timeout {
            return Err(invalid(
                "LEAD_AGENT_LEASE_SECS",
                "lease must be longer than LEAD_AGENT_JOB_TIMEOUT_SECS",
            ));
        }

        let webhook = match get("LEAD_AGENT_WEBHOOK_URL") {
            Some(url) => {
                if !(url.starts_with("http://") || url.starts_with("https://")) {
                    return Err(invalid("LEAD_AGENT_WEBHOOK_URL", "must be an http(s) URL"));
                }
                Some(WebhookConfig {
                    url,
                    timeout: Duration::from_secs(positive(&get, "LEAD_AGENT_WEBHOOK_TIMEOUT_SECS", 10)?),
                })
            }
            None => None,
        };

        let threshold: f32 = parse_or(&get, "LEAD_AGENT_SAFETY_THRESHOLD", 0.5)?;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(invalid("LEAD_AGENT_SAFETY_THRESHOLD", "must be between 0.0 and 1.0"));
        }
        let safety = SafetyConfig {
            pii_redaction: switch(&get, "LEAD_AGENT_PII_REDACTION", true)?,
            output_validation: switch(&get, "LEAD_AGENT_OUTPUT_VALIDATION", true)?,
            policy: OutputPolicy {
                threshold,
                ..OutputPolicy::default()
            },
            extra_blocked_terms: get("LEAD_AGENT_BLOCKED_TERMS")
                .map(|raw| {
                    raw.split(',')
                        .map(str::trim)
                        .filter(|t| !t.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
        };

        let logging = LogConfig {
            format: parse_or(&get, "LEAD_AGENT_LOG_FORMAT", LogFormat::Pretty)?,
            dir: get("LEAD_AGENT_LOG_DIR").map(PathBuf::from),
        };

        Ok(Self {
            llm,
            db_path: PathBuf::from(get("LEAD_AGENT_DB_PATH").unwrap_or_else(|| DEFAULT_DB_PATH.to_string())),
            queue,
            webhook,
            safety,
            logging,
        })
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            workers: self.queue.workers,
            poll_interval: self.queue.poll_interval,
            lease: self.queue.lease,
        }
    }
}

fn invalid(key: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.into(),
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw
            .parse()
            .map_err(|e| invalid(key, format!("cannot parse '{raw}': {e}"))),
        None => Ok(default),
    }
}

fn positive<G>(get: &G, key: &str, default: u64) -> Result<u64, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    let value = parse_or(get, key, default)?;
    if value == 0 {
        return Err(invalid(key, "must be greater than zero"));
    }
    Ok(value)
}

fn switch<G>(get: &G, key: &str, default: bool) -> Result<bool, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    match get(key).map(|v| v.to_ascii_lowercase()) {
        None => Ok(default),
        Some(v) => match v.as_str() {
            "on" | "true" | "1" | "yes" => Ok(true),
            "off" | "false" | "0" | "no" => Ok(false),
            _ => Err(invalid(key, format!("expected on/off, got '{v}'"))),
        },
    }
}
