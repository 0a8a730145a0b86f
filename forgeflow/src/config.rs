//! Engine configuration.
//!
//! Every field has a default, so a config can be loaded from a partial JSON
//! document or from `FORGEFLOW_*` environment variables.

use crate::core::Domain;
use crate::errors::ForgeflowError;
use crate::runner::RetryConfig;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

const ENV_PREFIX: &str = "FORGEFLOW_";

/// Upper bound on attempts per stage run, first attempt included.
pub const MAX_STAGE_ATTEMPTS: u32 = 3;

fn default_max_concurrent_pipelines() -> usize {
    10
}

fn default_worker_timeout_secs() -> u64 {
    300
}

fn default_event_queue_capacity() -> usize {
    1024
}

fn default_notification_concurrency() -> usize {
    8
}

fn default_approval_timeout_secs() -> u64 {
    24 * 60 * 60
}

fn default_scale_requirement() -> String {
    "1M+ requests/day".to_string()
}

/// Which domains wait for a human after their approve-role stage passes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HumanApprovalConfig {
    /// Domains gated by a human decision.
    #[serde(default)]
    pub domains: Vec<Domain>,
    /// How long to wait for a decision before the request expires.
    #[serde(default = "default_approval_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for HumanApprovalConfig {
    fn default() -> Self {
        Self {
            domains: Vec::new(),
            timeout_secs: default_approval_timeout_secs(),
        }
    }
}

impl HumanApprovalConfig {
    /// Returns true if the domain needs a human decision.
    #[must_use]
    pub fn requires(&self, domain: Domain) -> bool {
        self.domains.contains(&domain)
    }

    /// Returns the approval timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Configuration for the orchestrator and its runners.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForgeflowConfig {
    /// Pipelines allowed to run at once.
    #[serde(default = "default_max_concurrent_pipelines")]
    pub max_concurrent_pipelines: usize,
    /// Upper bound on a single worker call.
    #[serde(default = "default_worker_timeout_secs")]
    pub worker_timeout_secs: u64,
    /// Stage retry policy.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Capacity of the event forwarding queue.
    #[serde(default = "default_event_queue_capacity")]
    pub event_queue_capacity: usize,
    /// Notification deliveries allowed in flight.
    #[serde(default = "default_notification_concurrency")]
    pub notification_concurrency: usize,
    /// Human approval gates.
    #[serde(default)]
    pub human_approval: HumanApprovalConfig,
    /// Scale target passed to workers in the execution context.
    #[serde(default = "default_scale_requirement")]
    pub scale_requirement: String,
}

impl Default for ForgeflowConfig {
    fn default() -> Self {
        Self {
            max_concurrent_pipelines: default_max_concurrent_pipelines(),
            worker_timeout_secs: default_worker_timeout_secs(),
            retry: RetryConfig::default(),
            event_queue_capacity: default_event_queue_capacity(),
            notification_concurrency: default_notification_concurrency(),
            human_approval: HumanApprovalConfig::default(),
            scale_requirement: default_scale_requirement(),
        }
    }
}

impl ForgeflowConfig {
    /// Creates a config with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the concurrency limit.
    #[must_use]
    pub fn with_max_concurrent_pipelines(mut self, limit: usize) -> Self {
        self.max_concurrent_pipelines = limit;
        self
    }

    /// Sets the worker timeout.
    #[must_use]
    pub fn with_worker_timeout_secs(mut self, secs: u64) -> Self {
        self.worker_timeout_secs = secs;
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the forwarding queue capacity.
    #[must_use]
    pub fn with_event_queue_capacity(mut self, capacity: usize) -> Self {
        self.event_queue_capacity = capacity;
        self
    }

    /// Sets the domains gated by a human decision.
    #[must_use]
    pub fn with_human_approval(mut self, domains: impl IntoIterator<Item = Domain>) -> Self {
        self.human_approval.domains = domains.into_iter().collect();
        self
    }

    /// Sets the human approval timeout.
    #[must_use]
    pub fn with_approval_timeout_secs(mut self, secs: u64) -> Self {
        self.human_approval.timeout_secs = secs;
        self
    }

    /// Sets the scale requirement.
    #[must_use]
    pub fn with_scale_requirement(mut self, scale: impl Into<String>) -> Self {
        self.scale_requirement = scale.into();
        self
    }

    /// Returns the worker timeout.
    #[must_use]
    pub fn worker_timeout(&self) -> Duration {
        Duration::from_secs(self.worker_timeout_secs)
    }

    /// Parses a JSON document. Missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns `ForgeflowError::Config` for malformed JSON or invalid values.
    pub fn from_json_str(json: &str) -> Result<Self, ForgeflowError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ForgeflowError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads defaults overridden by `FORGEFLOW_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ForgeflowError::Config` for unparsable or invalid values.
    pub fn from_env() -> Result<Self, ForgeflowError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads defaults overridden by values from `lookup`, keyed by full variable name.
    ///
    /// # Errors
    ///
    /// Returns `ForgeflowError::Config` for unparsable or invalid values.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ForgeflowError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));
        let mut config = Self::default();

        if let Some(v) = var("MAX_CONCURRENT_PIPELINES") {
            config.max_concurrent_pipelines = parse_var("MAX_CONCURRENT_PIPELINES", &v)?;
        }
        if let Some(v) = var("WORKER_TIMEOUT_SECS") {
            config.worker_timeout_secs = parse_var("WORKER_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = var("RETRY_MAX_ATTEMPTS") {
            config.retry.max_attempts = parse_var("RETRY_MAX_ATTEMPTS", &v)?;
        }
        if let Some(v) = var("RETRY_BASE_DELAY_MS") {
            config.retry.base_delay_ms = parse_var("RETRY_BASE_DELAY_MS", &v)?;
        }
        if let Some(v) = var("EVENT_QUEUE_CAPACITY") {
            config.event_queue_capacity = parse_var("EVENT_QUEUE_CAPACITY", &v)?;
        }
        if let Some(v) = var("NOTIFICATION_CONCURRENCY") {
            config.notification_concurrency = parse_var("NOTIFICATION_CONCURRENCY", &v)?;
        }
        if let Some(v) = var("HUMAN_APPROVAL_DOMAINS") {
            config.human_approval.domains = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| {
                    s.parse::<Domain>().map_err(|e| {
                        ForgeflowError::Config(format!("{ENV_PREFIX}HUMAN_APPROVAL_DOMAINS: {e}"))
                    })
                })
                .collect::<Result<_, _>>()?;
        }
        if let Some(v) = var("APPROVAL_TIMEOUT_SECS") {
            config.human_approval.timeout_secs = parse_var("APPROVAL_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = var("SCALE_REQUIREMENT") {
            config.scale_requirement = v;
        }

        config.validate()?;
        Ok(config)
    }

    /// Rejects values the engine cannot run with.
    ///
    /// # Errors
    ///
    /// Returns `ForgeflowError::Config` naming the first offending field.
    pub fn validate(&self) -> Result<(), ForgeflowError> {
        let zero = [
            ("max_concurrent_pipelines", self.max_concurrent_pipelines == 0),
            ("worker_timeout_secs", self.worker_timeout_secs == 0),
            ("retry.max_attempts", self.retry.max_attempts == 0),
            ("event_queue_capacity", self.event_queue_capacity == 0),
            ("notification_concurrency", self.notification_concurrency == 0),
            ("human_approval.timeout_secs", self.human_approval.timeout_secs == 0),
        ];
        if let Some((field, _)) = zero.iter().find(|(_, is_zero)| *is_zero) {
            return Err(ForgeflowError::Config(format!("{field} must be greater than zero")));
        }
        if self.retry.max_attempts > MAX_STAGE_ATTEMPTS {
            return Err(ForgeflowError::Config(format!(
                "retry.max_attempts must be at most {MAX_STAGE_ATTEMPTS}, got {}",
                self.retry.max_attempts
            )));
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(ForgeflowError::Config(
                "retry.max_delay_ms must not be below retry.base_delay_ms".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_var<T>(name: &str, value: &str) -> Result<T, ForgeflowError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| ForgeflowError::Config(format!("{ENV_PREFIX}{name}={value}: {e}")))
}
