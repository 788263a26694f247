//! Engine configuration
//!
//! One TOML-loadable tree for every tunable. Every field has a default, so an
//! empty file is a valid configuration.

use crate::error::ConfigError;
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level engine configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Admission control
    pub gate: GateConfig,
    /// Update-safety policy
    pub safety: SafetyConfig,
    /// Retry policies per external call type
    pub retry: RetryConfig,
    /// Registry retention
    pub registry: RegistryConfig,
    /// Log output
    pub logging: LoggingConfig,
}

impl EngineConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With gate capacity
    #[inline]
    #[must_use]
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.gate.capacity = capacity;
        self
    }

    /// With queue capacity
    #[inline]
    #[must_use]
    pub fn with_queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.gate.queue_capacity = queue_capacity;
        self
    }

    /// With shrink threshold
    #[inline]
    #[must_use]
    pub fn with_shrink_threshold(mut self, threshold: f64) -> Self {
        self.safety.shrink_threshold = threshold;
        self
    }

    /// With the same retry policy for every call type
    #[must_use]
    pub fn with_uniform_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = RetryConfig {
            attachment: policy.clone(),
            fetch: policy.clone(),
            generate: policy.clone(),
            publish: policy.clone(),
            notify: policy,
        };
        self
    }

    /// Parse from TOML text and validate
    ///
    /// # Errors
    /// `ConfigError::Parse` on malformed TOML, `ConfigError::Invalid` on
    /// out-of-range values.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file, apply environment overrides, validate
    ///
    /// # Errors
    /// Any [`ConfigError`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let mut config: Self = toml::from_str(&text)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `SHIPWRIGHT_*` environment overrides
    ///
    /// # Errors
    /// `ConfigError::Invalid` if a variable does not parse.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(v) = lookup("SHIPWRIGHT_CAPACITY") {
            self.gate.capacity = parse_env("SHIPWRIGHT_CAPACITY", &v)?;
        }
        if let Some(v) = lookup("SHIPWRIGHT_QUEUE_CAPACITY") {
            self.gate.queue_capacity = parse_env("SHIPWRIGHT_QUEUE_CAPACITY", &v)?;
        }
        if let Some(v) = lookup("SHIPWRIGHT_SHRINK_THRESHOLD") {
            self.safety.shrink_threshold = parse_env("SHIPWRIGHT_SHRINK_THRESHOLD", &v)?;
        }
        if let Some(v) = lookup("SHIPWRIGHT_LOG") {
            self.logging.filter = v;
        }
        Ok(())
    }

    /// Check value ranges
    ///
    /// # Errors
    /// `ConfigError::Invalid` naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.gate.capacity == 0 {
            return Err(ConfigError::invalid("gate.capacity", "must be >= 1"));
        }
        if self.gate.queue_capacity == 0 {
            return Err(ConfigError::invalid("gate.queue_capacity", "must be >= 1"));
        }
        let t = self.safety.shrink_threshold;
        if !(0.0..=1.0).contains(&t) {
            return Err(ConfigError::invalid(
                "safety.shrink_threshold",
                format!("must be within [0.0, 1.0], got {t}"),
            ));
        }
        for (name, policy) in self.retry.policies() {
            if policy.max_attempts == 0 {
                return Err(ConfigError::invalid(
                    format!("retry.{name}.max_attempts"),
                    "must be >= 1",
                ));
            }
            if policy.multiplier < 1.0 || !policy.multiplier.is_finite() {
                return Err(ConfigError::invalid(
                    format!("retry.{name}.multiplier"),
                    "must be a finite value >= 1.0",
                ));
            }
        }
        if self.registry.max_records == 0 {
            return Err(ConfigError::invalid("registry.max_records", "must be >= 1"));
        }
        Ok(())
    }

    /// Render as TOML
    ///
    /// # Errors
    /// Propagates serializer failures.
    pub fn to_toml_string(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::invalid(name, format!("cannot parse '{value}'")))
}

/// Admission control settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// Maximum concurrently running pipelines
    pub capacity: usize,
    /// Maximum queued tasks before admission is refused
    pub queue_capacity: usize,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            capacity: 4,
            queue_capacity: 256,
        }
    }
}

/// Update-safety settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    /// Minimum candidate/previous size ratio accepted on update rounds
    pub shrink_threshold: f64,
    /// Previous artifacts smaller than this skip the ratio check
    pub min_previous_bytes: usize,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            shrink_threshold: 0.5,
            min_previous_bytes: 0,
        }
    }
}

/// Retry policies per external call type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Remote attachment download
    pub attachment: RetryPolicy,
    /// Prior artifact fetch
    pub fetch: RetryPolicy,
    /// LLM generation
    pub generate: RetryPolicy,
    /// Repository publish
    pub publish: RetryPolicy,
    /// Evaluator notification
    pub notify: RetryPolicy,
}

impl RetryConfig {
    fn policies(&self) -> [(&'static str, &RetryPolicy); 5] {
        [
            ("attachment", &self.attachment),
            ("fetch", &self.fetch),
            ("generate", &self.generate),
            ("publish", &self.publish),
            ("notify", &self.notify),
        ]
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        let standard = RetryPolicy::default();
        Self {
            attachment: standard.clone(),
            fetch: standard.clone(),
            generate: standard.clone().with_attempt_timeout(Some(Duration::from_secs(180))),
            // Page serving propagates slowly; give publish more room.
            publish: RetryPolicy::new(6, Duration::from_secs(2), 2.0)
                .with_jitter(Some(Duration::from_millis(500)))
                .with_max_delay(Some(Duration::from_secs(60))),
            notify: RetryPolicy::new(5, Duration::from_secs(1), 2.0)
                .with_jitter(Some(Duration::from_millis(250)))
                .with_attempt_timeout(Some(Duration::from_secs(15))),
        }
    }
}

/// Registry retention
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Maximum terminal records kept
    pub max_records: usize,
    /// Terminal records older than this are evicted
    pub max_age_secs: u64,
}

impl RegistryConfig {
    /// Max age as a duration
    #[inline]
    #[must_use]
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_records: 1024,
            max_age_secs: 24 * 60 * 60,
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable
    #[default]
    Pretty,
    /// One JSON object per line
    Json,
}

/// Log settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    pub filter: String,
    /// Output format
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}
