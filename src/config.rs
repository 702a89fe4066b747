//! Raw loader configuration and its validation.
//!
//! Mirrors the typed builder inputs with serde-friendly primitives: counts
//! as signed integers and delays as f64 milliseconds, so out-of-range values
//! arrive here instead of being unrepresentable, and are rejected with the
//! stable messages from [`crate::error::messages`]. `validate()` produces
//! [`LoaderSettings`], which convert into builder inputs.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::loader::{
    BackoffInput, BackoffStrategy, LoaderInput, PropagateRetry, RetryInput, TimeoutInput,
};

/// Raw, unvalidated loader configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoaderConfig {
    pub retry: RetryConfig,
    pub timeout: TimeoutConfig,
    #[serde(default)]
    pub backoff: Option<BackoffConfig>,
    #[serde(default)]
    pub propagate_retry: PropagateConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_count: i64,
    #[serde(default)]
    pub can_retry_on_error: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    pub delay_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffConfig {
    #[serde(flatten)]
    pub strategy: StrategyConfig,
    pub initial_delay_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "strategy")]
pub enum StrategyConfig {
    Fixed,
    Linear { add_ms: f64 },
    Exponential { factor: f64 },
}

/// Either a boolean or one of the named propagation modes. Unrecognized
/// names fall back to no propagation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropagateConfig {
    Flag(bool),
    Named(String),
}

impl Default for PropagateConfig {
    fn default() -> Self {
        PropagateConfig::Flag(false)
    }
}

impl PropagateConfig {
    fn resolve(&self) -> PropagateRetry {
        match self {
            PropagateConfig::Flag(flag) => (*flag).into(),
            PropagateConfig::Named(name) => match name.as_str() {
                "HAS_OUTER_CONTEXT" => PropagateRetry::HasOuterContext,
                "HAS_SAME_OUTER_CONTEXT" => PropagateRetry::HasSameOuterContext,
                _ => PropagateRetry::Never,
            },
        }
    }
}

/// Validated configuration, ready to become builder inputs.
#[derive(Debug, Clone, PartialEq)]
pub struct LoaderSettings {
    pub max_count: u32,
    pub can_retry_on_error: bool,
    pub timeout_delay: Duration,
    pub backoff: Option<BackoffInput>,
    pub propagate_retry: PropagateRetry,
}

impl LoaderSettings {
    /// Builder input carrying the validated knobs; predicates and callbacks
    /// are attached through the builder afterwards.
    pub fn loader_input<T: Send + 'static>(&self) -> LoaderInput<T> {
        let retry = RetryInput::new(self.max_count).retry_on(self.can_retry_on_error);
        let mut input = LoaderInput::new(retry, TimeoutInput::new(self.timeout_delay));
        if let Some(backoff) = self.backoff {
            input = input.backoff(backoff);
        }
        input
    }
}

impl LoaderConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw =
            std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io(e.to_string()))?;
        Self::from_json_str(&raw)
    }

    pub fn validate(self) -> Result<LoaderSettings, ConfigError> {
        let max_count = u32::try_from(self.retry.max_count).map_err(|_| {
            ConfigError::RetryCount {
                value: self.retry.max_count,
            }
        })?;

        let delay_ms = self.timeout.delay_ms;
        if !delay_ms.is_finite() || delay_ms < 0.0 {
            return Err(ConfigError::TimeoutDelay { value: delay_ms });
        }
        let timeout_delay = Duration::try_from_secs_f64(delay_ms / 1000.0)
            .map_err(|_| ConfigError::TimeoutDelay { value: delay_ms })?;

        let backoff = match self.backoff {
            None => None,
            Some(config) => {
                if !config.initial_delay_ms.is_finite() || config.initial_delay_ms < 0.0 {
                    return Err(ConfigError::BackoffDelay {
                        value: config.initial_delay_ms,
                    });
                }
                let strategy = match config.strategy {
                    StrategyConfig::Fixed => BackoffStrategy::Fixed,
                    StrategyConfig::Linear { add_ms } => {
                        if !add_ms.is_finite() {
                            return Err(ConfigError::BackoffDelay { value: add_ms });
                        }
                        BackoffStrategy::Linear { add_ms }
                    }
                    StrategyConfig::Exponential { factor } => {
                        if !factor.is_finite() || factor < 0.0 {
                            return Err(ConfigError::BackoffDelay { value: factor });
                        }
                        BackoffStrategy::Exponential { factor }
                    }
                };
                Some(BackoffInput::new(strategy, config.initial_delay_ms))
            }
        };

        Ok(LoaderSettings {
            max_count,
            can_retry_on_error: self.retry.can_retry_on_error,
            timeout_delay,
            backoff,
            propagate_retry: self.propagate_retry.resolve(),
        })
    }
}
