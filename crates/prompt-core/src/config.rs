//! Engine tuning, loadable from TOML.
//!
//! Every field has a default, so an empty file (or no file) yields the stock
//! engine.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;

use crate::budget::counter::{DEFAULT_SAFETY_MARGIN, SAFETY_MARGIN_RANGE};
use crate::budget::BudgetPolicy;
use crate::chunking::ChunkSettings;
use crate::error::EngineError;
use crate::execute::{Deadlines, RetryPolicy};
use crate::optimize::OptimizerSettings;
use crate::throttle::DEFAULT_TOKENS_PER_MINUTE;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ThrottleConfig {
    pub tokens_per_minute: u32,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            tokens_per_minute: DEFAULT_TOKENS_PER_MINUTE,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Over-estimate applied to every token count
    pub token_safety_margin: f64,
    pub budget: BudgetPolicy,
    pub optimizer: OptimizerSettings,
    pub chunking: ChunkSettings,
    pub throttle: ThrottleConfig,
    pub deadlines: Deadlines,
    pub retry: RetryPolicy,
    /// Concurrent chunk calls per request
    pub max_workers: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            token_safety_margin: DEFAULT_SAFETY_MARGIN,
            budget: BudgetPolicy::default(),
            optimizer: OptimizerSettings::default(),
            chunking: ChunkSettings::default(),
            throttle: ThrottleConfig::default(),
            deadlines: Deadlines::default(),
            retry: RetryPolicy::default(),
            max_workers: 4,
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, EngineError> {
        let config: Self = toml::from_str(text)
            .map_err(|e| EngineError::Configuration(format!("Invalid engine config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path`; a missing file yields the defaults.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let path = path.as_ref();
        match fs::read_to_string(path).await {
            Ok(text) => {
                tracing::info!("Loading engine config from {}", path.display());
                Self::from_toml_str(&text)
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No engine config at {}, using defaults", path.display());
                Ok(Self::default())
            }
            Err(err) => Err(EngineError::Configuration(format!(
                "Failed to read {}: {}",
                path.display(),
                err
            ))),
        }
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        self.deadlines.validate()?;

        let (low, high) = SAFETY_MARGIN_RANGE;
        if !(low..=high).contains(&self.token_safety_margin) {
            return Err(EngineError::Configuration(format!(
                "token_safety_margin {} outside [{}, {}]",
                self.token_safety_margin, low, high
            )));
        }

        let shares = [
            ("budget.input_ratio", self.budget.input_ratio),
            ("budget.system_ratio", self.budget.system_ratio),
        ];
        for (name, value) in shares {
            if value <= 0.0 || value > 1.0 {
                return Err(EngineError::Configuration(format!(
                    "{} must be within (0, 1], got {}",
                    name, value
                )));
            }
        }

        let fractions = [
            ("chunking.safety_margin", self.chunking.safety_margin),
            ("chunking.min_remainder_ratio", self.chunking.min_remainder_ratio),
        ];
        for (name, value) in fractions {
            if !(0.0..1.0).contains(&value) {
                return Err(EngineError::Configuration(format!(
                    "{} must be within [0, 1), got {}",
                    name, value
                )));
            }
        }
        if self.chunking.max_encoding_deviation < 0.0 {
            return Err(EngineError::Configuration(
                "chunking.max_encoding_deviation must not be negative".to_string(),
            ));
        }
        if self.throttle.tokens_per_minute == 0 {
            return Err(EngineError::Configuration(
                "throttle.tokens_per_minute must be positive".to_string(),
            ));
        }
        if self.max_workers == 0 {
            return Err(EngineError::Configuration(
                "max_workers must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
