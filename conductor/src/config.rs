//! Configuration for the Conductor engine.
//!
//! Configuration is read from a TOML file and then patched with environment
//! variable overrides. Every section has defaults, so a missing file or a
//! partial file is fine.
//!
//! # Location
//!
//! `CONDUCTOR_CONFIG_PATH` if set, otherwise `./conductor.toml`.
//!
//! # Example
//!
//! ```toml
//! [matcher]
//! min_score = 0.4
//!
//! [execution]
//! max_retries = 3
//! max_parallel_phases = 4
//!
//! [context]
//! compression_threshold_bytes = 32768
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{ConductorError, Result};
use crate::orchestration::workflow::WorkflowPattern;
use crate::registry::ResourceTier;

/// Environment variable prefix for all overrides
pub const ENV_PREFIX: &str = "CONDUCTOR_";

pub const ENV_CONFIG_PATH: &str = "CONDUCTOR_CONFIG_PATH";
pub const ENV_LOG_LEVEL: &str = "CONDUCTOR_LOG_LEVEL";
pub const ENV_MAX_RETRIES: &str = "CONDUCTOR_MAX_RETRIES";
pub const ENV_MIN_MATCH_SCORE: &str = "CONDUCTOR_MIN_MATCH_SCORE";
pub const ENV_MAX_PARALLEL_PHASES: &str = "CONDUCTOR_MAX_PARALLEL_PHASES";

/// Upper bound accepted for `execution.max_retries`
pub const MAX_RETRIES_LIMIT: u32 = 100;

/// Default config file name, resolved against the working directory
pub const DEFAULT_CONFIG_FILE: &str = "conductor.toml";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConductorConfig {
    pub matcher: MatcherConfig,
    pub decomposer: DecomposerConfig,
    pub execution: ExecutionConfig,
    pub context: ContextConfig,
    pub logging: LoggingConfig,
}

/// Worker matching weights and thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatcherConfig {
    /// Matches scoring below this are discarded
    pub min_score: f64,

    /// Weight of exact capability-tag overlap
    pub overlap_weight: f64,

    /// Weight of the pluggable semantic similarity component
    pub semantic_weight: f64,

    /// Weight of resource-tier fit
    pub tier_weight: f64,

    /// Number of runner-up matches recorded as fallbacks
    pub fallback_count: usize,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            min_score: 0.3,
            overlap_weight: 0.6,
            semantic_weight: 0.25,
            tier_weight: 0.15,
            fallback_count: 2,
        }
    }
}

/// Task decomposition settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecomposerConfig {
    /// Classifier results below this confidence fall back to `fallback_pattern`
    pub min_confidence: f64,

    /// Pattern used when classification is not confident enough
    pub fallback_pattern: WorkflowPattern,
}

impl Default for DecomposerConfig {
    fn default() -> Self {
        Self {
            min_confidence: 0.5,
            fallback_pattern: WorkflowPattern::Sequential,
        }
    }
}

/// Execution engine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Retries after the first attempt, spread over fallback workers
    pub max_retries: u32,

    /// Let dependents of a failed optional phase run anyway
    pub tolerate_optional_failures: bool,

    /// Upper bound on concurrently running phases
    pub max_parallel_phases: usize,

    pub light_timeout_ms: u64,
    pub standard_timeout_ms: u64,
    pub heavy_timeout_ms: u64,

    /// Drop context entries once a workflow completes
    pub gc_on_completion: bool,

    /// Capacity of the execution event broadcast channel
    pub event_buffer: usize,

    /// Finished runs kept for status queries; older ones are pruned
    pub retained_runs: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            tolerate_optional_failures: true,
            max_parallel_phases: 8,
            light_timeout_ms: 60_000,
            standard_timeout_ms: 180_000,
            heavy_timeout_ms: 600_000,
            gc_on_completion: true,
            event_buffer: 256,
            retained_runs: 64,
        }
    }
}

impl ExecutionConfig {
    /// Per-phase timeout budget for a worker tier
    pub fn timeout_for(&self, tier: ResourceTier) -> Duration {
        let ms = match tier {
            ResourceTier::Light => self.light_timeout_ms,
            ResourceTier::Standard => self.standard_timeout_ms,
            ResourceTier::Heavy => self.heavy_timeout_ms,
        };
        Duration::from_millis(ms)
    }
}

/// Context store tiering and compression
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Entries up to this size are placed in the hot tier
    pub hot_max_bytes: usize,

    /// Entries up to this size are placed in the warm tier
    pub warm_max_bytes: usize,

    /// Entries up to this size are placed in the cold tier, larger ones are archived
    pub cold_max_bytes: usize,

    /// Entries larger than this are compressed on write
    pub compression_threshold_bytes: usize,

    /// Hard ceiling on a stored entry after compression
    pub max_entry_bytes: usize,

    /// Total bytes allowed in the hot tier before demotion kicks in
    pub hot_budget_bytes: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            hot_max_bytes: 16 * 1024,
            warm_max_bytes: 256 * 1024,
            cold_max_bytes: 4 * 1024 * 1024,
            compression_threshold_bytes: 64 * 1024,
            max_entry_bytes: 8 * 1024 * 1024,
            hot_budget_bytes: 1024 * 1024,
        }
    }
}

/// Logging output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl ConductorConfig {
    /// Resolve the config file path from the environment
    pub fn config_path() -> PathBuf {
        std::env::var(ENV_CONFIG_PATH)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_FILE))
    }

    /// Load from the default location, falling back to defaults if the file is absent
    pub fn load() -> Result<Self> {
        let path = Self::config_path();
        if path.exists() {
            Self::load_from_path(&path)
        } else {
            debug!("No config file at {}, using defaults", path.display());
            let mut config = Self::default();
            config.merge_env_vars()?;
            config.validate()?;
            Ok(config)
        }
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self> {
        debug!("Loading configuration from: {}", path.display());

        let content = std::fs::read_to_string(path).map_err(|e| {
            ConductorError::config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;

        let mut config = Self::from_toml_str(&content)?;
        config.merge_env_vars()?;
        config.validate()?;

        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Parse configuration from TOML text without environment overrides
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| ConductorError::config(format!("Failed to parse config: {}", e)))
    }

    /// Serialize to pretty TOML
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| ConductorError::config(format!("Failed to serialize config: {}", e)))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.as_str()) {
            return Err(ConductorError::config(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            )));
        }

        if !(0.0..=1.0).contains(&self.matcher.min_score) {
            return Err(ConductorError::config("matcher.min_score must be within [0, 1]"));
        }

        let weights = [
            self.matcher.overlap_weight,
            self.matcher.semantic_weight,
            self.matcher.tier_weight,
        ];
        if weights.iter().any(|w| *w < 0.0) || weights.iter().sum::<f64>() <= 0.0 {
            return Err(ConductorError::config(
                "matcher weights must be non-negative and not all zero",
            ));
        }

        if !(0.0..=1.0).contains(&self.decomposer.min_confidence) {
            return Err(ConductorError::config(
                "decomposer.min_confidence must be within [0, 1]",
            ));
        }

        if self.decomposer.fallback_pattern == WorkflowPattern::Auto {
            return Err(ConductorError::config(
                "decomposer.fallback_pattern cannot be 'auto'",
            ));
        }

        if self.execution.max_retries > MAX_RETRIES_LIMIT {
            return Err(ConductorError::config(format!(
                "execution.max_retries must be at most {}",
                MAX_RETRIES_LIMIT
            )));
        }

        if self.execution.max_parallel_phases == 0 {
            return Err(ConductorError::config(
                "execution.max_parallel_phases must be greater than 0",
            ));
        }

        if self.execution.event_buffer == 0 {
            return Err(ConductorError::config("execution.event_buffer must be greater than 0"));
        }

        if [
            self.execution.light_timeout_ms,
            self.execution.standard_timeout_ms,
            self.execution.heavy_timeout_ms,
        ]
        .contains(&0)
        {
            return Err(ConductorError::config("phase timeouts must be greater than 0"));
        }

        let ctx = &self.context;
        if !(ctx.hot_max_bytes <= ctx.warm_max_bytes && ctx.warm_max_bytes <= ctx.cold_max_bytes) {
            return Err(ConductorError::config(
                "context tier thresholds must satisfy hot <= warm <= cold",
            ));
        }

        if ctx.max_entry_bytes == 0 {
            return Err(ConductorError::config("context.max_entry_bytes must be greater than 0"));
        }

        debug!("Configuration validation passed");
        Ok(())
    }

    /// Merge environment variable overrides into the configuration
    pub fn merge_env_vars(&mut self) -> Result<()> {
        if let Ok(level) = std::env::var(ENV_LOG_LEVEL) {
            debug!("Overriding log level from environment: {}", level);
            self.logging.level = level;
        }

        if let Ok(value) = std::env::var(ENV_MAX_RETRIES) {
            self.execution.max_retries = value.parse().map_err(|e| {
                ConductorError::config(format!("Invalid {} in environment: {}", ENV_MAX_RETRIES, e))
            })?;
            debug!("Overriding max_retries from environment: {}", self.execution.max_retries);
        }

        if let Ok(value) = std::env::var(ENV_MIN_MATCH_SCORE) {
            self.matcher.min_score = value.parse().map_err(|e| {
                ConductorError::config(format!(
                    "Invalid {} in environment: {}",
                    ENV_MIN_MATCH_SCORE, e
                ))
            })?;
            debug!("Overriding min_score from environment: {}", self.matcher.min_score);
        }

        if let Ok(value) = std::env::var(ENV_MAX_PARALLEL_PHASES) {
            self.execution.max_parallel_phases = value.parse().map_err(|e| {
                ConductorError::config(format!(
                    "Invalid {} in environment: {}",
                    ENV_MAX_PARALLEL_PHASES, e
                ))
            })?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ConductorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.matcher.min_score, 0.3);
        assert_eq!(config.execution.max_retries, 2);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = ConductorConfig::from_toml_str(
            r#"
            [execution]
            max_retries = 5

            [decomposer]
            fallback_pattern = "parallel"
            "#,
        )
        .unwrap();

        assert_eq!(config.execution.max_retries, 5);
        assert_eq!(config.execution.max_parallel_phases, 8);
        assert_eq!(config.decomposer.fallback_pattern, WorkflowPattern::Parallel);
        assert_eq!(config.matcher, MatcherConfig::default());
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = ConductorConfig::default();
        let text = config.to_toml_string().unwrap();
        assert_eq!(ConductorConfig::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = ConductorConfig::default();
        config.matcher.min_score = 1.5;
        assert!(config.validate().is_err());

        let mut config = ConductorConfig::default();
        config.context.hot_max_bytes = config.context.warm_max_bytes + 1;
        assert!(config.validate().is_err());

        let mut config = ConductorConfig::default();
        config.decomposer.fallback_pattern = WorkflowPattern::Auto;
        assert!(config.validate().is_err());

        let mut config = ConductorConfig::default();
        config.logging.level = "loud".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_bounds_max_retries() {
        let mut config = ConductorConfig::default();
        config.execution.max_retries = MAX_RETRIES_LIMIT;
        assert!(config.validate().is_ok());

        config.execution.max_retries = u32::MAX;
        assert!(matches!(config.validate(), Err(ConductorError::Config(_))));

        let config = ConductorConfig::from_toml_str("[execution]\nmax_retries = 4294967295\n").unwrap();
        assert!(matches!(config.validate(), Err(ConductorError::Config(_))));
    }

    #[test]
    fn test_timeouts_scale_with_tier() {
        let config = ExecutionConfig::default();
        assert!(config.timeout_for(ResourceTier::Light) < config.timeout_for(ResourceTier::Standard));
        assert!(config.timeout_for(ResourceTier::Standard) < config.timeout_for(ResourceTier::Heavy));
    }
}
