//! # Stage: Router Configuration
//!
//! ## Responsibility
//! Parse and validate TOML router configuration: selection weight tables,
//! stream timeouts, monitor window sizing, and recommendation thresholds.
//!
//! ## Guarantees
//! - Deterministic: same TOML input always produces the same `RouterConfig`
//! - Validated: semantic constraints are checked before a config is accepted
//! - Type-safe: invalid field combinations are caught at parse time via serde
//! - Schema-exportable: JSON Schema output enables IDE autocomplete
//!
//! ## NOT Responsible For
//! - Building the router from config (that belongs to `routing::router`)
//! - Provider adapter construction (that belongs to the embedding process)

use crate::RouterError;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

// ── Default value functions ──────────────────────────────────────────────

/// Default first-chunk / health-probe bound: 5000ms.
fn default_first_chunk_ms() -> u64 {
    5000
}

/// Default mid-stream inactivity bound: 10000ms.
fn default_stall_ms() -> u64 {
    10_000
}

/// Default non-streamed request bound: 30000ms.
fn default_request_ms() -> u64 {
    30_000
}

/// Default monitor window: 300 seconds.
fn default_window_s() -> u64 {
    300
}

/// Default per-model ring-buffer capacity.
fn default_monitor_capacity() -> usize {
    1024
}

/// Default latency ceiling before a model is flagged: 2000ms.
fn default_max_avg_latency_ms() -> u64 {
    2000
}

/// Default quality floor before a model is flagged.
fn default_min_avg_quality() -> f64 {
    0.5
}

/// Default sample floor below which no recommendation fires.
fn default_min_samples() -> usize {
    10
}

fn default_quality_weights() -> ScoreWeights {
    ScoreWeights {
        quality: 0.6,
        speed: 0.2,
        cost: 0.2,
    }
}

fn default_speed_weights() -> ScoreWeights {
    ScoreWeights {
        quality: 0.2,
        speed: 0.6,
        cost: 0.2,
    }
}

fn default_balanced_weights() -> ScoreWeights {
    ScoreWeights {
        quality: 0.4,
        speed: 0.4,
        cost: 0.2,
    }
}

// ── Top-level config ─────────────────────────────────────────────────────

/// Root configuration for a router instance.
///
/// Deserialized from a TOML file and validated before use. Every field has
/// a documented default, so an empty file is a valid configuration.
///
/// # Example
///
/// ```toml
/// [timeouts]
/// first_chunk_ms = 2000
/// stall_ms = 8000
///
/// [selection.quality]
/// quality = 0.7
/// speed = 0.2
/// cost = 0.1
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct RouterConfig {
    /// Per-priority scoring weight tables.
    pub selection: SelectionConfig,
    /// Probe and inactivity bounds.
    pub timeouts: TimeoutConfig,
    /// Performance-monitor window sizing.
    pub monitor: MonitorConfig,
    /// Advisory recommendation thresholds.
    pub recommendations: RecommendationConfig,
}

/// Weights for one priority class's scoring combination.
///
/// Applied as `quality·w_q + speed·w_s + cost_score·w_c` where `cost_score`
/// decreases monotonically with cost-per-1K.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ScoreWeights {
    /// Weight on the model's quality score.
    pub quality: f64,
    /// Weight on the model's speed score.
    pub speed: f64,
    /// Weight on the model's (inverted) cost score.
    pub cost: f64,
}

/// Per-priority scoring weight tables.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct SelectionConfig {
    /// Weights for `Priority::Quality` requests.
    pub quality: ScoreWeights,
    /// Weights for `Priority::Speed` requests.
    pub speed: ScoreWeights,
    /// Weights for `Priority::Balanced` requests.
    pub balanced: ScoreWeights,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            quality: default_quality_weights(),
            speed: default_speed_weights(),
            balanced: default_balanced_weights(),
        }
    }
}

/// Probe and inactivity bounds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Maximum time (ms) for a stream to produce its first chunk before the
    /// attempt is treated as `BackendUnavailable`.
    pub first_chunk_ms: u64,
    /// Maximum inactivity (ms) between chunks on an already-started stream
    /// before the generation is terminated as `StreamStalled`.
    pub stall_ms: u64,
    /// Maximum time (ms) for a non-streamed `route` execution.
    pub request_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            first_chunk_ms: default_first_chunk_ms(),
            stall_ms: default_stall_ms(),
            request_ms: default_request_ms(),
        }
    }
}

impl TimeoutConfig {
    /// First-chunk bound as a [`Duration`].
    pub fn first_chunk(&self) -> Duration {
        Duration::from_millis(self.first_chunk_ms)
    }

    /// Stall bound as a [`Duration`].
    pub fn stall(&self) -> Duration {
        Duration::from_millis(self.stall_ms)
    }

    /// Non-streamed request bound as a [`Duration`].
    pub fn request(&self) -> Duration {
        Duration::from_millis(self.request_ms)
    }
}

/// Performance-monitor window sizing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct MonitorConfig {
    /// Time window (seconds) over which records are retained and TPS is
    /// computed.
    pub window_s: u64,
    /// Maximum records held per model regardless of age.
    pub capacity: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            window_s: default_window_s(),
            capacity: default_monitor_capacity(),
        }
    }
}

/// Advisory recommendation thresholds.
///
/// Recommendations are read-only output; they are never fed back into the
/// selector, which stays deterministic.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct RecommendationConfig {
    /// Average latency (ms) above which a model is flagged.
    pub max_avg_latency_ms: u64,
    /// Average quality below which a model is flagged.
    pub min_avg_quality: f64,
    /// Minimum records for a model before any flag fires.
    pub min_samples: usize,
}

impl Default for RecommendationConfig {
    fn default() -> Self {
        Self {
            max_avg_latency_ms: default_max_avg_latency_ms(),
            min_avg_quality: default_min_avg_quality(),
            min_samples: default_min_samples(),
        }
    }
}

// ── Loading and validation ───────────────────────────────────────────────

impl RouterConfig {
    /// Load and validate a configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::ConfigurationError`] if the file cannot be
    /// read, fails to parse, or fails semantic validation.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, RouterError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            RouterError::ConfigurationError(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml(&raw)
    }

    /// Parse and validate a configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::ConfigurationError`] on parse or validation
    /// failure.
    pub fn from_toml(raw: &str) -> Result<Self, RouterError> {
        let config: Self = toml::from_str(raw)
            .map_err(|e| RouterError::ConfigurationError(format!("invalid TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Check all semantic constraints.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::ConfigurationError`] naming the first violated
    /// constraint.
    pub fn validate(&self) -> Result<(), RouterError> {
        for (name, w) in [
            ("selection.quality", &self.selection.quality),
            ("selection.speed", &self.selection.speed),
            ("selection.balanced", &self.selection.balanced),
        ] {
            if w.quality < 0.0 || w.speed < 0.0 || w.cost < 0.0 {
                return Err(RouterError::ConfigurationError(format!(
                    "{name}: weights must be non-negative"
                )));
            }
            if w.quality + w.speed + w.cost <= 0.0 {
                return Err(RouterError::ConfigurationError(format!(
                    "{name}: at least one weight must be positive"
                )));
            }
        }

        if self.timeouts.first_chunk_ms == 0 {
            return Err(RouterError::ConfigurationError(
                "timeouts.first_chunk_ms must be positive".to_string(),
            ));
        }
        if self.timeouts.stall_ms == 0 {
            return Err(RouterError::ConfigurationError(
                "timeouts.stall_ms must be positive".to_string(),
            ));
        }
        if self.timeouts.request_ms == 0 {
            return Err(RouterError::ConfigurationError(
                "timeouts.request_ms must be positive".to_string(),
            ));
        }

        if self.monitor.window_s == 0 {
            return Err(RouterError::ConfigurationError(
                "monitor.window_s must be positive".to_string(),
            ));
        }
        if self.monitor.capacity == 0 {
            return Err(RouterError::ConfigurationError(
                "monitor.capacity must be positive".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.recommendations.min_avg_quality) {
            return Err(RouterError::ConfigurationError(
                "recommendations.min_avg_quality must be in [0, 1]".to_string(),
            ));
        }

        Ok(())
    }

    /// Export the configuration schema as pretty-printed JSON Schema.
    pub fn json_schema() -> String {
        let schema = schemars::schema_for!(RouterConfig);
        serde_json::to_string_pretty(&schema).unwrap_or_default()
    }
}
