//! Configuration management for ruguard
//!
//! Handles loading and validation of `ruguard.toml`. Every section is
//! optional; missing fields take the defaults below.
//!
//! ```toml
//! [logging]
//! level = "info"
//! format = "json"
//!
//! [storage]
//! db_path = "ruguard.db"
//!
//! [[groups]]
//! name = "rg1"
//! ru_per_sec = 1000
//! priority = "high"
//! burstable = "moderated"
//!
//! [groups.query_limit]
//! exec_elapsed = "50ms"
//! action = "kill"
//! watch = "exact"
//! watch_duration = "10m"
//! ```

use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, GroupError};
use crate::group::{BurstMode, DEFAULT_GROUP_NAME, Priority, RuRate, RunawayAction, WatchType};
use crate::logging::LogConfig;
use crate::options::{
    AlterOption, BackgroundOption, QueryLimitOption, WatchDuration, parse_duration,
};

// =============================================================================
// Log format
// =============================================================================

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable output for terminals
    #[default]
    Pretty,
    /// JSON lines
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pretty => f.write_str("pretty"),
            Self::Json => f.write_str("json"),
        }
    }
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" | "text" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(format!("unknown log format: {s}. Expected one of: pretty, json")),
        }
    }
}

// =============================================================================
// Top level
// =============================================================================

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GovernorConfig {
    /// Logging settings
    #[serde(default)]
    pub logging: LogConfig,

    /// Audit storage settings
    #[serde(default)]
    pub storage: StorageConfig,

    /// Admission controller settings
    #[serde(default)]
    pub controller: ControllerConfig,

    /// Runaway event recorder settings
    #[serde(default)]
    pub recorder: RecorderConfig,

    /// Watch list maintenance settings
    #[serde(default)]
    pub watch: WatchConfig,

    /// Groups created (or, for `default`, altered) at startup
    #[serde(default)]
    pub groups: Vec<GroupSpec>,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite file holding the runaway audit tables
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

fn default_db_path() -> String {
    "ruguard.db".to_string()
}

/// Admission controller configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Upper bound of the moderated burst multiplier (capacity = rate × m)
    #[serde(default = "default_moderated_max_multiplier")]
    pub moderated_max_multiplier: f64,

    /// Cost multiplier applied to throttled (cooldown) queries
    #[serde(default = "default_cooldown_cost_factor")]
    pub cooldown_cost_factor: f64,

    /// Rate used to size background budgets on unlimited groups
    #[serde(default = "default_background_reference_ru")]
    pub background_reference_ru: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            moderated_max_multiplier: default_moderated_max_multiplier(),
            cooldown_cost_factor: default_cooldown_cost_factor(),
            background_reference_ru: default_background_reference_ru(),
        }
    }
}

fn default_moderated_max_multiplier() -> f64 {
    3.0
}

fn default_cooldown_cost_factor() -> f64 {
    4.0
}

fn default_background_reference_ru() -> u64 {
    10_000
}

/// Event recorder configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecorderConfig {
    /// Flush timer period
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    /// Buffered distinct events that trigger an early flush
    #[serde(default = "default_flush_batch_size")]
    pub flush_batch_size: usize,

    /// Persisted rows older than this are purged
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u64,

    /// Maximum rows purged per GC pass
    #[serde(default = "default_gc_batch_size")]
    pub gc_batch_size: usize,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: default_flush_interval_ms(),
            flush_batch_size: default_flush_batch_size(),
            retention_hours: default_retention_hours(),
            gc_batch_size: default_gc_batch_size(),
        }
    }
}

impl RecorderConfig {
    #[must_use]
    pub fn retention_ms(&self) -> u64 {
        self.retention_hours.saturating_mul(3_600_000)
    }
}

fn default_flush_interval_ms() -> u64 {
    5_000
}

fn default_flush_batch_size() -> usize {
    256
}

fn default_retention_hours() -> u64 {
    7 * 24
}

fn default_gc_batch_size() -> usize {
    1_000
}

/// Watch list maintenance configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchConfig {
    /// Sweep period for expired watch entries
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,

    /// Entries inspected per sweep
    #[serde(default = "default_sweep_batch_size")]
    pub sweep_batch_size: usize,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            sweep_interval_ms: default_sweep_interval_ms(),
            sweep_batch_size: default_sweep_batch_size(),
        }
    }
}

fn default_sweep_interval_ms() -> u64 {
    1_000
}

fn default_sweep_batch_size() -> usize {
    512
}

// =============================================================================
// Group seeds
// =============================================================================

/// `RU_PER_SEC` as written in TOML: a number or `"unlimited"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RuSpec {
    Number(u64),
    Text(String),
}

impl RuSpec {
    fn to_rate(&self) -> Result<RuRate, GroupError> {
        match self {
            Self::Number(n) => RuRate::limited(*n),
            Self::Text(text) => text.parse(),
        }
    }
}

/// `QUERY_LIMIT` block of a group seed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryLimitSpec {
    #[serde(default)]
    pub exec_elapsed: Option<String>,
    #[serde(default)]
    pub processed_keys: Option<u64>,
    #[serde(default)]
    pub ru: Option<u64>,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub watch: Option<String>,
    /// Duration string or `"unlimited"`
    #[serde(default)]
    pub watch_duration: Option<String>,
}

/// `BACKGROUND` block of the default group seed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackgroundSpec {
    #[serde(default)]
    pub task_types: Option<String>,
    #[serde(default)]
    pub utilization_limit: Option<u64>,
}

/// One group seed, written with the DDL vocabulary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupSpec {
    pub name: String,
    #[serde(default)]
    pub ru_per_sec: Option<RuSpec>,
    #[serde(default)]
    pub priority: Option<String>,
    /// `off`, `moderated` or `unlimited`
    #[serde(default)]
    pub burstable: Option<String>,
    #[serde(default)]
    pub query_limit: Option<QueryLimitSpec>,
    #[serde(default)]
    pub background: Option<BackgroundSpec>,
}

impl GroupSpec {
    #[must_use]
    pub fn is_default(&self) -> bool {
        self.name.trim().eq_ignore_ascii_case(DEFAULT_GROUP_NAME)
    }

    /// Translate into the option list a `CREATE`/`ALTER` statement would carry.
    pub fn to_options(&self) -> Result<Vec<AlterOption>, GroupError> {
        let mut options = Vec::new();
        if let Some(ru) = &self.ru_per_sec {
            options.push(AlterOption::RuPerSec(ru.to_rate()?));
        }
        if let Some(priority) = &self.priority {
            options.push(AlterOption::Priority(priority.parse::<Priority>()?));
        }
        if let Some(burst) = &self.burstable {
            options.push(AlterOption::Burstable(burst.parse::<BurstMode>()?));
        }
        if let Some(limit) = &self.query_limit {
            let mut entries = Vec::new();
            if let Some(elapsed) = &limit.exec_elapsed {
                entries.push(QueryLimitOption::ExecElapsed(parse_duration(elapsed)?));
            }
            if let Some(keys) = limit.processed_keys {
                entries.push(QueryLimitOption::ProcessedKeys(keys));
            }
            if let Some(ru) = limit.ru {
                entries.push(QueryLimitOption::Ru(ru));
            }
            if let Some(action) = &limit.action {
                entries.push(QueryLimitOption::Action(action.parse::<RunawayAction>()?));
            }
            if let Some(watch) = &limit.watch {
                let duration = limit
                    .watch_duration
                    .as_deref()
                    .map(str::parse::<WatchDuration>)
                    .transpose()?;
                entries.push(QueryLimitOption::Watch(watch.parse::<WatchType>()?, duration));
            }
            options.push(AlterOption::QueryLimit(entries));
        }
        if let Some(background) = &self.background {
            let mut entries = Vec::new();
            if let Some(types) = &background.task_types {
                entries.push(BackgroundOption::TaskTypes(types.clone()));
            }
            if let Some(limit) = background.utilization_limit {
                entries.push(BackgroundOption::UtilizationLimit(limit));
            }
            options.push(AlterOption::Background(entries));
        }
        Ok(options)
    }
}

// =============================================================================
// Loading
// =============================================================================

impl GovernorConfig {
    /// Parse from TOML text and validate.
    pub fn from_toml_str(text: &str) -> crate::Result<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| ConfigError::ParseFailed(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> crate::Result<Self> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()).into());
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.display().to_string(), e.to_string()))?;
        let config = Self::from_toml_str(&text)?;
        tracing::debug!(path = %path.display(), groups = config.groups.len(), "config loaded");
        Ok(config)
    }

    /// Check numeric ranges and that every group seed translates cleanly.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::ValidationError(msg));

        let multiplier = self.controller.moderated_max_multiplier;
        if multiplier.is_nan() || multiplier < 1.0 {
            return invalid(format!(
                "controller.moderated_max_multiplier must be >= 1 (got {})",
                self.controller.moderated_max_multiplier
            ));
        }
        let factor = self.controller.cooldown_cost_factor;
        if factor.is_nan() || factor < 1.0 {
            return invalid(format!(
                "controller.cooldown_cost_factor must be >= 1 (got {})",
                self.controller.cooldown_cost_factor
            ));
        }
        if self.controller.background_reference_ru == 0 {
            return invalid("controller.background_reference_ru must be positive".to_string());
        }
        if self.recorder.flush_interval_ms == 0 {
            return invalid("recorder.flush_interval_ms must be positive".to_string());
        }
        if self.recorder.flush_batch_size == 0 {
            return invalid("recorder.flush_batch_size must be positive".to_string());
        }
        if self.recorder.gc_batch_size == 0 {
            return invalid("recorder.gc_batch_size must be positive".to_string());
        }
        if self.watch.sweep_interval_ms == 0 || self.watch.sweep_batch_size == 0 {
            return invalid("watch.sweep_interval_ms and sweep_batch_size must be positive".to_string());
        }
        if crate::logging::parse_level(&self.logging.level).is_err() {
            return invalid(format!("unknown log level '{}'", self.logging.level));
        }

        let mut seen = HashSet::new();
        for seed in &self.groups {
            let name = seed.name.trim().to_lowercase();
            if !seen.insert(name.clone()) {
                return invalid(format!("group '{name}' is listed more than once"));
            }
            let options = seed
                .to_options()
                .map_err(|e| ConfigError::ValidationError(format!("group '{name}': {e}")))?;
            if !seed.is_default() && seed.ru_per_sec.is_none() {
                return invalid(format!("group '{name}': ru_per_sec is required"));
            }
            crate::options::validate_options(&options, seed.is_default())
                .map_err(|e| ConfigError::ValidationError(format!("group '{name}': {e}")))?;
        }
        Ok(())
    }
}
