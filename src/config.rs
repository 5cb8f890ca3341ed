//! Configuration management
//!
//! Engine tuning, scheduler cadence, the HTTP listener and the declarative
//! dimension/trigger/action set, all loaded from one TOML file.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::evaluation::Dimension;
use crate::triggers::TriggerSpec;
use crate::types::{Comparator, Priority};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Evaluation and dispatch tuning
    #[serde(default)]
    pub engine: EngineConfig,
    /// Periodic cycle settings
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// HTTP listener
    #[serde(default)]
    pub server: ServerConfig,
    /// Observation and history persistence
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub dimensions: Vec<DimensionConfig>,
    #[serde(default)]
    pub triggers: Vec<TriggerConfig>,
    #[serde(default)]
    pub actions: Vec<ActionConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Scores backed by fewer observations are flagged low-confidence
    #[serde(default = "default_min_observations")]
    pub min_observations: usize,
    /// Per-handler time limit
    #[serde(default = "default_handler_timeout_ms")]
    pub handler_timeout_ms: u64,
    /// Score delta below which a trend counts as stable
    #[serde(default = "default_trend_tolerance")]
    pub trend_tolerance: f64,
    /// Activation records kept in memory
    #[serde(default = "default_max_history")]
    pub max_history: usize,
}

fn default_min_observations() -> usize {
    1
}

fn default_handler_timeout_ms() -> u64 {
    5000
}

fn default_trend_tolerance() -> f64 {
    crate::evaluation::DEFAULT_TREND_TOLERANCE
}

fn default_max_history() -> usize {
    crate::dispatch::DEFAULT_MAX_HISTORY
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            min_observations: default_min_observations(),
            handler_timeout_ms: default_handler_timeout_ms(),
            trend_tolerance: default_trend_tolerance(),
            max_history: default_max_history(),
        }
    }
}

impl EngineConfig {
    pub fn handler_timeout(&self) -> Duration {
        Duration::from_millis(self.handler_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Seconds between cycles
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Length of the trailing window each cycle evaluates
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    /// Dimensions to evaluate; empty means every defined dimension
    #[serde(default)]
    pub dimensions: Vec<String>,
    #[serde(default = "default_base_backoff_secs")]
    pub base_backoff_secs: u64,
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_interval_secs() -> u64 {
    60
}

fn default_window_secs() -> u64 {
    3600
}

/// Longest trailing window the scheduler accepts (100 years)
pub const MAX_WINDOW_SECS: u64 = 100 * 365 * 24 * 3600;

fn default_base_backoff_secs() -> u64 {
    30
}

fn default_max_backoff_secs() -> u64 {
    1800
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_interval_secs(),
            window_secs: default_window_secs(),
            dimensions: Vec::new(),
            base_backoff_secs: default_base_backoff_secs(),
            max_backoff_secs: default_max_backoff_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    18790
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Load observations and history at startup and save them on shutdown
    #[serde(default)]
    pub persist: bool,
    /// Overrides the platform data directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

impl StorageConfig {
    pub fn resolve_dir(&self) -> Result<PathBuf> {
        match &self.dir {
            Some(dir) => Ok(dir.clone()),
            None => data_dir(),
        }
    }
}

/// `[[dimensions]]` entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DimensionConfig {
    pub name: String,
    /// metric name -> weight
    pub metrics: BTreeMap<String, f64>,
}

impl DimensionConfig {
    pub fn to_dimension(&self) -> crate::Result<Dimension> {
        Dimension::new(&self.name, self.metrics.clone())
    }
}

/// `[[triggers]]` entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerConfig {
    pub id: String,
    pub dimension: String,
    pub comparator: Comparator,
    pub threshold: f64,
    /// Action id to invoke
    pub action: String,
    #[serde(default)]
    pub cooldown_secs: u64,
    #[serde(default)]
    pub require_confidence: bool,
    #[serde(default)]
    pub priority: Priority,
    /// Band the priority from the firing score (for 0 to 1 scores)
    #[serde(default)]
    pub derive_priority: bool,
}

impl TriggerConfig {
    pub fn to_spec(&self) -> TriggerSpec {
        TriggerSpec::new(
            &self.id,
            &self.dimension,
            self.comparator,
            self.threshold,
            &self.action,
        )
        .cooldown(Duration::from_secs(self.cooldown_secs))
        .require_confidence(self.require_confidence)
        .priority(self.priority)
        .derive_priority(self.derive_priority)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Log,
    Webhook,
}

/// `[[actions]]` entry backed by a built-in handler
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionConfig {
    pub id: String,
    pub kind: ActionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl Config {
    /// Load from the default location, writing defaults if the file is missing
    pub fn load() -> Result<Self> {
        let path = config_path()?;
        if path.exists() {
            Self::load_from(&path)
        } else {
            let config = Config::default();
            config.save_to(&path)?;
            Ok(config)
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        let config: Config = toml::from_str(&contents).context("Failed to parse config file")?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }
        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents).context("Failed to write config file")?;
        Ok(())
    }

    /// Check the declarative set for mistakes that would fail at startup.
    /// Every problem found is reported, not just the first.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        if self.engine.handler_timeout_ms == 0 {
            problems.push("engine.handler_timeout_ms must be positive".to_string());
        }
        if !self.engine.trend_tolerance.is_finite() || self.engine.trend_tolerance < 0.0 {
            problems.push("engine.trend_tolerance must be a non-negative number".to_string());
        }
        if self.scheduler.interval_secs == 0 {
            problems.push("scheduler.interval_secs must be positive".to_string());
        }
        if self.scheduler.window_secs == 0 {
            problems.push("scheduler.window_secs must be positive".to_string());
        } else if self.scheduler.window_secs > MAX_WINDOW_SECS {
            problems.push(format!(
                "scheduler.window_secs must not exceed {}",
                MAX_WINDOW_SECS
            ));
        }
        if self.scheduler.base_backoff_secs > self.scheduler.max_backoff_secs {
            problems.push("scheduler.base_backoff_secs exceeds max_backoff_secs".to_string());
        }

        let mut dimensions = HashSet::new();
        for dimension in &self.dimensions {
            if let Err(e) = dimension.to_dimension() {
                problems.push(e.to_string());
            }
            if !dimensions.insert(dimension.name.as_str()) {
                problems.push(format!("dimension '{}' is defined twice", dimension.name));
            }
        }

        let mut actions = HashSet::new();
        for action in &self.actions {
            if !actions.insert(action.id.as_str()) {
                problems.push(format!("action '{}' is defined twice", action.id));
            }
            if action.kind == ActionKind::Webhook && action.url.is_none() {
                problems.push(format!("webhook action '{}' has no url", action.id));
            }
        }

        let mut triggers = HashSet::new();
        for trigger in &self.triggers {
            if !triggers.insert(trigger.id.as_str()) {
                problems.push(format!("trigger '{}' is defined twice", trigger.id));
            }
            if !trigger.threshold.is_finite() {
                problems.push(format!("trigger '{}' has a non-finite threshold", trigger.id));
            }
            if !dimensions.contains(trigger.dimension.as_str()) {
                problems.push(format!(
                    "trigger '{}' references unknown dimension '{}'",
                    trigger.id, trigger.dimension
                ));
            }
            if !actions.contains(trigger.action.as_str()) {
                problems.push(format!(
                    "trigger '{}' references unknown action '{}'",
                    trigger.id, trigger.action
                ));
            }
        }

        for name in &self.scheduler.dimensions {
            if !dimensions.contains(name.as_str()) {
                problems.push(format!("scheduler references unknown dimension '{}'", name));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            anyhow::bail!("Invalid configuration:\n  - {}", problems.join("\n  - "))
        }
    }
}

fn project_dirs() -> Result<directories::ProjectDirs> {
    directories::ProjectDirs::from("com", "feedback-coordinator", "feedback-coordinator")
        .context("Failed to get project directories")
}

/// Get the configuration file path
pub fn config_path() -> Result<PathBuf> {
    Ok(project_dirs()?.config_dir().join("config.toml"))
}

/// Get the data directory path
pub fn data_dir() -> Result<PathBuf> {
    Ok(project_dirs()?.data_dir().to_path_buf())
}

/// Get default configuration as TOML string
pub fn default_config_toml() -> String {
    let config = Config::default();
    toml::to_string_pretty(&config).unwrap_or_else(|_| "# Default configuration\n".to_string())
}
