use anyhow::{Context, Result};
use deploykit::SchedulerOptions;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Get the config directory path
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".config").join("converge"))
}

/// Get the default config file path
pub fn default_config_path() -> Result<PathBuf> {
    Ok(config_dir()?.join("config.toml"))
}

// ============================================================================
// Config
// ============================================================================

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub scheduler: SchedulerConfig,
    pub ledger: LedgerConfig,
    /// Entity type to handler program; `"*"` matches any type
    pub handlers: BTreeMap<String, HandlerConfig>,
}

/// `[scheduler]` section, durations in seconds; `0` disables a timer or timeout
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub max_concurrency_per_agent: usize,
    pub executor_timeout: u64,
    pub deploy_interval: u64,
    pub repair_interval: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        let defaults = SchedulerOptions::default();
        let secs = |d: Option<Duration>| d.map_or(0, |d| d.as_secs());
        Self {
            max_concurrency_per_agent: defaults.max_concurrency_per_agent,
            executor_timeout: secs(defaults.executor_timeout),
            deploy_interval: secs(defaults.deploy_interval),
            repair_interval: secs(defaults.repair_interval),
        }
    }
}

impl SchedulerConfig {
    pub fn options(&self) -> SchedulerOptions {
        let duration = |secs: u64| (secs > 0).then(|| Duration::from_secs(secs));
        SchedulerOptions {
            max_concurrency_per_agent: self.max_concurrency_per_agent.max(1),
            executor_timeout: duration(self.executor_timeout),
            deploy_interval: duration(self.deploy_interval),
            repair_interval: duration(self.repair_interval),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub path: Option<PathBuf>,
}

/// Program run for every action on resources of one entity type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerConfig {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl Config {
    /// Load the config file
    ///
    /// An explicit path must exist; a missing default file yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, explicit) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => (default_config_path()?, false),
        };
        if !explicit && !path.exists() {
            log::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Could not read {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Invalid config {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Ledger database path, defaulting next to the config file
    pub fn ledger_path(&self) -> Result<PathBuf> {
        match &self.ledger.path {
            Some(path) => Ok(path.clone()),
            None => Ok(config_dir()?.join("ledger.db")),
        }
    }
}
