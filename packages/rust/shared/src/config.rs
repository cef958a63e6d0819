//! Application configuration for Dealflow.
//!
//! User config lives at `~/.dealflow/dealflow.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{DealflowError, Result};
use crate::types::{QueuePriority, TriggerReason};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "dealflow.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".dealflow";

// ---------------------------------------------------------------------------
// Config structs (matching dealflow.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Database location.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Queue admission and retry policy.
    #[serde(default)]
    pub queue: QueueConfig,

    /// Worker polling settings.
    #[serde(default)]
    pub worker: WorkerConfig,

    /// External enrichment engines.
    #[serde(default)]
    pub engines: EnginesConfig,
}

/// `[database]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the libSQL database file.
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> String {
    "~/.dealflow/dealflow.db".into()
}

impl DatabaseConfig {
    /// The database path with a leading `~` expanded to the home directory.
    pub fn resolved_path(&self) -> Result<PathBuf> {
        match self.path.strip_prefix("~/") {
            Some(rest) => {
                let home = dirs::home_dir().ok_or_else(|| {
                    DealflowError::config("could not determine home directory")
                })?;
                Ok(home.join(rest))
            }
            None => Ok(PathBuf::from(&self.path)),
        }
    }
}

/// `[queue]` section. Every retry/backoff number lives here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Cooldown per trigger reason since the last granted trigger.
    #[serde(default)]
    pub cooldown_hours: CooldownConfig,

    /// Maximum entities accepted from one bulk submission.
    #[serde(default = "default_bulk_batch_cap")]
    pub bulk_batch_cap: usize,

    /// Delay added per position within an accepted bulk submission.
    #[serde(default = "default_bulk_stagger_minutes")]
    pub bulk_stagger_minutes: u32,

    /// Delay before a scheduled trigger becomes claimable.
    #[serde(default = "default_scheduled_delay_minutes")]
    pub scheduled_delay_minutes: u32,

    /// Items processing longer than this are treated as stuck.
    #[serde(default = "default_stuck_threshold_minutes")]
    pub stuck_threshold_minutes: u32,

    /// How far a reclaimed stuck item's `scheduled_for` is pushed forward.
    #[serde(default = "default_reclaim_delay_minutes")]
    pub reclaim_delay_minutes: u32,

    /// Claims allowed before an item is failed for good.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base of the exponential backoff applied when retrying failed items.
    #[serde(default = "default_retry_base_delay_minutes")]
    pub retry_base_delay_minutes: u32,

    /// Completed/failed items older than this are deleted.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    /// Queued items never claimed within this window are deleted.
    #[serde(default = "default_stale_queued_days")]
    pub stale_queued_days: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            cooldown_hours: CooldownConfig::default(),
            bulk_batch_cap: default_bulk_batch_cap(),
            bulk_stagger_minutes: default_bulk_stagger_minutes(),
            scheduled_delay_minutes: default_scheduled_delay_minutes(),
            stuck_threshold_minutes: default_stuck_threshold_minutes(),
            reclaim_delay_minutes: default_reclaim_delay_minutes(),
            max_attempts: default_max_attempts(),
            retry_base_delay_minutes: default_retry_base_delay_minutes(),
            retention_days: default_retention_days(),
            stale_queued_days: default_stale_queued_days(),
        }
    }
}

fn default_bulk_batch_cap() -> usize {
    5
}
fn default_bulk_stagger_minutes() -> u32 {
    1
}
fn default_scheduled_delay_minutes() -> u32 {
    5
}
fn default_stuck_threshold_minutes() -> u32 {
    30
}
fn default_reclaim_delay_minutes() -> u32 {
    5
}
fn default_max_attempts() -> u32 {
    3
}
fn default_retry_base_delay_minutes() -> u32 {
    5
}
fn default_retention_days() -> u32 {
    7
}
fn default_stale_queued_days() -> u32 {
    7
}

impl QueueConfig {
    /// Cooldown window for a trigger reason.
    pub fn cooldown(&self, reason: TriggerReason) -> chrono::Duration {
        let hours = match reason {
            TriggerReason::Upload => self.cooldown_hours.upload,
            TriggerReason::Manual => self.cooldown_hours.manual,
            TriggerReason::Bulk => self.cooldown_hours.bulk,
            TriggerReason::Scheduled => self.cooldown_hours.scheduled,
            TriggerReason::FirstTime => self.cooldown_hours.first_time,
        };
        chrono::Duration::hours(i64::from(hours))
    }

    /// Priority assigned to a granted trigger.
    pub fn priority_for(&self, reason: TriggerReason) -> QueuePriority {
        match reason {
            TriggerReason::Manual | TriggerReason::FirstTime => QueuePriority::High,
            TriggerReason::Upload | TriggerReason::Bulk => QueuePriority::Normal,
            TriggerReason::Scheduled => QueuePriority::Low,
        }
    }

    /// Base delay assigned to a granted trigger.
    pub fn delay_for(&self, reason: TriggerReason) -> u32 {
        match reason {
            TriggerReason::Scheduled => self.scheduled_delay_minutes,
            _ => 0,
        }
    }
}

/// `[queue.cooldown_hours]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CooldownConfig {
    #[serde(default = "default_routine_cooldown")]
    pub upload: u32,
    #[serde(default)]
    pub manual: u32,
    #[serde(default = "default_routine_cooldown")]
    pub bulk: u32,
    #[serde(default = "default_routine_cooldown")]
    pub scheduled: u32,
    #[serde(default = "default_routine_cooldown")]
    pub first_time: u32,
}

impl Default for CooldownConfig {
    fn default() -> Self {
        Self {
            upload: default_routine_cooldown(),
            manual: 0,
            bulk: default_routine_cooldown(),
            scheduled: default_routine_cooldown(),
            first_time: default_routine_cooldown(),
        }
    }
}

fn default_routine_cooldown() -> u32 {
    24
}

/// `[worker]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Items claimed per poll.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Entities allowed in `processing` at once across all workers.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Seconds between polls.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_concurrent: default_max_concurrent(),
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

fn default_batch_size() -> usize {
    5
}
fn default_max_concurrent() -> usize {
    3
}
fn default_poll_interval_secs() -> u64 {
    10
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

/// `[engines]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnginesConfig {
    /// Base URL of the hosted functions endpoint.
    #[serde(default)]
    pub base_url: Option<String>,

    /// Name of the env var holding the service key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Engines invoked, in order, for every claimed item.
    #[serde(default = "default_engine_names")]
    pub names: Vec<String>,

    /// Per-invocation timeout.
    #[serde(default = "default_engine_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EnginesConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key_env: default_api_key_env(),
            names: default_engine_names(),
            timeout_secs: default_engine_timeout_secs(),
        }
    }
}

fn default_api_key_env() -> String {
    "DEALFLOW_SERVICE_KEY".into()
}
fn default_engine_names() -> Vec<String> {
    vec!["company-enrichment".into()]
}
fn default_engine_timeout_secs() -> u64 {
    30
}

impl EnginesConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Parse the configured base URL; engines cannot run without one.
    pub fn parsed_base_url(&self) -> Result<Url> {
        let raw = self
            .base_url
            .as_deref()
            .ok_or_else(|| DealflowError::config("engines.base_url is not set"))?;
        Url::parse(raw)
            .map_err(|e| DealflowError::config(format!("invalid engines.base_url '{raw}': {e}")))
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.dealflow/`).
pub fn config_dir() -> Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| DealflowError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.dealflow/dealflow.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| DealflowError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| DealflowError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| DealflowError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| DealflowError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| DealflowError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Check that the engine service key env var is set and non-empty.
pub fn validate_service_key(config: &AppConfig) -> Result<String> {
    let var_name = &config.engines.api_key_env;
    match std::env::var(var_name) {
        Ok(val) if !val.is_empty() => Ok(val),
        _ => Err(DealflowError::config(format!(
            "engine service key not found. Set the {var_name} environment variable."
        ))),
    }
}
