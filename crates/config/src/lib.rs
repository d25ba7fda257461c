//! Configuration loading, validation, and management for senseloop.
//!
//! Loads configuration from `~/.senseloop/config.toml` (or the file named by
//! `SENSELOOP_CONFIG`) with environment variable overrides. Validates all
//! settings at startup. Components receive their section by value in their
//! constructors; nothing reads configuration from global state.

use senseloop_core::backoff::BackoffConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// The root configuration structure.
///
/// Maps directly to `~/.senseloop/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Directory for cursors, sessions, the ledger and the request queue.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<PathBuf>,

    /// Change watcher behavior (shared by every source)
    #[serde(default)]
    pub watcher: WatcherConfig,

    /// Named retry profiles
    #[serde(default)]
    pub backoff: BackoffProfiles,

    /// Primary remote backend
    #[serde(default)]
    pub primary: BackendConfig,

    /// Secondary remote backend (omit to skip the tier)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secondary: Option<BackendConfig>,

    /// Local model server
    #[serde(default)]
    pub local: LocalModelConfig,

    /// Fallback chain behavior
    #[serde(default)]
    pub fallback: FallbackConfig,

    /// Context budget thresholds
    #[serde(default)]
    pub context: ContextConfig,

    /// Watched sources
    #[serde(default)]
    pub sources: SourcesConfig,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherConfig {
    /// Periodic poll interval, independent of change notifications.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Maximum records fetched per scan.
    #[serde(default = "default_batch_limit")]
    pub batch_limit: usize,

    /// How many dispatched ids are remembered to close the race between
    /// overlapping trigger paths.
    #[serde(default = "default_recently_seen")]
    pub recently_seen_capacity: usize,

    /// Consecutive read failures before an alert fires.
    #[serde(default = "default_alert_threshold")]
    pub alert_threshold: u32,

    /// Minimum time between two alerts for the same source.
    #[serde(default = "default_alert_cooldown")]
    pub alert_cooldown_secs: u64,

    /// Pause added per consecutive failure before the next scan.
    #[serde(default = "default_failure_sleep_step")]
    pub failure_sleep_step_secs: u64,

    /// Upper bound for the failure pause.
    #[serde(default = "default_failure_sleep_cap")]
    pub failure_sleep_cap_secs: u64,
}

fn default_poll_interval() -> u64 {
    5
}
fn default_batch_limit() -> usize {
    500
}
fn default_recently_seen() -> usize {
    1000
}
fn default_alert_threshold() -> u32 {
    5
}
fn default_alert_cooldown() -> u64 {
    30 * 60
}
fn default_failure_sleep_step() -> u64 {
    2
}
fn default_failure_sleep_cap() -> u64 {
    60
}

impl WatcherConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn alert_cooldown(&self) -> Duration {
        Duration::from_secs(self.alert_cooldown_secs)
    }

    /// Pause applied after `failures` consecutive read failures.
    pub fn failure_sleep(&self, failures: u32) -> Duration {
        let secs = self
            .failure_sleep_step_secs
            .saturating_mul(u64::from(failures))
            .min(self.failure_sleep_cap_secs);
        Duration::from_secs(secs)
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            batch_limit: default_batch_limit(),
            recently_seen_capacity: default_recently_seen(),
            alert_threshold: default_alert_threshold(),
            alert_cooldown_secs: default_alert_cooldown(),
            failure_sleep_step_secs: default_failure_sleep_step(),
            failure_sleep_cap_secs: default_failure_sleep_cap(),
        }
    }
}

/// Named backoff profiles; each may be overridden individually.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffProfiles {
    #[serde(default = "BackoffConfig::database")]
    pub database: BackoffConfig,

    #[serde(default = "BackoffConfig::network")]
    pub network: BackoffConfig,

    #[serde(default = "BackoffConfig::automation")]
    pub automation: BackoffConfig,
}

impl Default for BackoffProfiles {
    fn default() -> Self {
        Self {
            database: BackoffConfig::database(),
            network: BackoffConfig::network(),
            automation: BackoffConfig::automation(),
        }
    }
}

/// A remote backend driven as a subprocess.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Executable name or path.
    #[serde(default = "default_backend_command")]
    pub command: String,

    /// Arguments placed before the generated ones.
    #[serde(default)]
    pub extra_args: Vec<String>,

    /// Passed as `--model` when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Wall-clock limit for one invocation.
    #[serde(default = "default_backend_timeout")]
    pub timeout_secs: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,

    /// Highest `retry_count` an invocation may reach.
    #[serde(default = "default_max_retry_count")]
    pub max_retry_count: u32,
}

fn default_backend_command() -> String {
    "claude".into()
}
fn default_backend_timeout() -> u64 {
    300
}
fn default_max_retry_count() -> u32 {
    2
}

impl BackendConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            command: default_backend_command(),
            extra_args: vec![],
            model: None,
            timeout_secs: default_backend_timeout(),
            working_dir: None,
            max_retry_count: default_max_retry_count(),
        }
    }
}

/// The local model server (Ollama-compatible API).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalModelConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_local_url")]
    pub base_url: String,

    #[serde(default = "default_local_model")]
    pub model: String,

    #[serde(default = "default_local_timeout")]
    pub timeout_secs: u64,

    /// Limit for the availability probe.
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,
}

fn default_local_url() -> String {
    "http://localhost:11434".into()
}
fn default_local_model() -> String {
    "llama3.2".into()
}
fn default_local_timeout() -> u64 {
    60
}
fn default_probe_timeout() -> u64 {
    3
}

impl Default for LocalModelConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: default_local_url(),
            model: default_local_model(),
            timeout_secs: default_local_timeout(),
            probe_timeout_secs: default_probe_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackConfig {
    /// How often a tier is re-tried for errors classified as same-tier retryable.
    #[serde(default = "default_same_tier_retries")]
    pub same_tier_retries: u32,

    /// Whether exhausted requests are deferred to the queue tier.
    #[serde(default = "default_true")]
    pub queue_enabled: bool,

    /// Inputs longer than this are never classified as acknowledgements.
    #[serde(default = "default_ack_max_chars")]
    pub ack_max_chars: usize,
}

fn default_same_tier_retries() -> u32 {
    1
}
fn default_ack_max_chars() -> usize {
    40
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            same_tier_retries: default_same_tier_retries(),
            queue_enabled: true,
            ack_max_chars: default_ack_max_chars(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,

    #[serde(default = "default_chars_per_token")]
    pub chars_per_token: usize,

    #[serde(default = "default_yellow")]
    pub yellow_threshold: f64,

    #[serde(default = "default_orange")]
    pub orange_threshold: f64,

    #[serde(default = "default_red")]
    pub red_threshold: f64,

    /// Measurements per thread used for the time-to-full estimate.
    #[serde(default = "default_trend_window")]
    pub trend_window: usize,
}

fn default_max_tokens() -> usize {
    200_000
}
fn default_chars_per_token() -> usize {
    4
}
fn default_yellow() -> f64 {
    0.50
}
fn default_orange() -> f64 {
    0.70
}
fn default_red() -> f64 {
    0.85
}
fn default_trend_window() -> usize {
    5
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            chars_per_token: default_chars_per_token(),
            yellow_threshold: default_yellow(),
            orange_threshold: default_orange(),
            red_threshold: default_red(),
            trend_window: default_trend_window(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourcesConfig {
    /// Directory of one-file-per-event sense documents.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sense_dir: Option<SourceConfig>,

    /// Messages-style SQLite database.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub messages_db: Option<SourceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub path: PathBuf,

    /// Where the cursor is persisted (defaults under the state dir).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor_file: Option<PathBuf>,

    /// Start from this id instead of the persisted cursor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_after: Option<u64>,
}

impl AppConfig {
    /// Load configuration from `SENSELOOP_CONFIG` or `~/.senseloop/config.toml`.
    ///
    /// Environment overrides (highest priority):
    /// - `SENSELOOP_BACKEND_COMMAND`
    /// - `SENSELOOP_LOCAL_URL`
    /// - `SENSELOOP_LOCAL_MODEL`
    /// - `SENSELOOP_STATE_DIR`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = std::env::var("SENSELOOP_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| Self::config_dir().join("config.toml"));
        let mut config = Self::load_from(&config_path)?;
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(command) = var("SENSELOOP_BACKEND_COMMAND") {
            self.primary.command = command.clone();
            if let Some(secondary) = self.secondary.as_mut() {
                secondary.command = command;
            }
        }
        if let Some(url) = var("SENSELOOP_LOCAL_URL") {
            self.local.base_url = url;
        }
        if let Some(model) = var("SENSELOOP_LOCAL_MODEL") {
            self.local.model = model;
        }
        if let Some(dir) = var("SENSELOOP_STATE_DIR") {
            self.state_dir = Some(PathBuf::from(dir));
        }
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".senseloop")
    }

    /// Directory holding all persisted runtime state.
    pub fn state_dir(&self) -> PathBuf {
        self.state_dir
            .clone()
            .unwrap_or_else(|| Self::config_dir().join("state"))
    }

    /// Cursor file for a named source, honoring an explicit override.
    pub fn cursor_path(&self, source_name: &str, source: &SourceConfig) -> PathBuf {
        source.cursor_file.clone().unwrap_or_else(|| {
            self.state_dir()
                .join("cursors")
                .join(format!("{source_name}.json"))
        })
    }

    pub fn ledger_dir(&self) -> PathBuf {
        self.state_dir().join("ledger")
    }

    pub fn queue_path(&self) -> PathBuf {
        self.state_dir().join("queue.jsonl")
    }

    pub fn sessions_path(&self) -> PathBuf {
        self.state_dir().join("sessions.json")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.watcher.poll_interval_secs == 0 {
            return Err(ConfigError::ValidationError(
                "watcher.poll_interval_secs must be > 0".into(),
            ));
        }
        if self.watcher.recently_seen_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "watcher.recently_seen_capacity must be > 0".into(),
            ));
        }
        if self.watcher.batch_limit == 0 {
            return Err(ConfigError::ValidationError(
                "watcher.batch_limit must be > 0".into(),
            ));
        }

        for (name, backend) in std::iter::once(("primary", &self.primary))
            .chain(self.secondary.as_ref().map(|s| ("secondary", s)))
        {
            if backend.timeout_secs == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "{name}.timeout_secs must be > 0"
                )));
            }
            if backend.command.trim().is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "{name}.command must not be empty"
                )));
            }
        }
        if self.local.timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "local.timeout_secs must be > 0".into(),
            ));
        }

        for (name, profile) in [
            ("database", &self.backoff.database),
            ("network", &self.backoff.network),
            ("automation", &self.backoff.automation),
        ] {
            if !(0.0..=1.0).contains(&profile.jitter_fraction) {
                return Err(ConfigError::ValidationError(format!(
                    "backoff.{name}.jitter_fraction must be between 0.0 and 1.0"
                )));
            }
            if profile.multiplier < 1.0 {
                return Err(ConfigError::ValidationError(format!(
                    "backoff.{name}.multiplier must be >= 1.0"
                )));
            }
        }

        let ctx = &self.context;
        if ctx.chars_per_token == 0 || ctx.max_tokens == 0 {
            return Err(ConfigError::ValidationError(
                "context.chars_per_token and context.max_tokens must be > 0".into(),
            ));
        }
        let thresholds = [ctx.yellow_threshold, ctx.orange_threshold, ctx.red_threshold];
        if thresholds.iter().any(|t| *t <= 0.0 || *t > 1.0) {
            return Err(ConfigError::ValidationError(
                "context thresholds must be in (0.0, 1.0]".into(),
            ));
        }
        if !(ctx.yellow_threshold < ctx.orange_threshold && ctx.orange_threshold < ctx.red_threshold)
        {
            return Err(ConfigError::ValidationError(
                "context thresholds must be strictly ascending (yellow < orange < red)".into(),
            ));
        }

        Ok(())
    }

    /// Generate a default config TOML string.
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            state_dir: None,
            watcher: WatcherConfig::default(),
            backoff: BackoffProfiles::default(),
            primary: BackendConfig::default(),
            secondary: None,
            local: LocalModelConfig::default(),
            fallback: FallbackConfig::default(),
            context: ContextConfig::default(),
            sources: SourcesConfig::default(),
        }
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}
