//! Configuration infrastructure
//!
//! Environment settings for a checker run, layered as:
//! 1. Built-in defaults (see [`defaults`])
//! 2. The JSON config file under the user config directory
//! 3. `BULKCHECK_*` environment variables (`BULKCHECK_GENERAL__BOTS=50`)
//!
//! Script-level settings travel with the script and override these where
//! both exist.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{info, warn};

use crate::domain::proxy::ProxyProtocol;
pub use crate::infrastructure::http_client::HttpConfig;

/// Complete application configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub general: GeneralConfig,
    pub proxies: ProxyConfig,
    pub http: HttpConfig,
    pub logging: LoggingConfig,
}

/// Run-wide settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Worker-set size when neither the caller nor the script picks one
    pub bots: usize,
    /// Pause after every check, per worker
    pub wait_time_ms: u64,
    pub request_timeout_secs: u64,
    /// 0 = unlimited
    pub max_hits: usize,
    pub start_offset: usize,
    /// 0 disables periodic progress saving
    pub progress_save_interval_secs: u64,
    /// Dispatcher sleep between idle-worker polls
    pub poll_interval_ms: u64,
    /// How long an abort waits for cooperative shutdown before killing tasks
    pub abort_grace_period_secs: u64,
}

/// Proxy policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Let several workers hold the same proxy
    pub concurrent_use: bool,
    pub never_ban: bool,
    /// Retries allowed after a ban; 0 = unlimited
    pub ban_loop_evasion: u32,
    pub shuffle_on_start: bool,
    pub reload_enabled: bool,
    /// 0 reloads only on exhaustion
    pub reload_interval_secs: u64,
    /// Banned proxies come back after this long; 0 keeps them banned
    pub ban_duration_secs: u64,
    /// 0 = unlimited
    pub max_uses: u32,
    /// Protocol for lines that do not name one
    pub default_protocol: ProxyProtocol,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// trace, debug, info, warn, error
    pub level: String,
    pub json_format: bool,
    pub console_output: bool,
    pub file_output: bool,
    pub file_name: String,
    /// Defaults to `logs/` under the application data directory
    pub log_dir: Option<PathBuf>,
    /// Number of log files to keep (older files will be deleted)
    pub max_files: u32,
    pub auto_cleanup_logs: bool,
    /// Per-target overrides, e.g. `"reqwest": "debug"`
    pub module_filters: HashMap<String, String>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            bots: defaults::BOTS,
            wait_time_ms: defaults::WAIT_TIME_MS,
            request_timeout_secs: defaults::REQUEST_TIMEOUT_SECS,
            max_hits: 0,
            start_offset: 0,
            progress_save_interval_secs: defaults::PROGRESS_SAVE_INTERVAL_SECS,
            poll_interval_ms: defaults::POLL_INTERVAL_MS,
            abort_grace_period_secs: defaults::ABORT_GRACE_PERIOD_SECS,
        }
    }
}

impl GeneralConfig {
    #[must_use]
    pub const fn wait_time(&self) -> Duration {
        Duration::from_millis(self.wait_time_ms)
    }

    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            concurrent_use: false,
            never_ban: false,
            ban_loop_evasion: defaults::BAN_LOOP_EVASION,
            shuffle_on_start: true,
            reload_enabled: false,
            reload_interval_secs: 0,
            ban_duration_secs: defaults::BAN_DURATION_SECS,
            max_uses: 0,
            default_protocol: ProxyProtocol::Http,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: defaults::LOG_LEVEL.to_string(),
            json_format: false,
            console_output: true,
            file_output: true,
            file_name: defaults::LOG_FILE_NAME.to_string(),
            log_dir: None,
            max_files: defaults::LOG_MAX_FILES,
            auto_cleanup_logs: true,
            module_filters: HashMap::new(),
        }
    }
}

/// Configuration manager for loading and saving settings
#[derive(Debug, Clone)]
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    /// Get the application configuration directory
    pub fn get_config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to get user config directory")?
            .join(defaults::APP_DIR_NAME);
        Ok(config_dir)
    }

    /// Get application data directory (logs, hits, progress)
    pub fn get_app_data_dir() -> Result<PathBuf> {
        let data_dir = dirs::data_local_dir()
            .context("Failed to get user data directory")?
            .join(defaults::APP_DIR_NAME);
        Ok(data_dir)
    }

    /// Manager for the default config file location
    pub fn new() -> Result<Self> {
        let config_path = Self::get_config_dir()?.join(defaults::CONFIG_FILE_NAME);
        Ok(Self { config_path })
    }

    /// Manager for an explicit config file
    #[must_use]
    pub fn with_path(config_path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: config_path.into(),
        }
    }

    #[must_use]
    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Writes defaults when no config file exists yet, then loads
    pub async fn initialize_on_first_run(&self) -> Result<AppConfig> {
        if !self.config_path.exists() {
            info!("🎉 First run detected - writing default configuration");
            self.save_config(&AppConfig::default()).await?;
        }
        self.load_config().await
    }

    /// Loads defaults, then the file, then the environment.
    ///
    /// A file that is not valid JSON is backed up next to itself with a
    /// `.corrupted` extension and replaced by defaults.
    pub async fn load_config(&self) -> Result<AppConfig> {
        if self.config_path.exists() {
            let content = fs::read_to_string(&self.config_path)
                .await
                .context("Failed to read configuration file")?;
            if let Err(parse_error) = serde_json::from_str::<serde_json::Value>(&content) {
                warn!("⚠️ Configuration file is not valid JSON: {}", parse_error);
                let backup_path = self.config_path.with_extension("json.corrupted");
                if let Err(e) = fs::copy(&self.config_path, &backup_path).await {
                    warn!("Failed to create backup of corrupted config: {}", e);
                } else {
                    info!("Backed up corrupted config to: {:?}", backup_path);
                }
                self.save_config(&AppConfig::default())
                    .await
                    .context("Failed to save default configuration")?;
                info!("✅ Reset to default configuration");
            }
        }

        let layered = config::Config::builder()
            .add_source(
                config::Config::try_from(&AppConfig::default())
                    .context("Failed to build default configuration layer")?,
            )
            .add_source(
                config::File::from(self.config_path.as_path())
                    .format(config::FileFormat::Json)
                    .required(false),
            )
            .add_source(
                config::Environment::with_prefix(defaults::ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to layer configuration sources")?;

        let loaded: AppConfig = layered
            .try_deserialize()
            .context("Failed to deserialize configuration")?;
        info!("Loaded configuration from: {:?}", self.config_path);
        Ok(loaded)
    }

    /// Save configuration to file
    pub async fn save_config(&self, config: &AppConfig) -> Result<()> {
        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent)
                .await
                .context("Failed to create config directory")?;
        }

        let content =
            serde_json::to_string_pretty(config).context("Failed to serialize configuration")?;
        fs::write(&self.config_path, content)
            .await
            .context("Failed to write configuration file")?;

        info!("Saved configuration to: {:?}", self.config_path);
        Ok(())
    }

    /// Reset configuration to defaults (useful for troubleshooting)
    pub async fn reset_to_defaults(&self) -> Result<AppConfig> {
        info!("🔄 Resetting configuration to defaults");
        let default_config = AppConfig::default();
        self.save_config(&default_config).await?;
        Ok(default_config)
    }
}

/// Default configuration values
pub mod defaults {
    pub const APP_DIR_NAME: &str = "bulkcheck";
    pub const CONFIG_FILE_NAME: &str = "bulkcheck_config.json";
    pub const ENV_PREFIX: &str = "BULKCHECK";

    pub const BOTS: usize = 1;
    pub const WAIT_TIME_MS: u64 = 0;
    pub const REQUEST_TIMEOUT_SECS: u64 = 10;
    pub const PROGRESS_SAVE_INTERVAL_SECS: u64 = 60;

    /// Dispatcher idle-worker poll
    pub const POLL_INTERVAL_MS: u64 = 200;

    /// Worker sleep while every alive proxy is busy
    pub const PROXY_WAIT_MS: u64 = 100;

    pub const ABORT_GRACE_PERIOD_SECS: u64 = 5;

    pub const BAN_LOOP_EVASION: u32 = 100;
    pub const BAN_DURATION_SECS: u64 = 0;

    pub const LOG_LEVEL: &str = "info";
    pub const LOG_FILE_NAME: &str = "bulkcheck.log";
    pub const LOG_MAX_FILES: u32 = 10;
}
