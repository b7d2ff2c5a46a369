use anyhow::{anyhow, Context, Result};
use dirs::config_dir;
use serde::{Deserialize, Serialize};
use shellexpand;
use std::path::{Path, PathBuf};

use crate::models::{Destination, DigestMode};

/// Floor for the poll interval, whatever the config says
pub const MIN_POLL_INTERVAL_SECS: u64 = 60;

/// Upper bound for concurrent enrichment calls
pub const MAX_ENRICHMENT_CONCURRENCY: usize = 5;

/// Main configuration structure for starwatch
///
/// These are initial values. Once the monitor has persisted its control
/// state (interval, destinations, pause flag, digest mode) the persisted
/// values win over the file.
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Config {
    /// GitHub API settings
    #[serde(default)]
    pub github: GitHubConfig,

    /// Polling behaviour
    #[serde(default)]
    pub monitor: MonitorConfig,

    /// Digest schedule
    #[serde(default)]
    pub digest: DigestConfig,

    /// Telegram delivery settings
    #[serde(default)]
    pub telegram: TelegramConfig,

    /// AI summary and media selection
    #[serde(default)]
    pub enrichment: EnrichmentConfig,

    /// Persisted state location
    #[serde(default)]
    pub state: StateConfig,

    /// Daemon configuration
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// GitHub configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct GitHubConfig {
    /// REST API base URL
    #[serde(default = "default_github_api")]
    pub api_base: String,

    /// Page size for the starred listing (max 100)
    #[serde(default = "default_per_page")]
    pub per_page: u32,

    /// Per-request timeout in seconds
    #[serde(default = "default_timeout")]
    pub request_timeout: u64,

    /// User-Agent header sent with every request
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

/// Monitor loop configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct MonitorConfig {
    /// Poll interval ("30s", "5m", "1h" or raw seconds)
    #[serde(default = "default_interval")]
    pub interval: String,

    /// Lower bound for the poll interval in seconds
    #[serde(default = "default_min_interval")]
    pub min_interval: u64,

    /// Cap for the transient-failure backoff multiplier
    #[serde(default = "default_max_backoff")]
    pub max_backoff_multiplier: u32,

    /// Maximum concurrent enrichment calls per cycle
    #[serde(default = "default_enrichment_concurrency")]
    pub enrichment_concurrency: usize,

    /// Scheduler resolution in seconds
    #[serde(default = "default_tick")]
    pub tick: u64,

    /// Digest mode used until the owner picks one
    #[serde(default = "default_digest_mode")]
    pub default_mode: String,
}

/// Digest schedule configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DigestConfig {
    /// Local time of the daily (and weekly) flush, "HH:MM"
    #[serde(default = "default_daily_time")]
    pub daily_time: String,

    /// Day of the weekly flush ("sun", "monday", ...)
    #[serde(default = "default_weekly_day")]
    pub weekly_day: String,

    /// Fixed UTC offset the schedule is expressed in ("+03:00", "UTC")
    #[serde(default = "default_utc_offset")]
    pub utc_offset: String,
}

/// Telegram configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct TelegramConfig {
    /// Bot token (falls back to BOT_TOKEN)
    pub bot_token: Option<String>,

    /// Bot API base URL
    #[serde(default = "default_telegram_api")]
    pub api_base: String,

    /// Owner's private chat id (falls back to OWNER_USER_ID)
    pub owner_chat_id: Option<String>,

    /// Message parse mode
    #[serde(default = "default_parse_mode")]
    pub parse_mode: String,

    /// Per-request timeout in seconds
    #[serde(default = "default_timeout")]
    pub request_timeout: u64,

    /// Pause between consecutive messages to one chat, in milliseconds
    #[serde(default = "default_message_delay")]
    pub message_delay_ms: u64,
}

/// Enrichment configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct EnrichmentConfig {
    /// Generate AI summaries at all
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Attach preview media picked from the README
    #[serde(default = "default_true")]
    pub media_selection: bool,

    /// Gemini API key (falls back to GEMINI_API_KEY)
    pub gemini_api_key: Option<String>,

    /// Gemini model name
    #[serde(default = "default_model")]
    pub model: String,

    /// Gemini API base URL
    #[serde(default = "default_gemini_api")]
    pub api_base: String,

    /// Per-repository enrichment timeout in seconds
    #[serde(default = "default_enrichment_timeout")]
    pub timeout: u64,

    /// Maximum number of preview media items
    #[serde(default = "default_max_media")]
    pub max_media: usize,
}

/// Persisted state configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StateConfig {
    /// SQLite database path
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

/// Daemon configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DaemonConfig {
    /// PID file location
    #[serde(default = "default_pid_file")]
    pub pid_file: String,

    /// Log file location
    #[serde(default = "default_log_file")]
    pub log_file: String,
}

/// Logging configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String, // "info"

    /// Log format
    #[serde(default = "default_log_format")]
    pub format: String, // "compact"
}

// Default value functions
fn default_true() -> bool {
    true
}
fn default_github_api() -> String {
    "https://api.github.com".to_string()
}
fn default_per_page() -> u32 {
    100
}
fn default_timeout() -> u64 {
    30
}
fn default_user_agent() -> String {
    format!("starwatch/{}", env!("CARGO_PKG_VERSION"))
}
fn default_interval() -> String {
    "5m".to_string()
}
fn default_min_interval() -> u64 {
    60
}
fn default_max_backoff() -> u32 {
    8
}
fn default_enrichment_concurrency() -> usize {
    3
}
fn default_tick() -> u64 {
    15
}
fn default_digest_mode() -> String {
    "instant".to_string()
}
fn default_daily_time() -> String {
    "21:00".to_string()
}
fn default_weekly_day() -> String {
    "sun".to_string()
}
fn default_utc_offset() -> String {
    "+03:00".to_string()
}
fn default_telegram_api() -> String {
    "https://api.telegram.org".to_string()
}
fn default_message_delay() -> u64 {
    2000
}
fn default_parse_mode() -> String {
    "HTML".to_string()
}
fn default_model() -> String {
    "gemini-2.5-flash".to_string()
}
fn default_gemini_api() -> String {
    "https://generativelanguage.googleapis.com".to_string()
}
fn default_enrichment_timeout() -> u64 {
    45
}
fn default_max_media() -> usize {
    3
}
fn default_db_path() -> String {
    if let Ok(data_home) = std::env::var("XDG_DATA_HOME") {
        format!("{}/starwatch/state.db", data_home)
    } else if let Ok(home) = std::env::var("HOME") {
        format!("{}/.local/share/starwatch/state.db", home)
    } else {
        "/tmp/starwatch/state.db".to_string()
    }
}
fn default_pid_file() -> String {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        format!("{}/starwatch.pid", runtime_dir)
    } else {
        "/tmp/starwatch.pid".to_string()
    }
}

fn default_log_file() -> String {
    if let Ok(data_home) = std::env::var("XDG_DATA_HOME") {
        format!("{}/starwatch/daemon.log", data_home)
    } else if let Ok(home) = std::env::var("HOME") {
        format!("{}/.local/share/starwatch/daemon.log", home)
    } else {
        "/tmp/starwatch-daemon.log".to_string()
    }
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "compact".to_string()
}

// Default implementations
impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            api_base: default_github_api(),
            per_page: default_per_page(),
            request_timeout: default_timeout(),
            user_agent: default_user_agent(),
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: default_interval(),
            min_interval: default_min_interval(),
            max_backoff_multiplier: default_max_backoff(),
            enrichment_concurrency: default_enrichment_concurrency(),
            tick: default_tick(),
            default_mode: default_digest_mode(),
        }
    }
}

impl Default for DigestConfig {
    fn default() -> Self {
        Self {
            daily_time: default_daily_time(),
            weekly_day: default_weekly_day(),
            utc_offset: default_utc_offset(),
        }
    }
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: None,
            api_base: default_telegram_api(),
            owner_chat_id: None,
            parse_mode: default_parse_mode(),
            request_timeout: default_timeout(),
            message_delay_ms: default_message_delay(),
        }
    }
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            media_selection: default_true(),
            gemini_api_key: None,
            model: default_model(),
            api_base: default_gemini_api(),
            timeout: default_enrichment_timeout(),
            max_media: default_max_media(),
        }
    }
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            pid_file: default_pid_file(),
            log_file: default_log_file(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Parse duration strings like "30s", "5m", "1h", "2d" or raw seconds
pub fn parse_duration(duration_str: &str) -> Result<u64> {
    let duration_str = duration_str.trim().to_lowercase();

    if let Some(value) = duration_str.strip_suffix('s') {
        value.parse::<u64>().context("Invalid seconds value")
    } else if let Some(value) = duration_str.strip_suffix('m') {
        value.parse::<u64>().map(|v| v * 60).context("Invalid minutes value")
    } else if let Some(value) = duration_str.strip_suffix('h') {
        value.parse::<u64>().map(|v| v * 3600).context("Invalid hours value")
    } else if let Some(value) = duration_str.strip_suffix('d') {
        value.parse::<u64>().map(|v| v * 86400).context("Invalid days value")
    } else {
        duration_str
            .parse::<u64>()
            .context("Invalid duration format. Use format like '90s', '5m', '1h'")
    }
}

impl Config {
    /// Load configuration from the default location or create a default config
    pub fn load_or_default() -> Result<Self> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            Self::load(&config_path)
        } else {
            let mut config = Self::default();

            if let Some(parent) = config_path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
            }

            config.save(&config_path)?;
            config.expand_paths()?;

            tracing::info!("Created default configuration at: {:?}", config_path);
            Ok(config)
        }
    }

    /// Load configuration from a specific file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let mut config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        config.expand_paths()?;

        Ok(config)
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_yaml::to_string(self).context("Failed to serialize configuration")?;

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {:?}", path))?;

        Ok(())
    }

    /// Get the default configuration file path (XDG compliant)
    pub fn default_config_path() -> Result<PathBuf> {
        let config_dir = config_dir().context("Failed to get user config directory")?;

        Ok(config_dir.join("starwatch").join("config.yml"))
    }

    /// Expand environment variables in configuration paths
    pub fn expand_paths(&mut self) -> Result<()> {
        self.state.db_path = shellexpand::full(&self.state.db_path)
            .context("Failed to expand db_path")?
            .into_owned();

        self.daemon.pid_file = shellexpand::full(&self.daemon.pid_file)
            .context("Failed to expand pid_file path")?
            .into_owned();

        self.daemon.log_file = shellexpand::full(&self.daemon.log_file)
            .context("Failed to expand log_file path")?
            .into_owned();

        Ok(())
    }

    /// Poll interval in seconds, clamped to the configured minimum
    pub fn interval_secs(&self) -> Result<u64> {
        let secs = parse_duration(&self.monitor.interval)
            .context("Failed to parse monitor interval")?;
        Ok(secs.max(self.min_interval_secs()))
    }

    /// Configured interval floor, never below [`MIN_POLL_INTERVAL_SECS`]
    pub fn min_interval_secs(&self) -> u64 {
        self.monitor.min_interval.max(MIN_POLL_INTERVAL_SECS)
    }

    pub fn enrichment_concurrency(&self) -> usize {
        self.monitor
            .enrichment_concurrency
            .clamp(1, MAX_ENRICHMENT_CONCURRENCY)
    }

    pub fn default_mode(&self) -> Result<DigestMode> {
        DigestMode::parse(&self.monitor.default_mode)
            .ok_or_else(|| anyhow!("Unknown digest mode: {}", self.monitor.default_mode))
    }

    /// The owner's private chat, the destination every install starts with
    pub fn owner_destination(&self) -> Result<Destination> {
        let raw = self
            .telegram
            .owner_chat_id
            .clone()
            .or_else(|| std::env::var("OWNER_USER_ID").ok())
            .filter(|id| !id.trim().is_empty() && id.trim() != "0")
            .ok_or_else(|| {
                anyhow!(
                    "Owner chat is not configured. Set telegram.owner_chat_id in the config \
                     or the OWNER_USER_ID environment variable"
                )
            })?;

        Destination::parse(&raw)
    }

    pub fn bot_token(&self) -> Option<String> {
        self.telegram
            .bot_token
            .clone()
            .or_else(|| std::env::var("BOT_TOKEN").ok())
            .filter(|token| !token.is_empty())
    }

    pub fn gemini_api_key(&self) -> Option<String> {
        self.enrichment
            .gemini_api_key
            .clone()
            .or_else(|| std::env::var("GEMINI_API_KEY").ok())
            .filter(|key| !key.is_empty())
    }
}
