//! Application configuration for the Aspects sinks.
//!
//! User config lives at `~/.aspects/aspects.toml`.
//! CLI flags override config file values, which override defaults.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{AspectsError, Result};
use crate::types::{BulkInsertOptions, block_types};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "aspects.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".aspects";

/// Sink names, also used as the `[sinks] enabled` entries.
pub mod sink_names {
    pub const COURSE_OVERVIEWS: &str = "course_overviews";
    pub const COURSE_BLOCKS: &str = "course_blocks";
    pub const EXTERNAL_ID: &str = "external_id";
    pub const USER_RETIREMENT: &str = "user_retirement";
}

// ---------------------------------------------------------------------------
// Config structs (matching aspects.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Warehouse connection.
    #[serde(default)]
    pub clickhouse: ClickHouseConfig,

    /// Local content store snapshot.
    #[serde(default)]
    pub content_store: ContentStoreConfig,

    /// Sink behavior.
    #[serde(default)]
    pub sinks: SinksConfig,

    /// Background task queue.
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
}

/// `[clickhouse]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClickHouseConfig {
    /// HTTP interface base URL.
    #[serde(default = "default_clickhouse_url")]
    pub url: String,

    /// Database holding the sink tables.
    #[serde(default = "default_database")]
    pub database: String,

    /// HTTP basic auth user.
    #[serde(default = "default_username")]
    pub username: String,

    /// Name of the env var holding the password (never store the password itself).
    #[serde(default = "default_password_env")]
    pub password_env: String,

    /// Request timeout.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Rows allowed to fail per bulk insert.
    #[serde(default = "default_max_error_count")]
    pub max_error_count: u64,

    /// Fraction of rows allowed to fail per bulk insert.
    #[serde(default = "default_max_error_ratio")]
    pub max_error_ratio: f64,
}

impl Default for ClickHouseConfig {
    fn default() -> Self {
        Self {
            url: default_clickhouse_url(),
            database: default_database(),
            username: default_username(),
            password_env: default_password_env(),
            timeout_secs: default_timeout_secs(),
            max_error_count: default_max_error_count(),
            max_error_ratio: default_max_error_ratio(),
        }
    }
}

impl ClickHouseConfig {
    pub fn bulk_insert_options(&self) -> BulkInsertOptions {
        BulkInsertOptions {
            max_error_count: self.max_error_count,
            max_error_ratio: self.max_error_ratio,
        }
    }

    /// Password from the configured env var; empty when unset.
    pub fn password(&self) -> String {
        std::env::var(&self.password_env).unwrap_or_default()
    }
}

fn default_clickhouse_url() -> String {
    "http://localhost:8123".into()
}
fn default_database() -> String {
    "event_sink".into()
}
fn default_username() -> String {
    "default".into()
}
fn default_password_env() -> String {
    "ASPECTS_CLICKHOUSE_PASSWORD".into()
}
fn default_timeout_secs() -> u64 {
    10
}
fn default_max_error_count() -> u64 {
    1
}
fn default_max_error_ratio() -> f64 {
    0.1
}

/// `[content_store]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentStoreConfig {
    /// Path to the libSQL snapshot database.
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

impl Default for ContentStoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

fn default_db_path() -> String {
    "~/.aspects/content.db".into()
}

impl ContentStoreConfig {
    /// `db_path` with a leading `~/` expanded to the home directory.
    pub fn resolved_db_path(&self) -> Result<PathBuf> {
        match self.db_path.strip_prefix("~/") {
            Some(rest) => {
                let home = dirs::home_dir().ok_or_else(|| {
                    AspectsError::config("could not determine home directory")
                })?;
                Ok(home.join(rest))
            }
            None => Ok(PathBuf::from(&self.db_path)),
        }
    }
}

/// `[sinks]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinksConfig {
    /// Block types recorded outside the course hierarchy.
    #[serde(default = "default_detached_block_types")]
    pub detached_block_types: Vec<String>,

    /// Whether to attach taxonomy tags to block rows.
    #[serde(default = "default_true")]
    pub tags_enabled: bool,

    /// Sinks allowed to write.
    #[serde(default = "default_enabled_sinks")]
    pub enabled: Vec<String>,

    /// Tables purged of a user's rows on retirement.
    #[serde(default = "default_pii_tables")]
    pub pii_tables: Vec<String>,
}

impl Default for SinksConfig {
    fn default() -> Self {
        Self {
            detached_block_types: default_detached_block_types(),
            tags_enabled: true,
            enabled: default_enabled_sinks(),
            pii_tables: default_pii_tables(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_detached_block_types() -> Vec<String> {
    block_types::DEFAULT_DETACHED
        .iter()
        .map(|t| t.to_string())
        .collect()
}
fn default_enabled_sinks() -> Vec<String> {
    vec![
        sink_names::COURSE_OVERVIEWS.into(),
        sink_names::COURSE_BLOCKS.into(),
        sink_names::EXTERNAL_ID.into(),
        sink_names::USER_RETIREMENT.into(),
    ]
}
fn default_pii_tables() -> Vec<String> {
    vec!["user_profile".into(), "external_id".into()]
}

/// `[dispatcher]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Concurrent worker tasks.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Bounded queue length.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

fn default_workers() -> usize {
    2
}
fn default_queue_capacity() -> usize {
    256
}

// ---------------------------------------------------------------------------
// Sink settings (runtime, read-only for the duration of a run)
// ---------------------------------------------------------------------------

/// Runtime sink settings, resolved once from the config and injected.
#[derive(Debug, Clone)]
pub struct SinkSettings {
    /// Block types treated as detached.
    pub detached_block_types: HashSet<String>,
    /// Whether tag lookups run at all.
    pub tags_enabled: bool,
    /// Enabled sink names.
    pub enabled: HashSet<String>,
    /// Tables purged on user retirement.
    pub pii_tables: Vec<String>,
    /// Bulk insert tolerance.
    pub bulk_insert: BulkInsertOptions,
}

impl SinkSettings {
    pub fn is_enabled(&self, sink_name: &str) -> bool {
        self.enabled.contains(sink_name)
    }
}

impl Default for SinkSettings {
    fn default() -> Self {
        SinkSettings::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for SinkSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            detached_block_types: config.sinks.detached_block_types.iter().cloned().collect(),
            tags_enabled: config.sinks.tags_enabled,
            enabled: config.sinks.enabled.iter().cloned().collect(),
            pii_tables: config.sinks.pii_tables.clone(),
            bulk_insert: config.clickhouse.bulk_insert_options(),
        }
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.aspects/`).
pub fn config_dir() -> Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| AspectsError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.aspects/aspects.toml`).
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

/// Load and validate the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| AspectsError::io(path, e))?;

    let config: AppConfig = toml::from_str(&content)
        .map_err(|e| AspectsError::config(format!("failed to parse {}: {e}", path.display())))?;
    validate_config(&config)?;
    Ok(config)
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| AspectsError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| AspectsError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| AspectsError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Reject settings no run could succeed with.
pub fn validate_config(config: &AppConfig) -> Result<()> {
    let url = Url::parse(&config.clickhouse.url).map_err(|e| {
        AspectsError::config(format!("clickhouse.url {:?} is invalid: {e}", config.clickhouse.url))
    })?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(AspectsError::config(format!(
            "clickhouse.url must be http or https, got {}",
            url.scheme()
        )));
    }

    if !(0.0..=1.0).contains(&config.clickhouse.max_error_ratio) {
        return Err(AspectsError::config(
            "clickhouse.max_error_ratio must be in [0.0, 1.0]",
        ));
    }

    if config.dispatcher.workers == 0 {
        return Err(AspectsError::config("dispatcher.workers must be > 0"));
    }
    if config.dispatcher.queue_capacity == 0 {
        return Err(AspectsError::config("dispatcher.queue_capacity must be > 0"));
    }

    Ok(())
}
