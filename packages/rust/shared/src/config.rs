//! Application configuration for chatkb.
//!
//! User config lives at `~/.chatkb/chatkb.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ChatKbError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "chatkb.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".chatkb";

// ---------------------------------------------------------------------------
// Config structs (matching chatkb.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Global defaults.
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Context assembly budgets.
    #[serde(default)]
    pub context: ContextLimits,

    /// Plan limits for URL entries.
    #[serde(default)]
    pub limits: LinkLimits,

    /// Page and sitemap fetch settings.
    #[serde(default)]
    pub crawl: CrawlSettings,
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Knowledge database location.
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Bot whose knowledge base commands operate on.
    #[serde(default = "default_bot")]
    pub bot: String,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            bot: default_bot(),
        }
    }
}

fn default_db_path() -> String {
    "~/.chatkb/knowledge.db".into()
}
fn default_bot() -> String {
    "default".into()
}

/// `[context]` section: budgets for knowledge context assembly.
///
/// All lengths are in characters (Unicode scalar values).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextLimits {
    /// Total budget for the assembled context block.
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,

    /// Content cap for `url` entries.
    #[serde(default = "default_url_cap")]
    pub url_cap: usize,

    /// Content cap for `file` entries.
    #[serde(default = "default_file_cap")]
    pub file_cap: usize,

    /// Content cap for every other type.
    #[serde(default = "default_cap")]
    pub default_cap: usize,

    /// Minimum room left in the budget for a partial final block.
    #[serde(default = "default_min_partial_chars")]
    pub min_partial_chars: usize,
}

impl Default for ContextLimits {
    fn default() -> Self {
        Self {
            max_chars: default_max_chars(),
            url_cap: default_url_cap(),
            file_cap: default_file_cap(),
            default_cap: default_cap(),
            min_partial_chars: default_min_partial_chars(),
        }
    }
}

impl ContextLimits {
    /// Same limits with a different total budget.
    pub fn with_max_chars(mut self, max_chars: usize) -> Self {
        self.max_chars = max_chars;
        self
    }
}

fn default_max_chars() -> usize {
    20_000
}
fn default_url_cap() -> usize {
    3_000
}
fn default_file_cap() -> usize {
    20_000
}
fn default_cap() -> usize {
    5_000
}
fn default_min_partial_chars() -> usize {
    200
}

/// `[limits]` section: plan quotas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkLimits {
    /// Maximum number of `url` entries a bot may hold.
    #[serde(default = "default_max_links")]
    pub max_links: usize,

    /// Maximum number of URLs read from one sitemap.
    #[serde(default = "default_max_sitemap_urls")]
    pub max_sitemap_urls: usize,
}

impl Default for LinkLimits {
    fn default() -> Self {
        Self {
            max_links: default_max_links(),
            max_sitemap_urls: default_max_sitemap_urls(),
        }
    }
}

fn default_max_links() -> usize {
    50
}
fn default_max_sitemap_urls() -> usize {
    500
}

/// `[crawl]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrawlSettings {
    /// HTTP timeout per request, in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Pause between consecutive requests of a sitemap batch.
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,

    /// Largest page body accepted.
    #[serde(default = "default_max_page_bytes")]
    pub max_page_bytes: u64,
}

impl Default for CrawlSettings {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            delay_ms: default_delay_ms(),
            max_page_bytes: default_max_page_bytes(),
        }
    }
}

fn default_timeout_secs() -> u64 {
    30
}
fn default_delay_ms() -> u64 {
    500
}
fn default_max_page_bytes() -> u64 {
    5 * 1024 * 1024
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.chatkb/`).
pub fn config_dir() -> Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| ChatKbError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.chatkb/chatkb.toml`).
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
    let content = std::fs::read_to_string(path).map_err(|e| ChatKbError::io(path, e))?;

    let config: AppConfig = toml::from_str(&content)
        .map_err(|e| ChatKbError::config(format!("failed to parse {}: {e}", path.display())))?;

    validate(&config)?;
    Ok(config)
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| ChatKbError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| ChatKbError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| ChatKbError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

impl DefaultsConfig {
    /// The database path with a leading `~/` expanded to the home directory.
    pub fn resolved_db_path(&self) -> Result<PathBuf> {
        match self.db_path.strip_prefix("~/") {
            Some(rest) => {
                let home = dirs::home_dir()
                    .ok_or_else(|| ChatKbError::config("could not determine home directory"))?;
                Ok(home.join(rest))
            }
            None => Ok(PathBuf::from(&self.db_path)),
        }
    }
}

/// Reject values that would make every context or crawl empty.
fn validate(config: &AppConfig) -> Result<()> {
    if config.context.max_chars == 0 {
        return Err(ChatKbError::config("context.max_chars must be greater than 0"));
    }
    if config.crawl.timeout_secs == 0 {
        return Err(ChatKbError::config("crawl.timeout_secs must be greater than 0"));
    }
    Ok(())
}
