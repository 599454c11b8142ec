//! Application configuration for Prospector.
//!
//! User config lives at `~/.prospector/prospector.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ProspectorError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "prospector.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".prospector";

// ---------------------------------------------------------------------------
// Config structs (matching prospector.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Query/relationship API settings.
    #[serde(default)]
    pub api: ApiConfig,

    /// Discovery settings.
    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// Batch assembly settings.
    #[serde(default)]
    pub assembly: AssemblyConfig,

    /// Geocoding settings.
    #[serde(default)]
    pub geocoding: GeocodingConfig,

    /// Page scraper settings.
    #[serde(default)]
    pub scraper: ScraperConfig,

    /// Output directory for JSON exports and the local cache database.
    #[serde(default = "default_output_dir")]
    pub output_dir: String,
}

fn default_output_dir() -> String {
    "outputs".into()
}

/// `[api]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Base URL of the filtered-query and relationship API.
    #[serde(default = "default_api_base_url")]
    pub base_url: String,

    /// Name of the env var holding the API token (never store the token itself).
    #[serde(default = "default_token_env")]
    pub token_env: String,

    /// Per-request timeout in seconds.
    #[serde(default = "default_api_timeout")]
    pub timeout_secs: u64,

    /// Retries after the first attempt for transient failures.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    /// Base backoff between retries, multiplied by the attempt number.
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,

    /// Minimum ms between requests.
    #[serde(default = "default_rate_limit")]
    pub rate_limit_ms: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_api_base_url(),
            token_env: default_token_env(),
            timeout_secs: default_api_timeout(),
            retry_attempts: default_retry_attempts(),
            retry_delay_ms: default_retry_delay(),
            rate_limit_ms: default_rate_limit(),
        }
    }
}

fn default_api_base_url() -> String {
    "https://mininghub.com/api".into()
}
fn default_token_env() -> String {
    "PROSPECTOR_API_TOKEN".into()
}
fn default_api_timeout() -> u64 {
    30
}
fn default_retry_attempts() -> u32 {
    3
}
fn default_retry_delay() -> u64 {
    2000
}
fn default_rate_limit() -> u64 {
    500
}

/// `[discovery]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Partition keys (countries) to query.
    #[serde(default = "default_partitions")]
    pub partitions: Vec<String>,

    /// Optional cap on the number of discovered ids.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_projects: Option<usize>,

    /// Path to the identifier registry JSON file.
    #[serde(default = "default_registry_path")]
    pub registry_path: String,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            partitions: default_partitions(),
            max_projects: None,
            registry_path: default_registry_path(),
        }
    }
}

fn default_partitions() -> Vec<String> {
    vec![
        "Australia".into(),
        "Canada".into(),
        "United States of America".into(),
        "Brazil".into(),
    ]
}
fn default_registry_path() -> String {
    "found_urls.json".into()
}

/// `[assembly]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssemblyConfig {
    /// Upper bound on concurrent per-id pipelines.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Number of ids handed to each `process_batch` call.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Overall timeout for one map-centre lookup.
    #[serde(default = "default_map_center_timeout")]
    pub map_center_timeout_ms: u64,

    /// Whether missing state/country fields are filled by geocoding.
    #[serde(default = "default_true")]
    pub enable_geocoding: bool,

    /// Whether missing coordinates are looked up on the map page.
    #[serde(default = "default_true")]
    pub enable_map_center: bool,
}

impl Default for AssemblyConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            batch_size: default_batch_size(),
            map_center_timeout_ms: default_map_center_timeout(),
            enable_geocoding: true,
            enable_map_center: true,
        }
    }
}

fn default_max_workers() -> usize {
    4
}
fn default_batch_size() -> usize {
    100
}
fn default_map_center_timeout() -> u64 {
    7000
}
fn default_true() -> bool {
    true
}

/// `[geocoding]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeocodingConfig {
    /// Nominatim-compatible endpoint.
    #[serde(default = "default_geocoding_url")]
    pub base_url: String,

    /// Minimum ms between two provider calls.
    #[serde(default = "default_geocoding_interval")]
    pub min_interval_ms: u64,

    /// Per-request timeout in seconds.
    #[serde(default = "default_geocoding_timeout")]
    pub timeout_secs: u64,

    /// Drop cached misses at the start of a run so those lookups are retried.
    #[serde(default = "default_true")]
    pub retry_misses: bool,
}

impl Default for GeocodingConfig {
    fn default() -> Self {
        Self {
            base_url: default_geocoding_url(),
            min_interval_ms: default_geocoding_interval(),
            timeout_secs: default_geocoding_timeout(),
            retry_misses: true,
        }
    }
}

fn default_geocoding_url() -> String {
    "https://nominatim.openstreetmap.org".into()
}
fn default_geocoding_interval() -> u64 {
    1000
}
fn default_geocoding_timeout() -> u64 {
    10
}

/// `[scraper]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScraperConfig {
    /// Site root hosting the project profile and map pages.
    #[serde(default = "default_site_url")]
    pub base_url: String,

    /// Per-page timeout in seconds.
    #[serde(default = "default_scraper_timeout")]
    pub timeout_secs: u64,

    /// Retries after the first attempt for transient page failures.
    #[serde(default = "default_scraper_retries")]
    pub retry_attempts: u32,

    /// Base backoff between page retries, multiplied by the attempt number.
    #[serde(default = "default_scraper_retry_delay")]
    pub retry_delay_ms: u64,
}

impl Default for ScraperConfig {
    fn default() -> Self {
        Self {
            base_url: default_site_url(),
            timeout_secs: default_scraper_timeout(),
            retry_attempts: default_scraper_retries(),
            retry_delay_ms: default_scraper_retry_delay(),
        }
    }
}

fn default_site_url() -> String {
    "https://mininghub.com".into()
}
fn default_scraper_timeout() -> u64 {
    45
}
fn default_scraper_retries() -> u32 {
    2
}
fn default_scraper_retry_delay() -> u64 {
    1000
}

// ---------------------------------------------------------------------------
// Run config (runtime, merged from config + CLI flags)
// ---------------------------------------------------------------------------

/// Runtime pipeline configuration, merged from config file + CLI flags.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Partition keys to discover and preload.
    pub partitions: Vec<String>,
    /// Optional cap on discovered ids.
    pub max_projects: Option<usize>,
    /// Upper bound on concurrent per-id pipelines.
    pub max_workers: usize,
    /// Ids per batch.
    pub batch_size: usize,
    /// Map-centre lookup timeout in ms.
    pub map_center_timeout_ms: u64,
    /// Geocoding toggle.
    pub enable_geocoding: bool,
    /// Map-centre toggle.
    pub enable_map_center: bool,
    /// Evict cached geocoding misses before assembly.
    pub retry_geocode_misses: bool,
}

impl From<&AppConfig> for RunConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            partitions: config.discovery.partitions.clone(),
            max_projects: config.discovery.max_projects,
            max_workers: config.assembly.max_workers,
            batch_size: config.assembly.batch_size,
            map_center_timeout_ms: config.assembly.map_center_timeout_ms,
            enable_geocoding: config.assembly.enable_geocoding,
            enable_map_center: config.assembly.enable_map_center,
            retry_geocode_misses: config.geocoding.retry_misses,
        }
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.prospector/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| ProspectorError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.prospector/prospector.toml`).
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
    let content = std::fs::read_to_string(path).map_err(|e| ProspectorError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| ProspectorError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| ProspectorError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| ProspectorError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| ProspectorError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Read the API token from the configured env var. Missing or empty is fatal.
pub fn validate_api_token(config: &AppConfig) -> Result<String> {
    let var_name = &config.api.token_env;
    match std::env::var(var_name) {
        Ok(val) if !val.trim().is_empty() => Ok(val),
        _ => Err(ProspectorError::config(format!(
            "API token not found. Set the {var_name} environment variable."
        ))),
    }
}
