//! Application configuration for Leadflow.
//!
//! Config lives at `~/.leadflow/leadflow.toml` unless `--config` points
//! elsewhere. CLI flags override config file values, which override defaults.
//! Credentials are never stored in the file: each provider section names the
//! environment variable that holds its secret.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{Days, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::error::{LeadflowError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "leadflow.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".leadflow";

// ---------------------------------------------------------------------------
// Config structs (matching leadflow.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Business-registry API.
    #[serde(default)]
    pub registry: RegistryConfig,

    /// CRM lead API.
    #[serde(default)]
    pub crm: CrmConfig,

    /// Transactional email API.
    #[serde(default)]
    pub notifier: NotifierConfig,

    /// Duplicate ledger storage.
    #[serde(default)]
    pub ledger: LedgerConfig,

    /// Per-run scheduling and concurrency policy.
    #[serde(default)]
    pub run: RunConfig,
}

/// `[registry]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default = "default_registry_url")]
    pub base_url: String,

    /// Name of the env var holding the registry token.
    #[serde(default = "default_registry_token_env")]
    pub token_env: String,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Only fetch companies registered in these states (empty = all).
    #[serde(default = "default_states")]
    pub states: Vec<String>,

    /// Records requested per page.
    #[serde(default = "default_page_size")]
    pub page_size: u32,

    /// Upper bound on pages followed per run.
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            base_url: default_registry_url(),
            token_env: default_registry_token_env(),
            timeout_secs: default_timeout_secs(),
            states: default_states(),
            page_size: default_page_size(),
            max_pages: default_max_pages(),
        }
    }
}

fn default_registry_url() -> String {
    "https://api.cnpja.com".into()
}
fn default_registry_token_env() -> String {
    "CNPJA_TOKEN".into()
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_states() -> Vec<String> {
    vec!["MA".into()]
}
fn default_page_size() -> u32 {
    10
}
fn default_max_pages() -> u32 {
    10
}

/// `[crm]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrmConfig {
    #[serde(default = "default_crm_url")]
    pub base_url: String,

    /// Name of the env var holding the CRM API key.
    #[serde(default = "default_crm_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for CrmConfig {
    fn default() -> Self {
        Self {
            base_url: default_crm_url(),
            api_key_env: default_crm_key_env(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_crm_url() -> String {
    "https://api.4c.com.br/v1".into()
}
fn default_crm_key_env() -> String {
    "CRM_API_KEY".into()
}

/// `[notifier]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifierConfig {
    #[serde(default = "default_notifier_url")]
    pub base_url: String,

    /// Name of the env var holding the email API token.
    #[serde(default = "default_notifier_token_env")]
    pub token_env: String,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_sender_email")]
    pub sender_email: String,

    #[serde(default = "default_sender_name")]
    pub sender_name: String,

    /// Provider-side template used for the contact email.
    #[serde(default = "default_template_id")]
    pub template_id: String,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            base_url: default_notifier_url(),
            token_env: default_notifier_token_env(),
            timeout_secs: default_timeout_secs(),
            sender_email: default_sender_email(),
            sender_name: default_sender_name(),
            template_id: default_template_id(),
        }
    }
}

fn default_notifier_url() -> String {
    "https://api.gclick.com.br/v1".into()
}
fn default_notifier_token_env() -> String {
    "GCLICK_TOKEN".into()
}
fn default_sender_email() -> String {
    "contato@ikasa.com.br".into()
}
fn default_sender_name() -> String {
    "Ikasa Contabilidade".into()
}
fn default_template_id() -> String {
    "lead_contabil_template".into()
}

/// `[ledger]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Database file; relative paths resolve against the working directory.
    #[serde(default = "default_ledger_path")]
    pub path: PathBuf,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            path: default_ledger_path(),
        }
    }
}

fn default_ledger_path() -> PathBuf {
    PathBuf::from("data").join("leads.db")
}

/// `[run]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Maximum candidates processed concurrently.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,

    /// Wall-clock budget for one run; 0 disables the limit.
    #[serde(default = "default_run_timeout_secs")]
    pub run_timeout_secs: u64,

    /// Target date is `today - days_back`.
    #[serde(default = "default_days_back")]
    pub days_back: u32,

    /// How many times an adapter waits out an HTTP 429 before giving up.
    #[serde(default = "default_rate_limit_retries")]
    pub max_rate_limit_retries: u32,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_in_flight: default_max_in_flight(),
            run_timeout_secs: default_run_timeout_secs(),
            days_back: default_days_back(),
            max_rate_limit_retries: default_rate_limit_retries(),
        }
    }
}

fn default_max_in_flight() -> usize {
    4
}
fn default_run_timeout_secs() -> u64 {
    900
}
fn default_days_back() -> u32 {
    1
}
fn default_rate_limit_retries() -> u32 {
    3
}

impl RunConfig {
    /// Resolve the scheduler's target date relative to `today`.
    pub fn target_date(&self, today: NaiveDate) -> NaiveDate {
        today
            .checked_sub_days(Days::new(u64::from(self.days_back)))
            .unwrap_or(today)
    }

    /// Run budget, or `None` when disabled.
    pub fn run_timeout(&self) -> Option<Duration> {
        (self.run_timeout_secs > 0).then(|| Duration::from_secs(self.run_timeout_secs))
    }
}

impl AppConfig {
    /// Reject configurations the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        for (section, url) in [
            ("registry", &self.registry.base_url),
            ("crm", &self.crm.base_url),
            ("notifier", &self.notifier.base_url),
        ] {
            url::Url::parse(url).map_err(|e| {
                LeadflowError::config(format!("[{section}] base_url {url:?} is invalid: {e}"))
            })?;
        }

        if self.run.max_in_flight == 0 {
            return Err(LeadflowError::config("[run] max_in_flight must be at least 1"));
        }
        if self.registry.page_size == 0 {
            return Err(LeadflowError::config("[registry] page_size must be at least 1"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.leadflow/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| LeadflowError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.leadflow/leadflow.toml`).
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
    let content = std::fs::read_to_string(path).map_err(|e| LeadflowError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| LeadflowError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    init_config_at(&config_file_path()?)
}

/// Write a default config file at `path`, creating parent directories.
pub fn init_config_at(path: &Path) -> Result<PathBuf> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|e| LeadflowError::io(dir, e))?;
    }

    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| LeadflowError::config(e.to_string()))?;

    std::fs::write(path, content).map_err(|e| LeadflowError::io(path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path.to_path_buf())
}

/// Read a provider secret from the env var named in config.
pub fn resolve_secret(var_name: &str) -> Result<String> {
    match std::env::var(var_name) {
        Ok(val) if !val.trim().is_empty() => Ok(val),
        _ => Err(LeadflowError::config(format!(
            "credential not found. Set the {var_name} environment variable."
        ))),
    }
}
