//! Application configuration for procwatch.
//!
//! User config lives at `~/.procwatch/procwatch.toml`.
//! CLI flags override config file values, which override defaults.
//! Secrets are never stored in the file; sections name the environment
//! variable that holds them, resolved once at startup.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ProcwatchError, Result};
use crate::types::Classification;

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "procwatch.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".procwatch";

/// Default database file name inside the config directory.
const DATABASE_FILE_NAME: &str = "procwatch.db";

// ---------------------------------------------------------------------------
// Config structs (matching procwatch.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// HTTP ingress settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Local database settings.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// changedetection.io collaborator settings.
    #[serde(default)]
    pub changedetection: ChangeDetectionConfig,

    /// OpenRouter settings.
    #[serde(default)]
    pub openrouter: OpenRouterConfig,

    /// Slack notifier settings.
    #[serde(default)]
    pub slack: SlackConfig,

    /// Inbound webhook authentication.
    #[serde(default)]
    pub webhook: WebhookConfig,

    /// Daily LLM spend ceiling.
    #[serde(default)]
    pub budget: BudgetConfig,

    /// Filter policy settings.
    #[serde(default)]
    pub filters: FiltersConfig,

    /// One-level link discovery settings.
    #[serde(default)]
    pub link_discovery: LinkDiscoveryConfig,
}

/// `[server]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address for the HTTP server.
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Port for the HTTP server.
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1".into()
}
fn default_port() -> u16 {
    8200
}

/// `[database]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database file path. Empty means `~/.procwatch/procwatch.db`.
    #[serde(default)]
    pub path: String,
}

/// `[changedetection]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeDetectionConfig {
    /// Base URL of the changedetection.io instance.
    #[serde(default = "default_cdio_base_url")]
    pub base_url: String,

    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_cdio_api_key_env")]
    pub api_key_env: String,
}

impl Default for ChangeDetectionConfig {
    fn default() -> Self {
        Self {
            base_url: default_cdio_base_url(),
            api_key_env: default_cdio_api_key_env(),
        }
    }
}

fn default_cdio_base_url() -> String {
    "http://localhost:5000".into()
}
fn default_cdio_api_key_env() -> String {
    "CDIO_API_KEY".into()
}

/// `[openrouter]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenRouterConfig {
    /// API base URL.
    #[serde(default = "default_openrouter_base_url")]
    pub base_url: String,

    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Model used when a stage has no override.
    #[serde(default = "default_model")]
    pub default_model: String,

    /// Optional cheaper model for the triage stage.
    #[serde(default)]
    pub triage_model: Option<String>,

    /// Optional model override for classification.
    #[serde(default)]
    pub classify_model: Option<String>,

    /// Optional model override for enrichment.
    #[serde(default)]
    pub enrich_model: Option<String>,

    /// Sampling temperature for all stages.
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Completion budget for triage calls.
    #[serde(default = "default_max_tokens_triage")]
    pub max_tokens_triage: u32,

    /// Completion budget for classification calls.
    #[serde(default = "default_max_tokens_classify")]
    pub max_tokens_classify: u32,

    /// Completion budget for enrichment calls.
    #[serde(default = "default_max_tokens_enrich")]
    pub max_tokens_enrich: u32,
}

impl Default for OpenRouterConfig {
    fn default() -> Self {
        Self {
            base_url: default_openrouter_base_url(),
            api_key_env: default_api_key_env(),
            default_model: default_model(),
            triage_model: None,
            classify_model: None,
            enrich_model: None,
            temperature: default_temperature(),
            max_tokens_triage: default_max_tokens_triage(),
            max_tokens_classify: default_max_tokens_classify(),
            max_tokens_enrich: default_max_tokens_enrich(),
        }
    }
}

fn default_openrouter_base_url() -> String {
    "https://openrouter.ai/api/v1".into()
}
fn default_api_key_env() -> String {
    "OPENROUTER_API_KEY".into()
}
fn default_model() -> String {
    "anthropic/claude-sonnet-4".into()
}
fn default_temperature() -> f32 {
    0.1
}
fn default_max_tokens_triage() -> u32 {
    512
}
fn default_max_tokens_classify() -> u32 {
    1024
}
fn default_max_tokens_enrich() -> u32 {
    2048
}

/// `[slack]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlackConfig {
    /// Name of the env var holding the incoming-webhook URL.
    #[serde(default = "default_slack_webhook_env")]
    pub webhook_url_env: String,
}

impl Default for SlackConfig {
    fn default() -> Self {
        Self {
            webhook_url_env: default_slack_webhook_env(),
        }
    }
}

fn default_slack_webhook_env() -> String {
    "SLACK_WEBHOOK_URL".into()
}

/// `[webhook]` section — inbound webhook auth.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Name of the env var holding the shared secret. Empty value disables auth.
    #[serde(default = "default_webhook_secret_env")]
    pub secret_env: String,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            secret_env: default_webhook_secret_env(),
        }
    }
}

fn default_webhook_secret_env() -> String {
    "PROCWATCH_WEBHOOK_SECRET".into()
}

/// `[budget]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    /// Daily LLM spend ceiling in USD.
    #[serde(default = "default_daily_usd")]
    pub daily_usd: f64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            daily_usd: default_daily_usd(),
        }
    }
}

fn default_daily_usd() -> f64 {
    5.0
}

/// `[filters]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FiltersConfig {
    /// Diffs shorter than this (trimmed) are considered noise.
    #[serde(default = "default_min_diff_length")]
    pub min_diff_length: usize,

    /// Classification labels that qualify for enrichment.
    #[serde(default = "default_action_classifications")]
    pub classifications_to_enrich: Vec<String>,

    /// Classification labels that qualify for Slack notification.
    #[serde(default = "default_action_classifications")]
    pub classifications_to_notify: Vec<String>,
}

impl Default for FiltersConfig {
    fn default() -> Self {
        Self {
            min_diff_length: default_min_diff_length(),
            classifications_to_enrich: default_action_classifications(),
            classifications_to_notify: default_action_classifications(),
        }
    }
}

fn default_min_diff_length() -> usize {
    50
}
fn default_action_classifications() -> Vec<String> {
    vec!["RFI".into(), "RFP".into(), "ACTIONABLE".into()]
}

/// `[link_discovery]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkDiscoveryConfig {
    /// Whether triage-discovered links spawn child events.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Cap on links accepted from a single triage result.
    #[serde(default = "default_max_links")]
    pub max_links_per_event: usize,

    /// Cap on characters kept from a crawled page.
    #[serde(default = "default_max_page_fetch_chars")]
    pub max_page_fetch_chars: usize,
}

impl Default for LinkDiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_links_per_event: default_max_links(),
            max_page_fetch_chars: default_max_page_fetch_chars(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_max_links() -> usize {
    3
}
fn default_max_page_fetch_chars() -> usize {
    8000
}

// ---------------------------------------------------------------------------
// Pipeline settings (runtime, resolved from config + environment)
// ---------------------------------------------------------------------------

/// Runtime pipeline configuration — env secrets resolved, allow-lists parsed.
/// Built once at startup and passed by reference into components.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// changedetection.io base URL.
    pub cdio_base_url: String,
    /// changedetection.io API key (may be empty when the instance is open).
    pub cdio_api_key: String,
    /// OpenRouter base URL.
    pub openrouter_base_url: String,
    /// OpenRouter API key.
    pub openrouter_api_key: String,
    /// Model used when a stage has no override.
    pub default_model: String,
    /// Triage model override.
    pub triage_model: Option<String>,
    /// Classification model override.
    pub classify_model: Option<String>,
    /// Enrichment model override.
    pub enrich_model: Option<String>,
    /// Sampling temperature for all stages.
    pub temperature: f32,
    /// Completion budget for triage calls.
    pub max_tokens_triage: u32,
    /// Completion budget for classification calls.
    pub max_tokens_classify: u32,
    /// Completion budget for enrichment calls.
    pub max_tokens_enrich: u32,
    /// Slack incoming-webhook URL. Empty means notifications are disabled.
    pub slack_webhook_url: String,
    /// Daily LLM spend ceiling in USD.
    pub daily_budget_usd: f64,
    /// Diffs shorter than this (trimmed) are considered noise.
    pub min_diff_length: usize,
    /// Parsed enrichment allow-list.
    pub enrich_classifications: Vec<Classification>,
    /// Parsed notification allow-list.
    pub notify_classifications: Vec<Classification>,
    /// Whether triage-discovered links spawn child events.
    pub link_discovery_enabled: bool,
    /// Cap on links accepted from a single triage result.
    pub max_links_per_event: usize,
    /// Cap on characters kept from a crawled page.
    pub max_page_fetch_chars: usize,
}

impl From<&AppConfig> for PipelineSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            cdio_base_url: config.changedetection.base_url.clone(),
            cdio_api_key: env_value(&config.changedetection.api_key_env),
            openrouter_base_url: config.openrouter.base_url.clone(),
            openrouter_api_key: env_value(&config.openrouter.api_key_env),
            default_model: config.openrouter.default_model.clone(),
            triage_model: config.openrouter.triage_model.clone(),
            classify_model: config.openrouter.classify_model.clone(),
            enrich_model: config.openrouter.enrich_model.clone(),
            temperature: config.openrouter.temperature,
            max_tokens_triage: config.openrouter.max_tokens_triage,
            max_tokens_classify: config.openrouter.max_tokens_classify,
            max_tokens_enrich: config.openrouter.max_tokens_enrich,
            slack_webhook_url: env_value(&config.slack.webhook_url_env),
            daily_budget_usd: config.budget.daily_usd,
            min_diff_length: config.filters.min_diff_length,
            enrich_classifications: parse_labels(&config.filters.classifications_to_enrich),
            notify_classifications: parse_labels(&config.filters.classifications_to_notify),
            link_discovery_enabled: config.link_discovery.enabled,
            max_links_per_event: config.link_discovery.max_links_per_event,
            max_page_fetch_chars: config.link_discovery.max_page_fetch_chars,
        }
    }
}

/// Read an env var by name, treating unset as empty.
fn env_value(var_name: &str) -> String {
    if var_name.is_empty() {
        return String::new();
    }
    std::env::var(var_name).unwrap_or_default()
}

/// Parse configured classification labels, warning on entries that match
/// no known label (they can never pass a filter, so they are dropped).
fn parse_labels(labels: &[String]) -> Vec<Classification> {
    let mut parsed = Vec::new();
    for label in labels {
        match Classification::parse(label) {
            Some(c) => parsed.push(c),
            None => tracing::warn!(label, "ignoring unknown classification label in config"),
        }
    }
    parsed
}

/// Resolve the inbound webhook shared secret. `None` disables auth.
pub fn webhook_secret(config: &AppConfig) -> Option<String> {
    let value = env_value(&config.webhook.secret_env);
    if value.is_empty() { None } else { Some(value) }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.procwatch/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| ProcwatchError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.procwatch/procwatch.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Resolve the database file path, defaulting to `~/.procwatch/procwatch.db`.
pub fn database_path(config: &AppConfig) -> Result<PathBuf> {
    if config.database.path.is_empty() {
        Ok(config_dir()?.join(DATABASE_FILE_NAME))
    } else {
        Ok(PathBuf::from(&config.database.path))
    }
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
    let content = std::fs::read_to_string(path).map_err(|e| ProcwatchError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| ProcwatchError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| ProcwatchError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| ProcwatchError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| ProcwatchError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Check that the OpenRouter API key env var is set and non-empty.
pub fn validate_api_key(config: &AppConfig) -> Result<()> {
    let var_name = &config.openrouter.api_key_env;
    match std::env::var(var_name) {
        Ok(val) if !val.is_empty() => Ok(()),
        _ => Err(ProcwatchError::config(format!(
            "OpenRouter API key not found. Set the {var_name} environment variable.\n\
             Get a key at https://openrouter.ai/keys"
        ))),
    }
}
