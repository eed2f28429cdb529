//! Shared types, error model, and configuration for procwatch.
//!
//! This crate is the foundation depended on by all other procwatch crates.
//! It provides:
//! - [`ProcwatchError`] — the unified error type
//! - Domain types ([`ChangeEvent`], [`PipelineStatus`], [`Classification`])
//! - Configuration ([`AppConfig`], [`PipelineSettings`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, BudgetConfig, ChangeDetectionConfig, DatabaseConfig, FiltersConfig,
    LinkDiscoveryConfig, OpenRouterConfig, PipelineSettings, ServerConfig, SlackConfig,
    WebhookConfig, config_dir, config_file_path, database_path, init_config, load_config,
    load_config_from, validate_api_key, webhook_secret,
};
pub use error::{ProcwatchError, Result};
pub use types::{
    ChangeEvent, Classification, ClassificationResult, CostLedgerEntry, DiscoveredLink,
    EnrichmentResult, PipelineStatus, TriageResult, Urgency, clip,
};
