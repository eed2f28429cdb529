//! CLI command definitions, routing, and tracing setup.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

use procwatch_pipeline::{Pipeline, SlackNotifier};
use procwatch_server::ServeConfig;
use procwatch_shared::{
    AppConfig, ChangeEvent, PipelineSettings, PipelineStatus, database_path, init_config,
    load_config, load_config_from, validate_api_key, webhook_secret,
};
use procwatch_storage::Storage;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// procwatch — procurement intelligence from page-change webhooks.
#[derive(Parser)]
#[command(
    name = "procwatch",
    version,
    about = "Monitor government pages for changes and turn them into actionable Slack intelligence.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Config file path (defaults to ~/.procwatch/procwatch.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Start the webhook ingress and pipeline host.
    Serve {
        /// Bind address (overrides config).
        #[arg(long)]
        bind: Option<String>,

        /// Port (overrides config).
        #[arg(long)]
        port: Option<u16>,
    },

    /// Re-run the pipeline for an existing event.
    Replay {
        /// Event id to re-process.
        event_id: i64,

        /// Stage to restart from.
        #[arg(long, value_enum, default_value = "enrich")]
        from_stage: ReplayStage,
    },

    /// POST a fabricated change webhook at a running server.
    Simulate {
        /// Server base URL.
        #[arg(long, default_value = "http://localhost:8200")]
        url: String,

        /// Watch UUID to report.
        #[arg(long, default_value = "simulated-watch")]
        watch_uuid: String,

        /// Watched page URL to report.
        #[arg(long, default_value = "https://example.gov/procurement/opportunities")]
        watch_url: String,

        /// Webhook secret header value.
        #[arg(long)]
        secret: Option<String>,
    },

    /// Post a sample intelligence card to Slack.
    TestCard {
        /// Webhook URL (defaults to the configured one).
        #[arg(long)]
        webhook_url: Option<String>,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Replay entry points, from earliest to latest.
#[derive(Clone, Copy, Debug, clap::ValueEnum)]
pub(crate) enum ReplayStage {
    /// Re-fetch the change content and re-run everything.
    Fetch,
    /// Keep the fetched content, redo classification onward.
    Classify,
    /// Keep the classification, redo enrichment onward.
    Enrich,
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "procwatch=info",
        1 => "procwatch=debug",
        _ => "procwatch=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt().with_env_filter(env_filter).with_target(false).init();
        }
        LogFormat::Json => {
            fmt().json().with_env_filter(env_filter).init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };

    match cli.command {
        Command::Serve { bind, port } => cmd_serve(&config, bind, port).await,
        Command::Replay {
            event_id,
            from_stage,
        } => cmd_replay(&config, event_id, from_stage).await,
        Command::Simulate {
            url,
            watch_uuid,
            watch_url,
            secret,
        } => cmd_simulate(&url, &watch_uuid, &watch_url, secret.as_deref()).await,
        Command::TestCard { webhook_url } => cmd_test_card(&config, webhook_url.as_deref()).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show(&config).await,
        },
    }
}

// ---------------------------------------------------------------------------
// serve
// ---------------------------------------------------------------------------

async fn cmd_serve(config: &AppConfig, bind: Option<String>, port: Option<u16>) -> Result<()> {
    validate_api_key(config)?;

    let db_path = database_path(config)?;
    let storage = Arc::new(Storage::open(&db_path).await?);
    let settings = Arc::new(PipelineSettings::from(config));
    let pipeline = Arc::new(Pipeline::new(storage.clone(), settings)?);
    let secret = webhook_secret(config);

    let serve_config = ServeConfig {
        bind: bind.unwrap_or_else(|| config.server.bind.clone()),
        port: port.unwrap_or(config.server.port),
    };

    info!(
        bind = serve_config.bind,
        port = serve_config.port,
        db = %db_path.display(),
        auth = secret.is_some(),
        "starting procwatch"
    );
    procwatch_server::serve(storage, pipeline, secret, serve_config).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// replay
// ---------------------------------------------------------------------------

async fn cmd_replay(config: &AppConfig, event_id: i64, from_stage: ReplayStage) -> Result<()> {
    validate_api_key(config)?;

    let db_path = database_path(config)?;
    let storage = Arc::new(Storage::open(&db_path).await?);
    let session = storage.session()?;

    let mut event = session
        .get_event(event_id)
        .await?
        .ok_or_else(|| eyre!("event {event_id} not found"))?;

    info!(
        event_id,
        from_stage = format!("{from_stage:?}").to_lowercase(),
        previous_status = %event.pipeline_status,
        "replaying event"
    );

    // Admin override: reset fields and write an earlier status directly,
    // bypassing the forward-only transition table.
    clear_enrichment(&mut event);
    match from_stage {
        ReplayStage::Fetch => {
            event.diff_text = None;
            event.snapshot_text = None;
            clear_triage(&mut event);
            clear_classification(&mut event);
            event.pipeline_status = PipelineStatus::Received;
        }
        ReplayStage::Classify => {
            clear_classification(&mut event);
            event.pipeline_status = PipelineStatus::Fetched;
        }
        ReplayStage::Enrich => {
            event.pipeline_status = PipelineStatus::Classified;
        }
    }
    event.error_message = None;
    event.slack_message_ts = None;
    session.update_event(&event).await?;

    let settings = Arc::new(PipelineSettings::from(config));
    let pipeline = Pipeline::new(storage.clone(), settings)?;

    let spinner = spinner(format!("Replaying event #{event_id}..."));
    pipeline.run(event_id).await;
    spinner.finish_and_clear();

    let replayed = session
        .get_event(event_id)
        .await?
        .ok_or_else(|| eyre!("event {event_id} vanished during replay"))?;

    println!();
    println!("  Replay complete");
    println!("  Event:  #{event_id}");
    println!("  Status: {}", replayed.pipeline_status);
    if let Some(classification) = &replayed.classification {
        println!("  Class:  {classification}");
    }
    if let Some(message) = &replayed.error_message {
        println!("  Note:   {message}");
    }
    println!();

    Ok(())
}

fn clear_triage(event: &mut ChangeEvent) {
    event.triage_result = None;
    event.triage_tokens_used = None;
    event.discovered_links = None;
}

fn clear_classification(event: &mut ChangeEvent) {
    event.classification = None;
    event.classification_confidence = None;
    event.classification_reasoning = None;
    event.classification_model = None;
    event.classification_tokens_used = None;
}

fn clear_enrichment(event: &mut ChangeEvent) {
    event.summary = None;
    event.recommended_actions = None;
    event.urgency = None;
    event.key_dates = None;
    event.relevant_agencies = None;
    event.enrichment_model = None;
    event.enrichment_tokens_used = None;
}

// ---------------------------------------------------------------------------
// simulate
// ---------------------------------------------------------------------------

async fn cmd_simulate(
    url: &str,
    watch_uuid: &str,
    watch_url: &str,
    secret: Option<&str>,
) -> Result<()> {
    let endpoint = format!("{}/webhooks/change", url.trim_end_matches('/'));
    info!(endpoint, watch_uuid, "simulating change webhook");

    let client = reqwest::Client::new();
    let mut request = client.post(&endpoint).json(&serde_json::json!({
        "watch_uuid": watch_uuid,
        "watch_url": watch_url,
    }));
    if let Some(secret) = secret {
        request = request.header("x-webhook-secret", secret);
    }

    let response = request
        .send()
        .await
        .map_err(|e| eyre!("could not reach {endpoint}: {e}"))?;
    let status = response.status();
    let body = response.text().await.unwrap_or_default();

    println!("HTTP {status}");
    println!("{body}");
    Ok(())
}

// ---------------------------------------------------------------------------
// test-card
// ---------------------------------------------------------------------------

async fn cmd_test_card(config: &AppConfig, webhook_url: Option<&str>) -> Result<()> {
    let settings = PipelineSettings::from(config);
    let url = webhook_url.unwrap_or(&settings.slack_webhook_url);
    if url.is_empty() {
        return Err(eyre!(
            "no Slack webhook URL. Pass --webhook-url or set the {} environment variable.",
            config.slack.webhook_url_env
        ));
    }

    let mut event = ChangeEvent::new(
        "test-watch",
        "https://example.gov/procurement/opportunities",
    );
    event.id = 0;
    event.classification = Some("RFP".into());
    event.classification_confidence = Some(0.93);
    event.classification_model = Some(settings.default_model.clone());
    event.summary = Some(
        "Sample card: the agency posted a new request for proposals for rural \
         broadband infrastructure. Proposals are due in 45 days."
            .into(),
    );
    event.recommended_actions = Some(
        serde_json::json!([
            "Read the full solicitation",
            "Confirm eligibility requirements",
            "Schedule a bid/no-bid review",
        ])
        .to_string(),
    );
    event.urgency = Some("HIGH".into());
    event.key_dates = Some(serde_json::json!(["Proposals due in 45 days"]).to_string());
    event.relevant_agencies = Some(serde_json::json!(["Example Agency"]).to_string());

    let notifier = SlackNotifier::new(url)?;
    match notifier.send(&event).await {
        Some(receipt) => {
            println!("Card delivered (receipt: {receipt})");
            Ok(())
        }
        None => Err(eyre!("Slack rejected the card — check the webhook URL")),
    }
}

// ---------------------------------------------------------------------------
// config
// ---------------------------------------------------------------------------

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show(config: &AppConfig) -> Result<()> {
    let toml_str = toml::to_string_pretty(config)?;
    println!("{toml_str}");
    Ok(())
}

// ---------------------------------------------------------------------------
// Progress spinner
// ---------------------------------------------------------------------------

fn spinner(message: String) -> ProgressBar {
    let bar = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan} {msg}") {
        bar.set_style(style.tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]));
    }
    bar.set_message(message);
    bar.enable_steady_tick(std::time::Duration::from_millis(80));
    bar
}
