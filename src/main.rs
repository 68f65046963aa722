//! Feedwatch - LLM-assisted watcher for RSS/Atom feeds
//!
//! Fetches feeds, drops entries already analysed on an earlier run, asks an
//! OpenAI-compatible model to classify the rest and reports breaking
//! changes, deprecations and deadlines.
//!
//! Exit codes:
//!   0 - Success (including runs with failed analyses)
//!   1 - Runtime error (config, ledger store unavailable, etc.)

mod analysis;
mod cli;
mod config;
mod error;
mod feeds;
mod fingerprint;
mod ledger;
mod models;
mod notify;
mod pipeline;
mod report;

use analysis::{AnalysisClient, OpenAiCompatibleService};
use anyhow::{bail, Context, Result};
use cli::Args;
use config::Config;
use feeds::FeedReader;
use indicatif::{ProgressBar, ProgressStyle};
use ledger::DedupLedger;
use models::{Classification, RawEntry};
use pipeline::{Orchestrator, RunControl};
use report::FileReportSink;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Timeout for fetching a single feed document.
const FEED_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse_args();

    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    // Handle --init-config early (no logging needed)
    if args.init_config {
        return handle_init_config();
    }

    init_logging(&args);

    info!("Feedwatch v{}", env!("CARGO_PKG_VERSION"));
    debug!("Arguments: {:?}", args);

    if let Err(e) = run(args).await {
        error!("Run failed: {:#}", e);
        eprintln!("\n❌ Error: {:#}", e);
        std::process::exit(1);
    }

    Ok(())
}

/// Handle --init-config: generate a default .feedwatch.toml.
fn handle_init_config() -> Result<()> {
    let path = std::path::Path::new(config::DEFAULT_CONFIG_FILE);

    if path.exists() {
        eprintln!(
            "⚠️  {} already exists. Remove it first or edit it manually.",
            config::DEFAULT_CONFIG_FILE
        );
        std::process::exit(1);
    }

    let content = Config::default_toml();
    std::fs::write(path, &content)
        .with_context(|| format!("Failed to write {}", config::DEFAULT_CONFIG_FILE))?;

    println!("✅ Created {} with default settings.", config::DEFAULT_CONFIG_FILE);
    println!("   Add your feeds under [feeds] and your stack under [pipeline].keywords.");
    Ok(())
}

/// Initialize logging. `RUST_LOG` wins over --verbose/--quiet when set.
fn init_logging(args: &Args) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_level().to_string().to_lowercase()));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }
}

/// Run the complete fetch → analyse → report workflow.
async fn run(args: Args) -> Result<()> {
    let mut config = load_config(&args)?;
    config.merge_with_args(&args);
    config.validate()?;

    if args.list_feeds {
        return handle_list_feeds(&config);
    }

    if config.feeds.urls.is_empty() {
        bail!("No feeds configured. Pass --feeds, set RSS_FEEDS or add [feeds].urls to the config file");
    }

    let entries = fetch_entries(&config, args.quiet).await?;
    let ledger = DedupLedger::open(&config.ledger).context("Failed to open dedup ledger")?;

    let service = OpenAiCompatibleService::from_config(&config.service)?;
    let has_api_key = service.has_api_key();
    let backend = ledger.backend();
    let client = AnalysisClient::new(Arc::new(service), config.retry.clone());
    let model = client.model_name();
    let orchestrator = Orchestrator::new(
        ledger,
        client,
        config.pipeline.clone(),
        config.retry.max_body_chars,
    );

    if args.dry_run {
        return handle_dry_run(entries, &orchestrator).await;
    }

    if !has_api_key {
        warn!(
            "{} is not set; requests are sent without authentication",
            config.service.api_key_env
        );
    }

    println!("🤖 Analysing with {}", config.service.model);
    println!("   Endpoint: {}", config.service.base_url);
    println!(
        "   Concurrency: {} | Retry budget: {} | Ledger: {}",
        config.pipeline.concurrency,
        config.retry.budget,
        backend
    );

    let control = match config.pipeline.run_timeout() {
        Some(timeout) => RunControl::with_timeout(timeout),
        None => RunControl::new(),
    };
    let on_interrupt = control.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; finishing in-flight analyses");
            on_interrupt.cancel();
        }
    });

    let sink = FileReportSink::new(
        &config.general.output_dir,
        config.report.format,
        model,
        config.pipeline.keywords.clone(),
        config.report.include_not_relevant,
    );
    let notifier = notify::from_webhook(config.notify.slack_webhook_url.as_deref());

    let outcome = orchestrator
        .run_and_dispatch(entries, &control, &sink, notifier.as_ref())
        .await?;

    let summary = &outcome.summary;
    let batch = &outcome.batch;
    println!("\n📊 Run Summary:");
    println!(
        "   Received: {} | Filtered: {} | Already seen: {}",
        summary.received, summary.filtered, summary.duplicates
    );
    println!(
        "   Analysed: {} | Failed: {} | Waiting for retry: {}",
        summary.analyzed, summary.errors, summary.failed_skipped
    );
    println!(
        "   - {} Breaking: {} | {} Deprecations: {} | {} Updates: {}",
        Classification::BreakingChange.emoji(),
        batch.count(Classification::BreakingChange),
        Classification::Deprecation.emoji(),
        batch.count(Classification::Deprecation),
        Classification::Update.emoji(),
        batch.count(Classification::Update)
    );
    if summary.cancelled {
        println!(
            "   ⏹️  Cancelled: {} entries not started",
            summary.cancelled_skipped
        );
    }
    println!("   Duration: {:.1}s", summary.duration_seconds);

    match outcome.artifact {
        Some(ref artifact) => println!(
            "\n✅ Run complete! {:?} report saved to: {}",
            artifact.format,
            artifact.path.display()
        ),
        None if batch.is_empty() => println!("\n✅ Run complete! Nothing new to report."),
        None => println!("\n⚠️  Run complete, but the report could not be written."),
    }

    Ok(())
}

/// Fetch every configured feed behind a spinner.
async fn fetch_entries(config: &Config, quiet: bool) -> Result<Vec<RawEntry>> {
    let reader = FeedReader::new(FEED_TIMEOUT)?;

    let spinner = if quiet {
        ProgressBar::hidden()
    } else {
        let pb = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} {msg}") {
            pb.set_style(style);
        }
        pb.enable_steady_tick(Duration::from_millis(120));
        pb
    };
    spinner.set_message(format!("📥 Fetching {} feeds...", config.feeds.urls.len()));

    let entries = reader.fetch_all(&config.feeds.urls).await;

    spinner.finish_and_clear();
    println!(
        "📥 Fetched {} entries from {} feeds",
        entries.len(),
        config.feeds.urls.len()
    );
    Ok(entries)
}

/// Handle --list-feeds.
fn handle_list_feeds(config: &Config) -> Result<()> {
    if config.feeds.urls.is_empty() {
        println!("No feeds configured.");
        return Ok(());
    }
    println!("Configured feeds:\n");
    for url in &config.feeds.urls {
        println!("  📰 {}", url);
    }
    println!("\nTotal: {} feeds", config.feeds.urls.len());
    Ok(())
}

/// Handle --dry-run: show which entries a run would analyse. Applies the
/// same prefilter, in-run dedup and ledger checks as a real run, but never
/// writes to the ledger or calls the model.
async fn handle_dry_run(entries: Vec<RawEntry>, orchestrator: &Orchestrator) -> Result<()> {
    println!("\n🔍 Dry run: filtering entries (no model calls)...\n");

    let fetched = entries.len();
    let preview = orchestrator.preview(entries).await?;
    for entry in &preview.pending {
        println!("     📄 {} ({})", entry.title, entry.link);
    }

    let summary = &preview.summary;
    println!(
        "\n   {} to analyse, {} already seen, {} waiting for retry, {} filtered, {} fetched",
        preview.pending.len(),
        summary.duplicates,
        summary.failed_skipped,
        summary.filtered,
        fetched
    );
    println!("\n✅ Dry run complete. No model calls were made.");
    Ok(())
}

/// Load configuration from file or use defaults.
fn load_config(args: &Args) -> Result<Config> {
    if let Some(ref config_path) = args.config {
        info!("Loading config from: {}", config_path.display());
        return Config::load(config_path);
    }

    match Config::load_default() {
        Ok(Some(config)) => {
            info!("Loaded default config from {}", config::DEFAULT_CONFIG_FILE);
            Ok(config)
        }
        Ok(None) => {
            debug!("No config file found, using defaults");
            Ok(Config::default())
        }
        Err(e) => {
            warn!("Failed to load config: {:#}", e);
            Ok(Config::default())
        }
    }
}
