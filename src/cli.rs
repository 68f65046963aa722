//! Command-line interface argument parsing.
//!
//! This module handles all CLI argument parsing using clap,
//! including validation. Every option that can also be set in
//! `.feedwatch.toml` is optional here so the file value survives
//! unless the flag is given.

use crate::config::{LedgerKind, ReportFormat};
use clap::Parser;
use std::path::PathBuf;

/// Feedwatch - LLM-assisted watcher for breaking changes in RSS/Atom feeds
///
/// Fetches the configured feeds, skips entries it has already seen, asks a
/// language model to classify the rest (breaking change, deprecation,
/// update) and writes a report plus a one-message summary.
///
/// Examples:
///   feedwatch "AWS Lambda" Terraform
///   feedwatch --feeds https://aws.amazon.com/about-aws/whats-new/recent/feed/ Lambda
///   feedwatch --dry-run
///   feedwatch --init-config
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Args {
    /// Technologies to watch for (e.g. "AWS Lambda" Terraform)
    ///
    /// Entries mentioning none of them are skipped unless --no-prefilter is set.
    #[arg(value_name = "KEYWORD", env = "DEFAULT_KEYWORDS", value_delimiter = ',')]
    pub keywords: Vec<String>,

    /// Feed URLs to fetch (comma-separated)
    #[arg(long, value_name = "URLS", env = "RSS_FEEDS", value_delimiter = ',')]
    pub feeds: Option<Vec<String>>,

    /// Model used for analysis
    #[arg(short, long, env = "FEEDWATCH_MODEL")]
    pub model: Option<String>,

    /// OpenAI-compatible API base URL
    #[arg(long, value_name = "URL", env = "FEEDWATCH_BASE_URL")]
    pub base_url: Option<String>,

    /// Path to configuration file
    ///
    /// If not specified, looks for .feedwatch.toml in the current directory
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Number of entries analysed concurrently
    #[arg(long, value_name = "NUM")]
    pub concurrency: Option<usize>,

    /// Retry budget per analysis request
    #[arg(long, value_name = "COUNT")]
    pub retries: Option<u32>,

    /// Analyse every entry, even those matching no keyword
    #[arg(long)]
    pub no_prefilter: bool,

    /// Dedup ledger backend (memory, file)
    #[arg(long, value_name = "KIND")]
    pub ledger: Option<LedgerKind>,

    /// Path of the file-backed ledger
    #[arg(long, value_name = "FILE")]
    pub ledger_path: Option<PathBuf>,

    /// Directory reports are written to
    #[arg(short, long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Report format (markdown, json)
    #[arg(long, value_name = "FORMAT")]
    pub format: Option<ReportFormat>,

    /// Slack incoming webhook for the run summary
    #[arg(long, value_name = "URL", env = "SLACK_WEBHOOK_URL", hide_env_values = true)]
    pub slack_webhook_url: Option<String>,

    /// Enable verbose logging output
    #[arg(short, long)]
    pub verbose: bool,

    /// Run in quiet mode (minimal output)
    #[arg(short, long)]
    pub quiet: bool,

    /// Print the configured feeds and exit
    #[arg(long)]
    pub list_feeds: bool,

    /// Dry run: fetch and filter feeds without calling the model
    ///
    /// Shows which entries would be analysed. Nothing is written to the ledger.
    #[arg(long)]
    pub dry_run: bool,

    /// Generate a default .feedwatch.toml configuration file
    #[arg(long)]
    pub init_config: bool,
}

impl Args {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate the parsed arguments.
    pub fn validate(&self) -> Result<(), String> {
        if self.init_config {
            return Ok(());
        }

        if self.verbose && self.quiet {
            return Err("Cannot use both --verbose and --quiet".to_string());
        }

        if self.concurrency == Some(0) {
            return Err("Concurrency must be at least 1".to_string());
        }

        if let Some(ref url) = self.base_url {
            if !is_http_url(url) {
                return Err("Base URL must start with 'http://' or 'https://'".to_string());
            }
        }

        if let Some(ref feeds) = self.feeds {
            if let Some(bad) = feeds.iter().find(|f| !is_http_url(f)) {
                return Err(format!(
                    "Feed URL must start with 'http://' or 'https://': {}",
                    bad
                ));
            }
        }

        if let Some(ref url) = self.slack_webhook_url {
            if !url.is_empty() && !url.starts_with("https://") {
                return Err("Slack webhook URL must start with 'https://'".to_string());
            }
        }

        Ok(())
    }

    /// Returns the log level based on verbosity settings.
    pub fn log_level(&self) -> tracing::Level {
        if self.quiet {
            tracing::Level::ERROR
        } else if self.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        }
    }
}

fn is_http_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}
