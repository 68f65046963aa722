//! Configuration file handling.
//!
//! This module handles loading and merging configuration from
//! `.feedwatch.toml` files.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Name of the configuration file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = ".feedwatch.toml";

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings.
    #[serde(default)]
    pub general: GeneralConfig,

    /// Reasoning service settings.
    #[serde(default)]
    pub service: ServiceConfig,

    /// Retry, backoff and truncation limits for analysis calls.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Orchestration settings.
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Dedup ledger settings.
    #[serde(default)]
    pub ledger: LedgerConfig,

    /// Report settings.
    #[serde(default)]
    pub report: ReportConfig,

    /// Notification settings.
    #[serde(default)]
    pub notify: NotifyConfig,

    /// Feeds to watch.
    #[serde(default)]
    pub feeds: FeedsConfig,
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Directory reports are written to.
    #[serde(default = "default_output_dir")]
    pub output_dir: String,

    /// Enable verbose logging by default.
    #[serde(default)]
    pub verbose: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            verbose: false,
        }
    }
}

fn default_output_dir() -> String {
    "reports".to_string()
}

/// Reasoning service (OpenAI-compatible chat completions) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// API base URL, without the `/chat/completions` suffix.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Model name.
    #[serde(default = "default_model")]
    pub model: String,

    /// Environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Temperature for generation.
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Per-request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,

    /// Ask the service for a JSON object response.
    #[serde(default = "default_true")]
    pub json_mode: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model: default_model(),
            api_key_env: default_api_key_env(),
            temperature: default_temperature(),
            timeout_seconds: default_timeout(),
            json_mode: true,
        }
    }
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_temperature() -> f32 {
    0.1
}

fn default_timeout() -> u64 {
    60
}

/// Retry state machine limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Re-issues allowed per request lineage (total attempts = budget + 1).
    #[serde(default = "default_retry_budget")]
    pub budget: u32,

    /// First backoff delay in milliseconds.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Upper bound for a single backoff delay in milliseconds.
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,

    /// Body length (chars) submitted before any truncation.
    #[serde(default = "default_max_body_chars")]
    pub max_body_chars: usize,

    /// Body length (chars) after the one allowed truncation.
    #[serde(default = "default_truncate_to_chars")]
    pub truncate_to_chars: usize,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            budget: default_retry_budget(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            max_body_chars: default_max_body_chars(),
            truncate_to_chars: default_truncate_to_chars(),
        }
    }
}

impl RetryConfig {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_millis(self.backoff_cap_ms)
    }
}

fn default_retry_budget() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    1_000
}

fn default_backoff_cap_ms() -> u64 {
    30_000
}

fn default_max_body_chars() -> usize {
    24_000
}

fn default_truncate_to_chars() -> usize {
    6_000
}

/// Orchestrator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Maximum entries analysed concurrently.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Technologies/keywords to watch for.
    #[serde(default)]
    pub keywords: Vec<String>,

    /// Skip entries that mention none of the keywords.
    #[serde(default = "default_true")]
    pub keyword_prefilter: bool,

    /// Total analysis lineages allowed per fingerprint across runs.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Minimum wait before a failed entry is retried on a later run.
    #[serde(default = "default_failed_cooldown")]
    pub failed_cooldown_secs: u64,

    /// Stop starting new analyses after this many seconds (0 = no limit).
    #[serde(default)]
    pub run_timeout_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            keywords: Vec::new(),
            keyword_prefilter: true,
            max_attempts: default_max_attempts(),
            failed_cooldown_secs: default_failed_cooldown(),
            run_timeout_secs: 0,
        }
    }
}

impl PipelineConfig {
    pub fn run_timeout(&self) -> Option<Duration> {
        (self.run_timeout_secs > 0).then(|| Duration::from_secs(self.run_timeout_secs))
    }
}

fn default_concurrency() -> usize {
    4
}

fn default_max_attempts() -> u32 {
    3
}

fn default_failed_cooldown() -> u64 {
    900
}

/// Which ledger backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LedgerKind {
    /// Forget everything when the process exits.
    Memory,
    /// JSON document on disk.
    #[default]
    File,
}

/// Dedup ledger settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    #[serde(default)]
    pub kind: LedgerKind,

    /// Path of the file-backed ledger.
    #[serde(default = "default_ledger_path")]
    pub path: String,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            kind: LedgerKind::File,
            path: default_ledger_path(),
        }
    }
}

fn default_ledger_path() -> String {
    ".feedwatch/ledger.json".to_string()
}

/// Report output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ReportFormat {
    /// Markdown format (default)
    #[default]
    Markdown,
    /// JSON format
    Json,
}

/// Report generation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportConfig {
    #[serde(default)]
    pub format: ReportFormat,

    /// List not-relevant entries in the report body.
    #[serde(default)]
    pub include_not_relevant: bool,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            format: ReportFormat::Markdown,
            include_not_relevant: false,
        }
    }
}

/// Notification settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotifyConfig {
    /// Slack incoming-webhook URL. Falls back to logging when unset.
    #[serde(default)]
    pub slack_webhook_url: Option<String>,
}

/// Feed list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeedsConfig {
    #[serde(default)]
    pub urls: Vec<String>,
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from a file path.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Try to load configuration from the default location.
    ///
    /// Returns `Ok(None)` if the file doesn't exist, `Err` if it exists but can't be parsed.
    pub fn load_default() -> Result<Option<Self>> {
        let default_path = Path::new(DEFAULT_CONFIG_FILE);

        if default_path.exists() {
            Ok(Some(Self::load(default_path)?))
        } else {
            Ok(None)
        }
    }

    /// Merge this configuration with CLI arguments.
    ///
    /// CLI arguments take precedence over config file settings, but only
    /// when they were actually provided.
    pub fn merge_with_args(&mut self, args: &crate::cli::Args) {
        if let Some(ref model) = args.model {
            self.service.model = model.clone();
        }
        if let Some(ref base_url) = args.base_url {
            self.service.base_url = base_url.clone();
        }

        if let Some(ref feeds) = args.feeds {
            self.feeds.urls = feeds.clone();
        }
        if !args.keywords.is_empty() {
            self.pipeline.keywords = args.keywords.clone();
        }
        if let Some(concurrency) = args.concurrency {
            self.pipeline.concurrency = concurrency;
        }
        if args.no_prefilter {
            self.pipeline.keyword_prefilter = false;
        }

        if let Some(retries) = args.retries {
            self.retry.budget = retries;
        }

        if let Some(kind) = args.ledger {
            self.ledger.kind = kind;
        }
        if let Some(ref path) = args.ledger_path {
            self.ledger.path = path.display().to_string();
        }

        if let Some(ref dir) = args.output_dir {
            self.general.output_dir = dir.display().to_string();
        }
        if let Some(format) = args.format {
            self.report.format = format;
        }

        if let Some(ref url) = args.slack_webhook_url {
            self.notify.slack_webhook_url = Some(url.clone());
        }

        if args.verbose {
            self.general.verbose = true;
        }
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.pipeline.concurrency == 0 {
            bail!("pipeline.concurrency must be at least 1");
        }
        if self.pipeline.max_attempts == 0 {
            bail!("pipeline.max_attempts must be at least 1");
        }
        if self.retry.backoff_cap_ms < self.retry.backoff_base_ms {
            bail!("retry.backoff_cap_ms must not be smaller than retry.backoff_base_ms");
        }
        if self.retry.truncate_to_chars == 0 {
            bail!("retry.truncate_to_chars must be at least 1");
        }
        if !self.service.base_url.starts_with("http://")
            && !self.service.base_url.starts_with("https://")
        {
            bail!("service.base_url must start with 'http://' or 'https://'");
        }
        for url in &self.feeds.urls {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                bail!("feed URL must start with 'http://' or 'https://': {}", url);
            }
        }
        Ok(())
    }

    /// Generate a default configuration file content.
    pub fn default_toml() -> String {
        let config = Config::default();
        toml::to_string_pretty(&config).unwrap_or_else(|_| String::new())
    }
}
