//! Run notifications.
//!
//! One message per completed run, summarising the batch and pointing at the
//! written report. Delivered to a Slack incoming webhook when configured,
//! otherwise to the log.

use crate::models::{Batch, Classification, RunSummary};
use crate::report::generator::sort_by_deadline;
use crate::report::ReportArtifact;
use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;
use tracing::{info, warn};

/// Maximum number of entries listed in a summary message.
const TOP_ENTRIES: usize = 5;

/// Receives the run-level summary.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, message: &str) -> Result<()>;

    fn name(&self) -> &'static str;
}

/// Slack incoming webhook.
pub struct SlackNotifier {
    webhook_url: String,
    http: reqwest::Client,
}

impl SlackNotifier {
    pub fn new(webhook_url: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .unwrap_or_default();
        Self {
            webhook_url: webhook_url.into(),
            http,
        }
    }
}

#[async_trait]
impl Notifier for SlackNotifier {
    async fn notify(&self, message: &str) -> Result<()> {
        let payload = json!({
            "text": message,
            "unfurl_links": false,
        });

        let resp = self.http.post(&self.webhook_url).json(&payload).send().await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            warn!(status = %status, body = %body, "Slack webhook returned non-success");
            anyhow::bail!("Slack webhook returned {status}");
        }

        Ok(())
    }

    fn name(&self) -> &'static str {
        "slack"
    }
}

/// Writes the summary to the log.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, message: &str) -> Result<()> {
        info!("Run summary:\n{}", message);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "log"
    }
}

/// Pick the notifier for an optional webhook URL.
pub fn from_webhook(webhook_url: Option<&str>) -> Box<dyn Notifier> {
    match webhook_url.map(str::trim).filter(|u| !u.is_empty()) {
        Some(url) => Box::new(SlackNotifier::new(url)),
        None => Box::new(LogNotifier),
    }
}

/// Build the summary message for a completed run.
pub fn build_summary_message(
    batch: &Batch,
    summary: &RunSummary,
    artifact: Option<&ReportArtifact>,
) -> String {
    let mut lines = vec![format!(
        ":newspaper: *Feedwatch: {} new entr{} analysed*",
        batch.len(),
        if batch.len() == 1 { "y" } else { "ies" }
    )];

    let counts: Vec<String> = [
        Classification::BreakingChange,
        Classification::Deprecation,
        Classification::Update,
        Classification::NotRelevant,
    ]
    .iter()
    .map(|c| format!("{} {}: {}", c.emoji(), c.label(), batch.count(*c)))
    .collect();
    lines.push(counts.join(" | "));

    let critical = batch.items.iter().filter(|i| i.record.is_critical()).count();
    let actionable = batch
        .items
        .iter()
        .filter(|i| i.record.classification.is_actionable())
        .count();
    lines.push(format!(
        ":rotating_light: Critical: {} | Non-critical: {}",
        critical,
        actionable.saturating_sub(critical)
    ));

    let errors = batch.errors().count();
    if errors > 0 {
        lines.push(format!(":warning: Failed analyses: {}", errors));
    }
    if summary.cancelled {
        lines.push(format!(
            ":hourglass: Run cancelled, {} entries not started",
            summary.cancelled_skipped
        ));
    }

    let top = sort_by_deadline(
        batch
            .items
            .iter()
            .filter(|i| i.record.classification.is_actionable()),
    );
    if !top.is_empty() {
        lines.push("*Top entries:*".to_string());
        for item in top.into_iter().take(TOP_ENTRIES) {
            let deadline = item
                .record
                .deadline
                .map(|d| format!(" (deadline {})", d))
                .unwrap_or_default();
            lines.push(format!(
                "• {} <{}|{}>{}",
                item.record.classification.emoji(),
                item.entry.link,
                item.entry.title,
                deadline
            ));
        }
    }

    // The report is not attached; the path is on the machine that ran us.
    if let Some(artifact) = artifact {
        lines.push(format!(
            "Report saved on the feedwatch host: `{}`",
            artifact.path.display()
        ));
    }

    lines.join("\n")
}
