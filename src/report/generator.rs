//! Markdown and JSON report generation.
//!
//! The Markdown report is built section by section from the run's batch.
//! Entries are listed in submission order; the deadline table imposes its
//! own total order (earliest first, undated last).

use super::ReportMetadata;
use crate::models::{Batch, BatchItem, Classification, RunSummary};
use anyhow::Result;
use chrono::NaiveDate;
use serde::Serialize;

/// Generate a complete Markdown report.
pub fn generate_markdown_report(
    batch: &Batch,
    summary: &RunSummary,
    metadata: &ReportMetadata,
) -> String {
    let today = metadata.generated_at.date_naive();
    let mut output = String::new();

    output.push_str("# Feedwatch Report\n\n");
    output.push_str(&generate_metadata_section(summary, metadata));
    output.push_str(&generate_summary_section(batch));
    output.push_str(&generate_deadline_section(batch, today));
    output.push_str(&generate_entries_section(batch, metadata.include_not_relevant));
    output.push_str(&generate_failures_section(batch));
    output.push_str(&generate_footer());

    output
}

fn generate_metadata_section(summary: &RunSummary, metadata: &ReportMetadata) -> String {
    let mut section = String::new();

    section.push_str("## Metadata\n\n");
    section.push_str(&format!(
        "- **Generated:** {}\n",
        metadata.generated_at.format("%Y-%m-%d %H:%M:%S UTC")
    ));
    section.push_str(&format!("- **Model Used:** `{}`\n", metadata.model));
    if !metadata.keywords.is_empty() {
        section.push_str(&format!("- **Keywords:** {}\n", metadata.keywords.join(", ")));
    }
    section.push_str(&format!("- **Entries Received:** {}\n", summary.received));
    section.push_str(&format!("- **Entries Analyzed:** {}\n", summary.analyzed));
    if summary.errors > 0 {
        section.push_str(&format!("- **Failed Analyses:** {}\n", summary.errors));
    }
    section.push_str(&format!(
        "- **Run Duration:** {:.1}s\n",
        summary.duration_seconds
    ));
    if summary.cancelled {
        section.push_str(&format!(
            "- **Cancelled:** yes ({} entries not started)\n",
            summary.cancelled_skipped
        ));
    }
    section.push('\n');

    section
}

fn generate_summary_section(batch: &Batch) -> String {
    let classes = [
        Classification::BreakingChange,
        Classification::Deprecation,
        Classification::Update,
        Classification::NotRelevant,
        Classification::Error,
    ];
    let mut section = String::new();

    section.push_str("## Summary\n\n");
    let header: Vec<String> = classes
        .iter()
        .map(|c| format!("{} {}", c.emoji(), c.label()))
        .collect();
    section.push_str(&format!("| {} | **Total** |\n", header.join(" | ")));
    section.push_str(&format!("|{}:---:|\n", ":---:|".repeat(classes.len())));
    let counts: Vec<String> = classes.iter().map(|c| batch.count(*c).to_string()).collect();
    section.push_str(&format!("| {} | **{}** |\n\n", counts.join(" | "), batch.len()));

    let critical = batch.items.iter().filter(|i| i.record.is_critical()).count();
    if critical > 0 {
        section.push_str(&format!(
            "🚨 **{} entr{} flagged as critical.**\n\n",
            critical,
            if critical == 1 { "y" } else { "ies" }
        ));
    }

    section
}

/// Order items by deadline, earliest first, undated last. Ties keep
/// submission order.
pub fn sort_by_deadline<'a>(items: impl IntoIterator<Item = &'a BatchItem>) -> Vec<&'a BatchItem> {
    let mut sorted: Vec<&BatchItem> = items.into_iter().collect();
    sorted.sort_by_key(|i| (i.record.deadline.is_none(), i.record.deadline));
    sorted
}

fn generate_deadline_section(batch: &Batch, today: NaiveDate) -> String {
    let actionable: Vec<&BatchItem> = batch
        .items
        .iter()
        .filter(|i| i.record.classification.is_actionable())
        .collect();
    if actionable.is_empty() {
        return String::new();
    }

    let mut section = String::new();
    section.push_str("## Upcoming Deadlines\n\n");
    section.push_str("| Deadline | Type | Entry |\n");
    section.push_str("|:---|:---|:---|\n");

    for item in sort_by_deadline(actionable) {
        let deadline = match item.record.deadline {
            Some(d) if d < today => format!("~~{}~~ (passed)", d),
            Some(d) => d.to_string(),
            None => "No deadline".to_string(),
        };
        section.push_str(&format!(
            "| {} | {} {} | [{}]({}) |\n",
            deadline,
            item.record.classification.emoji(),
            item.record.classification.label(),
            escape_cell(&item.entry.title),
            item.entry.link
        ));
    }
    section.push('\n');

    section
}

fn generate_entries_section(batch: &Batch, include_not_relevant: bool) -> String {
    let shown: Vec<&BatchItem> = batch
        .items
        .iter()
        .filter(|i| !i.record.is_error())
        .filter(|i| include_not_relevant || i.record.classification != Classification::NotRelevant)
        .collect();

    let mut section = String::new();
    section.push_str("## Entries\n\n");

    if shown.is_empty() {
        section.push_str("No relevant entries in this run.\n\n");
        return section;
    }

    for item in shown {
        section.push_str(&generate_entry_block(item));
    }

    section
}

fn generate_entry_block(item: &BatchItem) -> String {
    let record = &item.record;
    let mut block = String::new();

    block.push_str(&format!(
        "### {} {}\n\n",
        record.classification.emoji(),
        item.entry.title
    ));
    block.push_str(&format!(
        "**Type:** {} | **Link:** {}\n\n",
        record.classification.label(),
        item.entry.link
    ));
    if let Some(published) = item.entry.published {
        block.push_str(&format!("**Published:** {}\n\n", published.format("%Y-%m-%d")));
    }
    if let Some(deadline) = record.deadline {
        block.push_str(&format!("**Deadline:** {}\n\n", deadline));
    }
    if let Some(confidence) = record.confidence {
        block.push_str(&format!("**Confidence:** {:.0}%\n\n", confidence * 100.0));
    }

    block.push_str(&format!("{}\n\n", record.summary));

    if let Some(ref impact) = record.impact {
        block.push_str(&format!("> **Impact:** {}\n\n", impact));
    }
    if !record.actions.is_empty() {
        block.push_str("**Actions:**\n\n");
        for action in &record.actions {
            block.push_str(&format!("- {}\n", action));
        }
        block.push('\n');
    }

    block.push_str("---\n\n");
    block
}

fn generate_failures_section(batch: &Batch) -> String {
    let errors: Vec<&BatchItem> = batch.errors().collect();
    if errors.is_empty() {
        return String::new();
    }

    let mut section = String::new();
    section.push_str("## Failed Analyses\n\n");
    section.push_str(
        "These entries could not be analysed. They will be retried on a later run \
         until their attempt limit is reached.\n\n",
    );
    for item in errors {
        section.push_str(&format!(
            "- {} [{}]({}): `{}`\n",
            Classification::Error.emoji(),
            item.entry.title,
            item.entry.link,
            item.record.diagnostic.as_deref().unwrap_or("unknown")
        ));
    }
    section.push('\n');

    section
}

fn generate_footer() -> String {
    "---\n\n*Report generated by feedwatch*\n".to_string()
}

fn escape_cell(s: &str) -> String {
    s.replace('|', "\\|")
}

#[derive(Serialize)]
struct JsonReport<'a> {
    metadata: &'a ReportMetadata,
    summary: &'a RunSummary,
    items: &'a [BatchItem],
}

/// Generate a JSON report.
pub fn generate_json_report(
    batch: &Batch,
    summary: &RunSummary,
    metadata: &ReportMetadata,
) -> Result<String> {
    let report = JsonReport {
        metadata,
        summary,
        items: &batch.items,
    };
    serde_json::to_string_pretty(&report).map_err(Into::into)
}
