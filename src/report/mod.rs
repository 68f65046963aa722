//! Report generation and delivery.

pub mod generator;

pub use generator::{generate_json_report, generate_markdown_report};

use crate::config::ReportFormat;
use crate::models::{Batch, RunSummary};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::info;

/// Context printed at the top of a report.
#[derive(Debug, Clone, Serialize)]
pub struct ReportMetadata {
    pub generated_at: DateTime<Utc>,
    pub model: String,
    pub keywords: Vec<String>,
    /// Render `not_relevant` entries in the per-entry section.
    #[serde(skip)]
    pub include_not_relevant: bool,
}

/// A written report.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportArtifact {
    pub path: PathBuf,
    pub format: ReportFormat,
}

/// Receives the batch of a completed run.
pub trait ReportSink: Send + Sync {
    fn write(&self, batch: &Batch, summary: &RunSummary) -> Result<ReportArtifact>;
}

/// Writes `feedwatch_report_<timestamp>.{md,json}` into a directory.
pub struct FileReportSink {
    output_dir: PathBuf,
    format: ReportFormat,
    model: String,
    keywords: Vec<String>,
    include_not_relevant: bool,
}

impl FileReportSink {
    pub fn new(
        output_dir: impl AsRef<Path>,
        format: ReportFormat,
        model: impl Into<String>,
        keywords: Vec<String>,
        include_not_relevant: bool,
    ) -> Self {
        Self {
            output_dir: output_dir.as_ref().to_path_buf(),
            format,
            model: model.into(),
            keywords,
            include_not_relevant,
        }
    }
}

impl ReportSink for FileReportSink {
    fn write(&self, batch: &Batch, summary: &RunSummary) -> Result<ReportArtifact> {
        let metadata = ReportMetadata {
            generated_at: Utc::now(),
            model: self.model.clone(),
            keywords: self.keywords.clone(),
            include_not_relevant: self.include_not_relevant,
        };

        let (content, extension) = match self.format {
            ReportFormat::Markdown => (generate_markdown_report(batch, summary, &metadata), "md"),
            ReportFormat::Json => (generate_json_report(batch, summary, &metadata)?, "json"),
        };

        std::fs::create_dir_all(&self.output_dir).with_context(|| {
            format!(
                "Failed to create report directory {}",
                self.output_dir.display()
            )
        })?;

        let file_name = format!(
            "feedwatch_report_{}.{}",
            metadata.generated_at.format("%Y%m%d_%H%M%S"),
            extension
        );
        let path = self.output_dir.join(file_name);
        std::fs::write(&path, content)
            .with_context(|| format!("Failed to write report to {}", path.display()))?;

        info!(path = %path.display(), entries = batch.len(), "Report written");
        Ok(ReportArtifact {
            path,
            format: self.format,
        })
    }
}
