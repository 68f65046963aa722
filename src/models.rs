//! Data models for the feed watcher.
//!
//! This module contains the core data structures that flow through the
//! pipeline: raw feed entries, their fingerprints, analysis records,
//! ledger records and the per-run batch.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One feed item as fetched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawEntry {
    /// Entry title.
    pub title: String,
    /// Link to the article.
    pub link: String,
    /// Publication time, if the feed supplied a parseable one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published: Option<DateTime<Utc>>,
    /// Body content (may be HTML).
    pub body: String,
    /// Feed the entry came from (informational only).
    #[serde(default)]
    pub feed_url: String,
}

impl RawEntry {
    pub fn new(title: impl Into<String>, link: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            link: link.into(),
            published: None,
            body: body.into(),
            feed_url: String::new(),
        }
    }

    pub fn with_feed(mut self, feed_url: impl Into<String>) -> Self {
        self.feed_url = feed_url.into();
        self
    }

    pub fn with_published(mut self, published: DateTime<Utc>) -> Self {
        self.published = Some(published);
        self
    }
}

/// Hex-encoded SHA-256 digest of an entry's normalized content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub(crate) fn from_digest(bytes: &[u8]) -> Self {
        Self(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Shortened form for log lines.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification assigned by the analysis step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    BreakingChange,
    Deprecation,
    Update,
    NotRelevant,
    /// Analysis failed; the record carries a diagnostic instead of a summary.
    Error,
}

impl Classification {
    /// Parse a classification produced by the reasoning service.
    ///
    /// `error` is reserved for local failures and is never accepted from the service.
    pub fn from_service(value: &str) -> Option<Self> {
        let normalized = value.trim().to_lowercase().replace(['-', ' '], "_");
        match normalized.as_str() {
            "breaking_change" | "breaking" => Some(Self::BreakingChange),
            "deprecation" | "deprecated" => Some(Self::Deprecation),
            "update" => Some(Self::Update),
            "not_relevant" | "not_important" | "irrelevant" => Some(Self::NotRelevant),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::BreakingChange => "Breaking change",
            Self::Deprecation => "Deprecation",
            Self::Update => "Update",
            Self::NotRelevant => "Not relevant",
            Self::Error => "Error",
        }
    }

    pub fn emoji(&self) -> &'static str {
        match self {
            Self::BreakingChange => "🔴",
            Self::Deprecation => "🟠",
            Self::Update => "🔵",
            Self::NotRelevant => "⚪",
            Self::Error => "⚠️",
        }
    }

    /// Whether an entry with this classification needs someone's attention.
    pub fn is_actionable(&self) -> bool {
        matches!(self, Self::BreakingChange | Self::Deprecation)
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Canonical structured result of analysing one entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRecord {
    pub classification: Classification,
    /// Free-text summary. Empty for error records.
    pub summary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deadline: Option<NaiveDate>,
    /// Confidence/relevance in `0.0..=1.0`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub impact: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<String>,
    /// Reasoning-service response ID, for traceability.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_id: Option<String>,
    /// Failure reason; set only on error records.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<String>,
    pub analyzed_at: DateTime<Utc>,
}

impl AnalysisRecord {
    /// A known-bad but visible record.
    pub fn error(diagnostic: impl Into<String>) -> Self {
        let diagnostic = diagnostic.into();
        Self {
            classification: Classification::Error,
            summary: String::new(),
            deadline: None,
            confidence: None,
            impact: None,
            actions: Vec::new(),
            response_id: None,
            diagnostic: Some(if diagnostic.is_empty() {
                "unknown analysis failure".to_string()
            } else {
                diagnostic
            }),
            analyzed_at: Utc::now(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.classification == Classification::Error
    }

    /// Impact or actions call for immediate attention.
    pub fn is_critical(&self) -> bool {
        const MARKERS: [&str; 3] = ["critical", "urgent", "immediate"];
        let impact = self.impact.as_deref().unwrap_or("").to_lowercase();
        let actions = self.actions.join(" ").to_lowercase();
        MARKERS
            .iter()
            .any(|m| impact.contains(m) || actions.contains(m))
    }
}

/// Lifecycle of a ledger record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerStatus {
    Pending,
    Analyzed,
    Failed,
}

impl fmt::Display for LedgerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LedgerStatus::Pending => write!(f, "pending"),
            LedgerStatus::Analyzed => write!(f, "analyzed"),
            LedgerStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Value stored in the dedup ledger under an entry's fingerprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerRecord {
    pub status: LedgerStatus,
    pub first_seen: DateTime<Utc>,
    pub last_attempt: DateTime<Utc>,
    /// Number of analysis lineages run for this fingerprint, across runs.
    pub attempts: u32,
    /// Failed records are not retried before this time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_not_before: Option<DateTime<Utc>>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub link: String,
    pub analysis: AnalysisRecord,
}

/// One processed entry in a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchItem {
    pub fingerprint: Fingerprint,
    pub entry: RawEntry,
    pub record: AnalysisRecord,
}

/// The processed (entry, record) pairs of one run, in submission order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Batch {
    pub items: Vec<BatchItem>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn errors(&self) -> impl Iterator<Item = &BatchItem> {
        self.items.iter().filter(|i| i.record.is_error())
    }

    pub fn count(&self, classification: Classification) -> usize {
        self.items
            .iter()
            .filter(|i| i.record.classification == classification)
            .count()
    }
}

/// Counters describing one orchestration run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunSummary {
    pub started_at: Option<DateTime<Utc>>,
    /// Entries handed to the run.
    pub received: usize,
    /// Dropped by the keyword prefilter.
    pub filtered: usize,
    /// Already analyzed in an earlier run, or repeated within this run.
    pub duplicates: usize,
    /// Failed earlier and out of attempts or still cooling down.
    pub failed_skipped: usize,
    /// Not started because the run was cancelled.
    pub cancelled_skipped: usize,
    /// Entries that went through analysis (successful or not).
    pub analyzed: usize,
    /// Of those, how many ended as error records.
    pub errors: usize,
    pub cancelled: bool,
    pub duration_seconds: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification_from_service() {
        assert_eq!(
            Classification::from_service("breaking_change"),
            Some(Classification::BreakingChange)
        );
        assert_eq!(
            Classification::from_service("Breaking Change"),
            Some(Classification::BreakingChange)
        );
        assert_eq!(
            Classification::from_service("DEPRECATION"),
            Some(Classification::Deprecation)
        );
        assert_eq!(
            Classification::from_service("not-relevant"),
            Some(Classification::NotRelevant)
        );
        assert_eq!(Classification::from_service("error"), None);
        assert_eq!(Classification::from_service("maybe"), None);
    }

    #[test]
    fn test_classification_serde() {
        let json = serde_json::to_string(&Classification::BreakingChange).unwrap();
        assert_eq!(json, "\"breaking_change\"");
        let back: Classification = serde_json::from_str("\"not_relevant\"").unwrap();
        assert_eq!(back, Classification::NotRelevant);
    }

    #[test]
    fn test_error_record_has_diagnostic() {
        let record = AnalysisRecord::error("");
        assert!(record.is_error());
        assert!(record.summary.is_empty());
        assert!(!record.diagnostic.unwrap().is_empty());
    }

    #[test]
    fn test_is_critical() {
        let mut record = AnalysisRecord::error("x");
        record.classification = Classification::BreakingChange;
        assert!(!record.is_critical());

        record.impact = Some("Urgent migration needed".to_string());
        assert!(record.is_critical());

        record.impact = None;
        record.actions = vec!["Upgrade immediately".to_string()];
        assert!(record.is_critical());
    }

    #[test]
    fn test_batch_counts() {
        let mut ok = AnalysisRecord::error("x");
        ok.classification = Classification::Deprecation;
        ok.diagnostic = None;
        let batch = Batch {
            items: vec![
                BatchItem {
                    fingerprint: Fingerprint::from_digest(&[1, 2, 3]),
                    entry: RawEntry::new("a", "https://a", ""),
                    record: ok,
                },
                BatchItem {
                    fingerprint: Fingerprint::from_digest(&[4, 5, 6]),
                    entry: RawEntry::new("b", "https://b", ""),
                    record: AnalysisRecord::error("boom"),
                },
            ],
        };
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.count(Classification::Deprecation), 1);
        assert_eq!(batch.errors().count(), 1);
    }
}
