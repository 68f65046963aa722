//! Result validation and recording.
//!
//! This module turns the reasoning service's raw reply into the canonical
//! [`AnalysisRecord`] and writes the outcome of every analysed entry into
//! the dedup ledger.

use crate::config::PipelineConfig;
use crate::error::{ServiceError, StoreError};
use crate::ledger::DedupLedger;
use crate::models::{
    AnalysisRecord, Classification, Fingerprint, LedgerRecord, LedgerStatus, RawEntry,
};
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// Deadline values that mean "no deadline".
const NO_DEADLINE: [&str; 4] = ["no deadline", "none", "n/a", "null"];

/// Validate a service reply and normalize it into an [`AnalysisRecord`].
///
/// `classification` and `summary` are required; unknown fields are ignored.
/// A deadline, when given, must be a `YYYY-MM-DD` date.
pub fn normalize_payload(
    content: &str,
    response_id: Option<String>,
) -> Result<AnalysisRecord, ServiceError> {
    let json_text = extract_json_object(content)
        .ok_or_else(|| malformed("reply contains no JSON object"))?;
    let json: Value = serde_json::from_str(json_text)
        .map_err(|e| malformed(format!("invalid JSON: {}", e)))?;
    if !json.is_object() {
        return Err(malformed("payload is not a JSON object"));
    }

    let raw_class = json["classification"]
        .as_str()
        .ok_or_else(|| malformed("missing field `classification`"))?;
    let classification = Classification::from_service(raw_class)
        .ok_or_else(|| malformed(format!("unknown classification `{}`", raw_class)))?;

    let summary = json["summary"]
        .as_str()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| malformed("missing field `summary`"))?
        .to_string();

    let deadline = parse_deadline(&json["deadline"])?;

    let confidence = json
        .get("confidence")
        .or_else(|| json.get("relevance"))
        .and_then(Value::as_f64)
        .filter(|c| c.is_finite())
        .map(|c| c.clamp(0.0, 1.0) as f32);

    let impact = json["impact"]
        .as_str()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from);

    let actions = match &json["actions"] {
        Value::Array(items) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect(),
        Value::String(s) if !s.trim().is_empty() => vec![s.trim().to_string()],
        _ => Vec::new(),
    };

    Ok(AnalysisRecord {
        classification,
        summary,
        deadline,
        confidence,
        impact,
        actions,
        response_id,
        diagnostic: None,
        analyzed_at: Utc::now(),
    })
}

fn parse_deadline(value: &Value) -> Result<Option<NaiveDate>, ServiceError> {
    match value {
        Value::Null => Ok(None),
        Value::String(s) => {
            let s = s.trim();
            if s.is_empty() || NO_DEADLINE.iter().any(|n| s.eq_ignore_ascii_case(n)) {
                return Ok(None);
            }
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .map(Some)
                .map_err(|_| malformed(format!("unparseable deadline `{}`", s)))
        }
        other => Err(malformed(format!("unparseable deadline `{}`", other))),
    }
}

/// Find the JSON object in a reply, tolerating code fences and stray prose.
fn extract_json_object(content: &str) -> Option<&str> {
    let start = content.find('{')?;
    let end = content.rfind('}')?;
    (end > start).then(|| &content[start..=end])
}

fn malformed(reason: impl Into<String>) -> ServiceError {
    ServiceError::MalformedOutput(reason.into())
}

/// Records analysis outcomes in the ledger and owns the cross-run retry policy.
#[derive(Clone)]
pub struct ResultAggregator {
    ledger: DedupLedger,
    max_attempts: u32,
    failed_cooldown: Duration,
}

impl ResultAggregator {
    pub fn new(ledger: DedupLedger, config: &PipelineConfig) -> Self {
        Self {
            ledger,
            max_attempts: config.max_attempts,
            failed_cooldown: Duration::from_secs(config.failed_cooldown_secs),
        }
    }

    /// Build the ledger record for an outcome, carrying `first_seen` and the
    /// attempt count forward from `prior`.
    ///
    /// Error records become `failed` with a cooldown marker; anything else
    /// becomes `analyzed`. Nothing is written until [`Self::commit`].
    pub fn stage(
        &self,
        entry: &RawEntry,
        analysis: &AnalysisRecord,
        prior: Option<&LedgerRecord>,
    ) -> LedgerRecord {
        let now = Utc::now();
        let failed = analysis.is_error();

        LedgerRecord {
            status: if failed {
                LedgerStatus::Failed
            } else {
                LedgerStatus::Analyzed
            },
            first_seen: prior.map(|p| p.first_seen).unwrap_or(now),
            last_attempt: now,
            attempts: prior.map(|p| p.attempts).unwrap_or(0).saturating_add(1),
            retry_not_before: failed.then(|| self.cooldown_until(now)),
            title: entry.title.clone(),
            link: entry.link.clone(),
            analysis: analysis.clone(),
        }
    }

    /// Write a run's staged records as one unit.
    pub async fn commit(
        &self,
        records: Vec<(Fingerprint, LedgerRecord)>,
    ) -> Result<(), StoreError> {
        let count = records.len();
        self.ledger.put_many(records).await?;
        debug!(records = count, "Recorded analysis outcomes");
        Ok(())
    }

    /// Whether a `failed` record may be analysed again at `now`.
    pub fn retry_due(&self, record: &LedgerRecord, now: DateTime<Utc>) -> bool {
        record.attempts < self.max_attempts
            && record.retry_not_before.map_or(true, |t| now >= t)
    }

    fn cooldown_until(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::from_std(self.failed_cooldown)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::fingerprint;

    #[test]
    fn test_normalize_full_payload() {
        let content = r#"{
            "classification": "deprecation",
            "summary": "Node.js 16 runtime is deprecated on Lambda.",
            "deadline": "2024-06-12",
            "confidence": 0.9,
            "impact": "Functions on nodejs16.x stop receiving updates",
            "actions": ["Upgrade to nodejs20.x", " "],
            "model_notes": "ignored"
        }"#;

        let record = normalize_payload(content, Some("resp-1".to_string())).unwrap();
        assert_eq!(record.classification, Classification::Deprecation);
        assert_eq!(record.deadline, NaiveDate::from_ymd_opt(2024, 6, 12));
        assert_eq!(record.confidence, Some(0.9));
        assert_eq!(record.actions, vec!["Upgrade to nodejs20.x".to_string()]);
        assert_eq!(record.response_id.as_deref(), Some("resp-1"));
        assert!(record.diagnostic.is_none());
    }

    #[test]
    fn test_normalize_fenced_payload() {
        let content = "```json\n{\"classification\": \"update\", \"summary\": \"Minor release.\"}\n```";
        let record = normalize_payload(content, None).unwrap();
        assert_eq!(record.classification, Classification::Update);
        assert!(record.deadline.is_none());
        assert!(record.actions.is_empty());
    }

    #[test]
    fn test_no_deadline_variants() {
        for deadline in [r#""No deadline""#, "null", r#""""#] {
            let content = format!(
                r#"{{"classification": "update", "summary": "s", "deadline": {}}}"#,
                deadline
            );
            let record = normalize_payload(&content, None).unwrap();
            assert!(record.deadline.is_none(), "deadline {}", deadline);
        }
    }

    #[test]
    fn test_unparseable_deadline_is_malformed() {
        let content = r#"{"classification": "update", "summary": "s", "deadline": "next spring"}"#;
        let err = normalize_payload(content, None).unwrap_err();
        assert!(matches!(err, ServiceError::MalformedOutput(ref m) if m.contains("deadline")));
    }

    #[test]
    fn test_missing_required_fields() {
        let err = normalize_payload(r#"{"summary": "s"}"#, None).unwrap_err();
        assert!(err.to_string().contains("classification"));

        let err = normalize_payload(r#"{"classification": "update"}"#, None).unwrap_err();
        assert!(err.to_string().contains("summary"));

        let err =
            normalize_payload(r#"{"classification": "error", "summary": "s"}"#, None).unwrap_err();
        assert!(err.to_string().contains("unknown classification"));
    }

    #[test]
    fn test_not_json() {
        assert!(matches!(
            normalize_payload("I cannot help with that.", None),
            Err(ServiceError::MalformedOutput(_))
        ));
        assert!(matches!(
            normalize_payload("{ broken", None),
            Err(ServiceError::MalformedOutput(_))
        ));
    }

    #[test]
    fn test_relevance_alias_is_clamped() {
        let content = r#"{"classification": "breaking_change", "summary": "s", "relevance": 7}"#;
        let record = normalize_payload(content, None).unwrap();
        assert_eq!(record.confidence, Some(1.0));
    }

    fn aggregator(ledger: &DedupLedger) -> ResultAggregator {
        let config = PipelineConfig {
            max_attempts: 2,
            failed_cooldown_secs: 600,
            ..PipelineConfig::default()
        };
        ResultAggregator::new(ledger.clone(), &config)
    }

    #[tokio::test]
    async fn test_stage_failure_then_success_keeps_first_seen() {
        let ledger = DedupLedger::in_memory();
        let aggregator = aggregator(&ledger);
        let entry = RawEntry::new("t", "https://l", "b");
        let key = fingerprint(&entry);

        let failed = aggregator.stage(&entry, &AnalysisRecord::error("boom"), None);
        assert_eq!(failed.status, LedgerStatus::Failed);
        assert_eq!(failed.attempts, 1);
        assert!(failed.retry_not_before.unwrap() > failed.last_attempt);
        assert!(ledger.get(&key).await.unwrap().is_none());

        let ok = normalize_payload(r#"{"classification":"update","summary":"s"}"#, None).unwrap();
        let analyzed = aggregator.stage(&entry, &ok, Some(&failed));
        assert_eq!(analyzed.status, LedgerStatus::Analyzed);
        assert_eq!(analyzed.attempts, 2);
        assert_eq!(analyzed.first_seen, failed.first_seen);
        assert!(analyzed.retry_not_before.is_none());

        aggregator
            .commit(vec![(key.clone(), analyzed.clone())])
            .await
            .unwrap();
        let stored = ledger.get(&key).await.unwrap().unwrap();
        assert_eq!(stored, analyzed);
    }

    #[tokio::test]
    async fn test_retry_due_respects_limit_and_cooldown() {
        let ledger = DedupLedger::in_memory();
        let aggregator = aggregator(&ledger);
        let entry = RawEntry::new("t", "https://l", "b");

        let failed = aggregator.stage(&entry, &AnalysisRecord::error("boom"), None);
        let now = failed.last_attempt;
        assert!(!aggregator.retry_due(&failed, now));
        assert!(aggregator.retry_due(&failed, now + chrono::Duration::seconds(601)));

        let exhausted = LedgerRecord {
            attempts: 2,
            ..failed
        };
        assert!(!aggregator.retry_due(&exhausted, now + chrono::Duration::days(1)));
    }
}
