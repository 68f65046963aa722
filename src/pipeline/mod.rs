//! Pipeline orchestration.
//!
//! Drives a run's entries through prefilter → fingerprint → dedup check →
//! analysis → recording, with bounded concurrency, and hands the resulting
//! batch to the report and notification collaborators.
//!
//! Outcomes are staged while the run fans out and written to the ledger in
//! one `put_many` once every job has finished. A store failure anywhere in
//! the run therefore leaves the ledger as it was, and the entries are picked
//! up again by the next run.
//!
//! Two mechanisms keep a fingerprint from being analysed twice:
//! - within a run, repeats are dropped in submission order before fan-out;
//! - across concurrent runs sharing an orchestrator, a per-fingerprint lock
//!   serialises the ledger read and the analysis, and a record staged by
//!   one run counts as a ledger hit for the others until it is committed.

pub mod control;

pub use control::RunControl;

use crate::analysis::{AnalysisClient, AnalysisRequest, ResultAggregator};
use crate::config::PipelineConfig;
use crate::error::{PipelineError, StoreError};
use crate::feeds::matches_keywords;
use crate::fingerprint::fingerprint;
use crate::ledger::DedupLedger;
use crate::models::{
    Batch, BatchItem, Fingerprint, LedgerRecord, LedgerStatus, RawEntry, RunSummary,
};
use crate::notify::{build_summary_message, Notifier};
use crate::report::{ReportArtifact, ReportSink};
use chrono::Utc;
use futures::stream::{self, StreamExt, TryStreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Result of one completed run after dispatch.
#[derive(Debug)]
pub struct RunOutcome {
    pub batch: Batch,
    pub summary: RunSummary,
    pub artifact: Option<ReportArtifact>,
    pub notified: bool,
}

/// Work item after the sequential pre-pass.
struct Job {
    index: usize,
    fingerprint: Fingerprint,
    entry: RawEntry,
}

/// What happened to one job.
enum JobOutcome {
    Processed(BatchItem, LedgerRecord),
    AlreadyAnalyzed,
    FailedSkipped,
    Cancelled,
}

/// Per-fingerprint async locks. Entries are removed once nobody holds them.
#[derive(Default)]
struct KeyLocks {
    locks: Mutex<HashMap<Fingerprint, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyLocks {
    fn acquire(&self, key: &Fingerprint) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(key.clone()).or_default().clone()
    }

    fn release(&self, key: &Fingerprint, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        // One reference in the map, one held by the caller.
        if Arc::strong_count(&lock) <= 2 {
            locks.remove(key);
        }
    }
}

/// Runs batches of entries through the analysis pipeline.
pub struct Orchestrator {
    ledger: DedupLedger,
    client: AnalysisClient,
    aggregator: ResultAggregator,
    config: PipelineConfig,
    max_body_chars: usize,
    locks: KeyLocks,
    /// Records analysed but not yet committed, tagged with the owning run.
    staged: Mutex<HashMap<Fingerprint, (u64, LedgerRecord)>>,
    next_run: AtomicU64,
}

/// Entries a run would send for analysis, without analysing them.
#[derive(Debug, Default)]
pub struct RunPreview {
    pub pending: Vec<RawEntry>,
    pub summary: RunSummary,
}

impl Orchestrator {
    pub fn new(
        ledger: DedupLedger,
        client: AnalysisClient,
        config: PipelineConfig,
        max_body_chars: usize,
    ) -> Self {
        let aggregator = ResultAggregator::new(ledger.clone(), &config);
        Self {
            ledger,
            client,
            aggregator,
            config,
            max_body_chars,
            locks: KeyLocks::default(),
            staged: Mutex::new(HashMap::new()),
            next_run: AtomicU64::new(0),
        }
    }

    /// Process `entries` and return the batch in submission order.
    ///
    /// Per-entry failures become error records in the batch. Only a ledger
    /// store failure aborts the run.
    pub async fn run(
        &self,
        entries: Vec<RawEntry>,
        control: &RunControl,
    ) -> Result<(Batch, RunSummary), PipelineError> {
        let started = Instant::now();
        let mut summary = RunSummary {
            started_at: Some(Utc::now()),
            received: entries.len(),
            ..RunSummary::default()
        };

        let jobs = self.plan(entries, &mut summary);

        info!(
            received = summary.received,
            filtered = summary.filtered,
            queued = jobs.len(),
            concurrency = self.config.concurrency,
            "Starting run"
        );

        let run_id = self.next_run.fetch_add(1, Ordering::Relaxed);
        let result = self.fan_out(run_id, jobs, control).await;
        let committed = match result {
            Ok(mut outcomes) => {
                outcomes.sort_by_key(|(index, _)| *index);
                let writes: Vec<(Fingerprint, LedgerRecord)> = outcomes
                    .iter()
                    .filter_map(|(_, outcome)| match outcome {
                        JobOutcome::Processed(item, record) => {
                            Some((item.fingerprint.clone(), record.clone()))
                        }
                        _ => None,
                    })
                    .collect();
                self.aggregator.commit(writes).await.map(|()| outcomes)
            }
            Err(e) => Err(e),
        };
        self.unstage(run_id);

        let outcomes = committed.map_err(|e| {
            error!("Aborting run; no outcomes were recorded: {}", e);
            PipelineError::from(e)
        })?;

        let mut batch = Batch::default();
        for (_, outcome) in outcomes {
            match outcome {
                JobOutcome::Processed(item, _) => {
                    summary.analyzed += 1;
                    if item.record.is_error() {
                        summary.errors += 1;
                    }
                    batch.items.push(item);
                }
                JobOutcome::AlreadyAnalyzed => summary.duplicates += 1,
                JobOutcome::FailedSkipped => summary.failed_skipped += 1,
                JobOutcome::Cancelled => summary.cancelled_skipped += 1,
            }
        }
        summary.cancelled = control.is_cancelled();
        summary.duration_seconds = started.elapsed().as_secs_f64();

        info!(
            analyzed = summary.analyzed,
            errors = summary.errors,
            duplicates = summary.duplicates,
            failed_skipped = summary.failed_skipped,
            cancelled_skipped = summary.cancelled_skipped,
            "Run finished"
        );

        Ok((batch, summary))
    }

    /// Report which entries a run would analyse, reading the ledger but
    /// never writing to it and never calling the reasoning service.
    pub async fn preview(&self, entries: Vec<RawEntry>) -> Result<RunPreview, PipelineError> {
        let mut summary = RunSummary {
            started_at: Some(Utc::now()),
            received: entries.len(),
            ..RunSummary::default()
        };
        let jobs = self.plan(entries, &mut summary);

        let mut pending = Vec::new();
        for job in jobs {
            let prior = self.ledger.get(&job.fingerprint).await?;
            match self.skip_reason(prior.as_ref()) {
                Some(JobOutcome::FailedSkipped) => summary.failed_skipped += 1,
                Some(_) => summary.duplicates += 1,
                None => pending.push(job.entry),
            }
        }
        Ok(RunPreview { pending, summary })
    }

    /// Sequential pre-pass: keyword prefilter and in-run duplicates.
    fn plan(&self, entries: Vec<RawEntry>, summary: &mut RunSummary) -> Vec<Job> {
        let mut seen = HashSet::new();
        let mut jobs = Vec::new();
        for (index, entry) in entries.into_iter().enumerate() {
            if self.config.keyword_prefilter && !matches_keywords(&entry, &self.config.keywords) {
                summary.filtered += 1;
                continue;
            }
            let key = fingerprint(&entry);
            if !seen.insert(key.clone()) {
                debug!(fingerprint = key.short(), "Duplicate entry within run");
                summary.duplicates += 1;
                continue;
            }
            jobs.push(Job {
                index,
                fingerprint: key,
                entry,
            });
        }
        jobs
    }

    async fn fan_out(
        &self,
        run_id: u64,
        jobs: Vec<Job>,
        control: &RunControl,
    ) -> Result<Vec<(usize, JobOutcome)>, StoreError> {
        stream::iter(jobs)
            .map(|job| self.process(run_id, job, control))
            .buffer_unordered(self.config.concurrency.max(1))
            .try_collect()
            .await
    }

    /// Why a job with this prior record needs no analysis, if it doesn't.
    fn skip_reason(&self, prior: Option<&LedgerRecord>) -> Option<JobOutcome> {
        let prior = prior?;
        match prior.status {
            LedgerStatus::Analyzed => Some(JobOutcome::AlreadyAnalyzed),
            LedgerStatus::Failed if !self.aggregator.retry_due(prior, Utc::now()) => {
                Some(JobOutcome::FailedSkipped)
            }
            LedgerStatus::Failed | LedgerStatus::Pending => None,
        }
    }

    fn staged_record(&self, key: &Fingerprint) -> Option<LedgerRecord> {
        let staged = self.staged.lock().unwrap_or_else(|e| e.into_inner());
        staged.get(key).map(|(_, record)| record.clone())
    }

    fn stage(&self, run_id: u64, key: &Fingerprint, record: LedgerRecord) {
        let mut staged = self.staged.lock().unwrap_or_else(|e| e.into_inner());
        staged.insert(key.clone(), (run_id, record));
    }

    fn unstage(&self, run_id: u64) {
        let mut staged = self.staged.lock().unwrap_or_else(|e| e.into_inner());
        staged.retain(|_, (owner, _)| *owner != run_id);
    }

    /// Run, then write the report and send one notification. Nothing is
    /// dispatched when the run aborts or the batch is empty.
    pub async fn run_and_dispatch(
        &self,
        entries: Vec<RawEntry>,
        control: &RunControl,
        sink: &dyn ReportSink,
        notifier: &dyn Notifier,
    ) -> Result<RunOutcome, PipelineError> {
        let (batch, summary) = self.run(entries, control).await?;

        if batch.is_empty() {
            info!("No new entries; skipping report and notification");
            return Ok(RunOutcome {
                batch,
                summary,
                artifact: None,
                notified: false,
            });
        }

        let artifact = match sink.write(&batch, &summary) {
            Ok(artifact) => Some(artifact),
            Err(e) => {
                error!("Failed to write report: {:#}", e);
                None
            }
        };

        let message = build_summary_message(&batch, &summary, artifact.as_ref());
        let notified = match notifier.notify(&message).await {
            Ok(()) => true,
            Err(e) => {
                warn!(notifier = notifier.name(), "Notification failed: {:#}", e);
                false
            }
        };

        Ok(RunOutcome {
            batch,
            summary,
            artifact,
            notified,
        })
    }

    async fn process(
        &self,
        run_id: u64,
        job: Job,
        control: &RunControl,
    ) -> Result<(usize, JobOutcome), StoreError> {
        if control.is_cancelled() {
            return Ok((job.index, JobOutcome::Cancelled));
        }

        let lock = self.locks.acquire(&job.fingerprint);
        let outcome = {
            let _guard = lock.lock().await;
            self.process_locked(run_id, &job, control).await
        };
        self.locks.release(&job.fingerprint, lock);

        outcome.map(|o| (job.index, o))
    }

    async fn process_locked(
        &self,
        run_id: u64,
        job: &Job,
        control: &RunControl,
    ) -> Result<JobOutcome, StoreError> {
        let key = &job.fingerprint;
        // Staged first: a concurrent run removes its staged record only
        // after committing it.
        let prior = match self.staged_record(key) {
            Some(record) => Some(record),
            None => self.ledger.get(key).await?,
        };

        if let Some(skip) = self.skip_reason(prior.as_ref()) {
            debug!(fingerprint = key.short(), "Skipping; already handled");
            return Ok(skip);
        }

        if control.is_cancelled() {
            return Ok(JobOutcome::Cancelled);
        }

        let request =
            AnalysisRequest::from_entry(&job.entry, &self.config.keywords, self.max_body_chars);
        let record = self.client.analyze(request).await;
        if let Some(ref diagnostic) = record.diagnostic {
            warn!(
                fingerprint = key.short(),
                title = %job.entry.title,
                %diagnostic,
                "Analysis failed"
            );
        }

        let staged = self.aggregator.stage(&job.entry, &record, prior.as_ref());
        self.stage(run_id, key, staged.clone());

        Ok(JobOutcome::Processed(
            BatchItem {
                fingerprint: key.clone(),
                entry: job.entry.clone(),
                record,
            },
            staged,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::testing::{reply, ScriptedService};
    use crate::analysis::service::ServiceReply;
    use crate::config::{ReportFormat, RetryConfig};
    use crate::error::ServiceError;
    use crate::ledger::testing::FlakyStore;
    use crate::models::{AnalysisRecord, Classification};
    use anyhow::Result as AnyResult;
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_test::assert_ok;

    #[derive(Default)]
    struct CountingSink {
        writes: AtomicUsize,
    }

    impl ReportSink for CountingSink {
        fn write(&self, _batch: &Batch, _summary: &RunSummary) -> AnyResult<ReportArtifact> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(ReportArtifact {
                path: PathBuf::from("report.md"),
                format: ReportFormat::Markdown,
            })
        }
    }

    #[derive(Default)]
    struct CountingNotifier {
        sent: AtomicUsize,
    }

    #[async_trait]
    impl Notifier for CountingNotifier {
        async fn notify(&self, _message: &str) -> AnyResult<()> {
            self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn name(&self) -> &'static str {
            "counting"
        }
    }

    fn pipeline_config(concurrency: usize) -> PipelineConfig {
        PipelineConfig {
            concurrency,
            keywords: Vec::new(),
            keyword_prefilter: true,
            max_attempts: 3,
            failed_cooldown_secs: 0,
            run_timeout_secs: 0,
        }
    }

    fn orchestrator(
        ledger: &DedupLedger,
        service: &Arc<ScriptedService>,
        config: PipelineConfig,
    ) -> Orchestrator {
        let retry = RetryConfig {
            budget: 2,
            backoff_base_ms: 1,
            backoff_cap_ms: 2,
            ..RetryConfig::default()
        };
        let client = AnalysisClient::new(service.clone(), retry);
        Orchestrator::new(ledger.clone(), client, config, 10_000)
    }

    fn entries() -> Vec<RawEntry> {
        vec![
            RawEntry::new("Lambda drops Node 16", "https://aws/lambda", "Node 16 EOL."),
            RawEntry::new("S3 new storage class", "https://aws/s3", "Cheaper storage."),
            RawEntry::new("RDS MySQL 5.7 end of life", "https://aws/rds", "Upgrade to 8.0."),
        ]
    }

    #[tokio::test]
    async fn test_second_run_skips_analyzed_entries() {
        let ledger = DedupLedger::in_memory();
        let service = Arc::new(ScriptedService::always(reply("update")));
        let pipeline = orchestrator(&ledger, &service, pipeline_config(4));

        let (batch, summary) = pipeline.run(entries(), &RunControl::new()).await.unwrap();
        assert_eq!(batch.len(), 3);
        assert_eq!(summary.analyzed, 3);
        assert_eq!(service.calls(), 3);

        let (batch, summary) = pipeline.run(entries(), &RunControl::new()).await.unwrap();
        assert!(batch.is_empty());
        assert_eq!(summary.duplicates, 3);
        assert_eq!(service.calls(), 3);
    }

    #[tokio::test]
    async fn test_republished_entry_is_analyzed_once() {
        let ledger = DedupLedger::in_memory();
        let service = Arc::new(ScriptedService::always(reply("deprecation")));
        let pipeline = orchestrator(&ledger, &service, pipeline_config(4));

        let entry = RawEntry::new("Lambda drops Node 16", "https://aws/lambda", "Node 16 EOL.");
        let reformatted = RawEntry::new("  lambda drops  NODE 16", "https://aws/lambda/", "node 16 eol.");
        let input = vec![entry.clone(), entry.clone(), reformatted];

        let (batch, summary) = pipeline.run(input, &RunControl::new()).await.unwrap();

        assert_eq!(batch.len(), 1);
        assert_eq!(summary.duplicates, 2);
        assert_eq!(service.calls(), 1);
    }

    #[tokio::test]
    async fn test_batch_keeps_submission_order() {
        let ledger = DedupLedger::in_memory();
        let service = Arc::new(ScriptedService::always(reply("update")));
        let pipeline = orchestrator(&ledger, &service, pipeline_config(3));

        let (batch, _) = pipeline.run(entries(), &RunControl::new()).await.unwrap();

        let titles: Vec<&str> = batch.items.iter().map(|i| i.entry.title.as_str()).collect();
        assert_eq!(
            titles,
            vec!["Lambda drops Node 16", "S3 new storage class", "RDS MySQL 5.7 end of life"]
        );
    }

    #[tokio::test]
    async fn test_failed_analysis_stays_visible() {
        let ledger = DedupLedger::in_memory();
        let service = Arc::new(ScriptedService::responding(|request| {
            if request.title.contains("S3") {
                Ok(ServiceReply {
                    id: None,
                    content: "Sorry, I can't classify this.".to_string(),
                })
            } else {
                reply("breaking_change")
            }
        }));
        let pipeline = orchestrator(&ledger, &service, pipeline_config(2));

        let (batch, summary) = pipeline.run(entries(), &RunControl::new()).await.unwrap();

        assert_eq!(batch.len(), 3);
        assert_eq!(summary.errors, 1);
        let failed: Vec<&BatchItem> = batch.errors().collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].entry.title, "S3 new storage class");
        assert!(!failed[0].record.diagnostic.as_deref().unwrap().is_empty());
        assert_eq!(batch.count(Classification::BreakingChange), 2);

        let stored = ledger.get(&failed[0].fingerprint).await.unwrap().unwrap();
        assert_eq!(stored.status, LedgerStatus::Failed);
        assert_eq!(stored.attempts, 1);
    }

    #[tokio::test]
    async fn test_failed_entry_retries_are_bounded() {
        let ledger = DedupLedger::in_memory();
        let service = Arc::new(ScriptedService::always(Err(ServiceError::MalformedOutput(
            "no choices".to_string(),
        ))));
        let config = PipelineConfig {
            max_attempts: 2,
            ..pipeline_config(1)
        };
        let pipeline = orchestrator(&ledger, &service, config);
        let input = || vec![RawEntry::new("Broken", "https://x/broken", "body")];

        let (batch, _) = pipeline.run(input(), &RunControl::new()).await.unwrap();
        assert_eq!(batch.errors().count(), 1);

        let (batch, _) = pipeline.run(input(), &RunControl::new()).await.unwrap();
        assert_eq!(batch.errors().count(), 1);
        assert_eq!(service.calls(), 2);

        let (batch, summary) = pipeline.run(input(), &RunControl::new()).await.unwrap();
        assert!(batch.is_empty());
        assert_eq!(summary.failed_skipped, 1);
        assert_eq!(service.calls(), 2);
    }

    #[tokio::test]
    async fn test_failed_entry_waits_for_cooldown() {
        let ledger = DedupLedger::in_memory();
        let service = Arc::new(ScriptedService::always(Err(ServiceError::MalformedOutput(
            "no choices".to_string(),
        ))));
        let config = PipelineConfig {
            failed_cooldown_secs: 3_600,
            ..pipeline_config(1)
        };
        let pipeline = orchestrator(&ledger, &service, config);
        let input = || vec![RawEntry::new("Broken", "https://x/broken", "body")];

        pipeline.run(input(), &RunControl::new()).await.unwrap();
        let (batch, summary) = pipeline.run(input(), &RunControl::new()).await.unwrap();

        assert!(batch.is_empty());
        assert_eq!(summary.failed_skipped, 1);
        assert_eq!(service.calls(), 1);
    }

    #[tokio::test]
    async fn test_pending_record_is_reanalyzed() {
        let ledger = DedupLedger::in_memory();
        let service = Arc::new(ScriptedService::always(reply("update")));
        let pipeline = orchestrator(&ledger, &service, pipeline_config(1));
        let entry = RawEntry::new("Half done", "https://x/pending", "body");
        let key = fingerprint(&entry);
        let now = Utc::now();
        let pending = LedgerRecord {
            status: LedgerStatus::Pending,
            first_seen: now,
            last_attempt: now,
            attempts: 0,
            retry_not_before: None,
            title: entry.title.clone(),
            link: entry.link.clone(),
            analysis: AnalysisRecord::error("interrupted"),
        };
        ledger.put(&key, pending).await.unwrap();

        let (batch, _) = pipeline.run(vec![entry], &RunControl::new()).await.unwrap();

        assert_eq!(batch.len(), 1);
        let stored = ledger.get(&key).await.unwrap().unwrap();
        assert_eq!(stored.status, LedgerStatus::Analyzed);
        assert_eq!(stored.first_seen, now);
    }

    #[tokio::test]
    async fn test_store_outage_aborts_without_dispatch() {
        let store = Arc::new(FlakyStore::down());
        let ledger = DedupLedger::new(store.clone());
        let service = Arc::new(ScriptedService::always(reply("update")));
        let pipeline = orchestrator(&ledger, &service, pipeline_config(2));
        let sink = CountingSink::default();
        let notifier = CountingNotifier::default();

        let result = pipeline
            .run_and_dispatch(entries(), &RunControl::new(), &sink, &notifier)
            .await;

        assert!(matches!(result, Err(PipelineError::StoreUnavailable(_))));
        assert_eq!(sink.writes.load(Ordering::SeqCst), 0);
        assert_eq!(notifier.sent.load(Ordering::SeqCst), 0);
        assert_eq!(store.puts.load(Ordering::SeqCst), 0);
        assert_eq!(service.calls(), 0);
    }

    #[tokio::test]
    async fn test_dispatch_once_per_run() {
        let ledger = DedupLedger::in_memory();
        let service = Arc::new(ScriptedService::always(reply("deprecation")));
        let pipeline = orchestrator(&ledger, &service, pipeline_config(2));
        let sink = CountingSink::default();
        let notifier = CountingNotifier::default();

        let outcome = pipeline
            .run_and_dispatch(entries(), &RunControl::new(), &sink, &notifier)
            .await;
        let outcome = assert_ok!(outcome);
        assert_eq!(outcome.batch.len(), 3);
        assert!(outcome.notified);
        assert_eq!(outcome.artifact.unwrap().path, PathBuf::from("report.md"));
        assert_eq!(sink.writes.load(Ordering::SeqCst), 1);
        assert_eq!(notifier.sent.load(Ordering::SeqCst), 1);

        // Nothing new: no second report, no second notification.
        let outcome = assert_ok!(
            pipeline
                .run_and_dispatch(entries(), &RunControl::new(), &sink, &notifier)
                .await
        );
        assert!(outcome.batch.is_empty());
        assert!(!outcome.notified);
        assert_eq!(sink.writes.load(Ordering::SeqCst), 1);
        assert_eq!(notifier.sent.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_keyword_prefilter() {
        let ledger = DedupLedger::in_memory();
        let service = Arc::new(ScriptedService::always(reply("update")));
        let config = PipelineConfig {
            keywords: vec!["lambda".to_string(), "MySQL".to_string()],
            ..pipeline_config(2)
        };
        let pipeline = orchestrator(&ledger, &service, config);

        let (batch, summary) = pipeline.run(entries(), &RunControl::new()).await.unwrap();

        assert_eq!(batch.len(), 2);
        assert_eq!(summary.filtered, 1);
        assert_eq!(service.calls(), 2);
        assert!(service.requests()[0].instruction().contains("lambda, MySQL"));
    }

    #[tokio::test]
    async fn test_cancelled_run_starts_nothing() {
        let ledger = DedupLedger::in_memory();
        let service = Arc::new(ScriptedService::always(reply("update")));
        let pipeline = orchestrator(&ledger, &service, pipeline_config(2));
        let control = RunControl::new();
        control.cancel();

        let (batch, summary) = pipeline.run(entries(), &control).await.unwrap();

        assert!(batch.is_empty());
        assert!(summary.cancelled);
        assert_eq!(summary.cancelled_skipped, 3);
        assert_eq!(service.calls(), 0);
    }

    #[tokio::test]
    async fn test_cancel_mid_run_keeps_finished_work() {
        let ledger = DedupLedger::in_memory();
        let control = RunControl::new();
        let trigger = control.clone();
        let service = Arc::new(ScriptedService::responding(move |_| {
            trigger.cancel();
            reply("update")
        }));
        let pipeline = orchestrator(&ledger, &service, pipeline_config(1));

        let (batch, summary) = pipeline.run(entries(), &control).await.unwrap();

        assert_eq!(batch.len(), 1);
        assert_eq!(summary.cancelled_skipped, 2);
        let recorded = ledger.exists(&batch.items[0].fingerprint).await.unwrap();
        assert!(recorded);
        let skipped = fingerprint(&entries()[1]);
        assert!(!ledger.exists(&skipped).await.unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_runs_share_one_analysis() {
        let ledger = DedupLedger::in_memory();
        let service = Arc::new(ScriptedService::always(reply("update")));
        let pipeline = orchestrator(&ledger, &service, pipeline_config(4));
        let control = RunControl::new();

        let (a, b) = tokio::join!(
            pipeline.run(entries(), &control),
            pipeline.run(entries(), &control)
        );
        let (a, b) = (a.unwrap().0, b.unwrap().0);

        assert_eq!(a.len() + b.len(), 3);
        assert_eq!(service.calls(), 3);
    }

    #[tokio::test]
    async fn test_store_failure_mid_run_records_nothing() {
        // Reads succeed for the first entry, then the store goes away.
        let store = Arc::new(FlakyStore::failing_after_reads(1));
        let ledger = DedupLedger::new(store.clone());
        let service = Arc::new(ScriptedService::always(reply("breaking_change")));
        let pipeline = orchestrator(&ledger, &service, pipeline_config(1));
        let sink = CountingSink::default();
        let notifier = CountingNotifier::default();

        let result = pipeline
            .run_and_dispatch(entries(), &RunControl::new(), &sink, &notifier)
            .await;
        assert!(matches!(result, Err(PipelineError::StoreUnavailable(_))));
        assert_eq!(service.calls(), 1);
        assert_eq!(store.puts.load(Ordering::SeqCst), 0);
        assert_eq!(notifier.sent.load(Ordering::SeqCst), 0);

        store.restore();
        let outcome = assert_ok!(
            pipeline
                .run_and_dispatch(entries(), &RunControl::new(), &sink, &notifier)
                .await
        );
        let titles: Vec<&str> = outcome.batch.items.iter().map(|i| i.entry.title.as_str()).collect();
        assert_eq!(
            titles,
            vec!["Lambda drops Node 16", "S3 new storage class", "RDS MySQL 5.7 end of life"]
        );
        assert_eq!(outcome.summary.duplicates, 0);
        assert_eq!(notifier.sent.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_commit_leaves_entries_for_next_run() {
        let store = Arc::new(FlakyStore::failing_after_writes(0));
        let ledger = DedupLedger::new(store.clone());
        let service = Arc::new(ScriptedService::always(reply("deprecation")));
        let pipeline = orchestrator(&ledger, &service, pipeline_config(2));
        let sink = CountingSink::default();
        let notifier = CountingNotifier::default();

        let result = pipeline
            .run_and_dispatch(entries(), &RunControl::new(), &sink, &notifier)
            .await;
        assert!(matches!(result, Err(PipelineError::StoreUnavailable(_))));
        assert_eq!(store.puts.load(Ordering::SeqCst), 0);
        assert_eq!(sink.writes.load(Ordering::SeqCst), 0);

        store.restore();
        let outcome = assert_ok!(
            pipeline
                .run_and_dispatch(entries(), &RunControl::new(), &sink, &notifier)
                .await
        );
        assert_eq!(outcome.batch.len(), 3);
        assert_eq!(store.puts.load(Ordering::SeqCst), 3);
        assert_eq!(service.calls(), 6);
    }

    #[tokio::test]
    async fn test_run_writes_ledger_once() {
        // One write call is allowed; a run must fit in it.
        let store = Arc::new(FlakyStore::failing_after_writes(1));
        let ledger = DedupLedger::new(store.clone());
        let service = Arc::new(ScriptedService::always(reply("update")));
        let pipeline = orchestrator(&ledger, &service, pipeline_config(1));

        let (batch, _) = pipeline.run(entries(), &RunControl::new()).await.unwrap();
        assert_eq!(batch.len(), 3);
        assert_eq!(store.puts.load(Ordering::SeqCst), 3);

        let (batch, summary) = pipeline.run(entries(), &RunControl::new()).await.unwrap();
        assert!(batch.is_empty());
        assert_eq!(summary.duplicates, 3);
    }

    #[tokio::test]
    async fn test_preview_matches_run_decisions() {
        let ledger = DedupLedger::in_memory();
        let service = Arc::new(ScriptedService::responding(|request| {
            if request.title.contains("S3") {
                Err(ServiceError::MalformedOutput("no choices".to_string()))
            } else {
                reply("update")
            }
        }));
        let config = PipelineConfig {
            max_attempts: 3,
            ..pipeline_config(2)
        };
        let pipeline = orchestrator(&ledger, &service, config);
        pipeline.run(entries(), &RunControl::new()).await.unwrap();

        let mut input = entries();
        input.push(RawEntry::new("Brand new", "https://aws/new", "Fresh."));
        input.push(RawEntry::new("Brand new", "https://aws/new", "Fresh."));
        let preview = pipeline.preview(input).await.unwrap();

        let pending: Vec<&str> = preview.pending.iter().map(|e| e.title.as_str()).collect();
        // The failed entry is due again (no cooldown); the analysed ones are not.
        assert_eq!(pending, vec!["S3 new storage class", "Brand new"]);
        assert_eq!(preview.summary.duplicates, 3);
        assert_eq!(preview.summary.received, 5);
        assert_eq!(service.calls(), 3);
    }
}
