//! Resilient analysis calls.
//!
//! [`AnalysisClient::analyze`] drives one request lineage through an explicit
//! state machine:
//!
//! ```text
//! Start ──ok──────────────▶ validate ──▶ Done
//!   │  ──malformed─────────────────────▶ Done(error)
//!   │  ──rate-limit / transport──▶ Backoff ──▶ Start
//!   └──input too large──────────▶ Truncate ──▶ Start
//! ```
//!
//! Backoff and truncation share one retry budget, so a lineage never makes
//! more than `budget + 1` attempts. Truncation happens at most once.

use super::aggregator::normalize_payload;
use super::prompt::AnalysisRequest;
use super::service::{ReasoningService, ServiceReply};
use crate::config::RetryConfig;
use crate::error::ServiceError;
use crate::models::AnalysisRecord;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// States of one request lineage.
#[derive(Debug)]
enum State {
    Start,
    Backoff(Duration),
    Truncate,
    Done(AnalysisRecord),
}

/// Per-lineage counters.
#[derive(Debug)]
struct Lineage {
    request: AnalysisRequest,
    attempts: u32,
    retries: u32,
}

/// Client for the reasoning service with retry, backoff and truncation.
#[derive(Clone)]
pub struct AnalysisClient {
    service: Arc<dyn ReasoningService>,
    retry: RetryConfig,
}

impl AnalysisClient {
    pub fn new(service: Arc<dyn ReasoningService>, retry: RetryConfig) -> Self {
        Self { service, retry }
    }

    pub fn model_name(&self) -> String {
        self.service.model_name()
    }

    /// Analyse one request. Every failure ends in an error record; this
    /// never returns early with a raw service error.
    pub async fn analyze(&self, request: AnalysisRequest) -> AnalysisRecord {
        let mut lineage = Lineage {
            request,
            attempts: 0,
            retries: 0,
        };
        let mut state = State::Start;

        loop {
            state = match state {
                State::Start => {
                    lineage.attempts += 1;
                    let outcome = self.service.complete(&lineage.request).await;
                    self.transition(&mut lineage, outcome)
                }
                State::Backoff(delay) => {
                    tokio::time::sleep(delay).await;
                    State::Start
                }
                State::Truncate => {
                    lineage.request = lineage.request.truncated(self.retry.truncate_to_chars);
                    debug!(
                        chars = lineage.request.body.chars().count(),
                        "Truncated request body"
                    );
                    State::Start
                }
                State::Done(record) => {
                    debug!(
                        attempts = lineage.attempts,
                        classification = %record.classification,
                        "Analysis finished"
                    );
                    return record;
                }
            };
        }
    }

    fn transition(
        &self,
        lineage: &mut Lineage,
        outcome: Result<ServiceReply, ServiceError>,
    ) -> State {
        let error = match outcome {
            Ok(reply) => {
                return match normalize_payload(&reply.content, reply.id) {
                    Ok(record) => State::Done(record),
                    Err(e) => State::Done(AnalysisRecord::error(e.to_string())),
                }
            }
            Err(e) => e,
        };

        let budget_left = lineage.retries < self.retry.budget;

        match error {
            ServiceError::MalformedOutput(_) => State::Done(AnalysisRecord::error(error.to_string())),

            ServiceError::RateLimited { retry_after } => {
                if !budget_left {
                    return State::Done(AnalysisRecord::error(
                        "rate-limited: retry budget exhausted",
                    ));
                }
                let delay = self.delay(lineage.retries, retry_after);
                lineage.retries += 1;
                warn!(
                    attempt = lineage.attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Rate limited, backing off"
                );
                State::Backoff(delay)
            }

            ServiceError::Transport(reason) => {
                if !budget_left {
                    return State::Done(AnalysisRecord::error(format!(
                        "transport error: retry budget exhausted ({})",
                        reason
                    )));
                }
                let delay = self.delay(lineage.retries, None);
                lineage.retries += 1;
                warn!(
                    attempt = lineage.attempts,
                    delay_ms = delay.as_millis() as u64,
                    %reason,
                    "Transport error, backing off"
                );
                State::Backoff(delay)
            }

            ServiceError::InputTooLarge(_) if lineage.request.truncated => State::Done(
                AnalysisRecord::error("content too large after truncation"),
            ),

            ServiceError::InputTooLarge(_) if !budget_left => State::Done(AnalysisRecord::error(
                "content too large: retry budget exhausted",
            )),

            ServiceError::InputTooLarge(_) => {
                lineage.retries += 1;
                warn!(attempt = lineage.attempts, "Input too large, truncating");
                State::Truncate
            }
        }
    }

    /// Delay before re-issue number `retry` (0-based): `base * 2^retry`,
    /// raised to the server hint if larger, never above the cap.
    fn delay(&self, retry: u32, retry_after: Option<Duration>) -> Duration {
        let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
        let exponential = self.retry.backoff_base().saturating_mul(factor);
        exponential
            .max(retry_after.unwrap_or_default())
            .min(self.retry.backoff_cap())
    }
}
