//! Entry analysis.
//!
//! - [`prompt`] builds the request sent for an entry.
//! - [`service`] talks to the reasoning service.
//! - [`client`] wraps it in the retry/backoff/truncation state machine.
//! - [`aggregator`] validates replies and records outcomes in the ledger.

pub mod aggregator;
pub mod client;
pub mod prompt;
pub mod service;

pub use aggregator::ResultAggregator;
pub use client::AnalysisClient;
pub use prompt::AnalysisRequest;
pub use service::OpenAiCompatibleService;
