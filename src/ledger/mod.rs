//! Dedup ledger.
//!
//! The ledger maps an entry fingerprint to the last known outcome of
//! analysing it. Every `put` replaces the whole record; callers that need
//! to carry fields forward (first-seen time, attempt count) read the old
//! record and merge before writing. A run's outcomes are written together
//! through `put_many` once the run has finished analysing.

pub mod file;
pub mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use crate::config::{LedgerConfig, LedgerKind};
use crate::error::StoreError;
use crate::models::{Fingerprint, LedgerRecord};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Key/value upsert store backing the ledger.
///
/// Implementations must give read-your-writes consistency within a process
/// and replace values whole.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn get(&self, key: &Fingerprint) -> Result<Option<LedgerRecord>, StoreError>;

    async fn put(&self, key: &Fingerprint, record: LedgerRecord) -> Result<(), StoreError>;

    async fn contains(&self, key: &Fingerprint) -> Result<bool, StoreError> {
        Ok(self.get(key).await?.is_some())
    }

    /// Write several records as one unit: either all of them land or none.
    ///
    /// The default writes one by one and is only all-or-nothing for stores
    /// whose `put` cannot fail part way through a batch.
    async fn put_many(&self, records: Vec<(Fingerprint, LedgerRecord)>) -> Result<(), StoreError> {
        for (key, record) in records {
            self.put(&key, record).await?;
        }
        Ok(())
    }

    /// Backend name for log lines.
    fn name(&self) -> &'static str;
}

/// Thin handle over a shared store.
#[derive(Clone)]
pub struct DedupLedger {
    store: Arc<dyn LedgerStore>,
}

impl DedupLedger {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    /// Open the backend selected in configuration.
    pub fn open(config: &LedgerConfig) -> Result<Self, StoreError> {
        let ledger = match config.kind {
            LedgerKind::Memory => Self::in_memory(),
            LedgerKind::File => {
                let store = FileStore::open(Path::new(&config.path))?;
                info!(path = %store.path().display(), "Using file ledger");
                Self::new(Arc::new(store))
            }
        };
        info!(backend = ledger.backend(), "Opened dedup ledger");
        Ok(ledger)
    }

    #[allow(dead_code)] // Membership only; runs need the status from `get`
    pub async fn exists(&self, key: &Fingerprint) -> Result<bool, StoreError> {
        self.store.contains(key).await
    }

    pub async fn get(&self, key: &Fingerprint) -> Result<Option<LedgerRecord>, StoreError> {
        self.store.get(key).await
    }

    #[allow(dead_code)] // Single upsert; runs commit through `put_many`
    pub async fn put(&self, key: &Fingerprint, record: LedgerRecord) -> Result<(), StoreError> {
        self.store.put(key, record).await
    }

    pub async fn put_many(
        &self,
        records: Vec<(Fingerprint, LedgerRecord)>,
    ) -> Result<(), StoreError> {
        if records.is_empty() {
            return Ok(());
        }
        self.store.put_many(records).await
    }

    pub fn backend(&self) -> &'static str {
        self.store.name()
    }
}
