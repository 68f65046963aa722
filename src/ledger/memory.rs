//! In-process ledger store.

use super::LedgerStore;
use crate::error::StoreError;
use crate::models::{Fingerprint, LedgerRecord};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;

#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<Fingerprint, LedgerRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn get(&self, key: &Fingerprint) -> Result<Option<LedgerRecord>, StoreError> {
        let records = self
            .records
            .read()
            .map_err(|_| StoreError::unavailable("memory store lock poisoned"))?;
        Ok(records.get(key).cloned())
    }

    async fn put(&self, key: &Fingerprint, record: LedgerRecord) -> Result<(), StoreError> {
        let mut records = self
            .records
            .write()
            .map_err(|_| StoreError::unavailable("memory store lock poisoned"))?;
        records.insert(key.clone(), record);
        Ok(())
    }

    async fn put_many(&self, batch: Vec<(Fingerprint, LedgerRecord)>) -> Result<(), StoreError> {
        let mut records = self
            .records
            .write()
            .map_err(|_| StoreError::unavailable("memory store lock poisoned"))?;
        records.extend(batch);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
