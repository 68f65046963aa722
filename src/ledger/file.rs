//! File-backed ledger store.
//!
//! The whole ledger is a single JSON document. It is read once on open and
//! rewritten on every write through a temp file + rename, so a crash leaves
//! either the old or the new document on disk, never a torn one. A
//! `put_many` is a single rewrite, so a batch lands whole or not at all.

use super::LedgerStore;
use crate::error::StoreError;
use crate::models::{Fingerprint, LedgerRecord};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Default, Serialize, Deserialize)]
struct LedgerDocument {
    version: u32,
    records: BTreeMap<Fingerprint, LedgerRecord>,
}

pub struct FileStore {
    path: PathBuf,
    records: Mutex<BTreeMap<Fingerprint, LedgerRecord>>,
}

impl FileStore {
    /// Open (or create) the ledger at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| {
                StoreError::unavailable(format!("cannot create {}: {}", parent.display(), e))
            })?;
        }

        let records = match fs::read_to_string(path) {
            Ok(content) if content.trim().is_empty() => BTreeMap::new(),
            Ok(content) => {
                let doc: LedgerDocument = serde_json::from_str(&content).map_err(|e| {
                    StoreError::unavailable(format!("corrupt ledger {}: {}", path.display(), e))
                })?;
                if doc.version != FORMAT_VERSION {
                    return Err(StoreError::unavailable(format!(
                        "unsupported ledger version {} in {}",
                        doc.version,
                        path.display()
                    )));
                }
                doc.records
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                return Err(StoreError::unavailable(format!(
                    "cannot read {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        debug!(path = %path.display(), records = records.len(), "Loaded ledger file");

        Ok(Self {
            path: path.to_path_buf(),
            records: Mutex::new(records),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, records: &BTreeMap<Fingerprint, LedgerRecord>) -> std::io::Result<()> {
        #[derive(Serialize)]
        struct Borrowed<'a> {
            version: u32,
            records: &'a BTreeMap<Fingerprint, LedgerRecord>,
        }

        let json = serde_json::to_vec_pretty(&Borrowed {
            version: FORMAT_VERSION,
            records,
        })
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        let tmp = self.path.with_extension("json.tmp");
        let mut f = fs::File::create(&tmp)?;
        f.write_all(&json)?;
        f.sync_all()?;
        fs::rename(tmp, &self.path)?;
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for FileStore {
    async fn get(&self, key: &Fingerprint) -> Result<Option<LedgerRecord>, StoreError> {
        let records = self
            .records
            .lock()
            .map_err(|_| StoreError::unavailable("file store lock poisoned"))?;
        Ok(records.get(key).cloned())
    }

    async fn put(&self, key: &Fingerprint, record: LedgerRecord) -> Result<(), StoreError> {
        let mut records = self
            .records
            .lock()
            .map_err(|_| StoreError::unavailable("file store lock poisoned"))?;

        let previous = records.insert(key.clone(), record);
        if let Err(e) = self.persist(&records) {
            // Keep memory in step with what is on disk.
            match previous {
                Some(old) => records.insert(key.clone(), old),
                None => records.remove(key),
            };
            return Err(StoreError::unavailable(format!(
                "cannot write {}: {}",
                self.path.display(),
                e
            )));
        }
        Ok(())
    }

    async fn put_many(&self, batch: Vec<(Fingerprint, LedgerRecord)>) -> Result<(), StoreError> {
        let mut records = self
            .records
            .lock()
            .map_err(|_| StoreError::unavailable("file store lock poisoned"))?;

        let mut previous = Vec::with_capacity(batch.len());
        for (key, record) in batch {
            let old = records.insert(key.clone(), record);
            previous.push((key, old));
        }

        if let Err(e) = self.persist(&records) {
            // Undo in reverse so a key repeated in the batch ends at its
            // original value.
            for (key, old) in previous.into_iter().rev() {
                match old {
                    Some(old) => records.insert(key, old),
                    None => records.remove(&key),
                };
            }
            return Err(StoreError::unavailable(format!(
                "cannot write {}: {}",
                self.path.display(),
                e
            )));
        }
        debug!(path = %self.path.display(), records = records.len(), "Wrote ledger batch");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "file"
    }
}
