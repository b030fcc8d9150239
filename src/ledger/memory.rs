use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};

use super::{AttemptRecord, LedgerStore};
use crate::error::LedgerError;
use crate::state_machine::ItemKey;

/// Vec-backed store for tests. Lookups can be switched to fail.
#[derive(Default)]
pub struct InMemoryLedgerStore {
    records: Mutex<Vec<AttemptRecord>>,
    failing: AtomicBool,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_lookups(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn records(&self) -> Vec<AttemptRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }

    fn check(&self) -> Result<(), LedgerError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(LedgerError::Unavailable("in-memory store offline".into()))
        } else {
            Ok(())
        }
    }
}

impl LedgerStore for InMemoryLedgerStore {
    fn append(&self, record: &AttemptRecord) -> Result<(), LedgerError> {
        let mut records = self
            .records
            .lock()
            .map_err(|_| LedgerError::Unavailable("poisoned".into()))?;
        records.push(record.clone());
        Ok(())
    }

    fn has_success_since(&self, key: &ItemKey, since: DateTime<Utc>) -> Result<bool, LedgerError> {
        self.check()?;
        let records = self
            .records
            .lock()
            .map_err(|_| LedgerError::Unavailable("poisoned".into()))?;
        Ok(records
            .iter()
            .any(|r| &r.item_key == key && r.succeeded && r.recorded_at >= since))
    }

    fn records_since(&self, since: DateTime<Utc>) -> Result<Vec<AttemptRecord>, LedgerError> {
        self.check()?;
        let records = self
            .records
            .lock()
            .map_err(|_| LedgerError::Unavailable("poisoned".into()))?;
        Ok(records
            .iter()
            .filter(|r| r.recorded_at >= since)
            .cloned()
            .collect())
    }
}
