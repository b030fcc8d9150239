//! Append-only record of acquisition attempts.
//!
//! The ledger is the only durable state shared between runs. A key is
//! "satisfied" when a successful record exists inside the configured
//! freshness window; everything else is attempted again.

#[cfg(test)]
mod memory;
mod sqlite;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration, Local, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::LedgerError;
use crate::state_machine::{AttemptOutcome, ItemKey};

#[cfg(test)]
pub use memory::InMemoryLedgerStore;
pub use sqlite::SqliteLedgerStore;

/// Longest `LastDays` window accepted from configuration or the CLI.
pub const MAX_WINDOW_DAYS: u32 = 36_500;

/// How far back a successful attempt still counts.
///
/// In TOML: `freshness = "today"`, `"current_month"` or `{ last_days = 5 }`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FreshnessWindow {
    Today,
    CurrentMonth,
    LastDays(u32),
}

impl FreshnessWindow {
    /// Start of the window, evaluated in the time zone of `now`.
    pub fn since<Tz: TimeZone>(&self, now: DateTime<Tz>) -> DateTime<Utc> {
        let start_of = |date: NaiveDate| {
            date.and_hms_opt(0, 0, 0)
                .and_then(|midnight| now.timezone().from_local_datetime(&midnight).earliest())
                .map(|dt| dt.with_timezone(&Utc))
        };

        let today = now.date_naive();
        match self {
            FreshnessWindow::Today => start_of(today),
            FreshnessWindow::CurrentMonth => today.with_day(1).and_then(start_of),
            FreshnessWindow::LastDays(days) => {
                return Duration::try_days(i64::from(*days))
                    .and_then(|span| now.with_timezone(&Utc).checked_sub_signed(span))
                    .unwrap_or(DateTime::<Utc>::MIN_UTC);
            }
        }
        .unwrap_or_else(|| now.with_timezone(&Utc) - Duration::days(1))
    }
}

/// One persisted attempt. Never updated or deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub item_key: ItemKey,
    pub succeeded: bool,
    /// `succeeded`, `no_data`, `no_artifact` or `failed`.
    pub outcome: String,
    pub error: Option<String>,
    pub run_id: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// Persistence backend: insert plus filtered selects.
///
/// Implementations must tolerate concurrent appends from independent runs.
pub trait LedgerStore: Send + Sync {
    fn append(&self, record: &AttemptRecord) -> Result<(), LedgerError>;

    fn has_success_since(&self, key: &ItemKey, since: DateTime<Utc>) -> Result<bool, LedgerError>;

    /// Records at or after `since`, oldest first.
    fn records_since(&self, since: DateTime<Utc>) -> Result<Vec<AttemptRecord>, LedgerError>;
}

impl<T: LedgerStore + ?Sized> LedgerStore for Arc<T> {
    fn append(&self, record: &AttemptRecord) -> Result<(), LedgerError> {
        (**self).append(record)
    }

    fn has_success_since(&self, key: &ItemKey, since: DateTime<Utc>) -> Result<bool, LedgerError> {
        (**self).has_success_since(key, since)
    }

    fn records_since(&self, since: DateTime<Utc>) -> Result<Vec<AttemptRecord>, LedgerError> {
        (**self).records_since(since)
    }
}

/// Ledger facade used by the orchestrator and the reporting commands.
pub struct AttemptLedger<L> {
    store: L,
    run_id: Option<String>,
}

impl<L: LedgerStore> AttemptLedger<L> {
    pub fn new(store: L) -> Self {
        Self {
            store,
            run_id: None,
        }
    }

    /// Tags every record appended from now on with `run_id`.
    pub fn set_run_id(&mut self, run_id: impl Into<String>) {
        self.run_id = Some(run_id.into());
    }

    pub fn store(&self) -> &L {
        &self.store
    }

    pub fn is_satisfied(&self, key: &ItemKey, window: FreshnessWindow) -> Result<bool, LedgerError> {
        self.store.has_success_since(key, window.since(Local::now()))
    }

    /// Appends one record. Duplicates are expected.
    pub fn record(
        &self,
        key: &ItemKey,
        succeeded: bool,
        error: Option<String>,
    ) -> Result<(), LedgerError> {
        let outcome = if succeeded { "succeeded" } else { "failed" };
        self.append(key, succeeded, outcome, error)
    }

    /// Appends the record for a settled attempt.
    pub fn record_outcome(&self, key: &ItemKey, outcome: &AttemptOutcome) -> Result<(), LedgerError> {
        self.append(key, outcome.satisfies(), outcome.label(), outcome.error())
    }

    fn append(
        &self,
        key: &ItemKey,
        succeeded: bool,
        outcome: &str,
        error: Option<String>,
    ) -> Result<(), LedgerError> {
        let record = AttemptRecord {
            item_key: key.clone(),
            succeeded,
            outcome: outcome.to_string(),
            error,
            run_id: self.run_id.clone(),
            recorded_at: Utc::now(),
        };
        self.store.append(&record)?;
        debug!(key = %key, outcome, "attempt recorded");
        Ok(())
    }

    /// Keys from `keys` without a fresh success.
    ///
    /// Lookup failures are logged and the key is kept: an unreachable
    /// backend means "attempt again", never "skip".
    pub fn filter_unsatisfied<'a>(
        &self,
        keys: impl IntoIterator<Item = &'a ItemKey>,
        window: FreshnessWindow,
    ) -> BTreeSet<ItemKey> {
        let since = window.since(Local::now());
        let mut unsatisfied = BTreeSet::new();
        for key in keys {
            match self.store.has_success_since(key, since) {
                Ok(true) => debug!(key = %key, "already satisfied, skipping"),
                Ok(false) => {
                    unsatisfied.insert(key.clone());
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "ledger lookup failed, treating as unsatisfied");
                    unsatisfied.insert(key.clone());
                }
            }
        }
        unsatisfied
    }

    /// Aggregates the records since `since` for the `status` command.
    pub fn summarize(&self, since: DateTime<Utc>) -> Result<LedgerSummary, LedgerError> {
        let records = self.store.records_since(since)?;
        Ok(LedgerSummary::from_records(&records))
    }
}

/// Per-day counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DayTally {
    pub succeeded: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LedgerSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub per_day: BTreeMap<NaiveDate, DayTally>,
    /// Most frequent error messages, most frequent first.
    pub top_errors: Vec<(String, usize)>,
}

const TOP_ERRORS: usize = 5;

impl LedgerSummary {
    fn from_records(records: &[AttemptRecord]) -> Self {
        let mut summary = LedgerSummary::default();
        let mut errors: HashMap<&str, usize> = HashMap::new();

        for record in records {
            summary.total += 1;
            let day = summary
                .per_day
                .entry(record.recorded_at.with_timezone(&Local).date_naive())
                .or_default();
            if record.succeeded {
                summary.succeeded += 1;
                day.succeeded += 1;
            } else {
                summary.failed += 1;
                day.failed += 1;
            }
            if let Some(error) = record.error.as_deref() {
                *errors.entry(error).or_default() += 1;
            }
        }

        let mut top: Vec<(String, usize)> = errors
            .into_iter()
            .map(|(msg, count)| (msg.to_string(), count))
            .collect();
        top.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        top.truncate(TOP_ERRORS);
        summary.top_errors = top;
        summary
    }

    /// Percentage of successful records, 0 when empty.
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.succeeded as f64 * 100.0 / self.total as f64
        }
    }
}
