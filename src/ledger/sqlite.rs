use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use tracing::warn;

use super::{AttemptRecord, LedgerStore};
use crate::error::LedgerError;
use crate::state_machine::ItemKey;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite-backed ledger. One table, append-only; timestamps are epoch millis.
///
/// WAL mode plus a busy timeout lets concurrent runs append to the same file.
pub struct SqliteLedgerStore {
    conn: Mutex<Connection>,
}

impl SqliteLedgerStore {
    pub fn open(path: &Path) -> Result<Self, LedgerError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Self::init(conn)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, LedgerError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, LedgerError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS attempts (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              item_key TEXT NOT NULL,
              succeeded INTEGER NOT NULL,
              outcome TEXT NOT NULL,
              error TEXT,
              run_id TEXT,
              ts_ms INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_attempts_key_ts ON attempts(item_key, ts_ms);
            CREATE INDEX IF NOT EXISTS idx_attempts_ts ON attempts(ts_ms);
            "#,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, LedgerError> {
        self.conn
            .lock()
            .map_err(|_| LedgerError::Unavailable("ledger connection poisoned".into()))
    }
}

type RawRow = (String, bool, String, Option<String>, Option<String>, i64);

impl LedgerStore for SqliteLedgerStore {
    fn append(&self, record: &AttemptRecord) -> Result<(), LedgerError> {
        self.conn()?.execute(
            "INSERT INTO attempts (item_key, succeeded, outcome, error, run_id, ts_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.item_key.as_str(),
                record.succeeded,
                record.outcome,
                record.error,
                record.run_id,
                record.recorded_at.timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    fn has_success_since(&self, key: &ItemKey, since: DateTime<Utc>) -> Result<bool, LedgerError> {
        let found: bool = self.conn()?.query_row(
            "SELECT EXISTS(
               SELECT 1 FROM attempts
               WHERE item_key = ?1 AND succeeded = 1 AND ts_ms >= ?2
             )",
            params![key.as_str(), since.timestamp_millis()],
            |row| row.get(0),
        )?;
        Ok(found)
    }

    fn records_since(&self, since: DateTime<Utc>) -> Result<Vec<AttemptRecord>, LedgerError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT item_key, succeeded, outcome, error, run_id, ts_ms
             FROM attempts WHERE ts_ms >= ?1 ORDER BY ts_ms, id",
        )?;
        let rows = stmt
            .query_map(params![since.timestamp_millis()], |row| {
                Ok::<RawRow, rusqlite::Error>((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut records = Vec::with_capacity(rows.len());
        for (raw_key, succeeded, outcome, error, run_id, ts_ms) in rows {
            let (Some(item_key), Some(recorded_at)) = (
                ItemKey::parse(&raw_key),
                DateTime::<Utc>::from_timestamp_millis(ts_ms),
            ) else {
                warn!(key = %raw_key, ts_ms, "skipping malformed ledger row");
                continue;
            };
            records.push(AttemptRecord {
                item_key,
                succeeded,
                outcome,
                error,
                run_id,
                recorded_at,
            });
        }
        Ok(records)
    }
}
