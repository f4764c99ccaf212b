//! SQLite persistence for work units and step records.
//!
//! One connection behind a mutex is shared by both schedulers. Every method
//! is synchronous and releases the lock before returning, so the lock is never
//! held across an `.await`.

pub mod models;
mod steps;
mod units;

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, Row};

use crate::error::StoreError;
pub use models::{
    CaptionCue, LifecycleStatus, NewUnit, StepDefinition, StepPhase, StepRecord, StepStatus,
    WorkUnit,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS units (
    id                      INTEGER PRIMARY KEY AUTOINCREMENT,
    source_ref              TEXT NOT NULL UNIQUE,
    url                     TEXT NOT NULL DEFAULT '',
    title                   TEXT NOT NULL DEFAULT '',
    description             TEXT NOT NULL DEFAULT '',
    subtitles               TEXT NOT NULL DEFAULT '[]',
    status                  TEXT NOT NULL,
    generated_title         TEXT,
    generated_description   TEXT,
    generated_tags          TEXT,
    primary_publish_id      TEXT,
    primary_published_at    INTEGER,
    secondary_published_at  INTEGER,
    created_at              INTEGER NOT NULL,
    updated_at              INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_units_status ON units (status, created_at);

CREATE TABLE IF NOT EXISTS steps (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    unit_ref        TEXT NOT NULL,
    step_name       TEXT NOT NULL,
    step_order      INTEGER NOT NULL,
    phase           TEXT NOT NULL,
    status          TEXT NOT NULL,
    start_time      INTEGER,
    end_time        INTEGER,
    duration_ms     INTEGER,
    error_message   TEXT,
    result_data     TEXT,
    can_retry       INTEGER NOT NULL DEFAULT 1,
    created_at      INTEGER NOT NULL,
    UNIQUE (unit_ref, step_name)
);
CREATE INDEX IF NOT EXISTS idx_steps_status ON steps (status, phase);
"#;

/// Shared handle to the relay database. Cloning is cheap.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }
}

pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn millis_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let ms: i64 = row.get(idx)?;
    DateTime::from_timestamp_millis(ms).ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, ms))
}

fn opt_millis_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<i64>>(idx)? {
        Some(ms) => DateTime::from_timestamp_millis(ms)
            .map(Some)
            .ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, ms)),
        None => Ok(None),
    }
}

const UNIT_COLUMNS: &str = "id, source_ref, url, title, description, subtitles, status, \
     generated_title, generated_description, generated_tags, primary_publish_id, \
     primary_published_at, secondary_published_at, created_at, updated_at";

fn unit_from_row(row: &Row<'_>) -> rusqlite::Result<WorkUnit> {
    let subtitles: String = row.get(5)?;
    let subtitles = serde_json::from_str(&subtitles)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(e)))?;
    Ok(WorkUnit {
        id: row.get(0)?,
        source_ref: row.get(1)?,
        url: row.get(2)?,
        title: row.get(3)?,
        description: row.get(4)?,
        subtitles,
        status: row.get(6)?,
        generated_title: row.get(7)?,
        generated_description: row.get(8)?,
        generated_tags: row.get(9)?,
        primary_publish_id: row.get(10)?,
        primary_published_at: opt_millis_at(row, 11)?,
        secondary_published_at: opt_millis_at(row, 12)?,
        created_at: millis_at(row, 13)?,
        updated_at: millis_at(row, 14)?,
    })
}

const STEP_COLUMNS: &str = "s.unit_ref, s.step_name, s.step_order, s.phase, s.status, \
     s.start_time, s.end_time, s.duration_ms, s.error_message, s.result_data, \
     s.can_retry, s.created_at";

fn step_from_row(row: &Row<'_>) -> rusqlite::Result<StepRecord> {
    Ok(StepRecord {
        unit_ref: row.get(0)?,
        step_name: row.get(1)?,
        step_order: row.get(2)?,
        phase: row.get(3)?,
        status: row.get(4)?,
        start_time: opt_millis_at(row, 5)?,
        end_time: opt_millis_at(row, 6)?,
        duration_ms: row.get(7)?,
        error_message: row.get(8)?,
        result_data: row.get(9)?,
        can_retry: row.get(10)?,
        created_at: millis_at(row, 11)?,
    })
}

/// Counts returned by [`Store::reset_running_on_startup`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StartupReset {
    pub steps: usize,
    pub units: usize,
}

impl Store {
    /// Puts interrupted work back in line after a crash: every running step
    /// becomes pending and every processing unit pending-ingestion, in one
    /// transaction. Nothing else is touched.
    pub fn reset_running_on_startup(&self) -> Result<StartupReset, StoreError> {
        let mut conn = self.lock()?;
        let now = to_millis(Utc::now());
        let tx = conn.transaction()?;
        let steps = tx.execute(
            "UPDATE steps SET status = ?1, start_time = NULL WHERE status = ?2",
            rusqlite::params![StepStatus::Pending, StepStatus::Running],
        )?;
        let units = tx.execute(
            "UPDATE units SET status = ?1, updated_at = ?2 WHERE status = ?3",
            rusqlite::params![
                LifecycleStatus::PendingIngestion,
                now,
                LifecycleStatus::Processing
            ],
        )?;
        tx.commit()?;
        Ok(StartupReset { steps, units })
    }
}
