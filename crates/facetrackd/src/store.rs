//! Local record store.
//!
//! A SQLite-backed key-value table holding JSON documents under fixed keys.
//! Every write replaces the whole value for its key; there is no batching
//! across keys and no migration.

use facetrack_core::{AttendancePunch, Employee, FaceEnrollment, LastPunch};
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use thiserror::Error;

pub const EMPLOYEES_KEY: &str = "facetrack_employees";
pub const FACE_DATABASE_KEY: &str = "facetrack_face_database";
pub const ATTENDANCE_KEY: &str = "attendance_records";
pub const LAST_PUNCH_KEY: &str = "last_attendance_punch";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("record {key:?} is not valid JSON: {source}")]
    Corrupt {
        key: String,
        source: serde_json::Error,
    },
    #[error("serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("cannot create store directory: {0}")]
    Io(#[from] std::io::Error),
}

/// Synchronous JSON key-value store.
pub struct KvStore {
    conn: Connection,
}

impl KvStore {
    /// Open (or create) the store at `path`, creating parent directories.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        tracing::info!(path = %path.display(), "record store opened");
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );",
        )?;
        Ok(Self { conn })
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        let raw: Option<String> = self
            .conn
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()?;
        raw.map(|json| {
            serde_json::from_str(&json).map_err(|source| StoreError::Corrupt {
                key: key.to_string(),
                source,
            })
        })
        .transpose()
    }

    pub fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        let json = serde_json::to_string(value)?;
        self.conn.execute(
            "INSERT INTO kv (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, json],
        )?;
        Ok(())
    }

    /// Remove `key`. Returns whether it existed.
    pub fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let n = self.conn.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        Ok(n > 0)
    }
}

/// Typed access to the FaceTrack records.
///
/// Unreadable records are treated as empty and logged, so one corrupt key
/// never blocks the others.
pub struct RecordStore {
    kv: KvStore,
}

impl RecordStore {
    pub fn new(kv: KvStore) -> Self {
        Self { kv }
    }

    fn list<T: DeserializeOwned>(&self, key: &str) -> Result<Vec<T>, StoreError> {
        match self.kv.get::<Vec<T>>(key) {
            Ok(v) => Ok(v.unwrap_or_default()),
            Err(StoreError::Corrupt { key, source }) => {
                tracing::error!(key = %key, error = %source, "corrupt record; treating as empty");
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    pub fn employees(&self) -> Result<Vec<Employee>, StoreError> {
        self.list(EMPLOYEES_KEY)
    }

    pub fn employee(&self, id: u32) -> Result<Option<Employee>, StoreError> {
        Ok(self.employees()?.into_iter().find(|e| e.id == id))
    }

    /// Insert or replace the employee with the same id.
    pub fn save_employee(&self, employee: &Employee) -> Result<(), StoreError> {
        let mut all = self.employees()?;
        match all.iter_mut().find(|e| e.id == employee.id) {
            Some(existing) => *existing = employee.clone(),
            None => all.push(employee.clone()),
        }
        self.kv.set(EMPLOYEES_KEY, &all)
    }

    /// Remove the employee and their enrollment. Returns whether the employee existed.
    pub fn delete_employee(&self, id: u32) -> Result<bool, StoreError> {
        let mut all = self.employees()?;
        let before = all.len();
        all.retain(|e| e.id != id);
        let existed = all.len() != before;
        if existed {
            self.kv.set(EMPLOYEES_KEY, &all)?;
        }
        let had_enrollment = self.delete_enrollment(id)?;
        tracing::debug!(id, existed, had_enrollment, "employee deleted");
        Ok(existed)
    }

    pub fn next_employee_id(&self) -> Result<u32, StoreError> {
        Ok(self.employees()?.iter().map(|e| e.id).max().unwrap_or(0) + 1)
    }

    pub fn enrollments(&self) -> Result<Vec<FaceEnrollment>, StoreError> {
        self.list(FACE_DATABASE_KEY)
    }

    pub fn enrollment(&self, employee_id: u32) -> Result<Option<FaceEnrollment>, StoreError> {
        Ok(self
            .enrollments()?
            .into_iter()
            .find(|e| e.employee_id == employee_id))
    }

    /// Store an enrollment, replacing any previous one for the same employee.
    pub fn save_enrollment(&self, enrollment: &FaceEnrollment) -> Result<(), StoreError> {
        let mut all = self.enrollments()?;
        all.retain(|e| e.employee_id != enrollment.employee_id);
        all.push(enrollment.clone());
        self.kv.set(FACE_DATABASE_KEY, &all)
    }

    pub fn delete_enrollment(&self, employee_id: u32) -> Result<bool, StoreError> {
        let mut all = self.enrollments()?;
        let before = all.len();
        all.retain(|e| e.employee_id != employee_id);
        if all.len() == before {
            return Ok(false);
        }
        self.kv.set(FACE_DATABASE_KEY, &all)?;
        Ok(true)
    }

    pub fn punches(&self) -> Result<Vec<AttendancePunch>, StoreError> {
        self.list(ATTENDANCE_KEY)
    }

    /// Append a punch and record it as the last punch.
    pub fn append_punch(&self, punch: &AttendancePunch) -> Result<(), StoreError> {
        let mut all = self.punches()?;
        all.push(punch.clone());
        self.kv.set(ATTENDANCE_KEY, &all)?;
        self.kv.set(
            LAST_PUNCH_KEY,
            &LastPunch {
                employee_id: punch.employee_id,
                name: punch.employee_name.clone(),
                timestamp: punch.timestamp,
            },
        )
    }

    /// Append hand-entered punches. The last-punch record is left alone, so
    /// backfilling an old day never affects duplicate-punch checks.
    pub fn append_manual_punches(&self, punches: &[AttendancePunch]) -> Result<(), StoreError> {
        let mut all = self.punches()?;
        all.extend_from_slice(punches);
        self.kv.set(ATTENDANCE_KEY, &all)
    }

    pub fn last_punch(&self) -> Result<Option<LastPunch>, StoreError> {
        match self.kv.get(LAST_PUNCH_KEY) {
            Err(StoreError::Corrupt { key, source }) => {
                tracing::error!(key = %key, error = %source, "corrupt last punch; ignoring");
                Ok(None)
            }
            other => other,
        }
    }
}
