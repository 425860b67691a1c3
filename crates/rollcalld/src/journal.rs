//! SQLite attendance journal, the daemon's attendance gateway.
//!
//! One row per identity per local calendar date. A second mark on the same
//! day returns the stored row with `already_marked` set.

use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveDate, NaiveTime, Utc};
use rollcall_core::{AttendanceGateway, AttendanceMark, AttendanceRequest, AttendanceStatus, GatewayError};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum JournalError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("cannot create journal directory: {0}")]
    Io(#[from] std::io::Error),
}

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS attendance (
    id TEXT PRIMARY KEY,
    identity_id TEXT NOT NULL,
    identity_name TEXT NOT NULL,
    date TEXT NOT NULL,
    time_in TEXT NOT NULL,
    status TEXT NOT NULL,
    confidence REAL NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE (identity_id, date)
)";

#[derive(Clone)]
pub struct SqliteJournal {
    conn: Arc<Mutex<Connection>>,
    late_after: Option<NaiveTime>,
}

impl SqliteJournal {
    pub fn open(path: &Path, late_after: Option<NaiveTime>) -> Result<Self, JournalError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        tracing::info!(path = %path.display(), late_after = ?late_after, "attendance journal opened");
        Self::with_connection(conn, late_after)
    }

    pub fn open_in_memory(late_after: Option<NaiveTime>) -> Result<Self, JournalError> {
        Self::with_connection(Connection::open_in_memory()?, late_after)
    }

    fn with_connection(conn: Connection, late_after: Option<NaiveTime>) -> Result<Self, JournalError> {
        conn.execute(SCHEMA, [])?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            late_after,
        })
    }

    /// Number of identities marked on `date`.
    pub async fn count_on(&self, date: NaiveDate) -> Result<u64, GatewayError> {
        self.blocking(move |conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM attendance WHERE date = ?1",
                params![date.to_string()],
                |row| row.get::<_, i64>(0),
            )
            .map(|n| n.max(0) as u64)
            .map_err(storage)
        })
        .await
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, GatewayError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, GatewayError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|e| GatewayError::Storage(format!("journal lock poisoned: {e}")))?;
            f(&*guard)
        })
        .await
        .map_err(|e| GatewayError::Storage(format!("journal task failed: {e}")))?
    }
}

fn storage(e: rusqlite::Error) -> GatewayError {
    GatewayError::Storage(e.to_string())
}

fn parse_status(raw: &str) -> AttendanceStatus {
    match raw {
        "late" => AttendanceStatus::Late,
        _ => AttendanceStatus::Present,
    }
}

fn mark(
    conn: &Connection,
    request: &AttendanceRequest,
    late_after: Option<NaiveTime>,
) -> Result<AttendanceMark, GatewayError> {
    let local = request.timestamp.with_timezone(&Local);
    let date = local.date_naive().to_string();

    let existing = conn
        .query_row(
            "SELECT id, identity_name, time_in, status, confidence
             FROM attendance WHERE identity_id = ?1 AND date = ?2",
            params![request.identity.id, date],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, f64>(4)?,
                ))
            },
        )
        .optional()
        .map_err(storage)?;

    if let Some((id, name, time_in, status, confidence)) = existing {
        let timestamp = DateTime::parse_from_rfc3339(&time_in)
            .map_err(|e| GatewayError::Storage(format!("corrupt time_in {time_in:?}: {e}")))?
            .with_timezone(&Utc);
        return Ok(AttendanceMark {
            record_id: id,
            identity_id: request.identity.id.clone(),
            identity_name: name,
            confidence: confidence as f32,
            timestamp,
            status: parse_status(&status),
            already_marked: true,
        });
    }

    let status = match late_after {
        Some(cutoff) if local.time() > cutoff => AttendanceStatus::Late,
        _ => AttendanceStatus::Present,
    };
    let id = uuid::Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO attendance
             (id, identity_id, identity_name, date, time_in, status, confidence, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            id,
            request.identity.id,
            request.identity.name,
            date,
            request.timestamp.to_rfc3339(),
            status.as_str(),
            request.confidence as f64,
            Utc::now().to_rfc3339(),
        ],
    )
    .map_err(storage)?;

    Ok(AttendanceMark {
        record_id: id,
        identity_id: request.identity.id.clone(),
        identity_name: request.identity.name.clone(),
        confidence: request.confidence,
        timestamp: request.timestamp,
        status,
        already_marked: false,
    })
}

#[async_trait]
impl AttendanceGateway for SqliteJournal {
    async fn mark_attendance(
        &self,
        request: AttendanceRequest,
    ) -> Result<AttendanceMark, GatewayError> {
        if request.identity.id.trim().is_empty() {
            return Err(GatewayError::Rejected("empty identity id".into()));
        }
        let late_after = self.late_after;
        self.blocking(move |conn| mark(conn, &request, late_after)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rollcall_core::Identity;

    fn request(id: &str, local: (u32, u32), day: u32) -> AttendanceRequest {
        let timestamp = Local
            .with_ymd_and_hms(2026, 3, day, local.0, local.1, 0)
            .unwrap()
            .with_timezone(&Utc);
        AttendanceRequest {
            identity: Identity {
                id: id.into(),
                name: format!("Student {id}"),
            },
            confidence: 0.91,
            timestamp,
        }
    }

    #[tokio::test]
    async fn test_first_mark_is_present() {
        let journal = SqliteJournal::open_in_memory(None).unwrap();
        let mark = journal.mark_attendance(request("STU001", (8, 30), 2)).await.unwrap();

        assert!(!mark.already_marked);
        assert_eq!(mark.status, AttendanceStatus::Present);
        assert_eq!(mark.identity_name, "Student STU001");
        assert!((mark.confidence - 0.91).abs() < 1e-6);
        assert_eq!(
            journal.count_on(NaiveDate::from_ymd_opt(2026, 3, 2).unwrap()).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_second_mark_same_day_is_deduplicated() {
        let journal = SqliteJournal::open_in_memory(None).unwrap();
        let first = journal.mark_attendance(request("STU001", (8, 30), 2)).await.unwrap();
        let second = journal.mark_attendance(request("STU001", (10, 0), 2)).await.unwrap();

        assert!(second.already_marked);
        assert_eq!(second.record_id, first.record_id);
        assert_eq!(second.timestamp, first.timestamp);
        assert_eq!(
            journal.count_on(NaiveDate::from_ymd_opt(2026, 3, 2).unwrap()).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_new_day_gets_new_record() {
        let journal = SqliteJournal::open_in_memory(None).unwrap();
        let monday = journal.mark_attendance(request("STU001", (8, 30), 2)).await.unwrap();
        let tuesday = journal.mark_attendance(request("STU001", (8, 30), 3)).await.unwrap();

        assert!(!tuesday.already_marked);
        assert_ne!(monday.record_id, tuesday.record_id);
    }

    #[tokio::test]
    async fn test_late_after_cutoff() {
        let cutoff = NaiveTime::from_hms_opt(9, 0, 0);
        let journal = SqliteJournal::open_in_memory(cutoff).unwrap();

        let early = journal.mark_attendance(request("STU001", (8, 59), 2)).await.unwrap();
        let late = journal.mark_attendance(request("STU002", (9, 15), 2)).await.unwrap();
        assert_eq!(early.status, AttendanceStatus::Present);
        assert_eq!(late.status, AttendanceStatus::Late);

        let again = journal.mark_attendance(request("STU002", (11, 0), 2)).await.unwrap();
        assert_eq!(again.status, AttendanceStatus::Late);
    }

    #[tokio::test]
    async fn test_empty_identity_rejected() {
        let journal = SqliteJournal::open_in_memory(None).unwrap();
        let result = journal.mark_attendance(request(" ", (8, 0), 2)).await;
        assert!(matches!(result, Err(GatewayError::Rejected(_))));
    }

    #[tokio::test]
    async fn test_journal_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("attendance.db");

        let journal = SqliteJournal::open(&path, None).unwrap();
        let first = journal.mark_attendance(request("STU007", (8, 0), 4)).await.unwrap();
        drop(journal);

        let reopened = SqliteJournal::open(&path, None).unwrap();
        let again = reopened.mark_attendance(request("STU007", (9, 0), 4)).await.unwrap();
        assert!(again.already_marked);
        assert_eq!(again.record_id, first.record_id);
    }

    #[tokio::test]
    async fn test_row_records_creation_time() {
        let journal = SqliteJournal::open_in_memory(None).unwrap();
        let before = Utc::now();
        let mark = journal.mark_attendance(request("STU003", (8, 0), 2)).await.unwrap();
        let after = Utc::now();

        let created_at = journal
            .blocking(move |conn| {
                conn.query_row(
                    "SELECT created_at FROM attendance WHERE id = ?1",
                    params![mark.record_id],
                    |row| row.get::<_, String>(0),
                )
                .map_err(storage)
            })
            .await
            .unwrap();
        let created_at = DateTime::parse_from_rfc3339(&created_at)
            .unwrap()
            .with_timezone(&Utc);
        // Wall-clock write time, not the recognition timestamp (2026-03-02).
        assert!(created_at >= before && created_at <= after);
    }
}
