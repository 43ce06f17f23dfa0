//! SQLite-backed storage for users, face embeddings, and attendance
//! records.
//!
//! Embeddings are stored as little-endian f32 blobs. The daily unique
//! index on attendance backstops the gate's in-process dedup against
//! marks racing in from other processes.

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{NaiveDate, NaiveDateTime};
use rusqlite::{params, Connection};
use thiserror::Error;

use rollcall_core::{
    AttendanceLedger, AttendanceRow, BoxError, Embedding, KnownFaceEntry, LedgerError,
    RegistrySource,
};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const DATE_FORMAT: &str = "%Y-%m-%d";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS users (
    user_id     INTEGER PRIMARY KEY AUTOINCREMENT,
    name        TEXT NOT NULL,
    email       TEXT UNIQUE,
    created_at  TEXT DEFAULT CURRENT_TIMESTAMP
);
CREATE TABLE IF NOT EXISTS face_embeddings (
    embedding_id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id      INTEGER NOT NULL,
    embedding    BLOB NOT NULL,
    FOREIGN KEY (user_id) REFERENCES users(user_id) ON DELETE CASCADE
);
CREATE TABLE IF NOT EXISTS attendance_records (
    record_id   INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id     INTEGER NOT NULL,
    timestamp   TEXT NOT NULL,
    FOREIGN KEY (user_id) REFERENCES users(user_id) ON DELETE CASCADE
);
CREATE INDEX IF NOT EXISTS idx_user_email ON users(email);
CREATE INDEX IF NOT EXISTS idx_attendance_user ON attendance_records(user_id);
CREATE UNIQUE INDEX IF NOT EXISTS idx_attendance_daily
    ON attendance_records(user_id, date(timestamp));
";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct UserRow {
    pub user_id: i64,
    pub name: String,
    pub email: Option<String>,
    pub created_at: String,
}

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let store = Self::init(Connection::open(path)?)?;
        tracing::info!(path = %path.display(), "attendance database opened");
        Ok(store)
    }

    /// In-memory database, used by tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a new user and return the generated identity.
    pub fn add_user(&self, name: &str, email: Option<&str>) -> Result<i64, StoreError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO users (name, email) VALUES (?1, ?2)",
            params![name, email],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Store one enrolled embedding for a user.
    pub fn add_embedding(&self, user_id: i64, embedding: &Embedding) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT INTO face_embeddings (user_id, embedding) VALUES (?1, ?2)",
            params![user_id, embedding_to_blob(embedding)],
        )?;
        Ok(())
    }

    pub fn list_users(&self) -> Result<Vec<UserRow>, StoreError> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT user_id, name, email, created_at FROM users ORDER BY user_id")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(UserRow {
                    user_id: row.get(0)?,
                    name: row.get(1)?,
                    email: row.get(2)?,
                    created_at: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Attendance counts per user, optionally restricted to one date.
    pub fn attendance_report(
        &self,
        date: Option<NaiveDate>,
    ) -> Result<Vec<(String, i64)>, StoreError> {
        let conn = self.conn();
        let mut query = String::from(
            "SELECT u.name, COUNT(a.record_id) AS attendance_count
             FROM users u
             LEFT JOIN attendance_records a ON u.user_id = a.user_id",
        );
        let rows = if let Some(date) = date {
            query.push_str(" WHERE date(a.timestamp) = ?1");
            query.push_str(" GROUP BY u.name ORDER BY attendance_count DESC");
            let mut stmt = conn.prepare(&query)?;
            stmt.query_map(params![date.format(DATE_FORMAT).to_string()], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?
        } else {
            query.push_str(" GROUP BY u.name ORDER BY attendance_count DESC");
            let mut stmt = conn.prepare(&query)?;
            stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<Result<Vec<_>, _>>()?
        };
        Ok(rows)
    }

    /// Delete embedding rows whose blob does not decode, returning how
    /// many were removed.
    pub fn repair_embeddings(&self) -> Result<usize, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT embedding_id, user_id, embedding FROM face_embeddings")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, Vec<u8>>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        drop(stmt);

        let mut removed = 0usize;
        for (embedding_id, user_id, blob) in rows {
            if blob_to_embedding(&blob).is_none() {
                tracing::info!(embedding_id, user_id, "removing malformed embedding");
                conn.execute(
                    "DELETE FROM face_embeddings WHERE embedding_id = ?1",
                    params![embedding_id],
                )?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

fn embedding_to_blob(embedding: &Embedding) -> Vec<u8> {
    let mut blob = Vec::with_capacity(embedding.values.len() * 4);
    for value in &embedding.values {
        blob.extend_from_slice(&value.to_le_bytes());
    }
    blob
}

fn blob_to_embedding(blob: &[u8]) -> Option<Embedding> {
    if blob.is_empty() || blob.len() % 4 != 0 {
        return None;
    }
    let values = blob
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();
    Some(Embedding::new(values))
}

impl RegistrySource for SqliteStore {
    fn load_known_faces(&self) -> Result<Vec<KnownFaceEntry>, BoxError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT u.user_id, u.name, fe.embedding
             FROM face_embeddings fe
             JOIN users u ON fe.user_id = u.user_id
             ORDER BY fe.embedding_id",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Vec<u8>>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut entries = Vec::with_capacity(rows.len());
        for (identity, display_name, blob) in rows {
            match blob_to_embedding(&blob) {
                Some(embedding) => entries.push(KnownFaceEntry {
                    identity,
                    display_name,
                    embedding,
                }),
                None => {
                    tracing::warn!(identity, "skipping malformed embedding blob");
                }
            }
        }
        Ok(entries)
    }
}

impl AttendanceLedger for SqliteStore {
    fn attendance_on(&self, date: NaiveDate) -> Result<Vec<AttendanceRow>, LedgerError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT u.name, a.timestamp
                 FROM attendance_records a
                 JOIN users u ON a.user_id = u.user_id
                 WHERE date(a.timestamp) = ?1
                 ORDER BY a.timestamp",
            )
            .map_err(|e| LedgerError::Storage(e.to_string()))?;
        let rows = stmt
            .query_map(params![date.format(DATE_FORMAT).to_string()], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(|e| LedgerError::Storage(e.to_string()))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| LedgerError::Storage(e.to_string()))?;

        let mut result = Vec::with_capacity(rows.len());
        for (display_name, raw) in rows {
            match NaiveDateTime::parse_from_str(&raw, TIMESTAMP_FORMAT) {
                Ok(at) => result.push(AttendanceRow { display_name, at }),
                Err(err) => {
                    tracing::warn!(raw = %raw, error = %err, "skipping unparseable attendance timestamp");
                }
            }
        }
        Ok(result)
    }

    fn record_attendance(&self, identity: i64, at: NaiveDateTime) -> Result<(), LedgerError> {
        let result = self.conn().execute(
            "INSERT INTO attendance_records (user_id, timestamp) VALUES (?1, ?2)",
            params![identity, at.format(TIMESTAMP_FORMAT).to_string()],
        );
        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY =>
            {
                Err(LedgerError::UnknownIdentity(identity))
            }
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE =>
            {
                Err(LedgerError::Duplicate)
            }
            Err(err) => Err(LedgerError::Storage(err.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn ts(date: &str, time: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(&format!("{date} {time}"), "%Y-%m-%d %H:%M:%S").unwrap()
    }

    #[test]
    fn test_embedding_blob_roundtrip_is_bit_exact() {
        let embedding = Embedding::new(vec![0.25, -1.5, f32::MIN_POSITIVE, 1e30]);
        let blob = embedding_to_blob(&embedding);
        let back = blob_to_embedding(&blob).unwrap();
        assert_eq!(back, embedding);
    }

    #[test]
    fn test_blob_rejects_truncated_or_empty() {
        assert!(blob_to_embedding(&[]).is_none());
        assert!(blob_to_embedding(&[1, 2, 3]).is_none());
    }

    #[test]
    fn test_enroll_and_load_known_faces() {
        let store = SqliteStore::open_in_memory().unwrap();
        let alice = store.add_user("Alice", Some("alice@example.com")).unwrap();
        let bob = store.add_user("Bob", None).unwrap();
        store
            .add_embedding(alice, &Embedding::new(vec![1.0, 0.0]))
            .unwrap();
        store
            .add_embedding(bob, &Embedding::new(vec![0.0, 1.0]))
            .unwrap();

        let entries = store.load_known_faces().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].identity, alice);
        assert_eq!(entries[0].display_name, "Alice");
        assert_eq!(entries[1].display_name, "Bob");
    }

    #[test]
    fn test_load_skips_malformed_blob() {
        let store = SqliteStore::open_in_memory().unwrap();
        let alice = store.add_user("Alice", None).unwrap();
        store
            .add_embedding(alice, &Embedding::new(vec![1.0, 0.0]))
            .unwrap();
        store
            .conn()
            .execute(
                "INSERT INTO face_embeddings (user_id, embedding) VALUES (?1, ?2)",
                params![alice, vec![1u8, 2, 3]],
            )
            .unwrap();

        let entries = store.load_known_faces().unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_repair_deletes_only_malformed_rows() {
        let store = SqliteStore::open_in_memory().unwrap();
        let alice = store.add_user("Alice", None).unwrap();
        store
            .add_embedding(alice, &Embedding::new(vec![1.0, 0.0]))
            .unwrap();
        store
            .conn()
            .execute(
                "INSERT INTO face_embeddings (user_id, embedding) VALUES (?1, ?2)",
                params![alice, vec![9u8; 5]],
            )
            .unwrap();

        assert_eq!(store.repair_embeddings().unwrap(), 1);
        assert_eq!(store.load_known_faces().unwrap().len(), 1);
        // Second run finds nothing left to fix.
        assert_eq!(store.repair_embeddings().unwrap(), 0);
    }

    #[test]
    fn test_attendance_on_filters_by_date() {
        let store = SqliteStore::open_in_memory().unwrap();
        let alice = store.add_user("Alice", None).unwrap();
        store
            .record_attendance(alice, ts("2026-08-07", "09:00:00"))
            .unwrap();

        let today = store
            .attendance_on(NaiveDate::from_ymd_opt(2026, 8, 7).unwrap())
            .unwrap();
        assert_eq!(today.len(), 1);
        assert_eq!(today[0].display_name, "Alice");

        let tomorrow = store
            .attendance_on(NaiveDate::from_ymd_opt(2026, 8, 8).unwrap())
            .unwrap();
        assert!(tomorrow.is_empty());
    }

    #[test]
    fn test_record_attendance_unknown_identity() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(matches!(
            store.record_attendance(999, ts("2026-08-07", "09:00:00")),
            Err(LedgerError::UnknownIdentity(999))
        ));
    }

    #[test]
    fn test_daily_unique_index_maps_to_duplicate() {
        let store = SqliteStore::open_in_memory().unwrap();
        let alice = store.add_user("Alice", None).unwrap();
        store
            .record_attendance(alice, ts("2026-08-07", "09:00:00"))
            .unwrap();

        assert!(matches!(
            store.record_attendance(alice, ts("2026-08-07", "17:00:00")),
            Err(LedgerError::Duplicate)
        ));
        // A different day records normally.
        store
            .record_attendance(alice, ts("2026-08-08", "09:00:00"))
            .unwrap();
    }

    #[test]
    fn test_attendance_report_counts() {
        let store = SqliteStore::open_in_memory().unwrap();
        let alice = store.add_user("Alice", None).unwrap();
        let _bob = store.add_user("Bob", None).unwrap();
        store
            .record_attendance(alice, ts("2026-08-06", "09:00:00"))
            .unwrap();
        store
            .record_attendance(alice, ts("2026-08-07", "09:00:00"))
            .unwrap();

        let all_time = store.attendance_report(None).unwrap();
        assert_eq!(all_time[0], ("Alice".to_string(), 2));
        // Bob appears with zero attendance in the unfiltered report.
        assert!(all_time.contains(&("Bob".to_string(), 0)));

        let on_day = store
            .attendance_report(NaiveDate::from_ymd_opt(2026, 8, 7))
            .unwrap();
        assert_eq!(on_day, vec![("Alice".to_string(), 1)]);
    }

    #[test]
    fn test_list_users() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.add_user("Alice", Some("alice@example.com")).unwrap();
        let users = store.list_users().unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].name, "Alice");
        assert_eq!(users[0].email.as_deref(), Some("alice@example.com"));
    }
}
