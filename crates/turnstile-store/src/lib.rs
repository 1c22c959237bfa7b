//! SQLite gallery and access event log.
//!
//! `users` holds one enrolled face per username, with the embedding stored as
//! little-endian f32 bytes and an optional JPEG reference image. `logs` holds
//! one row per granted pass.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;
use turnstile_core::{AccessAction, Embedding, EventLog, GalleryEntry, GalleryError, GalleryStore};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sql(#[from] rusqlite::Error),
    #[error("failed to create database directory: {0}")]
    Io(#[from] std::io::Error),
    #[error("embedding for user {id} is {len} bytes, not a whole number of f32 values")]
    CorruptEmbedding { id: i64, len: usize },
    #[error("connection lock poisoned")]
    Poisoned,
}

impl From<StoreError> for GalleryError {
    fn from(e: StoreError) -> Self {
        GalleryError::Backend(Box::new(e))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserSummary {
    pub id: i64,
    pub username: String,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventRecord {
    pub id: i64,
    pub username: String,
    pub action: String,
    pub timestamp: String,
}

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at `path`, creating parent directories.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        tracing::info!(path = %path.display(), "opened access database");
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    pub fn entries(&self) -> Result<Vec<GalleryEntry>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, username, embedding, model_version FROM users ORDER BY id",
        )?;
        let rows = stmt
            .query_map([], |r| {
                Ok((
                    r.get::<_, i64>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, Vec<u8>>(2)?,
                    r.get::<_, Option<String>>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(id, username, blob, model_version)| {
                Ok(GalleryEntry {
                    id,
                    identity: username,
                    embedding: Embedding {
                        values: blob_to_embedding(id, &blob)?,
                        model_version,
                    },
                })
            })
            .collect()
    }

    pub fn insert_user(
        &self,
        username: &str,
        embedding: &Embedding,
        face_image: Option<&[u8]>,
    ) -> Result<i64, StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO users (username, embedding, model_version, face_image, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                username,
                embedding_to_blob(&embedding.values),
                embedding.model_version,
                face_image,
                Utc::now().format(TIMESTAMP_FORMAT).to_string(),
            ],
        )?;
        let id = conn.last_insert_rowid();
        tracing::debug!(id, username, dim = embedding.dim(), "user inserted");
        Ok(id)
    }

    /// Insert a log row at an explicit time.
    pub fn record_event_at(
        &self,
        user_id: i64,
        action: AccessAction,
        at: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO logs (user_id, action, timestamp) VALUES (?1, ?2, ?3)",
            params![user_id, action.as_str(), at.format(TIMESTAMP_FORMAT).to_string()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn list_users(&self) -> Result<Vec<UserSummary>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT id, username, created_at FROM users ORDER BY id")?;
        let users = stmt
            .query_map([], |r| {
                Ok(UserSummary {
                    id: r.get(0)?,
                    username: r.get(1)?,
                    created_at: r.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(users)
    }

    /// The stored reference image, if the user exists and has one.
    pub fn user_image(&self, id: i64) -> Result<Option<Vec<u8>>, StoreError> {
        let conn = self.conn()?;
        let image: Option<Option<Vec<u8>>> = conn
            .query_row(
                "SELECT face_image FROM users WHERE id = ?1",
                params![id],
                |r| r.get(0),
            )
            .optional()?;
        Ok(image.flatten())
    }

    /// Access events, newest first.
    pub fn list_events(&self) -> Result<Vec<EventRecord>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT logs.id, users.username, logs.action, logs.timestamp
             FROM logs JOIN users ON users.id = logs.user_id
             ORDER BY logs.timestamp DESC, logs.id DESC",
        )?;
        let events = stmt
            .query_map([], |r| {
                Ok(EventRecord {
                    id: r.get(0)?,
                    username: r.get(1)?,
                    action: r.get(2)?,
                    timestamp: r.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(events)
    }
}

impl GalleryStore for SqliteStore {
    fn enumerate(&self) -> Result<Vec<GalleryEntry>, GalleryError> {
        Ok(self.entries()?)
    }

    fn append(
        &self,
        identity: &str,
        embedding: &Embedding,
        image: Option<&[u8]>,
    ) -> Result<i64, GalleryError> {
        match self.insert_user(identity, embedding, image) {
            Err(StoreError::Sql(e)) if is_unique_violation(&e) => {
                Err(GalleryError::Duplicate(identity.to_string()))
            }
            other => Ok(other?),
        }
    }
}

impl EventLog for SqliteStore {
    fn record(&self, entry: &GalleryEntry, action: AccessAction) -> Result<(), GalleryError> {
        self.record_event_at(entry.id, action, Utc::now())?;
        Ok(())
    }
}

fn init_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "BEGIN;
        CREATE TABLE IF NOT EXISTS users (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            username TEXT UNIQUE NOT NULL,
            embedding BLOB NOT NULL,
            model_version TEXT,
            face_image BLOB,
            created_at TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL REFERENCES users(id),
            action TEXT NOT NULL,
            timestamp TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS logs_timestamp_idx ON logs(timestamp);
        COMMIT;",
    )?;
    Ok(())
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

fn embedding_to_blob(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn blob_to_embedding(id: i64, blob: &[u8]) -> Result<Vec<f32>, StoreError> {
    if blob.len() % 4 != 0 {
        return Err(StoreError::CorruptEmbedding { id, len: blob.len() });
    }
    Ok(blob
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn embedding(values: &[f32]) -> Embedding {
        Embedding {
            values: values.to_vec(),
            model_version: Some("w600k_r50".into()),
        }
    }

    #[test]
    fn test_append_and_enumerate_in_insertion_order() {
        let store = SqliteStore::open_in_memory().unwrap();
        let a = store.append("alice", &embedding(&[0.1, -0.2, 0.3]), None).unwrap();
        let b = store.append("bob", &embedding(&[1.0, 2.0, 3.0]), None).unwrap();
        assert!(a < b);

        let entries = store.enumerate().unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.identity.as_str()).collect();
        assert_eq!(names, ["alice", "bob"]);
        assert_eq!(entries[0].embedding.values, vec![0.1, -0.2, 0.3]);
        assert_eq!(entries[0].embedding.model_version.as_deref(), Some("w600k_r50"));
    }

    #[test]
    fn test_duplicate_username() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.append("alice", &embedding(&[0.0]), None).unwrap();
        let err = store.append("alice", &embedding(&[1.0]), None).unwrap_err();
        assert!(matches!(err, GalleryError::Duplicate(name) if name == "alice"));
    }

    #[test]
    fn test_corrupt_embedding_blob() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .conn()
            .unwrap()
            .execute(
                "INSERT INTO users (username, embedding, created_at) VALUES ('x', ?1, 'now')",
                params![vec![1u8, 2, 3]],
            )
            .unwrap();
        assert!(matches!(
            store.entries(),
            Err(StoreError::CorruptEmbedding { len: 3, .. })
        ));
        assert!(matches!(store.enumerate(), Err(GalleryError::Backend(_))));
    }

    #[test]
    fn test_user_image() {
        let store = SqliteStore::open_in_memory().unwrap();
        let with = store.append("alice", &embedding(&[0.0]), Some(&[0xFF, 0xD8, 0x00])).unwrap();
        let without = store.append("bob", &embedding(&[0.0]), None).unwrap();

        assert_eq!(store.user_image(with).unwrap(), Some(vec![0xFF, 0xD8, 0x00]));
        assert_eq!(store.user_image(without).unwrap(), None);
        assert_eq!(store.user_image(999).unwrap(), None);
    }

    #[test]
    fn test_list_users() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.append("alice", &embedding(&[0.0]), None).unwrap();
        store.append("bob", &embedding(&[0.0]), None).unwrap();
        let users = store.list_users().unwrap();
        assert_eq!(users.len(), 2);
        assert_eq!(users[1].username, "bob");
        assert_eq!(users[0].created_at.len(), "2024-01-01 00:00:00".len());
    }

    #[test]
    fn test_events_newest_first() {
        let store = SqliteStore::open_in_memory().unwrap();
        let id = store.append("alice", &embedding(&[0.0]), None).unwrap();
        let t = |h| Utc.with_ymd_and_hms(2024, 5, 1, h, 0, 0).unwrap();

        store.record_event_at(id, AccessAction::In, t(8)).unwrap();
        store.record_event_at(id, AccessAction::Out, t(17)).unwrap();
        let tie_a = store.record_event_at(id, AccessAction::In, t(12)).unwrap();
        let tie_b = store.record_event_at(id, AccessAction::Out, t(12)).unwrap();

        let events = store.list_events().unwrap();
        let order: Vec<(&str, &str)> = events
            .iter()
            .map(|e| (e.action.as_str(), e.timestamp.as_str()))
            .collect();
        assert_eq!(
            order,
            [
                ("out", "2024-05-01 17:00:00"),
                ("out", "2024-05-01 12:00:00"),
                ("in", "2024-05-01 12:00:00"),
                ("in", "2024-05-01 08:00:00"),
            ]
        );
        assert_eq!(events[1].id, tie_b);
        assert_eq!(events[2].id, tie_a);
        assert!(events.iter().all(|e| e.username == "alice"));
    }

    #[test]
    fn test_record_via_event_log() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.append("alice", &embedding(&[0.5]), None).unwrap();
        let entry = store.enumerate().unwrap().remove(0);
        store.record(&entry, AccessAction::In).unwrap();

        let events = store.list_events().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action, "in");
    }

    #[test]
    fn test_record_unknown_user_rejected_by_foreign_key() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(store.record_event_at(42, AccessAction::In, Utc::now()).is_err());
    }

    #[test]
    fn test_open_creates_parent_dirs_and_persists() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested/dir/access.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store.append("alice", &embedding(&[0.25, 0.75]), Some(b"jpeg")).unwrap();
        }
        let reopened = SqliteStore::open(&path).unwrap();
        let entries = reopened.entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].embedding.values, vec![0.25, 0.75]);
    }

    #[test]
    fn test_blob_roundtrip_preserves_bits() {
        let values = [f32::MIN_POSITIVE, -0.0, 1.5e-7, 512.0];
        let blob = embedding_to_blob(&values);
        assert_eq!(blob.len(), 16);
        assert_eq!(blob_to_embedding(1, &blob).unwrap(), values.to_vec());
    }
}
