//! SQLite-backed ledger.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use tracing::{debug, info};
use uuid::Uuid;

use super::{FileCompletion, FileRecord, LedgerClient, LedgerError, UploadRecord};
use crate::media::{ExifSummary, FileId, UploadBatch, UploadId};

struct Table {
    name: &'static str,
    schema: &'static str,
    indices: &'static [&'static str],
}

const UPLOADS_TABLE_V_1: Table = Table {
    name: "uploads",
    schema: "CREATE TABLE uploads (id TEXT NOT NULL, created_at INTEGER NOT NULL, PRIMARY KEY (id));",
    indices: &["CREATE INDEX uploads_created_at_index ON uploads (created_at);"],
};

const FILES_TABLE_V_1: Table = Table {
    name: "files",
    schema: "CREATE TABLE files (id TEXT NOT NULL, path TEXT NOT NULL, created_at INTEGER NOT NULL, name TEXT NOT NULL, extension TEXT NOT NULL, upload_id TEXT NOT NULL, size_bytes INTEGER NOT NULL, complete INTEGER NOT NULL DEFAULT 0, preview_path TEXT, thumbnail_path TEXT, exif TEXT, error TEXT, PRIMARY KEY (id), CONSTRAINT upload_id FOREIGN KEY (upload_id) REFERENCES uploads (id));",
    indices: &[
        "CREATE INDEX files_created_at_extension_index ON files (created_at, extension);",
        "CREATE INDEX files_upload_id_index ON files (upload_id);",
    ],
};

struct VersionedSchema {
    version: i64,
    tables: &'static [Table],
}

impl VersionedSchema {
    fn create(&self, conn: &mut Connection) -> Result<(), LedgerError> {
        let tx = conn.transaction()?;
        for table in self.tables {
            debug!(table = table.name, "ledger: creating table");
            tx.execute(table.schema, [])?;
            for index in table.indices {
                tx.execute(index, [])?;
            }
        }
        tx.pragma_update(None, "user_version", self.version)?;
        tx.commit()?;
        Ok(())
    }
}

const VERSIONED_SCHEMAS: &[VersionedSchema] = &[VersionedSchema {
    version: 1,
    tables: &[UPLOADS_TABLE_V_1, FILES_TABLE_V_1],
}];

fn migrate_if_needed(conn: &mut Connection) -> Result<(), LedgerError> {
    let db_version: i64 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
    let Some(latest) = VERSIONED_SCHEMAS.last() else {
        return Ok(());
    };
    if db_version > latest.version {
        return Err(LedgerError::UnsupportedSchema {
            found: db_version,
            supported: latest.version,
        });
    }
    if db_version == 0 {
        info!(version = latest.version, "ledger: creating schema");
        latest.create(conn)?;
    }
    Ok(())
}

const FILE_COLUMNS: &str = "id, path, created_at, name, extension, upload_id, size_bytes, complete, preview_path, thumbnail_path, exif, error";

fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>, LedgerError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| LedgerError::Corrupt(format!("timestamp {ms} out of range")))
}

fn parse_uuid(text: &str) -> Result<Uuid, LedgerError> {
    Uuid::parse_str(text).map_err(|e| LedgerError::Corrupt(format!("id {text:?}: {e}")))
}

fn path_text(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn exif_json(exif: Option<&ExifSummary>) -> Result<Option<String>, LedgerError> {
    exif.map(serde_json::to_string)
        .transpose()
        .map_err(|e| LedgerError::Corrupt(format!("exif encode: {e}")))
}

/// Raw column values; conversion errors surface after the row closure.
struct FileRow {
    id: String,
    path: String,
    created_at: i64,
    name: String,
    extension: String,
    upload_id: String,
    size_bytes: i64,
    complete: bool,
    preview_path: Option<String>,
    thumbnail_path: Option<String>,
    exif: Option<String>,
    error: Option<String>,
}

impl FileRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            path: row.get(1)?,
            created_at: row.get(2)?,
            name: row.get(3)?,
            extension: row.get(4)?,
            upload_id: row.get(5)?,
            size_bytes: row.get(6)?,
            complete: row.get(7)?,
            preview_path: row.get(8)?,
            thumbnail_path: row.get(9)?,
            exif: row.get(10)?,
            error: row.get(11)?,
        })
    }

    fn into_record(self) -> Result<FileRecord, LedgerError> {
        let exif = self
            .exif
            .map(|json| serde_json::from_str::<ExifSummary>(&json))
            .transpose()
            .map_err(|e| LedgerError::Corrupt(format!("exif of {}: {e}", self.id)))?;
        Ok(FileRecord {
            id: FileId::from(parse_uuid(&self.id)?),
            path: PathBuf::from(self.path),
            created_at: from_millis(self.created_at)?,
            name: self.name,
            extension: self.extension,
            upload_id: UploadId::from(parse_uuid(&self.upload_id)?),
            size_bytes: u64::try_from(self.size_bytes)
                .map_err(|_| LedgerError::Corrupt(format!("size {}", self.size_bytes)))?,
            complete: self.complete,
            preview_path: self.preview_path.map(PathBuf::from),
            thumbnail_path: self.thumbnail_path.map(PathBuf::from),
            exif,
            error: self.error,
        })
    }
}

/// Ledger stored in a single SQLite database file.
pub struct SqliteLedger {
    conn: Mutex<Connection>,
}

impl SqliteLedger {
    /// Open (creating if needed) the database at `path`. `busy_timeout` bounds
    /// how long a write waits for another process holding the lock.
    pub fn open(path: &Path, busy_timeout: Duration) -> Result<Self, LedgerError> {
        let conn = Connection::open(path)?;
        info!(path = %path.display(), "ledger: opened sqlite database");
        Self::with_connection(conn, busy_timeout)
    }

    pub fn open_in_memory() -> Result<Self, LedgerError> {
        Self::with_connection(Connection::open_in_memory()?, Duration::from_secs(5))
    }

    fn with_connection(mut conn: Connection, busy_timeout: Duration) -> Result<Self, LedgerError> {
        conn.busy_timeout(busy_timeout)?;
        conn.pragma_update(None, "foreign_keys", true)?;
        migrate_if_needed(&mut conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn query_files(&self, filter: &str, upload: Option<UploadId>) -> Result<Vec<FileRecord>, LedgerError> {
        let conn = self.conn();
        let sql = format!("SELECT {FILE_COLUMNS} FROM files WHERE {filter} ORDER BY rowid");
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = match upload {
            Some(id) => stmt
                .query_map(params![id.to_string()], FileRow::read)?
                .collect::<Result<Vec<_>, _>>()?,
            None => stmt
                .query_map([], FileRow::read)?
                .collect::<Result<Vec<_>, _>>()?,
        };
        rows.into_iter().map(FileRow::into_record).collect()
    }
}

impl LedgerClient for SqliteLedger {
    fn create_upload(&self, batch: &UploadBatch) -> Result<(), LedgerError> {
        let conn = self.conn();
        let exists = conn
            .query_row(
                "SELECT 1 FROM uploads WHERE id = ?1",
                params![batch.id.to_string()],
                |_| Ok(()),
            )
            .optional()?;
        if exists.is_some() {
            return Err(LedgerError::DuplicateUpload(batch.id));
        }
        conn.execute(
            "INSERT INTO uploads (id, created_at) VALUES (?1, ?2)",
            params![batch.id.to_string(), millis(batch.created_at)],
        )?;
        Ok(())
    }

    fn abandon_upload(&self, upload: UploadId) -> Result<(), LedgerError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let id = upload.to_string();
        let has_files = tx
            .prepare_cached("SELECT 1 FROM files WHERE upload_id = ?1")?
            .exists(params![id])?;
        if has_files {
            return Err(LedgerError::UploadNotEmpty(upload));
        }
        if tx.execute("DELETE FROM uploads WHERE id = ?1", params![id])? == 0 {
            return Err(LedgerError::UnknownUpload(upload));
        }
        tx.commit()?;
        debug!(upload = %upload, "ledger: abandoned empty upload");
        Ok(())
    }

    fn register_files(&self, files: &[FileRecord]) -> Result<(), LedgerError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        {
            let mut upload_exists = tx.prepare_cached("SELECT 1 FROM uploads WHERE id = ?1")?;
            let mut file_exists = tx.prepare_cached("SELECT 1 FROM files WHERE id = ?1")?;
            let mut insert = tx.prepare_cached(&format!(
                "INSERT INTO files ({FILE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
            ))?;
            for record in files {
                let upload_id = record.upload_id.to_string();
                if !upload_exists.exists(params![upload_id])? {
                    return Err(LedgerError::UnknownUpload(record.upload_id));
                }
                if file_exists.exists(params![record.id.to_string()])? {
                    return Err(LedgerError::DuplicateFile(record.id));
                }
                let size = i64::try_from(record.size_bytes)
                    .map_err(|_| LedgerError::Corrupt(format!("size {}", record.size_bytes)))?;
                insert.execute(params![
                    record.id.to_string(),
                    path_text(&record.path),
                    millis(record.created_at),
                    record.name,
                    record.extension,
                    upload_id,
                    size,
                    record.complete,
                    record.preview_path.as_deref().map(path_text),
                    record.thumbnail_path.as_deref().map(path_text),
                    exif_json(record.exif.as_ref())?,
                    record.error,
                ])?;
            }
        }
        tx.commit()?;
        debug!(count = files.len(), "ledger: registered files");
        Ok(())
    }

    fn complete_file(&self, id: FileId, completion: &FileCompletion) -> Result<(), LedgerError> {
        let exif = exif_json(completion.exif.as_ref())?;
        let changed = self.conn().execute(
            "UPDATE files SET complete = 1, preview_path = ?2, thumbnail_path = ?3, exif = ?4, error = NULL WHERE id = ?1",
            params![
                id.to_string(),
                completion.preview_path.as_deref().map(path_text),
                completion.thumbnail_path.as_deref().map(path_text),
                exif,
            ],
        )?;
        if changed == 0 {
            return Err(LedgerError::UnknownFile(id));
        }
        Ok(())
    }

    fn fail_file(&self, id: FileId, reason: &str) -> Result<(), LedgerError> {
        let changed = self.conn().execute(
            "UPDATE files SET complete = 0, error = ?2 WHERE id = ?1",
            params![id.to_string(), reason],
        )?;
        if changed == 0 {
            return Err(LedgerError::UnknownFile(id));
        }
        Ok(())
    }

    fn uploads(&self) -> Result<Vec<UploadRecord>, LedgerError> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare_cached("SELECT id, created_at FROM uploads ORDER BY created_at, rowid")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|(id, created_at)| -> Result<UploadRecord, LedgerError> {
                Ok(UploadRecord {
                    id: UploadId::from(parse_uuid(&id)?),
                    created_at: from_millis(created_at)?,
                })
            })
            .collect()
    }

    fn files_for_upload(&self, upload: UploadId) -> Result<Vec<FileRecord>, LedgerError> {
        self.query_files("upload_id = ?1", Some(upload))
    }

    fn pending_files(&self) -> Result<Vec<FileRecord>, LedgerError> {
        self.query_files("complete = 0", None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::contract;

    #[test]
    fn registers_and_completes() {
        contract::registers_and_completes(&SqliteLedger::open_in_memory().unwrap());
    }

    #[test]
    fn registration_is_all_or_nothing() {
        contract::registration_is_all_or_nothing(&SqliteLedger::open_in_memory().unwrap());
    }

    #[test]
    fn rejects_unknown_ids() {
        contract::rejects_unknown_ids(&SqliteLedger::open_in_memory().unwrap());
    }

    #[test]
    fn abandons_only_empty_uploads() {
        contract::abandons_only_empty_uploads(&SqliteLedger::open_in_memory().unwrap());
    }

    #[test]
    fn keeps_every_upload() {
        contract::keeps_every_upload(&SqliteLedger::open_in_memory().unwrap());
    }

    #[test]
    fn schema_survives_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("media.sqlite3");
        let file = contract::media_file("keep.ORF");
        let batch = UploadBatch::new(Utc::now(), std::slice::from_ref(&file));
        {
            let ledger = SqliteLedger::open(&path, Duration::from_secs(1)).unwrap();
            ledger.create_upload(&batch).unwrap();
            ledger
                .register_files(&[FileRecord::pending(&file, batch.id)])
                .unwrap();
        }
        let ledger = SqliteLedger::open(&path, Duration::from_secs(1)).unwrap();
        assert_eq!(ledger.uploads().unwrap().len(), 1);
        let pending = ledger.pending_files().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].name, "keep.ORF");

        let version: i64 = ledger
            .conn()
            .query_row("PRAGMA user_version", [], |r| r.get(0))
            .unwrap();
        assert_eq!(version, 1);
    }

    #[test]
    fn newer_schema_is_refused() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("future.sqlite3");
        Connection::open(&path)
            .unwrap()
            .pragma_update(None, "user_version", 99)
            .unwrap();
        assert!(matches!(
            SqliteLedger::open(&path, Duration::from_secs(1)),
            Err(LedgerError::UnsupportedSchema { found: 99, .. })
        ));
    }
}
