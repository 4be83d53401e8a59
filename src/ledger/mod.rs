//! Durable record of upload batches and per-file ingest state.
//!
//! The pipeline only talks to [`LedgerClient`]; [`MemoryLedger`] and
//! [`SqliteLedger`] are the two stores shipped with the crate.

mod memory;
mod sqlite;

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::media::{ExifSummary, FileId, MediaFile, UploadBatch, UploadId};

pub use memory::MemoryLedger;
pub use sqlite::SqliteLedger;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger storage error: {0}")]
    Storage(#[from] rusqlite::Error),
    #[error("upload {0} is not in the ledger")]
    UnknownUpload(UploadId),
    #[error("file {0} is not in the ledger")]
    UnknownFile(FileId),
    #[error("file {0} is already registered")]
    DuplicateFile(FileId),
    #[error("upload {0} already exists")]
    DuplicateUpload(UploadId),
    #[error("upload {0} still has registered files")]
    UploadNotEmpty(UploadId),
    #[error("corrupt ledger row: {0}")]
    Corrupt(String),
    #[error("ledger schema version {found} is newer than supported version {supported}")]
    UnsupportedSchema { found: i64, supported: i64 },
    #[error("ledger unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadRecord {
    pub id: UploadId,
    pub created_at: DateTime<Utc>,
}

impl From<&UploadBatch> for UploadRecord {
    fn from(batch: &UploadBatch) -> Self {
        Self {
            id: batch.id,
            created_at: batch.created_at,
        }
    }
}

/// One row of the `files` table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileRecord {
    pub id: FileId,
    /// Destination path of the copied bytes.
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub name: String,
    pub extension: String,
    pub upload_id: UploadId,
    pub size_bytes: u64,
    pub complete: bool,
    pub preview_path: Option<PathBuf>,
    pub thumbnail_path: Option<PathBuf>,
    pub exif: Option<ExifSummary>,
    /// Reason the last transfer attempt failed; cleared on completion.
    pub error: Option<String>,
}

impl FileRecord {
    /// Incomplete record for a resolved file.
    pub fn pending(file: &MediaFile, upload_id: UploadId) -> Self {
        Self {
            id: file.id(),
            path: file.destination_path().to_path_buf(),
            created_at: file.created_at(),
            name: file.name().to_string(),
            extension: file.extension().to_string(),
            upload_id,
            size_bytes: file.size_bytes(),
            complete: false,
            preview_path: None,
            thumbnail_path: None,
            exif: None,
            error: None,
        }
    }
}

/// Fields written when a file record is marked complete.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FileCompletion {
    pub preview_path: Option<PathBuf>,
    pub thumbnail_path: Option<PathBuf>,
    pub exif: Option<ExifSummary>,
}

impl From<&MediaFile> for FileCompletion {
    fn from(file: &MediaFile) -> Self {
        Self {
            preview_path: file.preview_path().map(PathBuf::from),
            thumbnail_path: file.thumbnail_path().map(PathBuf::from),
            exif: file.exif().cloned(),
        }
    }
}

/// Storage seam for batches and file records.
///
/// Calls are blocking; the pipeline runs them on the blocking pool. Timeouts
/// and retries belong to the implementation.
pub trait LedgerClient: Send + Sync {
    fn create_upload(&self, batch: &UploadBatch) -> Result<(), LedgerError>;

    /// Remove an upload that never got any file registered, so a directory
    /// failing between batch creation and registration leaves nothing behind.
    fn abandon_upload(&self, upload: UploadId) -> Result<(), LedgerError>;

    /// Insert every record or none of them.
    fn register_files(&self, files: &[FileRecord]) -> Result<(), LedgerError>;

    fn complete_file(&self, id: FileId, completion: &FileCompletion) -> Result<(), LedgerError>;

    /// Leave the record incomplete and note why.
    fn fail_file(&self, id: FileId, reason: &str) -> Result<(), LedgerError>;

    /// Oldest first.
    fn uploads(&self) -> Result<Vec<UploadRecord>, LedgerError>;

    /// Registration order.
    fn files_for_upload(&self, upload: UploadId) -> Result<Vec<FileRecord>, LedgerError>;

    /// Every record with `complete = false`, across all uploads.
    fn pending_files(&self) -> Result<Vec<FileRecord>, LedgerError>;
}

#[cfg(test)]
pub(crate) mod contract {
    //! Behaviour every [`LedgerClient`] must share.

    use super::*;
    use crate::media::SourceFile;
    use chrono::TimeZone;

    pub fn media_file(name: &str) -> MediaFile {
        MediaFile::new(
            SourceFile {
                name: name.into(),
                source_path: PathBuf::from("/src").join(name),
            },
            "orf".into(),
            Utc.with_ymd_and_hms(2023, 5, 1, 9, 0, 0).unwrap(),
            42,
            PathBuf::from("/dest/2023/May/1/orf").join(name),
        )
    }

    fn batch_of(files: &[MediaFile]) -> UploadBatch {
        UploadBatch::new(Utc::now(), files)
    }

    pub fn registers_and_completes(ledger: &dyn LedgerClient) {
        let files = vec![media_file("a.ORF"), media_file("b.ORF")];
        let batch = batch_of(&files);
        ledger.create_upload(&batch).unwrap();
        let records: Vec<_> = files.iter().map(|f| FileRecord::pending(f, batch.id)).collect();
        ledger.register_files(&records).unwrap();

        let stored = ledger.files_for_upload(batch.id).unwrap();
        assert_eq!(stored, records);
        assert_eq!(ledger.pending_files().unwrap().len(), 2);

        let completion = FileCompletion {
            preview_path: Some(PathBuf::from("/dest/2023/May/1/orf/preview/a.prev.jpg")),
            thumbnail_path: Some(PathBuf::from("/dest/2023/May/1/orf/preview/a.thumb.jpg")),
            exif: Some(ExifSummary {
                make: Some("OLYMPUS IMAGING CORP.".into()),
                iso: Some(200),
                ..ExifSummary::default()
            }),
        };
        ledger.fail_file(files[0].id(), "first attempt").unwrap();
        ledger.complete_file(files[0].id(), &completion).unwrap();
        ledger.fail_file(files[1].id(), "copy failed").unwrap();

        let stored = ledger.files_for_upload(batch.id).unwrap();
        assert!(stored[0].complete);
        assert_eq!(stored[0].error, None);
        assert_eq!(stored[0].preview_path, completion.preview_path);
        assert_eq!(stored[0].thumbnail_path, completion.thumbnail_path);
        assert_eq!(stored[0].exif, completion.exif);
        assert!(!stored[1].complete);
        assert_eq!(stored[1].error.as_deref(), Some("copy failed"));

        let pending = ledger.pending_files().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, files[1].id());
    }

    pub fn registration_is_all_or_nothing(ledger: &dyn LedgerClient) {
        let files = vec![media_file("a.ORF"), media_file("b.ORF")];
        let batch = batch_of(&files);
        ledger.create_upload(&batch).unwrap();
        ledger
            .register_files(&[FileRecord::pending(&files[0], batch.id)])
            .unwrap();

        // Second record is fresh, first collides with the registered one.
        let retry = [
            FileRecord::pending(&files[1], batch.id),
            FileRecord::pending(&files[0], batch.id),
        ];
        assert!(matches!(
            ledger.register_files(&retry),
            Err(LedgerError::DuplicateFile(id)) if id == files[0].id()
        ));
        let stored = ledger.files_for_upload(batch.id).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id, files[0].id());
    }

    pub fn rejects_unknown_ids(ledger: &dyn LedgerClient) {
        let file = media_file("orphan.ORF");
        let orphan = FileRecord::pending(&file, UploadId::new());
        assert!(matches!(
            ledger.register_files(&[orphan]),
            Err(LedgerError::UnknownUpload(_))
        ));
        assert!(matches!(
            ledger.complete_file(file.id(), &FileCompletion::default()),
            Err(LedgerError::UnknownFile(_))
        ));
        assert!(matches!(
            ledger.fail_file(file.id(), "nope"),
            Err(LedgerError::UnknownFile(_))
        ));
    }

    pub fn abandons_only_empty_uploads(ledger: &dyn LedgerClient) {
        let files = vec![media_file("kept.ORF")];
        let kept = batch_of(&files);
        let empty = batch_of(&[]);
        ledger.create_upload(&kept).unwrap();
        ledger.create_upload(&empty).unwrap();
        ledger
            .register_files(&[FileRecord::pending(&files[0], kept.id)])
            .unwrap();

        ledger.abandon_upload(empty.id).unwrap();
        assert!(matches!(
            ledger.abandon_upload(kept.id),
            Err(LedgerError::UploadNotEmpty(id)) if id == kept.id
        ));
        assert!(matches!(
            ledger.abandon_upload(empty.id),
            Err(LedgerError::UnknownUpload(_))
        ));
        let ids: Vec<_> = ledger.uploads().unwrap().iter().map(|u| u.id).collect();
        assert_eq!(ids, vec![kept.id]);
        assert_eq!(ledger.files_for_upload(kept.id).unwrap().len(), 1);
    }

    pub fn keeps_every_upload(ledger: &dyn LedgerClient) {
        let first = UploadBatch::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(), &[]);
        let second = UploadBatch::new(Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap(), &[]);
        ledger.create_upload(&second).unwrap();
        ledger.create_upload(&first).unwrap();
        assert!(matches!(
            ledger.create_upload(&first),
            Err(LedgerError::DuplicateUpload(_))
        ));
        let ids: Vec<_> = ledger.uploads().unwrap().iter().map(|u| u.id).collect();
        assert_eq!(ids, vec![first.id, second.id]);
    }
}
