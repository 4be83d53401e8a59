use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{FileCompletion, FileRecord, LedgerClient, LedgerError, UploadRecord};
use crate::media::{FileId, UploadBatch, UploadId};

#[derive(Debug, Default)]
struct State {
    uploads: Vec<UploadRecord>,
    files: Vec<FileRecord>,
    by_id: HashMap<FileId, usize>,
}

impl State {
    fn file_mut(&mut self, id: FileId) -> Result<&mut FileRecord, LedgerError> {
        let idx = *self.by_id.get(&id).ok_or(LedgerError::UnknownFile(id))?;
        Ok(&mut self.files[idx])
    }
}

/// Process-local ledger. Nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    state: Mutex<State>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl LedgerClient for MemoryLedger {
    fn create_upload(&self, batch: &UploadBatch) -> Result<(), LedgerError> {
        let mut state = self.state();
        if state.uploads.iter().any(|u| u.id == batch.id) {
            return Err(LedgerError::DuplicateUpload(batch.id));
        }
        state.uploads.push(UploadRecord::from(batch));
        Ok(())
    }

    fn abandon_upload(&self, upload: UploadId) -> Result<(), LedgerError> {
        let mut state = self.state();
        let idx = state
            .uploads
            .iter()
            .position(|u| u.id == upload)
            .ok_or(LedgerError::UnknownUpload(upload))?;
        if state.files.iter().any(|f| f.upload_id == upload) {
            return Err(LedgerError::UploadNotEmpty(upload));
        }
        state.uploads.remove(idx);
        Ok(())
    }

    fn register_files(&self, files: &[FileRecord]) -> Result<(), LedgerError> {
        let mut state = self.state();
        // Validate everything before the first insert.
        let mut incoming = HashSet::with_capacity(files.len());
        for record in files {
            if !state.uploads.iter().any(|u| u.id == record.upload_id) {
                return Err(LedgerError::UnknownUpload(record.upload_id));
            }
            if state.by_id.contains_key(&record.id) || !incoming.insert(record.id) {
                return Err(LedgerError::DuplicateFile(record.id));
            }
        }
        for record in files {
            let idx = state.files.len();
            state.by_id.insert(record.id, idx);
            state.files.push(record.clone());
        }
        Ok(())
    }

    fn complete_file(&self, id: FileId, completion: &FileCompletion) -> Result<(), LedgerError> {
        let mut state = self.state();
        let record = state.file_mut(id)?;
        record.complete = true;
        record.preview_path = completion.preview_path.clone();
        record.thumbnail_path = completion.thumbnail_path.clone();
        record.exif = completion.exif.clone();
        record.error = None;
        Ok(())
    }

    fn fail_file(&self, id: FileId, reason: &str) -> Result<(), LedgerError> {
        let mut state = self.state();
        let record = state.file_mut(id)?;
        record.complete = false;
        record.error = Some(reason.to_string());
        Ok(())
    }

    fn uploads(&self) -> Result<Vec<UploadRecord>, LedgerError> {
        let mut uploads = self.state().uploads.clone();
        uploads.sort_by_key(|u| u.created_at);
        Ok(uploads)
    }

    fn files_for_upload(&self, upload: UploadId) -> Result<Vec<FileRecord>, LedgerError> {
        Ok(self
            .state()
            .files
            .iter()
            .filter(|f| f.upload_id == upload)
            .cloned()
            .collect())
    }

    fn pending_files(&self) -> Result<Vec<FileRecord>, LedgerError> {
        Ok(self
            .state()
            .files
            .iter()
            .filter(|f| !f.complete)
            .cloned()
            .collect())
    }
}
