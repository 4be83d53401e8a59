//! Per-file Transferring stage: copy bytes, derive RAW artifacts, record the
//! outcome in the ledger. Everything here is blocking and runs on the
//! blocking pool.

use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::error::IngestError;
use crate::ledger::{FileCompletion, LedgerClient};
use crate::media::{FileId, MediaFile};
use crate::paths::create_bucket;
use crate::raw::RawDecoder;
use crate::transcode::{OutputKind, ThumbnailTranscoder};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOutcome {
    /// Bytes copied, artifacts written, ledger record complete.
    Completed,
    /// Bytes and artifacts are in place but the completion update failed.
    Unrecorded { reason: String },
    /// Transfer failed; the ledger record stays incomplete with this reason.
    Failed { reason: String },
    /// Never started because the run was cancelled; the record stays pending.
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct FileReport {
    pub id: FileId,
    pub name: String,
    pub source_path: PathBuf,
    pub destination: PathBuf,
    pub outcome: FileOutcome,
}

impl FileReport {
    pub(crate) fn new(file: &MediaFile, outcome: FileOutcome) -> Self {
        Self {
            id: file.id(),
            name: file.name().to_string(),
            source_path: file.source_path().to_path_buf(),
            destination: file.destination_path().to_path_buf(),
            outcome,
        }
    }
}

fn create_new(destination: &Path) -> Result<File, IngestError> {
    match OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(destination)
    {
        Ok(f) => Ok(f),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            Err(IngestError::DestinationCollision(destination.to_path_buf()))
        }
        Err(e) => Err(IngestError::io(destination, e)),
    }
}

/// Run `fill` against a freshly created `destination`, removing the file
/// again if it fails. Only this call created it, so a partial file is ours.
fn fill_new<T>(
    destination: &Path,
    fill: impl FnOnce(&mut File) -> io::Result<T>,
) -> Result<T, IngestError> {
    let mut output = create_new(destination)?;
    match fill(&mut output).and_then(|n| output.sync_all().map(|()| n)) {
        Ok(n) => Ok(n),
        Err(e) => {
            drop(output);
            if let Err(rm) = fs::remove_file(destination) {
                warn!(path = %destination.display(), error = %rm, "failed to remove partial file");
            }
            Err(IngestError::io(destination, e))
        }
    }
}

/// Byte-for-byte copy that never replaces an existing file.
pub fn copy_new(source: &Path, destination: &Path) -> Result<u64, IngestError> {
    let mut input = File::open(source).map_err(|e| IngestError::io(source, e))?;
    fill_new(destination, |output| io::copy(&mut input, output))
}

/// Write `bytes` to a file that must not exist yet.
pub fn write_new(destination: &Path, bytes: &[u8]) -> Result<(), IngestError> {
    fill_new(destination, |output| output.write_all(bytes))
}

/// Shared, immutable collaborators of the Transferring stage.
pub struct Transfer {
    ledger: Arc<dyn LedgerClient>,
    decoder: Arc<dyn RawDecoder>,
    transcoder: ThumbnailTranscoder,
    raw_extensions: Vec<String>,
}

impl Transfer {
    pub fn new(
        ledger: Arc<dyn LedgerClient>,
        decoder: Arc<dyn RawDecoder>,
        transcoder: ThumbnailTranscoder,
        raw_extensions: Vec<String>,
    ) -> Self {
        Self {
            ledger,
            decoder,
            transcoder,
            raw_extensions,
        }
    }

    pub fn ledger(&self) -> &Arc<dyn LedgerClient> {
        &self.ledger
    }

    fn is_raw(&self, file: &MediaFile) -> bool {
        self.raw_extensions
            .iter()
            .any(|e| e.eq_ignore_ascii_case(file.extension()))
    }

    /// Copy, derive artifacts, complete. Failures are isolated to this file.
    pub fn run(&self, mut file: MediaFile) -> FileReport {
        if let Err(err) = self.move_bytes(&mut file) {
            let reason = err.to_string();
            warn!(file = %file.source_path().display(), error = %reason, "transfer failed");
            if let Err(ledger_err) = self.ledger.fail_file(file.id(), &reason) {
                error!(file = %file.id(), error = %ledger_err, "could not record transfer failure");
            }
            return FileReport::new(&file, FileOutcome::Failed { reason });
        }

        match self
            .ledger
            .complete_file(file.id(), &FileCompletion::from(&file))
        {
            Ok(()) => {
                debug!(dest = %file.destination_path().display(), "file complete");
                FileReport::new(&file, FileOutcome::Completed)
            }
            Err(err) => {
                // The copy stays in place; a later run or operator can reconcile.
                let reason = err.to_string();
                error!(
                    file = %file.id(),
                    dest = %file.destination_path().display(),
                    error = %reason,
                    "completion not recorded"
                );
                FileReport::new(&file, FileOutcome::Unrecorded { reason })
            }
        }
    }

    fn move_bytes(&self, file: &mut MediaFile) -> Result<(), IngestError> {
        let copied = copy_new(file.source_path(), file.destination_path())?;
        debug!(
            src = %file.source_path().display(),
            dest = %file.destination_path().display(),
            bytes = copied,
            "copied"
        );
        if self.is_raw(file) {
            self.derive_artifacts(file)?;
        }
        Ok(())
    }

    fn derive_artifacts(&self, file: &mut MediaFile) -> Result<(), IngestError> {
        let decoded = self.decoder.decode(file.source_path())?;
        file.set_exif(ThumbnailTranscoder::exif_summary(&decoded));
        let preview = decoded.preview.as_ref().ok_or_else(|| {
            IngestError::TranscodeFailure(format!(
                "{} has no embedded preview",
                file.source_path().display()
            ))
        })?;

        for kind in OutputKind::ALL {
            let artifact = self.transcoder.transcode(preview, kind)?;
            let path = file.artifact_path(kind, artifact.extension);
            if let Some(dir) = path.parent() {
                create_bucket(dir)?;
            }
            write_new(&path, &artifact.bytes)?;
            debug!(path = %path.display(), kind = kind.tag(), "artifact written");
            file.set_artifact(kind, path);
        }
        Ok(())
    }
}
