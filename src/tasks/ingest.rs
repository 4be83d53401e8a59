//! Directory-by-directory ingest.
//!
//! Each directory runs `Scanning → BatchOpened → FilesRegistered →
//! Transferring → Completed`, or stops in `Failed`. The batch and every file
//! record are durably in the ledger before the first byte is copied; after
//! that, failures are isolated per file.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::codec::{JpegCodec, StandardJpegCodec};
use crate::config::Configuration;
use crate::error::IngestError;
use crate::ledger::{FileRecord, LedgerClient};
use crate::media::{MediaFile, UploadBatch, UploadId};
use crate::paths::PathResolver;
use crate::raw::{RawDecoder, TiffRawDecoder};
use crate::tasks::transfer::{FileOutcome, FileReport, Transfer};
use crate::transcode::{ThumbnailTranscoder, TranscodeSettings};
use crate::walk::{DirectoryWalker, WalkFailure};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectoryState {
    Scanning,
    BatchOpened,
    FilesRegistered,
    Transferring,
    Completed,
    Failed,
}

impl fmt::Display for DirectoryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Scanning => "scanning",
            Self::BatchOpened => "batch-opened",
            Self::FilesRegistered => "files-registered",
            Self::Transferring => "transferring",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// An entry left out of its directory's batch because it could not be resolved.
#[derive(Debug)]
pub struct RejectedEntry {
    pub name: String,
    pub source_path: PathBuf,
    pub error: IngestError,
}

/// Why a whole directory stopped in [`DirectoryState::Failed`].
#[derive(Debug)]
pub struct DirectoryFailure {
    /// Stage that was running when the error hit.
    pub stage: DirectoryState,
    pub error: IngestError,
}

#[derive(Debug)]
pub struct DirectoryReport {
    pub dir: PathBuf,
    pub state: DirectoryState,
    pub upload: Option<UploadId>,
    pub files: Vec<FileReport>,
    pub rejected: Vec<RejectedEntry>,
    pub failure: Option<DirectoryFailure>,
}

impl DirectoryReport {
    fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            state: DirectoryState::Scanning,
            upload: None,
            files: Vec::new(),
            rejected: Vec::new(),
            failure: None,
        }
    }

    fn fail(mut self, error: IngestError) -> Self {
        error!(
            dir = %self.dir.display(),
            stage = %self.state,
            error = %error,
            "directory failed"
        );
        self.failure = Some(DirectoryFailure {
            stage: self.state,
            error,
        });
        self.state = DirectoryState::Failed;
        self
    }
}

#[derive(Debug, Default)]
pub struct IngestReport {
    /// Processing order (children before parents).
    pub directories: Vec<DirectoryReport>,
    pub walk_failures: Vec<WalkFailure>,
    pub cancelled: bool,
}

impl IngestReport {
    fn count(&self, pred: impl Fn(&FileOutcome) -> bool) -> usize {
        self.directories
            .iter()
            .flat_map(|d| &d.files)
            .filter(|f| pred(&f.outcome))
            .count()
    }

    pub fn completed_files(&self) -> usize {
        self.count(|o| matches!(o, FileOutcome::Completed))
    }

    /// Copied, but the ledger does not know.
    pub fn unrecorded_files(&self) -> usize {
        self.count(|o| matches!(o, FileOutcome::Unrecorded { .. }))
    }

    pub fn failed_files(&self) -> usize {
        self.count(|o| matches!(o, FileOutcome::Failed { .. }))
    }

    pub fn cancelled_files(&self) -> usize {
        self.count(|o| matches!(o, FileOutcome::Cancelled))
    }

    pub fn rejected_entries(&self) -> usize {
        self.directories.iter().map(|d| d.rejected.len()).sum()
    }

    pub fn failed_directories(&self) -> usize {
        self.directories
            .iter()
            .filter(|d| d.state == DirectoryState::Failed)
            .count()
    }

    pub fn uploads(&self) -> impl Iterator<Item = UploadId> + '_ {
        self.directories.iter().filter_map(|d| d.upload)
    }

    /// Every entry made it into the ledger as complete.
    pub fn is_clean(&self) -> bool {
        !self.cancelled
            && self.walk_failures.is_empty()
            && self.failed_directories() == 0
            && self.rejected_entries() == 0
            && self.completed_files() == self.count(|_| true)
    }

    pub fn directory(&self, dir: &Path) -> Option<&DirectoryReport> {
        self.directories.iter().find(|d| d.dir == dir)
    }
}

fn join_failure(what: &Path, err: tokio::task::JoinError) -> IngestError {
    IngestError::io(what, std::io::Error::other(format!("worker task failed: {err}")))
}

async fn blocking<T, F>(what: &Path, f: F) -> Result<T, IngestError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, IngestError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| join_failure(what, e))?
}

struct Scan {
    files: Vec<MediaFile>,
    rejected: Vec<RejectedEntry>,
}

fn scan_directory(
    walker: DirectoryWalker,
    resolver: &PathResolver,
    dir: &Path,
) -> Result<Scan, IngestError> {
    let mut scan = Scan {
        files: Vec::new(),
        rejected: Vec::new(),
    };
    for source in walker.list(dir)? {
        let name = source.name.clone();
        let source_path = source.source_path.clone();
        match resolver.resolve(source) {
            Ok(file) => {
                debug!(
                    src = %file.source_path().display(),
                    dest = %file.destination_path().display(),
                    "resolved"
                );
                scan.files.push(file);
            }
            Err(error) => {
                warn!(src = %source_path.display(), error = %error, "entry rejected");
                scan.rejected.push(RejectedEntry {
                    name,
                    source_path,
                    error,
                });
            }
        }
    }
    Ok(scan)
}

pub struct IngestPipeline {
    walker: DirectoryWalker,
    resolver: Arc<PathResolver>,
    ledger: Arc<dyn LedgerClient>,
    decoder: Arc<dyn RawDecoder>,
    codec: Arc<dyn JpegCodec>,
    settings: TranscodeSettings,
    raw_extensions: Vec<String>,
    workers: usize,
    cancel: CancellationToken,
}

impl IngestPipeline {
    /// Pipeline writing below `destination` with the default RAW decoder and
    /// JPEG codec. `config` must already be validated.
    pub fn new(
        config: &Configuration,
        destination: impl Into<PathBuf>,
        ledger: Arc<dyn LedgerClient>,
    ) -> Result<Self> {
        let resolver = PathResolver::new(destination)
            .with_date_source(config.date_source)
            .with_timezone(config.timezone)
            .with_collision_policy(config.collision);
        Ok(Self {
            walker: DirectoryWalker::new(config.walk_options()),
            resolver: Arc::new(resolver),
            ledger,
            decoder: Arc::new(TiffRawDecoder),
            codec: Arc::new(StandardJpegCodec),
            settings: config.transcode_settings()?,
            raw_extensions: config.raw_extensions.clone(),
            workers: config.workers.max(1),
            cancel: CancellationToken::new(),
        })
    }

    #[must_use]
    pub fn with_raw_decoder(mut self, decoder: Arc<dyn RawDecoder>) -> Self {
        self.decoder = decoder;
        self
    }

    #[must_use]
    pub fn with_jpeg_codec(mut self, codec: Arc<dyn JpegCodec>) -> Self {
        self.codec = codec;
        self
    }

    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Ingest every directory under `source`, children before parents.
    ///
    /// # Errors
    /// Only when the source root itself cannot be walked; everything below
    /// the root is reported in the returned [`IngestReport`].
    #[instrument(skip(self), fields(source = %source.display()))]
    pub async fn run(&self, source: &Path) -> Result<IngestReport, IngestError> {
        let walker = self.walker;
        let root = source.to_path_buf();
        let plan = blocking(source, move || walker.plan(&root)).await?;
        info!(
            directories = plan.directories.len(),
            walk_failures = plan.failures.len(),
            "walk planned"
        );

        let transfer = Arc::new(Transfer::new(
            Arc::clone(&self.ledger),
            Arc::clone(&self.decoder),
            ThumbnailTranscoder::new(Arc::clone(&self.codec), self.settings),
            self.raw_extensions.clone(),
        ));

        let mut report = IngestReport {
            walk_failures: plan.failures,
            ..IngestReport::default()
        };
        for dir in plan.directories {
            if self.cancel.is_cancelled() {
                info!(dir = %dir.display(), "cancelled; directory not started");
                break;
            }
            report
                .directories
                .push(self.ingest_directory(&dir, &transfer).await);
        }
        report.cancelled = self.cancel.is_cancelled();

        info!(
            completed = report.completed_files(),
            failed = report.failed_files(),
            unrecorded = report.unrecorded_files(),
            rejected = report.rejected_entries(),
            cancelled = report.cancelled_files(),
            failed_directories = report.failed_directories(),
            "ingest finished"
        );
        Ok(report)
    }

    #[instrument(skip(self, transfer), fields(dir = %dir.display()))]
    async fn ingest_directory(&self, dir: &Path, transfer: &Arc<Transfer>) -> DirectoryReport {
        let mut report = DirectoryReport::new(dir);

        // Scanning
        let walker = self.walker;
        let resolver = Arc::clone(&self.resolver);
        let owned_dir = dir.to_path_buf();
        let scan = match blocking(dir, move || scan_directory(walker, &resolver, &owned_dir)).await {
            Ok(scan) => scan,
            Err(err) => return report.fail(err),
        };
        report.rejected = scan.rejected;
        let files = scan.files;
        if files.is_empty() {
            debug!("nothing to ingest");
            report.state = DirectoryState::Completed;
            return report;
        }

        // BatchOpened
        let batch = UploadBatch::new(Utc::now(), &files);
        let ledger = Arc::clone(&self.ledger);
        let opened = batch.clone();
        if let Err(err) = blocking(dir, move || Ok(ledger.create_upload(&opened)?)).await {
            return report.fail(err);
        }
        report.upload = Some(batch.id);
        report.state = DirectoryState::BatchOpened;
        info!(upload = %batch.id, files = batch.len(), "batch opened");

        // FilesRegistered
        let records: Vec<FileRecord> = files
            .iter()
            .map(|f| FileRecord::pending(f, batch.id))
            .collect();
        let ledger = Arc::clone(&self.ledger);
        if let Err(err) = blocking(dir, move || Ok(ledger.register_files(&records)?)).await {
            let ledger = Arc::clone(&self.ledger);
            let upload = batch.id;
            match blocking(dir, move || Ok(ledger.abandon_upload(upload)?)).await {
                Ok(()) => {
                    debug!(upload = %upload, "empty batch abandoned");
                    report.upload = None;
                }
                Err(abandon) => {
                    error!(upload = %upload, error = %abandon, "could not abandon empty batch");
                }
            }
            return report.fail(err);
        }
        report.state = DirectoryState::FilesRegistered;
        debug!(upload = %batch.id, "files registered");

        // Transferring
        report.state = DirectoryState::Transferring;
        report.files = self.transfer_all(files, transfer).await;
        report.files.sort_by(|a, b| a.name.cmp(&b.name));

        report.state = DirectoryState::Completed;
        info!(upload = %batch.id, files = report.files.len(), "directory completed");
        report
    }

    async fn transfer_all(&self, files: Vec<MediaFile>, transfer: &Arc<Transfer>) -> Vec<FileReport> {
        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut tasks = JoinSet::new();
        let mut in_flight = HashMap::new();
        let mut reports = Vec::with_capacity(files.len());

        for file in files {
            let permit = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                permit = Arc::clone(&semaphore).acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                debug!(file = %file.source_path().display(), "cancelled before transfer");
                reports.push(FileReport::new(&file, FileOutcome::Cancelled));
                continue;
            };
            let placeholder = FileReport::new(
                &file,
                FileOutcome::Failed {
                    reason: "transfer worker panicked".into(),
                },
            );
            let transfer = Arc::clone(transfer);
            let handle = tasks.spawn_blocking(move || {
                let _permit = permit;
                transfer.run(file)
            });
            in_flight.insert(handle.id(), placeholder);
        }

        while let Some(joined) = tasks.join_next_with_id().await {
            match joined {
                Ok((id, file_report)) => {
                    in_flight.remove(&id);
                    reports.push(file_report);
                }
                Err(err) => {
                    error!(error = %err, "transfer worker failed");
                    if let Some(placeholder) = in_flight.remove(&err.id()) {
                        self.record_lost_worker(&placeholder).await;
                        reports.push(placeholder);
                    }
                }
            }
        }
        reports
    }

    /// A worker that died never reached its own `fail_file`; annotate the
    /// record here so it does not sit pending without a reason.
    async fn record_lost_worker(&self, placeholder: &FileReport) {
        let FileOutcome::Failed { reason } = &placeholder.outcome else {
            return;
        };
        let ledger = Arc::clone(&self.ledger);
        let id = placeholder.id;
        let reason = reason.clone();
        if let Err(err) = blocking(&placeholder.source_path, move || {
            Ok(ledger.fail_file(id, &reason)?)
        })
        .await
        {
            error!(file = %id, error = %err, "could not record transfer failure");
        }
    }
}
