use std::path::PathBuf;

use thiserror::Error;

use crate::ledger::LedgerError;

/// Library error type for ingest operations.
#[derive(Debug, Error)]
pub enum IngestError {
    /// Open/stat/mkdir/copy failure on a concrete path.
    #[error("i/o error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file name has no `.` (or nothing after the last one).
    #[error("file name {0:?} has no extension")]
    NoExtension(String),

    /// A path component would escape its directory once joined.
    #[error("invalid path component {0:?}")]
    InvalidComponent(String),

    /// Filesystem metadata (creation time, size) could not be read.
    #[error("metadata unavailable for {}: {source}", path.display())]
    MetadataUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Another file already owns the destination path.
    #[error("destination {} is already taken", .0.display())]
    DestinationCollision(PathBuf),

    /// The buffer does not start with the Start-Of-Image marker.
    #[error("not a JPEG stream (leading word {0:#06x})")]
    NotAJpeg(u16),

    /// Marker sequence is truncated or carries an impossible length.
    #[error("malformed JPEG at byte {offset}: {reason}")]
    MalformedJpeg { offset: usize, reason: &'static str },

    /// The RAW decoder or the JPEG codec failed.
    #[error("transcode failed: {0}")]
    TranscodeFailure(String),

    /// The embedded preview cannot be turned into the requested artifact.
    #[error("unsupported preview format: {0}")]
    UnsupportedPreviewFormat(&'static str),

    /// Ledger write or read failed.
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl IngestError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
