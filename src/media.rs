//! Core data model: source entries, resolved media files, upload batches and
//! the EXIF summary carried into the ledger.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Datelike, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::transcode::OutputKind;

macro_rules! opaque_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<Uuid> for $name {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

opaque_id!(
    /// Identity of one ingested file, generated before ledger registration.
    FileId
);
opaque_id!(
    /// Identity of one directory's upload batch.
    UploadId
);

/// A non-directory entry found by the walker, before any resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub name: String,
    pub source_path: PathBuf,
}

pub const UNKNOWN_MONTH: &str = "Unknown";

const MONTH_NAMES: [&str; 12] = [
    "January",
    "February",
    "March",
    "April",
    "May",
    "June",
    "July",
    "August",
    "September",
    "October",
    "November",
    "December",
];

/// English name for a zero-based month index; anything out of range maps to
/// [`UNKNOWN_MONTH`].
#[must_use]
pub fn month_name(month0: u32) -> &'static str {
    MONTH_NAMES
        .get(month0 as usize)
        .copied()
        .unwrap_or(UNKNOWN_MONTH)
}

/// Year/month/day directory names derived from a creation timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DateParts {
    pub year: String,
    pub month: &'static str,
    pub day: String,
}

impl DateParts {
    pub fn from_datetime<Tz: TimeZone>(at: &DateTime<Tz>) -> Self {
        Self {
            year: format!("{:04}", at.year()),
            month: month_name(at.month0()),
            day: at.day().to_string(),
        }
    }
}

/// GPS fix as recorded by the camera.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpsPosition {
    /// Degrees, minutes, seconds.
    pub latitude: [f64; 3],
    pub latitude_ref: Option<String>,
    pub longitude: [f64; 3],
    pub longitude_ref: Option<String>,
    pub altitude: Option<f64>,
    /// 0 = above sea level, 1 = below.
    pub altitude_ref: Option<u8>,
}

/// Camera metadata exposed by the RAW decoder. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExifSummary {
    pub make: Option<String>,
    pub model: Option<String>,
    pub lens: Option<String>,
    pub focal_length_mm: Option<f64>,
    pub aperture: Option<f64>,
    pub shutter_speed_s: Option<f64>,
    pub iso: Option<u32>,
    pub orientation: Option<u16>,
    pub gps: Option<GpsPosition>,
}

impl ExifSummary {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// `<bucket>/preview/<stem>.<prev|thumb>.<artifact_ext>` next to `destination`.
///
/// Only the stem survives, so two destinations in one bucket that share a
/// stem share their artifact paths.
pub fn artifact_path(destination: &Path, kind: OutputKind, artifact_ext: &str) -> PathBuf {
    let bucket = destination.parent().map(Path::to_path_buf).unwrap_or_default();
    let stem = destination
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    bucket
        .join("preview")
        .join(format!("{stem}.{}.{artifact_ext}", kind.tag()))
}

/// A source file with its destination resolved.
///
/// The destination is fixed at construction; artifacts and EXIF data are
/// filled in during transfer and the value is dropped once its ledger record
/// is complete.
#[derive(Debug, Clone)]
pub struct MediaFile {
    id: FileId,
    name: String,
    source_path: PathBuf,
    extension: String,
    created_at: DateTime<Utc>,
    size_bytes: u64,
    destination_path: PathBuf,
    preview_path: Option<PathBuf>,
    thumbnail_path: Option<PathBuf>,
    exif: Option<ExifSummary>,
}

impl MediaFile {
    pub(crate) fn new(
        source: SourceFile,
        extension: String,
        created_at: DateTime<Utc>,
        size_bytes: u64,
        destination_path: PathBuf,
    ) -> Self {
        Self {
            id: FileId::new(),
            name: source.name,
            source_path: source.source_path,
            extension,
            created_at,
            size_bytes,
            destination_path,
            preview_path: None,
            thumbnail_path: None,
            exif: None,
        }
    }

    pub fn id(&self) -> FileId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source_path(&self) -> &Path {
        &self.source_path
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn destination_path(&self) -> &Path {
        &self.destination_path
    }

    pub fn preview_path(&self) -> Option<&Path> {
        self.preview_path.as_deref()
    }

    pub fn thumbnail_path(&self) -> Option<&Path> {
        self.thumbnail_path.as_deref()
    }

    pub fn exif(&self) -> Option<&ExifSummary> {
        self.exif.as_ref()
    }

    /// See [`artifact_path`].
    pub fn artifact_path(&self, kind: OutputKind, artifact_ext: &str) -> PathBuf {
        artifact_path(&self.destination_path, kind, artifact_ext)
    }

    pub(crate) fn set_artifact(&mut self, kind: OutputKind, path: PathBuf) {
        match kind {
            OutputKind::Preview => self.preview_path = Some(path),
            OutputKind::Thumbnail => self.thumbnail_path = Some(path),
        }
    }

    pub(crate) fn set_exif(&mut self, exif: Option<ExifSummary>) {
        self.exif = exif;
    }
}

/// The files discovered in one directory visit, registered as a unit.
#[derive(Debug, Clone)]
pub struct UploadBatch {
    pub id: UploadId,
    pub created_at: DateTime<Utc>,
    file_ids: Vec<FileId>,
}

impl UploadBatch {
    pub fn new(created_at: DateTime<Utc>, files: &[MediaFile]) -> Self {
        Self {
            id: UploadId::new(),
            created_at,
            file_ids: files.iter().map(MediaFile::id).collect(),
        }
    }

    pub fn file_ids(&self) -> &[FileId] {
        &self.file_ids
    }

    pub fn len(&self) -> usize {
        self.file_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.file_ids.is_empty()
    }
}
