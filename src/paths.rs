//! Destination path assignment.
//!
//! Layout: `root/<YEAR>/<MONTH_NAME>/<DAY>/<extension>/<name>`. The path
//! computed from a (date, extension, name) triple is deterministic; the
//! collision policy decides what happens when two distinct sources land on the
//! same leaf.

use std::collections::HashSet;
use std::fs::{self, Metadata};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Local, Utc};
use chrono_tz::Tz;
use serde::Deserialize;
use tracing::debug;

use crate::error::IngestError;
use crate::media::{DateParts, MediaFile, SourceFile, artifact_path};
use crate::raw::EmbeddedPreview;
use crate::transcode::OutputKind;

/// Which filesystem timestamp stands in for the capture date.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DateSource {
    /// Birth time; modification time where the platform has no birth time.
    #[default]
    Created,
    Modified,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CollisionPolicy {
    /// Append `-<n>` to the stem, smallest free `n` first.
    #[default]
    Suffix,
    /// Fail the entry with [`IngestError::DestinationCollision`].
    Reject,
}

/// Lower-cased text after the last `.` in `name`.
///
/// # Errors
/// [`IngestError::NoExtension`] when there is no dot or nothing follows it,
/// [`IngestError::InvalidComponent`] when the result contains a separator.
pub fn extract_extension(name: &str) -> Result<String, IngestError> {
    let ext = name
        .rfind('.')
        .map(|dot| &name[dot + 1..])
        .filter(|ext| !ext.is_empty())
        .ok_or_else(|| IngestError::NoExtension(name.to_string()))?;
    validate_component(ext)?;
    Ok(ext.to_ascii_lowercase())
}

/// Reject anything that would not stay a single path component once joined.
pub fn validate_component(component: &str) -> Result<&str, IngestError> {
    let bad = component.is_empty()
        || component == "."
        || component == ".."
        || component.contains(['/', '\\', '\0']);
    if bad {
        return Err(IngestError::InvalidComponent(component.to_string()));
    }
    Ok(component)
}

/// `root/YEAR/MONTH/DAY/ext/name`, without touching the filesystem.
pub fn destination_for(
    root: &Path,
    date: &DateParts,
    extension: &str,
    name: &str,
) -> Result<PathBuf, IngestError> {
    let mut path = root.to_path_buf();
    for component in [date.year.as_str(), date.month, date.day.as_str(), extension, name] {
        path.push(validate_component(component)?);
    }
    Ok(path)
}

/// Create `dir` and its parents. An existing directory, including one created
/// concurrently by another worker, is success.
pub fn create_bucket(dir: &Path) -> Result<(), IngestError> {
    match fs::create_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::AlreadyExists && dir.is_dir() => Ok(()),
        Err(e) => Err(IngestError::io(dir, e)),
    }
}

fn metadata(path: &Path) -> Result<Metadata, IngestError> {
    fs::metadata(path).map_err(|source| IngestError::MetadataUnavailable {
        path: path.to_path_buf(),
        source,
    })
}

/// Destinations handed out by one resolver.
#[derive(Debug, Default)]
struct Claims {
    leaves: HashSet<PathBuf>,
    /// `bucket/stem` of every claimed leaf.
    stems: HashSet<PathBuf>,
}

fn stem_key(leaf: &Path) -> PathBuf {
    leaf.with_extension("")
}

fn artifacts_on_disk(leaf: &Path) -> bool {
    OutputKind::ALL.into_iter().any(|kind| {
        EmbeddedPreview::ARTIFACT_EXTENSIONS
            .iter()
            .any(|ext| fs::symlink_metadata(artifact_path(leaf, kind, ext)).is_ok())
    })
}

impl Claims {
    fn is_taken(&self, leaf: &Path) -> bool {
        self.leaves.contains(leaf)
            || self.stems.contains(&stem_key(leaf))
            || fs::symlink_metadata(leaf).is_ok()
            || artifacts_on_disk(leaf)
    }

    fn insert(&mut self, leaf: &Path) {
        self.stems.insert(stem_key(leaf));
        self.leaves.insert(leaf.to_path_buf());
    }
}

#[derive(Debug)]
pub struct PathResolver {
    root: PathBuf,
    date_source: DateSource,
    timezone: Option<Tz>,
    collision: CollisionPolicy,
    claims: Mutex<Claims>,
}

impl PathResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            date_source: DateSource::default(),
            timezone: None,
            collision: CollisionPolicy::default(),
            claims: Mutex::new(Claims::default()),
        }
    }

    #[must_use]
    pub fn with_date_source(mut self, date_source: DateSource) -> Self {
        self.date_source = date_source;
        self
    }

    /// `None` means the host's local zone.
    #[must_use]
    pub fn with_timezone(mut self, timezone: Option<Tz>) -> Self {
        self.timezone = timezone;
        self
    }

    #[must_use]
    pub fn with_collision_policy(mut self, collision: CollisionPolicy) -> Self {
        self.collision = collision;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn timestamp(&self, path: &Path, meta: &Metadata) -> Result<DateTime<Utc>, IngestError> {
        let stamp = match self.date_source {
            DateSource::Created => match meta.created() {
                Err(e) if e.kind() == ErrorKind::Unsupported => {
                    debug!(path = %path.display(), "birth time unsupported, using mtime");
                    meta.modified()
                }
                other => other,
            },
            DateSource::Modified => meta.modified(),
        };
        stamp
            .map(DateTime::<Utc>::from)
            .map_err(|source| IngestError::MetadataUnavailable {
                path: path.to_path_buf(),
                source,
            })
    }

    pub fn date_parts(&self, at: DateTime<Utc>) -> DateParts {
        match self.timezone {
            Some(tz) => DateParts::from_datetime(&at.with_timezone(&tz)),
            None => DateParts::from_datetime(&at.with_timezone(&Local)),
        }
    }

    /// Date folders for the file at `path`.
    pub fn resolve_date(&self, path: &Path) -> Result<DateParts, IngestError> {
        let meta = metadata(path)?;
        Ok(self.date_parts(self.timestamp(path, &meta)?))
    }

    /// Reserve `candidate` (or a suffixed sibling) for one source file.
    ///
    /// Artifacts are named after the destination stem, so a leaf whose stem
    /// is already claimed in its bucket, or whose artifacts already exist on
    /// disk, counts as taken too.
    pub fn claim_destination(&self, candidate: PathBuf) -> Result<PathBuf, IngestError> {
        let mut claims = self.claims.lock().unwrap_or_else(PoisonError::into_inner);
        if !claims.is_taken(&candidate) {
            claims.insert(&candidate);
            return Ok(candidate);
        }
        if self.collision == CollisionPolicy::Reject {
            return Err(IngestError::DestinationCollision(candidate));
        }

        let stem = candidate
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let ext = candidate
            .extension()
            .map(|s| s.to_string_lossy().into_owned());
        for n in 1u32.. {
            let leaf = match &ext {
                Some(ext) => format!("{stem}-{n}.{ext}"),
                None => format!("{stem}-{n}"),
            };
            let next = candidate.with_file_name(leaf);
            if !claims.is_taken(&next) {
                debug!(from = %candidate.display(), to = %next.display(), "destination suffixed");
                claims.insert(&next);
                return Ok(next);
            }
        }
        Err(IngestError::DestinationCollision(candidate))
    }

    /// Resolve extension, date and destination, create the bucket directory
    /// and claim the leaf.
    pub fn resolve(&self, source: SourceFile) -> Result<MediaFile, IngestError> {
        let extension = extract_extension(&source.name)?;
        let meta = metadata(&source.source_path)?;
        let created_at = self.timestamp(&source.source_path, &meta)?;
        let parts = self.date_parts(created_at);
        let candidate = destination_for(&self.root, &parts, &extension, &source.name)?;
        if let Some(bucket) = candidate.parent() {
            create_bucket(bucket)?;
        }
        let destination = self.claim_destination(candidate)?;
        Ok(MediaFile::new(
            source,
            extension,
            created_at,
            meta.len(),
            destination,
        ))
    }
}
