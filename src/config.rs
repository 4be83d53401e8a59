use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, ensure};
use chrono_tz::Tz;
use serde::Deserialize;

use crate::codec::Scale;
use crate::paths::{CollisionPolicy, DateSource};
use crate::transcode::TranscodeSettings;
use crate::walk::WalkOptions;

const DEFAULT_RAW_EXTENSIONS: &[&str] = &[
    "orf", "cr2", "nef", "nrw", "arw", "srf", "sr2", "dng", "rw2", "raf", "pef", "srw", "3fr",
    "erf", "kdc", "mrw", "x3f",
];

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct Configuration {
    /// Lower-case extensions that get preview and thumbnail artifacts.
    pub raw_extensions: Vec<String>,
    /// Concurrent file transfers per directory.
    pub workers: usize,
    /// Timestamp used for the year/month/day folders.
    pub date_source: DateSource,
    /// Zone the date folders are computed in; host local time when unset.
    pub timezone: Option<Tz>,
    /// What to do when two files land on the same destination.
    pub collision: CollisionPolicy,
    /// Skip dot-directories below the source root.
    pub skip_hidden: bool,
    pub follow_links: bool,
    pub preview: PreviewOptions,
    pub thumbnail: ThumbnailOptions,
    pub ledger: LedgerOptions,
}

impl Configuration {
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        serde_yaml::from_str(&s).with_context(|| format!("failed to parse config {}", path.display()))
    }

    /// Validate runtime invariants that cannot be expressed via serde defaults alone.
    pub fn validated(mut self) -> Result<Self> {
        ensure!(self.workers > 0, "workers must be greater than zero");
        for ext in &mut self.raw_extensions {
            let trimmed = ext.trim().trim_start_matches('.');
            ensure!(!trimmed.is_empty(), "raw-extensions must not contain empty entries");
            ensure!(
                !trimmed.contains(['/', '\\', '.']),
                "raw-extensions entry {ext:?} must be a bare extension"
            );
            *ext = trimmed.to_ascii_lowercase();
        }
        self.preview.validate()?;
        self.thumbnail.validate()?;
        self.ledger.validate()?;
        Ok(self)
    }

    pub fn walk_options(&self) -> WalkOptions {
        WalkOptions {
            skip_hidden: self.skip_hidden,
            follow_links: self.follow_links,
        }
    }

    pub fn transcode_settings(&self) -> Result<TranscodeSettings> {
        Ok(TranscodeSettings {
            preview_quality: self.preview.quality,
            thumbnail_quality: self.thumbnail.quality,
            thumbnail_scale: self.thumbnail.scale()?,
        })
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            raw_extensions: DEFAULT_RAW_EXTENSIONS.iter().map(|e| (*e).to_string()).collect(),
            workers: 4,
            date_source: DateSource::default(),
            timezone: None,
            collision: CollisionPolicy::default(),
            skip_hidden: false,
            follow_links: true,
            preview: PreviewOptions::default(),
            thumbnail: ThumbnailOptions::default(),
            ledger: LedgerOptions::default(),
        }
    }
}

fn validate_quality(key: &str, quality: u8) -> Result<()> {
    ensure!(
        (1..=100).contains(&quality),
        "{key} must be between 1 and 100"
    );
    Ok(())
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct PreviewOptions {
    /// JPEG quality of the full-size preview.
    pub quality: u8,
}

impl PreviewOptions {
    fn validate(&self) -> Result<()> {
        validate_quality("preview.quality", self.quality)
    }
}

impl Default for PreviewOptions {
    fn default() -> Self {
        Self { quality: 92 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct ThumbnailOptions {
    /// Linear downscale denominator: 1, 2, 4 or 8.
    pub scale: u8,
    pub quality: u8,
}

impl ThumbnailOptions {
    fn scale(&self) -> Result<Scale> {
        Scale::new(self.scale)
            .with_context(|| format!("thumbnail.scale must be 1, 2, 4 or 8 (got {})", self.scale))
    }

    fn validate(&self) -> Result<()> {
        self.scale()?;
        validate_quality("thumbnail.quality", self.quality)
    }
}

impl Default for ThumbnailOptions {
    fn default() -> Self {
        Self {
            scale: 8,
            quality: 75,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct LedgerOptions {
    /// How long a ledger write waits on a locked database.
    #[serde(with = "humantime_serde")]
    pub busy_timeout: Duration,
}

impl LedgerOptions {
    fn validate(&self) -> Result<()> {
        ensure!(
            self.busy_timeout > Duration::ZERO,
            "ledger.busy-timeout must be positive"
        );
        Ok(())
    }
}

impl Default for LedgerOptions {
    fn default() -> Self {
        Self {
            busy_timeout: Duration::from_secs(5),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let cfg: Configuration = serde_yaml::from_str("{}").unwrap();
        let cfg = cfg.validated().unwrap();
        assert_eq!(cfg.workers, 4);
        assert_eq!(cfg.date_source, DateSource::Created);
        assert_eq!(cfg.collision, CollisionPolicy::Suffix);
        assert!(cfg.follow_links);
        assert!(cfg.raw_extensions.iter().any(|e| e == "orf"));
        assert!(cfg.raw_extensions.iter().any(|e| e == "cr2"));
        assert!(!cfg.raw_extensions.iter().any(|e| e == "jpg"));
        let settings = cfg.transcode_settings().unwrap();
        assert_eq!(settings.preview_quality, 92);
        assert_eq!(settings.thumbnail_quality, 75);
        assert_eq!(settings.thumbnail_scale.denominator(), 8);
    }

    #[test]
    fn raw_extensions_are_normalised() {
        let cfg = Configuration {
            raw_extensions: vec![".ORF".into(), " Nef ".into()],
            ..Configuration::default()
        }
        .validated()
        .unwrap();
        assert_eq!(cfg.raw_extensions, vec!["orf", "nef"]);
    }

    #[test]
    fn rejects_bad_values() {
        let bad = [
            "workers: 0",
            "thumbnail:\n  scale: 3",
            "preview:\n  quality: 0",
            "thumbnail:\n  quality: 101",
            "raw-extensions: [\"a/b\"]",
            "ledger:\n  busy-timeout: 0s",
        ];
        for yaml in bad {
            let parsed: Result<Configuration, _> = serde_yaml::from_str(yaml);
            let rejected = match parsed {
                Ok(cfg) => cfg.validated().is_err(),
                Err(_) => true,
            };
            assert!(rejected, "{yaml} should be rejected");
        }
    }
}
