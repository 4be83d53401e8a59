//! Preview and thumbnail artifacts for RAW files.
//!
//! JPEG previews are decoded and re-encoded through a [`JpegCodec`], then the
//! original EXIF (APP1) segment is spliced back in verbatim. Bitmap previews
//! are written as PNM with 16-bit samples in network byte order.

use std::sync::Arc;

use crate::codec::{JpegCodec, Scale};
use crate::endian::write_u16_slice_be;
use crate::error::IngestError;
use crate::jpeg::{find_exif_segment, splice_exif};
use crate::media::ExifSummary;
use crate::raw::{BitmapImage, BitmapSamples, DecodedRaw, EmbeddedPreview};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    /// Full embedded-preview resolution, minimal recompression.
    Preview,
    /// Downscaled, lower quality.
    Thumbnail,
}

impl OutputKind {
    pub const ALL: [Self; 2] = [Self::Preview, Self::Thumbnail];

    /// Infix used in artifact file names.
    pub fn tag(self) -> &'static str {
        match self {
            Self::Preview => "prev",
            Self::Thumbnail => "thumb",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TranscodeSettings {
    pub preview_quality: u8,
    pub thumbnail_quality: u8,
    pub thumbnail_scale: Scale,
}

impl Default for TranscodeSettings {
    fn default() -> Self {
        Self {
            preview_quality: 92,
            thumbnail_quality: 75,
            thumbnail_scale: Scale::new(8).unwrap_or(Scale::FULL),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Artifact {
    pub kind: OutputKind,
    pub extension: &'static str,
    pub bytes: Vec<u8>,
}

pub struct ThumbnailTranscoder {
    codec: Arc<dyn JpegCodec>,
    settings: TranscodeSettings,
}

impl ThumbnailTranscoder {
    pub fn new(codec: Arc<dyn JpegCodec>, settings: TranscodeSettings) -> Self {
        Self { codec, settings }
    }

    pub fn settings(&self) -> &TranscodeSettings {
        &self.settings
    }

    pub fn transcode(
        &self,
        preview: &EmbeddedPreview,
        kind: OutputKind,
    ) -> Result<Artifact, IngestError> {
        let bytes = match (preview, kind) {
            (EmbeddedPreview::Jpeg(jpeg), _) => self.transcode_jpeg(jpeg, kind)?,
            (EmbeddedPreview::Bitmap(bitmap), OutputKind::Preview) => write_pnm(bitmap)?,
            (EmbeddedPreview::Bitmap(_), OutputKind::Thumbnail) => {
                return Err(IngestError::UnsupportedPreviewFormat(
                    "thumbnails require a JPEG embedded preview",
                ));
            }
        };
        Ok(Artifact {
            kind,
            extension: preview.artifact_extension(),
            bytes,
        })
    }

    fn transcode_jpeg(&self, jpeg: &[u8], kind: OutputKind) -> Result<Vec<u8>, IngestError> {
        let original_app1 = find_exif_segment(jpeg)?.map(|range| &jpeg[range]);

        let (scale, quality) = match kind {
            OutputKind::Preview => (Scale::FULL, self.settings.preview_quality),
            OutputKind::Thumbnail => (
                self.settings.thumbnail_scale,
                self.settings.thumbnail_quality,
            ),
        };
        let decoded = self
            .codec
            .decode(jpeg, scale)
            .map_err(|e| IngestError::TranscodeFailure(e.to_string()))?;
        let encoded = self
            .codec
            .encode(&decoded, quality)
            .map_err(|e| IngestError::TranscodeFailure(e.to_string()))?;

        match original_app1 {
            Some(app1) => splice_exif(&encoded, app1),
            None => Ok(encoded),
        }
    }

    /// Camera metadata worth recording, or `None` when the decoder exposed nothing.
    pub fn exif_summary(decoded: &DecodedRaw) -> Option<ExifSummary> {
        (!decoded.metadata.is_empty()).then(|| decoded.metadata.clone())
    }
}

/// Binary PNM (`P5` grey / `P6` RGB): `P<n>\n<w> <h>\n<max>\n` then samples.
pub fn write_pnm(bitmap: &BitmapImage) -> Result<Vec<u8>, IngestError> {
    let magic = match bitmap.colors {
        1 => 5,
        3 => 6,
        _ => {
            return Err(IngestError::UnsupportedPreviewFormat(
                "bitmap previews must have 1 or 3 colour channels",
            ));
        }
    };
    let expected = bitmap.width as usize * bitmap.height as usize * usize::from(bitmap.colors);
    let count = match &bitmap.samples {
        BitmapSamples::Eight(s) => s.len(),
        BitmapSamples::Sixteen(s) => s.len(),
    };
    if count != expected {
        return Err(IngestError::TranscodeFailure(format!(
            "bitmap has {count} samples, expected {expected}"
        )));
    }

    let mut out = format!(
        "P{magic}\n{} {}\n{}\n",
        bitmap.width,
        bitmap.height,
        bitmap.max_value()
    )
    .into_bytes();
    match &bitmap.samples {
        BitmapSamples::Eight(samples) => out.extend_from_slice(samples),
        BitmapSamples::Sixteen(samples) => write_u16_slice_be(&mut out, samples),
    }
    Ok(out)
}
