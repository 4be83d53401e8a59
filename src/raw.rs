//! Camera RAW decoding seam.
//!
//! The pipeline only needs the embedded preview and the camera metadata from
//! a RAW file. [`TiffRawDecoder`] reads both from TIFF-structured containers
//! (ORF, NEF, CR2, ARW, DNG, PEF, RW2, ...) with `kamadak-exif`.

use std::fs;
use std::path::Path;

use exif::{Exif, In, Tag, Value};
use tracing::debug;

use crate::error::IngestError;
use crate::media::{ExifSummary, GpsPosition};

/// Pixel samples of a bitmap preview, held in host byte order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BitmapSamples {
    Eight(Vec<u8>),
    Sixteen(Vec<u16>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitmapImage {
    pub width: u32,
    pub height: u32,
    /// 1 (grey) or 3 (RGB); anything else cannot be written as PNM.
    pub colors: u8,
    pub samples: BitmapSamples,
}

impl BitmapImage {
    pub fn bits(&self) -> u8 {
        match self.samples {
            BitmapSamples::Eight(_) => 8,
            BitmapSamples::Sixteen(_) => 16,
        }
    }

    pub fn max_value(&self) -> u32 {
        (1u32 << self.bits()) - 1
    }
}

/// Pre-rendered image stored inside the RAW file by the camera.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmbeddedPreview {
    Jpeg(Vec<u8>),
    Bitmap(BitmapImage),
}

impl EmbeddedPreview {
    /// Every value [`Self::artifact_extension`] can return.
    pub const ARTIFACT_EXTENSIONS: [&'static str; 3] = ["jpg", "pgm", "ppm"];

    /// File extension of artifacts derived from this preview.
    pub fn artifact_extension(&self) -> &'static str {
        match self {
            Self::Jpeg(_) => "jpg",
            Self::Bitmap(bitmap) if bitmap.colors == 1 => "pgm",
            Self::Bitmap(_) => "ppm",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DecodedRaw {
    pub preview: Option<EmbeddedPreview>,
    pub metadata: ExifSummary,
}

pub trait RawDecoder: Send + Sync {
    fn decode(&self, path: &Path) -> Result<DecodedRaw, IngestError>;
}

/// Rewrite vendor TIFF magics (Olympus `IIRO`/`IIRS`/`MMOR`, Panasonic `IIU`)
/// to the standard 42 so the container parses as plain TIFF.
fn normalize_tiff_magic(data: &mut [u8]) {
    let patched = match data.get(..4) {
        Some([b'I', b'I', b'R', b'O' | b'S'] | [b'I', b'I', 0x55, 0x00]) => [0x2A, 0x00],
        Some([b'M', b'M', b'O', b'R']) => [0x00, 0x2A],
        _ => return,
    };
    data[2..4].copy_from_slice(&patched);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TiffRawDecoder;

impl RawDecoder for TiffRawDecoder {
    fn decode(&self, path: &Path) -> Result<DecodedRaw, IngestError> {
        let mut data = fs::read(path).map_err(|e| IngestError::io(path, e))?;
        normalize_tiff_magic(&mut data);
        let exif = exif::Reader::new().read_raw(data).map_err(|e| {
            IngestError::TranscodeFailure(format!("{}: {e}", path.display()))
        })?;

        let preview = largest_embedded_jpeg(&exif).map(EmbeddedPreview::Jpeg);
        if preview.is_none() {
            debug!(path = %path.display(), "raw: no embedded jpeg preview");
        }
        Ok(DecodedRaw {
            preview,
            metadata: summarize(&exif),
        })
    }
}

fn uint(exif: &Exif, tag: Tag, ifd: In) -> Option<u32> {
    exif.get_field(tag, ifd)?.value.get_uint(0)
}

fn jpeg_slice(buf: &[u8], offset: u32, length: u32) -> Option<&[u8]> {
    let start = usize::try_from(offset).ok()?;
    let end = start.checked_add(usize::try_from(length).ok()?)?;
    let slice = buf.get(start..end)?;
    slice.starts_with(&[0xFF, 0xD8]).then_some(slice)
}

fn largest_embedded_jpeg(exif: &Exif) -> Option<Vec<u8>> {
    let buf = exif.buf();
    let mut candidates = Vec::new();
    for ifd in [In::THUMBNAIL, In::PRIMARY] {
        if let (Some(offset), Some(length)) = (
            uint(exif, Tag::JPEGInterchangeFormat, ifd),
            uint(exif, Tag::JPEGInterchangeFormatLength, ifd),
        ) {
            candidates.extend(jpeg_slice(buf, offset, length));
        }
    }
    // Old-style JPEG strips (CR2 keeps its large preview there).
    if let (Some(offset), Some(length)) = (
        uint(exif, Tag::StripOffsets, In::PRIMARY),
        uint(exif, Tag::StripByteCounts, In::PRIMARY),
    ) {
        candidates.extend(jpeg_slice(buf, offset, length));
    }
    candidates
        .into_iter()
        .max_by_key(|jpeg| jpeg.len())
        .map(<[u8]>::to_vec)
}

fn ascii(exif: &Exif, tag: Tag) -> Option<String> {
    match &exif.get_field(tag, In::PRIMARY)?.value {
        Value::Ascii(parts) => parts
            .first()
            .map(|raw| {
                String::from_utf8_lossy(raw)
                    .trim_end_matches('\0')
                    .trim()
                    .to_string()
            })
            .filter(|s| !s.is_empty()),
        _ => None,
    }
}

fn rationals(exif: &Exif, tag: Tag) -> Option<Vec<f64>> {
    match &exif.get_field(tag, In::PRIMARY)?.value {
        Value::Rational(values) => {
            let out: Vec<f64> = values
                .iter()
                .map(|r| r.to_f64())
                .filter(|v| v.is_finite())
                .collect();
            (out.len() == values.len() && !out.is_empty()).then_some(out)
        }
        _ => None,
    }
}

fn rational(exif: &Exif, tag: Tag) -> Option<f64> {
    rationals(exif, tag).map(|v| v[0])
}

fn dms(exif: &Exif, tag: Tag) -> Option<[f64; 3]> {
    let values = rationals(exif, tag)?;
    match values.as_slice() {
        [d, m, s] => Some([*d, *m, *s]),
        _ => None,
    }
}

fn summarize(exif: &Exif) -> ExifSummary {
    let gps = match (dms(exif, Tag::GPSLatitude), dms(exif, Tag::GPSLongitude)) {
        (Some(latitude), Some(longitude)) => Some(GpsPosition {
            latitude,
            latitude_ref: ascii(exif, Tag::GPSLatitudeRef),
            longitude,
            longitude_ref: ascii(exif, Tag::GPSLongitudeRef),
            altitude: rational(exif, Tag::GPSAltitude),
            altitude_ref: uint(exif, Tag::GPSAltitudeRef, In::PRIMARY)
                .and_then(|v| u8::try_from(v).ok()),
        }),
        _ => None,
    };

    ExifSummary {
        make: ascii(exif, Tag::Make),
        model: ascii(exif, Tag::Model),
        lens: ascii(exif, Tag::LensModel),
        focal_length_mm: rational(exif, Tag::FocalLength),
        aperture: rational(exif, Tag::FNumber),
        shutter_speed_s: rational(exif, Tag::ExposureTime),
        iso: uint(exif, Tag::PhotographicSensitivity, In::PRIMARY),
        orientation: uint(exif, Tag::Orientation, In::PRIMARY).and_then(|v| u16::try_from(v).ok()),
        gps,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_vendor_magics() {
        let mut orf = b"IIRO\x08\0\0\0".to_vec();
        normalize_tiff_magic(&mut orf);
        assert_eq!(&orf[..4], b"II*\0");

        let mut rw2 = b"IIU\0\x18\0\0\0".to_vec();
        normalize_tiff_magic(&mut rw2);
        assert_eq!(&rw2[..4], b"II*\0");

        let mut big = b"MMOR\0\0\0\x08".to_vec();
        normalize_tiff_magic(&mut big);
        assert_eq!(&big[..4], b"MM\0*");

        let mut tiff = b"II*\0\x08\0\0\0".to_vec();
        normalize_tiff_magic(&mut tiff);
        assert_eq!(&tiff[..4], b"II*\0");

        let mut short = b"II".to_vec();
        normalize_tiff_magic(&mut short);
        assert_eq!(short, b"II");
    }

    #[test]
    fn artifact_extension_follows_preview_kind() {
        assert_eq!(EmbeddedPreview::Jpeg(vec![]).artifact_extension(), "jpg");
        let grey = BitmapImage {
            width: 1,
            height: 1,
            colors: 1,
            samples: BitmapSamples::Eight(vec![0]),
        };
        assert_eq!(
            EmbeddedPreview::Bitmap(grey.clone()).artifact_extension(),
            "pgm"
        );
        let rgb = BitmapImage {
            colors: 3,
            samples: BitmapSamples::Sixteen(vec![0; 3]),
            ..grey
        };
        assert_eq!(rgb.max_value(), 65535);
        assert_eq!(EmbeddedPreview::Bitmap(rgb).artifact_extension(), "ppm");
    }

    #[test]
    fn jpeg_slice_requires_soi_and_bounds() {
        let buf = [0u8, 0xFF, 0xD8, 0xFF, 0xD9];
        assert_eq!(jpeg_slice(&buf, 1, 4), Some(&buf[1..5]));
        assert_eq!(jpeg_slice(&buf, 0, 4), None);
        assert_eq!(jpeg_slice(&buf, 1, 5), None);
        assert_eq!(jpeg_slice(&buf, u32::MAX, u32::MAX), None);
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = TiffRawDecoder
            .decode(Path::new("/definitely/missing/file.orf"))
            .unwrap_err();
        assert!(matches!(err, IngestError::Io { .. }));
    }

    #[test]
    fn non_tiff_is_transcode_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bogus.cr3");
        std::fs::write(&path, b"\0\0\0\x18ftypcrx ").unwrap();
        let err = TiffRawDecoder.decode(&path).unwrap_err();
        assert!(matches!(err, IngestError::TranscodeFailure(_)));
    }
}
