//! JPEG bitstream codec seam.
//!
//! The transcoder only needs "decode at a scale" and "encode at a quality";
//! [`StandardJpegCodec`] provides both with `jpeg-decoder` and `image`.

use std::io::Cursor;

use image::ExtendedColorType;
use image::codecs::jpeg::JpegEncoder;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("jpeg decode failed: {0}")]
    Decode(String),
    #[error("jpeg encode failed: {0}")]
    Encode(String),
    #[error("unsupported pixel format {0}")]
    UnsupportedPixelFormat(&'static str),
}

/// Linear downscale applied while decoding: 1/1, 1/2, 1/4 or 1/8.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Scale(u8);

impl Scale {
    pub const FULL: Self = Self(1);

    /// `None` unless `denominator` is 1, 2, 4 or 8.
    #[must_use]
    pub fn new(denominator: u8) -> Option<Self> {
        matches!(denominator, 1 | 2 | 4 | 8).then_some(Self(denominator))
    }

    pub fn denominator(self) -> u8 {
        self.0
    }

    fn apply(self, dim: u16) -> u16 {
        dim.div_ceil(u16::from(self.0)).max(1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelLayout {
    Luma8,
    Rgb8,
}

impl PixelLayout {
    pub fn channels(self) -> usize {
        match self {
            Self::Luma8 => 1,
            Self::Rgb8 => 3,
        }
    }
}

/// Interleaved 8-bit pixels as produced by the decoder.
#[derive(Debug, Clone)]
pub struct DecodedImage {
    pub width: u32,
    pub height: u32,
    pub layout: PixelLayout,
    pub pixels: Vec<u8>,
}

pub trait JpegCodec: Send + Sync {
    fn decode(&self, jpeg: &[u8], scale: Scale) -> Result<DecodedImage, CodecError>;

    /// `quality` is 1..=100.
    fn encode(&self, image: &DecodedImage, quality: u8) -> Result<Vec<u8>, CodecError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StandardJpegCodec;

impl JpegCodec for StandardJpegCodec {
    fn decode(&self, jpeg: &[u8], scale: Scale) -> Result<DecodedImage, CodecError> {
        let mut decoder = jpeg_decoder::Decoder::new(Cursor::new(jpeg));
        decoder
            .read_info()
            .map_err(|e| CodecError::Decode(e.to_string()))?;
        let info = decoder
            .info()
            .ok_or_else(|| CodecError::Decode("missing frame header".into()))?;

        let (width, height) = if scale == Scale::FULL {
            (info.width, info.height)
        } else {
            decoder
                .scale(scale.apply(info.width), scale.apply(info.height))
                .map_err(|e| CodecError::Decode(e.to_string()))?
        };

        let layout = match info.pixel_format {
            jpeg_decoder::PixelFormat::L8 => PixelLayout::Luma8,
            jpeg_decoder::PixelFormat::RGB24 => PixelLayout::Rgb8,
            jpeg_decoder::PixelFormat::L16 => return Err(CodecError::UnsupportedPixelFormat("L16")),
            jpeg_decoder::PixelFormat::CMYK32 => {
                return Err(CodecError::UnsupportedPixelFormat("CMYK32"));
            }
            #[allow(unreachable_patterns)]
            _ => return Err(CodecError::UnsupportedPixelFormat("unknown")),
        };

        let pixels = decoder
            .decode()
            .map_err(|e| CodecError::Decode(e.to_string()))?;
        let expected = usize::from(width) * usize::from(height) * layout.channels();
        if pixels.len() != expected {
            return Err(CodecError::Decode(format!(
                "decoded {} bytes, expected {expected}",
                pixels.len()
            )));
        }

        Ok(DecodedImage {
            width: u32::from(width),
            height: u32::from(height),
            layout,
            pixels,
        })
    }

    fn encode(&self, image: &DecodedImage, quality: u8) -> Result<Vec<u8>, CodecError> {
        let color = match image.layout {
            PixelLayout::Luma8 => ExtendedColorType::L8,
            PixelLayout::Rgb8 => ExtendedColorType::Rgb8,
        };
        let mut out = Vec::new();
        JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100))
            .encode(&image.pixels, image.width, image.height, color)
            .map_err(|e| CodecError::Encode(e.to_string()))?;
        Ok(out)
    }
}
