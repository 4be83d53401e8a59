//! JPEG marker scanning: locate the Start-Of-Image marker and the EXIF (APP1)
//! segment, and splice a captured APP1 segment into a freshly encoded stream.
//!
//! Marker and length words are big-endian on the wire; every read goes
//! through [`crate::endian`].

use std::ops::Range;

use crate::endian::read_u16_be;
use crate::error::IngestError;

pub const SOI: u16 = 0xFFD8;
pub const EOI: u16 = 0xFFD9;
pub const SOS: u16 = 0xFFDA;
pub const APP0: u16 = 0xFFE0;
pub const APP1: u16 = 0xFFE1;

/// One marker segment: `range` spans the marker word, the length word and the
/// payload (just the marker word for standalone markers).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub marker: u16,
    pub range: Range<usize>,
}

#[inline]
fn is_standalone(marker: u16) -> bool {
    matches!(marker, 0xFF01 | 0xFFD0..=0xFFD7 | SOI | EOI)
}

fn malformed(offset: usize, reason: &'static str) -> IngestError {
    IngestError::MalformedJpeg { offset, reason }
}

/// Sequential walk over the header segments of a JPEG stream.
///
/// Yields segments after the Start-Of-Image marker and stops after yielding
/// End-Of-Image or Start-Of-Scan (entropy-coded data follows SOS, so no
/// further marker can be read sequentially).
#[derive(Debug)]
pub struct MarkerScanner<'a> {
    buf: &'a [u8],
    pos: usize,
    finished: bool,
}

impl<'a> MarkerScanner<'a> {
    /// Fails with [`IngestError::NotAJpeg`] unless `buf` starts with `0xFFD8`.
    pub fn new(buf: &'a [u8]) -> Result<Self, IngestError> {
        match read_u16_be(buf, 0) {
            Some(SOI) => Ok(Self {
                buf,
                pos: 2,
                finished: false,
            }),
            Some(other) => Err(IngestError::NotAJpeg(other)),
            None => Err(IngestError::NotAJpeg(buf.first().map_or(0, |b| u16::from(*b) << 8))),
        }
    }

    /// Byte range of the Start-Of-Image marker.
    pub fn soi_range(&self) -> Range<usize> {
        0..2
    }

    fn read_segment(&mut self) -> Result<Segment, IngestError> {
        // Fill bytes: any number of 0xFF may precede a marker.
        while self.buf.get(self.pos) == Some(&0xFF) && self.buf.get(self.pos + 1) == Some(&0xFF) {
            self.pos += 1;
        }
        let start = self.pos;
        if start == self.buf.len() {
            return Err(malformed(start, "stream ended before End-Of-Image"));
        }
        let marker =
            read_u16_be(self.buf, start).ok_or_else(|| malformed(start, "truncated marker"))?;
        if marker >> 8 != 0xFF {
            return Err(malformed(start, "expected a marker"));
        }
        if is_standalone(marker) {
            if marker == SOI {
                return Err(malformed(start, "unexpected Start-Of-Image"));
            }
            self.pos = start + 2;
            return Ok(Segment {
                marker,
                range: start..self.pos,
            });
        }
        let length = read_u16_be(self.buf, start + 2)
            .ok_or_else(|| malformed(start + 2, "truncated segment length"))?;
        if length < 2 {
            return Err(malformed(start + 2, "segment length shorter than 2"));
        }
        let end = start + 2 + usize::from(length);
        if end > self.buf.len() {
            return Err(malformed(start + 2, "segment runs past end of buffer"));
        }
        self.pos = end;
        Ok(Segment {
            marker,
            range: start..end,
        })
    }
}

impl Iterator for MarkerScanner<'_> {
    type Item = Result<Segment, IngestError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.read_segment() {
            Ok(segment) => {
                if matches!(segment.marker, EOI | SOS) {
                    self.finished = true;
                }
                Some(Ok(segment))
            }
            Err(err) => {
                self.finished = true;
                Some(Err(err))
            }
        }
    }
}

/// Locate the first APP1 segment. Returns the marker+length+payload range, or
/// `None` when End-Of-Image (or Start-Of-Scan) comes first.
pub fn find_exif_segment(buf: &[u8]) -> Result<Option<Range<usize>>, IngestError> {
    for segment in MarkerScanner::new(buf)? {
        let segment = segment?;
        match segment.marker {
            APP1 => return Ok(Some(segment.range)),
            EOI | SOS => return Ok(None),
            _ => {}
        }
    }
    Ok(None)
}

/// Build `SOI + app1 + rest`, where `rest` starts at the first marker of
/// `encoded` that is neither APP0 nor APP1.
pub fn splice_exif(encoded: &[u8], app1: &[u8]) -> Result<Vec<u8>, IngestError> {
    let mut scanner = MarkerScanner::new(encoded)?;
    let soi = scanner.soi_range();
    let mut rest = None;
    for segment in scanner.by_ref() {
        let segment = segment?;
        if !matches!(segment.marker, APP0 | APP1) {
            rest = Some(segment.range.start);
            break;
        }
    }
    let rest = rest.ok_or_else(|| malformed(encoded.len(), "no segment after application markers"))?;

    let mut out = Vec::with_capacity(encoded.len() + app1.len());
    out.extend_from_slice(&encoded[soi]);
    out.extend_from_slice(app1);
    out.extend_from_slice(&encoded[rest..]);
    Ok(out)
}
