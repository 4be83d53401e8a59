#![allow(dead_code)]

use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use base64::Engine;
use chrono::{TimeZone, Utc};

use media_organizer::codec::{DecodedImage, JpegCodec, PixelLayout, StandardJpegCodec};
use media_organizer::config::Configuration;
use media_organizer::jpeg::{APP1, find_exif_segment, splice_exif};
use media_organizer::paths::DateSource;

/// 2x1 baseline JPEG with an APP0 block and a big-endian EXIF APP1 block
/// (orientation 6) at bytes 20..56.
pub const EXIF_JPEG: &str = concat!(
    "/9j/4AAQSkZJRgABAQAAAQABAAD/4QAiRXhpZgAATU0AKgAAAAgAAQESAAMAAAABAAYAAAAAAAD/2wBDAAgGBgcGBQgHBwcJCQgKDBQNDAsLDBkSEw8UHRofHh0aHBwgJC4nICIsIxwcKDcpLDAxNDQ0Hyc5PTgyPC4zNDL/",
    "2wBDAQkJCQwLDBgNDRgyIRwhMjIyMjIyMjIyMjIyMjIyMjIyMjIyMjIyMjIyMjIyMjIyMjIyMjIyMjIyMjIyMjIyMjL/wAARCAABAAIDASIAAhEBAxEB/8QAHwAAAQUBAQEBAQEAAAAAAAAAAAECAwQFBgcICQoL/8QAtRAAAgEDAwIEAwUFBAQAAAF9AQIDAAQRBRIhMUEGE1FhByJxFDKBkaEII0KxwRVS0fAkM2JyggkKFhcYGRolJicoKSo0NTY3ODk6Q0RFRkdISUpTVFVWV1hZWmNkZWZnaGlqc3R1dnd4eXqDhIWGh4iJipKTlJWWl5iZmqKjpKWmp6ipqrKztLW2t7i5usLDxMXGx8jJytLT1NXW19jZ2uHi4+Tl5ufo6erx8vP09fb3+Pn6/8QAHwEAAwEBAQEBAQEBAQAAAAAAAAECAwQFBgcICQoL/8QAtREAAgECBAQDBAcFBAQAAQJ3AAECAxEEBSExBhJBUQdhcRMiMoEIFEKRobHBCSMzUvAVYnLRChYkNOEl8RcYGRomJygpKjU2Nzg5OkNERUZHSElKU1RVVldYWVpjZGVmZ2hpanN0dXZ3eHl6goOEhYaHiImKkpOUlZaXmJmaoqOkpaanqKmqsrO0tba3uLm6wsPExcbHyMnK0tPU1dbX2Nna4uPk5ebn6Onq8vP09fb3+Pn6/9oADAMBAAIRAxEAPwDi6KKK+ZP3E//Z"
);

pub fn exif_jpeg() -> Vec<u8> {
    base64::engine::general_purpose::STANDARD
        .decode(EXIF_JPEG)
        .unwrap()
}

/// The fixture's APP1 segment, marker to end of payload.
pub fn exif_app1() -> Vec<u8> {
    let jpeg = exif_jpeg();
    let range = find_exif_segment(&jpeg).unwrap().expect("fixture carries APP1");
    jpeg[range].to_vec()
}

/// A `width`x`height` gradient JPEG carrying `app1` (if any) after SOI.
pub fn preview_jpeg(width: u32, height: u32, app1: Option<&[u8]>) -> Vec<u8> {
    let mut pixels = Vec::with_capacity((width * height * 3) as usize);
    for y in 0..height {
        for x in 0..width {
            pixels.extend_from_slice(&[(x * 3) as u8, (y * 5) as u8, 96]);
        }
    }
    let encoded = StandardJpegCodec
        .encode(
            &DecodedImage {
                width,
                height,
                layout: PixelLayout::Rgb8,
                pixels,
            },
            90,
        )
        .unwrap();
    match app1 {
        Some(app1) => splice_exif(&encoded, app1).unwrap(),
        None => encoded,
    }
}

pub fn app1_segment(payload: &[u8]) -> Vec<u8> {
    let mut out = APP1.to_be_bytes().to_vec();
    out.extend_from_slice(&((payload.len() + 2) as u16).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

enum Value {
    Ascii(&'static str),
    Byte(u8),
    Short(u16),
    Long(u32),
    Rational(Vec<(u32, u32)>),
}

impl Value {
    /// (TIFF type, count, little-endian bytes)
    fn encode(&self) -> (u16, u32, Vec<u8>) {
        match self {
            Value::Ascii(s) => {
                let mut b = s.as_bytes().to_vec();
                b.push(0);
                (2, b.len() as u32, b)
            }
            Value::Byte(v) => (1, 1, vec![*v]),
            Value::Short(v) => (3, 1, v.to_le_bytes().to_vec()),
            Value::Long(v) => (4, 1, v.to_le_bytes().to_vec()),
            Value::Rational(parts) => {
                let mut b = Vec::new();
                for (n, d) in parts {
                    b.extend_from_slice(&n.to_le_bytes());
                    b.extend_from_slice(&d.to_le_bytes());
                }
                (5, parts.len() as u32, b)
            }
        }
    }
}

fn ifd_len(entries: &[(u16, Value)]) -> usize {
    let data: usize = entries
        .iter()
        .map(|(_, v)| {
            let len = v.encode().2.len();
            if len > 4 { len + (len & 1) } else { 0 }
        })
        .sum();
    2 + entries.len() * 12 + 4 + data
}

fn write_ifd(out: &mut Vec<u8>, entries: &[(u16, Value)], next: u32) {
    let mut data_offset = out.len() + 2 + entries.len() * 12 + 4;
    let mut data = Vec::new();
    out.extend_from_slice(&(entries.len() as u16).to_le_bytes());
    for (tag, value) in entries {
        let (ty, count, bytes) = value.encode();
        out.extend_from_slice(&tag.to_le_bytes());
        out.extend_from_slice(&ty.to_le_bytes());
        out.extend_from_slice(&count.to_le_bytes());
        if bytes.len() <= 4 {
            let mut inline = bytes.clone();
            inline.resize(4, 0);
            out.extend_from_slice(&inline);
        } else {
            out.extend_from_slice(&(data_offset as u32).to_le_bytes());
            data.extend_from_slice(&bytes);
            if bytes.len() & 1 == 1 {
                data.push(0);
            }
            data_offset += bytes.len() + (bytes.len() & 1);
        }
    }
    out.extend_from_slice(&next.to_le_bytes());
    out.extend_from_slice(&data);
}

/// Minimal Olympus-style (`IIRO`) RAW container: camera tags, an EXIF and a
/// GPS sub-IFD, and `preview` referenced from IFD1 as the embedded JPEG.
pub fn orf_bytes(preview: &[u8]) -> Vec<u8> {
    let ifd0_entries = |exif_at: u32, gps_at: u32| {
        vec![
            (0x010F, Value::Ascii("OLYMPUS IMAGING CORP.")),
            (0x0110, Value::Ascii("E-M5MarkII")),
            (0x0112, Value::Short(1)),
            (0x8769, Value::Long(exif_at)),
            (0x8825, Value::Long(gps_at)),
        ]
    };
    let exif_entries = vec![
        (0x829A, Value::Rational(vec![(1, 250)])),
        (0x829D, Value::Rational(vec![(56, 10)])),
        (0x8827, Value::Short(200)),
        (0x920A, Value::Rational(vec![(25, 1)])),
        (0xA434, Value::Ascii("M.Zuiko Digital 25mm F1.8")),
    ];
    let gps_entries = vec![
        (0x0001, Value::Ascii("N")),
        (0x0002, Value::Rational(vec![(48, 1), (51, 1), (2400, 100)])),
        (0x0003, Value::Ascii("E")),
        (0x0004, Value::Rational(vec![(2, 1), (21, 1), (700, 100)])),
        (0x0005, Value::Byte(0)),
        (0x0006, Value::Rational(vec![(35, 1)])),
    ];
    let ifd1_entries = |jpeg_at: u32| {
        vec![
            (0x0201, Value::Long(jpeg_at)),
            (0x0202, Value::Long(preview.len() as u32)),
        ]
    };

    let ifd0_at = 8usize;
    let ifd0_size = ifd_len(&ifd0_entries(0, 0));
    let ifd1_at = ifd0_at + ifd0_size;
    let ifd1_size = ifd_len(&ifd1_entries(0));
    let exif_at = ifd1_at + ifd1_size;
    let gps_at = exif_at + ifd_len(&exif_entries);
    let jpeg_at = gps_at + ifd_len(&gps_entries);

    let mut out = b"IIRO".to_vec();
    out.extend_from_slice(&(ifd0_at as u32).to_le_bytes());
    write_ifd(&mut out, &ifd0_entries(exif_at as u32, gps_at as u32), ifd1_at as u32);
    write_ifd(&mut out, &ifd1_entries(jpeg_at as u32), 0);
    write_ifd(&mut out, &exif_entries, 0);
    write_ifd(&mut out, &gps_entries, 0);
    assert_eq!(out.len(), jpeg_at);
    out.extend_from_slice(preview);
    out
}

/// Write `bytes` to `path` and stamp it with a fixed modification time.
pub fn write_dated(path: &Path, bytes: &[u8], year: i32, month: u32, day: u32) -> PathBuf {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, bytes).unwrap();
    let at = Utc.with_ymd_and_hms(year, month, day, 12, 0, 0).unwrap();
    File::options()
        .write(true)
        .open(path)
        .unwrap()
        .set_modified(SystemTime::from(at))
        .unwrap();
    path.to_path_buf()
}

/// Defaults with dates taken from mtime in UTC, so tests control the buckets.
pub fn test_config() -> Configuration {
    Configuration {
        date_source: DateSource::Modified,
        timezone: Some(chrono_tz::UTC),
        workers: 2,
        ..Configuration::default()
    }
    .validated()
    .unwrap()
}
