mod common;

use std::sync::Arc;

use media_organizer::codec::{Scale, StandardJpegCodec};
use media_organizer::jpeg::{SOI, find_exif_segment};
use media_organizer::raw::EmbeddedPreview;
use media_organizer::transcode::{OutputKind, ThumbnailTranscoder, TranscodeSettings};

fn contains(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn transcoder() -> ThumbnailTranscoder {
    ThumbnailTranscoder::new(Arc::new(StandardJpegCodec), TranscodeSettings::default())
}

#[test]
fn fixture_app1_survives_preview_and_thumbnail() {
    let source = common::exif_jpeg();
    let original = &source[20..56];
    assert_eq!(find_exif_segment(&source).unwrap(), Some(20..56));

    for kind in OutputKind::ALL {
        let out = transcoder()
            .transcode(&EmbeddedPreview::Jpeg(source.clone()), kind)
            .unwrap();
        assert_eq!(out.extension, "jpg");
        assert_eq!(&out.bytes[..2], &SOI.to_be_bytes());
        let at = contains(&out.bytes, original).expect("APP1 copied verbatim");
        assert_eq!(at, 2, "APP1 directly follows SOI");
        assert_eq!(find_exif_segment(&out.bytes).unwrap(), Some(2..2 + original.len()));
    }
}

#[test]
fn thumbnail_is_downscaled() {
    let source = common::preview_jpeg(160, 120, Some(&common::exif_app1()));
    let settings = TranscodeSettings {
        thumbnail_scale: Scale::new(4).unwrap(),
        ..TranscodeSettings::default()
    };
    let transcoder = ThumbnailTranscoder::new(Arc::new(StandardJpegCodec), settings);

    let preview = transcoder
        .transcode(&EmbeddedPreview::Jpeg(source.clone()), OutputKind::Preview)
        .unwrap();
    let thumb = transcoder
        .transcode(&EmbeddedPreview::Jpeg(source), OutputKind::Thumbnail)
        .unwrap();

    let dims = |bytes: &[u8]| {
        let mut decoder = jpeg_decoder::Decoder::new(bytes);
        decoder.read_info().unwrap();
        let info = decoder.info().unwrap();
        (info.width, info.height)
    };
    assert_eq!(dims(&preview.bytes), (160, 120));
    assert_eq!(dims(&thumb.bytes), (40, 30));
    assert!(thumb.bytes.len() < preview.bytes.len());
}

#[test]
fn stream_without_exif_stays_without_exif() {
    let source = common::preview_jpeg(32, 32, None);
    for kind in OutputKind::ALL {
        let out = transcoder()
            .transcode(&EmbeddedPreview::Jpeg(source.clone()), kind)
            .unwrap();
        assert_eq!(find_exif_segment(&out.bytes).unwrap(), None);
    }
}
