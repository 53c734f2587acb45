mod common;

use morph_check::{
    config::Limits,
    detect::{FormatDetector, sniff},
    error::DetectionError,
    format::{Feature, Format},
};
use std::path::Path;

#[test]
fn magic_bytes_win_over_text_heuristics() {
    let p = Path::new("x.bin");
    assert_eq!(sniff(b"%PDF-1.7\n...", p), Some(Format::Pdf));
    assert_eq!(sniff(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A], p), Some(Format::Png));
    assert_eq!(sniff(&[0xFF, 0xD8, 0xFF, 0xE0], p), Some(Format::Jpeg));
    assert_eq!(sniff(&[0x00, 0x01, 0x02, 0x03, 0x04], p), None);
}

#[test]
fn text_signatures() {
    let p = Path::new("x");
    assert_eq!(sniff(b"<svg xmlns=\"http://www.w3.org/2000/svg\"></svg>", p), Some(Format::Svg));
    assert_eq!(sniff(b"<!DOCTYPE html><html></html>", p), Some(Format::Html));
    assert_eq!(sniff(br#"{"title": "x"}"#, p), Some(Format::Json));
    assert_eq!(sniff(common::MERMAID.as_bytes(), p), Some(Format::Mermaid));
    assert_eq!(sniff(b"# Title\n\nSome prose.\n", p), Some(Format::Markdown));
    assert_eq!(sniff(b"a,b,c\n1,2,3\n4,5,6\n", p), Some(Format::Csv));
    assert_eq!(sniff(b"just some words\n", p), Some(Format::Text));
}

#[test]
fn agreeing_signals_give_full_confidence() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("report.docx");
    common::write_docx(&path);

    let profile = FormatDetector::default().detect(&path, None).unwrap();
    assert_eq!(profile.detected_format, Format::Docx);
    assert_eq!(profile.confidence, 1.0);
    assert!(profile.structural_features.contains(&Feature::Tables));
    assert!(profile.structural_features.contains(&Feature::Headings));
    assert!(!profile.signals_disagree());
}

#[test]
fn generic_text_signature_defers_to_extension() {
    let dir = tempfile::tempdir().unwrap();
    let path = common::write(dir.path(), "notes.md", b"plain words only\n");

    let profile = FormatDetector::default().detect(&path, None).unwrap();
    assert_eq!(profile.detected_format, Format::Markdown);
    assert_eq!(profile.confidence, 1.0);
}

#[test]
fn single_signal_gives_half_confidence() {
    let dir = tempfile::tempdir().unwrap();
    let path = common::write(dir.path(), "diagram", common::MERMAID.as_bytes());

    let profile = FormatDetector::default().detect(&path, None).unwrap();
    assert_eq!(profile.detected_format, Format::Mermaid);
    assert_eq!(profile.confidence, 0.5);
    assert_eq!(profile.extension_format, None);
}

#[test]
fn content_wins_on_disagreement() {
    let dir = tempfile::tempdir().unwrap();
    let path = common::write(dir.path(), "looks-like.docx", b"%PDF-1.4\nBT /F1 12 Tf (Hello) Tj ET\n");

    let profile = FormatDetector::default().detect(&path, None).unwrap();
    assert_eq!(profile.detected_format, Format::Pdf);
    assert_eq!(profile.confidence, 0.2);
    assert!(profile.signals_disagree());
}

#[test]
fn hint_is_trusted() {
    let dir = tempfile::tempdir().unwrap();
    let path = common::write(dir.path(), "data.txt", b"a,b\n1,2\n");

    let profile = FormatDetector::default()
        .detect(&path, Some("markdown"))
        .unwrap();
    assert_eq!(profile.detected_format, Format::Markdown);
}

#[test]
fn unknown_hint_is_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let path = common::write(dir.path(), "diagram.mmd", common::MERMAID.as_bytes());

    let profile = FormatDetector::default()
        .detect(&path, Some("visio"))
        .unwrap();
    assert_eq!(profile.detected_format, Format::Mermaid);
    assert_eq!(profile.confidence, 1.0);
}

#[test]
fn scanned_pdf_is_tagged() {
    let dir = tempfile::tempdir().unwrap();
    let path = common::write(dir.path(), "scan.pdf", &common::scanned_pdf());

    let profile = FormatDetector::default().detect(&path, None).unwrap();
    assert_eq!(profile.detected_format, Format::Pdf);
    assert!(profile.structural_features.contains(&Feature::ScannedImage));
    assert!(profile.structural_features.contains(&Feature::EmbeddedDiagrams));
}

#[test]
fn unrecognized_content_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = common::write(dir.path(), "blob.xyz", &[0x00, 0x9F, 0x92, 0x96, 0x01]);

    let err = FormatDetector::default().detect(&path, None).unwrap_err();
    assert!(matches!(err, DetectionError::Unrecognized { .. }));
}

#[test]
fn missing_file_is_unreadable() {
    let dir = tempfile::tempdir().unwrap();
    let err = FormatDetector::default()
        .detect(&dir.path().join("absent.pdf"), None)
        .unwrap_err();
    assert!(matches!(err, DetectionError::Unreadable { .. }));
}

#[test]
fn oversized_input_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = common::write(dir.path(), "big.txt", &[b'a'; 64]);
    let limits = Limits {
        max_input_file_bytes: 16,
        ..Limits::default()
    };

    let err = FormatDetector::new(&limits).detect(&path, None).unwrap_err();
    assert!(matches!(err, DetectionError::TooLarge { size: 64, limit: 16, .. }));
}
