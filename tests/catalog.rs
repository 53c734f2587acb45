mod common;

use common::{ScriptedConverter, Step};
use morph_check::{
    catalog::{ConversionMethod, MethodCatalog},
    converter::Converter,
    error::CatalogError,
    format::{Feature, Format},
};
use std::collections::BTreeSet;
use std::sync::Arc;

fn tool(name: &str) -> Arc<dyn Converter> {
    Arc::new(ScriptedConverter::new(name, Step::Score(100.0)))
}

fn ids(methods: &[ConversionMethod]) -> Vec<&str> {
    methods.iter().map(|m| m.id.as_str()).collect()
}

fn pdf_markdown_catalog() -> MethodCatalog {
    MethodCatalog::builder()
        .register(ConversionMethod::new("pdftotext", 3, Format::Pdf, Format::Markdown, tool("pdftotext")))
        .register(
            ConversionMethod::new("docling", 1, Format::Pdf, Format::Markdown, tool("docling"))
                .excludes(Feature::ScannedImage),
        )
        .register(
            ConversionMethod::new("ocr", 1, Format::Pdf, Format::Markdown, tool("ocr"))
                .requires(Feature::ScannedImage),
        )
        .register(ConversionMethod::new("pandoc", 2, Format::Pdf, Format::Markdown, tool("pandoc")))
        .register(ConversionMethod::new("pandoc-html", 1, Format::Markdown, Format::Html, tool("pandoc")))
        .build()
        .unwrap()
}

#[test]
fn candidates_are_ordered_by_rank() {
    let catalog = pdf_markdown_catalog();
    let got = catalog.candidates(Format::Pdf, Format::Markdown, &BTreeSet::new());
    assert_eq!(ids(&got), ["docling", "pandoc", "pdftotext"]);
}

#[test]
fn preconditions_filter_candidates() {
    let catalog = pdf_markdown_catalog();
    let scanned = BTreeSet::from([Feature::ScannedImage]);
    let got = catalog.candidates(Format::Pdf, Format::Markdown, &scanned);
    assert_eq!(ids(&got), ["ocr", "pandoc", "pdftotext"]);
}

#[test]
fn equal_ranks_keep_registration_order() {
    let catalog = MethodCatalog::builder()
        .register(ConversionMethod::new("b", 1, Format::Mermaid, Format::Svg, tool("b")))
        .register(ConversionMethod::new("a", 1, Format::Mermaid, Format::Svg, tool("a")))
        .register(ConversionMethod::new("c", 0, Format::Mermaid, Format::Svg, tool("c")))
        .build()
        .unwrap();
    let got = catalog.candidates(Format::Mermaid, Format::Svg, &BTreeSet::new());
    assert_eq!(ids(&got), ["c", "b", "a"]);
}

#[test]
fn unknown_pair_yields_nothing() {
    let catalog = pdf_markdown_catalog();
    assert!(
        catalog
            .candidates(Format::Png, Format::Docx, &BTreeSet::new())
            .is_empty()
    );
    assert_eq!(catalog.pairs().len(), 2);
    assert_eq!(catalog.len(), 5);
}

#[test]
fn every_pair_needs_a_method_of_last_resort() {
    let err = MethodCatalog::builder()
        .register(
            ConversionMethod::new("ocr", 1, Format::Pdf, Format::Text, tool("ocr"))
                .requires(Feature::ScannedImage),
        )
        .build()
        .unwrap_err();
    assert!(matches!(
        err,
        CatalogError::NoLastResort {
            from: Format::Pdf,
            to: Format::Text
        }
    ));
}

#[test]
fn duplicate_ids_are_rejected() {
    let err = MethodCatalog::builder()
        .register(ConversionMethod::new("x", 1, Format::Pdf, Format::Text, tool("a")))
        .register(ConversionMethod::new("x", 2, Format::Pdf, Format::Text, tool("b")))
        .build()
        .unwrap_err();
    assert!(matches!(err, CatalogError::DuplicateMethod(id) if id == "x"));
}
