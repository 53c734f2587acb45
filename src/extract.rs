//! Lightweight content inspection for the formats in [`Format`].
//!
//! Extraction is heuristic: the orchestrator only needs to
//! count structural features, collect visible text, and spot metadata fields.
//! Container formats go through real parsers (`lopdf` for PDF, `zip` and
//! `quick-xml` for DOCX, `scraper` for HTML); the text formats are line scans.

use crate::format::{Feature, Format, MetaField};
use quick_xml::Reader;
use quick_xml::events::Event;
use regex::Regex;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::io::Read;
use std::path::Path;
use std::sync::LazyLock;
use tracing::debug;
use unicode_normalization::UnicodeNormalization;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Extracted {
    pub text: String,
    pub features: BTreeMap<Feature, usize>,
    pub metadata: BTreeSet<MetaField>,
}

impl Extracted {
    pub fn feature_set(&self) -> BTreeSet<Feature> {
        self.features
            .iter()
            .filter(|(_, n)| **n > 0)
            .map(|(f, _)| *f)
            .collect()
    }

    pub fn count(&self, feature: Feature) -> usize {
        self.features.get(&feature).copied().unwrap_or(0)
    }

    /// Non-whitespace character count after NFKC normalization.
    pub fn normalized_len(&self) -> usize {
        self.text.nfkc().filter(|c| !c.is_whitespace()).count()
    }

    fn add(&mut self, feature: Feature, n: usize) {
        if n > 0 {
            *self.features.entry(feature).or_insert(0) += n;
        }
    }
}

/// Reads at most `max_bytes` of `path`.
pub fn read_prefix(path: &Path, max_bytes: u64) -> std::io::Result<Vec<u8>> {
    let file = std::fs::File::open(path)?;
    let mut buf = Vec::new();
    file.take(max_bytes).read_to_end(&mut buf)?;
    Ok(buf)
}

/// Extracts `path` as `format`. Text formats are read up to `max_bytes`; container
/// formats that cannot be parsed from a prefix are rejected when they exceed it.
pub fn extract(path: &Path, format: Format, max_bytes: u64) -> Result<Extracted, String> {
    match format {
        Format::Docx => extract_docx(path, max_bytes),
        Format::Pdf => {
            let bytes =
                read_prefix(path, max_bytes.saturating_add(1)).map_err(|e| e.to_string())?;
            if bytes.len() as u64 > max_bytes {
                return Err(format!("pdf exceeds max_extract_bytes ({max_bytes} bytes)"));
            }
            extract_pdf(&bytes)
        }
        _ => {
            let bytes = read_prefix(path, max_bytes).map_err(|e| e.to_string())?;
            Ok(extract_bytes(&bytes, format))
        }
    }
}

pub fn extract_bytes(bytes: &[u8], format: Format) -> Extracted {
    match format {
        Format::Pdf => extract_pdf(bytes).unwrap_or_else(|e| {
            debug!("{e}");
            Extracted::default()
        }),
        Format::Png | Format::Jpeg => extract_raster(bytes, format),
        Format::Docx => Extracted::default(),
        _ => {
            let text = String::from_utf8_lossy(bytes);
            match format {
                Format::Markdown => extract_markdown(&text),
                Format::Html => extract_html(&text),
                Format::Mermaid => extract_mermaid(&text),
                Format::Svg => extract_svg(&text),
                Format::Csv => extract_csv(&text),
                Format::Json => extract_json(&text),
                _ => extract_plain(&text),
            }
        }
    }
}

static LIST_ITEM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(?:[-*+]|\d+[.)])\s+\S").unwrap());
static MD_HEADING: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^#{1,6}\s+\S").unwrap());
static MD_TABLE_SEP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*\|?\s*:?-{3,}:?\s*(\|\s*:?-{3,}:?\s*)*\|?\s*$").unwrap());
static MD_DIAGRAM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^```\s*(mermaid|plantuml|dot|graphviz)\b|!\[[^\]]*\]\(").unwrap());
static FRONT_MATTER_KEY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(title|author|date|created)\s*:\s*\S").unwrap());
static HTML_TABLES: LazyLock<Selector> = LazyLock::new(|| Selector::parse("table").unwrap());
static HTML_HEADINGS: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("h1, h2, h3, h4, h5, h6").unwrap());
static HTML_LISTS: LazyLock<Selector> = LazyLock::new(|| Selector::parse("ul, ol").unwrap());
static HTML_GRAPHICS: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("svg, img, canvas").unwrap());
static HTML_TITLE: LazyLock<Selector> = LazyLock::new(|| Selector::parse("title").unwrap());
static HTML_META: LazyLock<Selector> = LazyLock::new(|| Selector::parse("meta[name]").unwrap());
static SVG_TEXT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<(?:text|tspan)\b[^>]*>([^<]*)<").unwrap());
static MERMAID_LABEL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"\[([^\]]+)\]|\(([^)]+)\)|\{([^}]+)\}|"([^"]+)"|:\s*(.+)$"#).unwrap());
const MERMAID_KEYWORDS: [&str; 12] = [
    "graph",
    "flowchart",
    "sequenceDiagram",
    "classDiagram",
    "stateDiagram",
    "stateDiagram-v2",
    "erDiagram",
    "gantt",
    "pie",
    "journey",
    "mindmap",
    "gitGraph",
];

pub fn is_mermaid_header(line: &str) -> bool {
    let first = line.split_whitespace().next().unwrap_or("");
    MERMAID_KEYWORDS.contains(&first)
}

fn count_lists<'a>(lines: impl Iterator<Item = &'a str>) -> usize {
    // Count list blocks, not items.
    let mut blocks = 0;
    let mut in_list = false;
    for line in lines {
        let is_item = LIST_ITEM.is_match(line);
        if is_item && !in_list {
            blocks += 1;
        }
        if is_item {
            in_list = true;
        } else if !line.trim().is_empty() {
            in_list = false;
        }
    }
    blocks
}

fn extract_plain(text: &str) -> Extracted {
    let mut out = Extracted {
        text: text.to_string(),
        ..Default::default()
    };
    out.add(Feature::Lists, count_lists(text.lines()));
    out
}

/// Splits a leading `---` front-matter block from the body.
fn split_front_matter(text: &str) -> (Option<&str>, &str) {
    let trimmed = text.trim_start_matches('\u{feff}');
    if let Some(rest) = trimmed.strip_prefix("---\n").or_else(|| trimmed.strip_prefix("---\r\n")) {
        if let Some(end) = rest.find("\n---") {
            let body_start = rest[end + 4..].find('\n').map(|i| end + 4 + i + 1).unwrap_or(rest.len());
            return (Some(&rest[..end]), &rest[body_start..]);
        }
    }
    (None, trimmed)
}

fn front_matter_fields(front: &str) -> BTreeSet<MetaField> {
    let mut fields = BTreeSet::new();
    for line in front.lines() {
        if let Some(caps) = FRONT_MATTER_KEY.captures(line.trim()) {
            match &caps[1] {
                "title" => fields.insert(MetaField::Title),
                "author" => fields.insert(MetaField::Author),
                _ => fields.insert(MetaField::Created),
            };
        }
    }
    fields
}

fn extract_markdown(text: &str) -> Extracted {
    let (front, body) = split_front_matter(text);
    let mut out = Extracted::default();
    if let Some(front) = front {
        out.metadata = front_matter_fields(front);
    }

    let mut in_fence = false;
    let mut visible = Vec::new();
    let mut headings = 0;
    let mut tables = 0;
    for line in body.lines() {
        if line.trim_start().starts_with("```") {
            in_fence = !in_fence;
            continue;
        }
        if in_fence {
            continue;
        }
        if MD_HEADING.is_match(line) {
            headings += 1;
        }
        if MD_TABLE_SEP.is_match(line) && line.contains('-') && line.contains('|') {
            tables += 1;
            continue;
        }
        visible.push(line);
    }
    out.add(Feature::Headings, headings);
    out.add(Feature::Tables, tables);
    out.add(Feature::Lists, count_lists(visible.iter().copied()));
    out.add(Feature::EmbeddedDiagrams, MD_DIAGRAM.find_iter(body).count());

    let mut s = visible.join("\n");
    for marker in ["**", "__", "`", "|"] {
        s = s.replace(marker, " ");
    }
    out.text = s
        .lines()
        .map(|l| l.trim_start_matches('#').trim_start_matches(['-', '*', '+', '>']).trim())
        .collect::<Vec<_>>()
        .join("\n");
    out
}

fn count_tags(html_lower: &str, tags: &[&str]) -> usize {
    tags.iter()
        .map(|t| {
            let open = format!("<{t}");
            html_lower
                .match_indices(&open)
                .filter(|(i, _)| {
                    html_lower[i + open.len()..]
                        .chars()
                        .next()
                        .is_some_and(|c| c == '>' || c.is_whitespace() || c == '/')
                })
                .count()
        })
        .sum()
}

fn extract_html(text: &str) -> Extracted {
    let doc = Html::parse_document(text);
    let mut out = Extracted::default();
    out.add(Feature::Tables, doc.select(&HTML_TABLES).count());
    out.add(Feature::Headings, doc.select(&HTML_HEADINGS).count());
    out.add(Feature::Lists, doc.select(&HTML_LISTS).count());
    out.add(Feature::EmbeddedDiagrams, doc.select(&HTML_GRAPHICS).count());

    if doc
        .select(&HTML_TITLE)
        .any(|t| !t.text().collect::<String>().trim().is_empty())
    {
        out.metadata.insert(MetaField::Title);
    }
    for meta in doc.select(&HTML_META) {
        let named = meta.value().attr("name").unwrap_or_default().to_ascii_lowercase();
        let has_content = meta
            .value()
            .attr("content")
            .is_some_and(|c| !c.trim().is_empty());
        match named.as_str() {
            "author" if has_content => {
                out.metadata.insert(MetaField::Author);
            }
            "date" | "created" | "dcterms.created" if has_content => {
                out.metadata.insert(MetaField::Created);
            }
            _ => {}
        }
    }

    out.text = html_visible_text(&doc);
    out
}

/// Text nodes outside `<head>` and non-rendered elements, entity-decoded by the parser.
fn html_visible_text(doc: &Html) -> String {
    let mut pieces = Vec::new();
    for node in doc.tree.root().descendants() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        let hidden = node.ancestors().any(|a| {
            a.value().as_element().is_some_and(|e| {
                matches!(e.name(), "head" | "script" | "style" | "template" | "noscript")
            })
        });
        let t = text.trim();
        if !hidden && !t.is_empty() {
            pieces.push(t.to_string());
        }
    }
    pieces.join(" ")
}

fn decode_entities(s: &str) -> String {
    s.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

fn extract_mermaid(text: &str) -> Extracted {
    let (front, body) = split_front_matter(text);
    let mut out = Extracted::default();
    if let Some(front) = front {
        out.metadata = front_matter_fields(front);
    }
    let mut labels = Vec::new();
    let mut diagrams = 0;
    for line in body.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with("%%") {
            continue;
        }
        if is_mermaid_header(line) {
            diagrams += 1;
            continue;
        }
        for caps in MERMAID_LABEL.captures_iter(line) {
            if let Some(m) = caps.iter().skip(1).flatten().next() {
                labels.push(m.as_str().trim().to_string());
            }
        }
    }
    out.add(Feature::EmbeddedDiagrams, diagrams.max(1));
    out.text = labels.join("\n");
    out
}

fn extract_svg(text: &str) -> Extracted {
    let lower = text.to_ascii_lowercase();
    let mut out = Extracted::default();
    out.add(Feature::EmbeddedDiagrams, count_tags(&lower, &["svg"]).max(1));
    if lower.contains("<title") {
        out.metadata.insert(MetaField::Title);
    }
    out.text = SVG_TEXT
        .captures_iter(text)
        .map(|c| decode_entities(c[1].trim()))
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("\n");
    out
}

fn extract_csv(text: &str) -> Extracted {
    let mut out = Extracted::default();
    let rows: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    if !rows.is_empty() {
        out.add(Feature::Tables, 1);
    }
    out.text = rows
        .iter()
        .flat_map(|r| r.split(','))
        .map(|c| c.trim().trim_matches('"'))
        .collect::<Vec<_>>()
        .join(" ");
    out
}

fn extract_json(text: &str) -> Extracted {
    let mut out = Extracted::default();
    let Ok(value) = serde_json::from_str::<serde_json::Value>(text) else {
        out.text = text.to_string();
        return out;
    };
    if let Some(obj) = value.as_object() {
        for (k, v) in obj {
            if v.is_null() {
                continue;
            }
            match k.to_ascii_lowercase().as_str() {
                "title" => {
                    out.metadata.insert(MetaField::Title);
                }
                "author" | "creator" => {
                    out.metadata.insert(MetaField::Author);
                }
                "created" | "date" | "creation_date" => {
                    out.metadata.insert(MetaField::Created);
                }
                _ => {}
            }
        }
    }
    let mut strings = Vec::new();
    let mut tables = 0;
    walk_json(&value, &mut strings, &mut tables);
    out.add(Feature::Tables, tables);
    out.text = strings.join("\n");
    out
}

fn walk_json(v: &serde_json::Value, strings: &mut Vec<String>, tables: &mut usize) {
    match v {
        serde_json::Value::String(s) => strings.push(s.clone()),
        serde_json::Value::Number(n) => strings.push(n.to_string()),
        serde_json::Value::Array(items) => {
            if !items.is_empty() && items.iter().all(|i| i.is_object()) {
                *tables += 1;
            }
            for i in items {
                walk_json(i, strings, tables);
            }
        }
        serde_json::Value::Object(map) => {
            for i in map.values() {
                walk_json(i, strings, tables);
            }
        }
        _ => {}
    }
}

/// Reads the text layer, image XObjects, and Info dictionary of a PDF. Content
/// streams are decoded by `lopdf`, so compressed (FlateDecode) pages are covered.
/// A document whose pages yield no text is tagged [`Feature::ScannedImage`].
fn extract_pdf(bytes: &[u8]) -> Result<Extracted, String> {
    let doc = lopdf::Document::load_mem(bytes).map_err(|e| format!("parse pdf: {e}"))?;
    let mut out = Extracted::default();

    let mut pages = Vec::new();
    for (page_num, _) in doc.get_pages() {
        match doc.extract_text(&[page_num]) {
            Ok(text) => pages.push(text.trim().to_string()),
            Err(e) => debug!("no text on pdf page {page_num}: {e}"),
        }
    }
    out.text = pages
        .into_iter()
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("\n");
    if out.text.trim().is_empty() {
        out.add(Feature::ScannedImage, 1);
    }

    let images = doc
        .objects
        .values()
        .filter(|obj| match obj {
            lopdf::Object::Stream(stream) => matches!(
                stream.dict.get(b"Subtype").and_then(lopdf::Object::as_name),
                Ok(b"Image")
            ),
            _ => false,
        })
        .count();
    out.add(Feature::EmbeddedDiagrams, images);

    let info = doc
        .trailer
        .get(b"Info")
        .and_then(lopdf::Object::as_reference)
        .and_then(|id| doc.get_dictionary(id));
    if let Ok(info) = info {
        for (key, field) in [
            (&b"Title"[..], MetaField::Title),
            (&b"Author"[..], MetaField::Author),
            (&b"CreationDate"[..], MetaField::Created),
        ] {
            if info.has(key) {
                out.metadata.insert(field);
            }
        }
    }
    Ok(out)
}

fn extract_raster(bytes: &[u8], format: Format) -> Extracted {
    let valid = match format {
        Format::Png => bytes.starts_with(&[0x89, 0x50, 0x4E, 0x47]),
        _ => bytes.starts_with(&[0xFF, 0xD8, 0xFF]),
    };
    let mut out = Extracted::default();
    if valid {
        // A rendered image stands in for the diagram it depicts.
        out.add(Feature::EmbeddedDiagrams, 1);
    }
    out
}

fn extract_docx(path: &Path, max_bytes: u64) -> Result<Extracted, String> {
    let file = std::fs::File::open(path).map_err(|e| e.to_string())?;
    let mut archive = zip::ZipArchive::new(file).map_err(|e| format!("open docx: {e}"))?;

    let document = read_zip_entry(&mut archive, "word/document.xml", max_bytes)?
        .ok_or_else(|| "missing word/document.xml".to_string())?;
    let mut out = parse_docx_document(&document)?;

    if let Some(core) = read_zip_entry(&mut archive, "docProps/core.xml", max_bytes)? {
        out.metadata = parse_docx_core(&core)?;
    }
    Ok(out)
}

/// Inflates one archive member, refusing members larger than `max_bytes` once
/// decompressed.
fn read_zip_entry<R: Read + std::io::Seek>(
    archive: &mut zip::ZipArchive<R>,
    name: &str,
    max_bytes: u64,
) -> Result<Option<String>, String> {
    let entry = match archive.by_name(name) {
        Ok(e) => e,
        Err(zip::result::ZipError::FileNotFound) => return Ok(None),
        Err(e) => return Err(format!("read {name}: {e}")),
    };
    let too_large = || format!("{name} exceeds max_extract_bytes ({max_bytes} bytes)");
    if entry.size() > max_bytes {
        return Err(too_large());
    }
    // The declared size can lie; bound the inflated stream as well.
    let mut buf = Vec::new();
    entry
        .take(max_bytes.saturating_add(1))
        .read_to_end(&mut buf)
        .map_err(|e| format!("read {name}: {e}"))?;
    if buf.len() as u64 > max_bytes {
        return Err(too_large());
    }
    String::from_utf8(buf)
        .map(Some)
        .map_err(|e| format!("read {name}: {e}"))
}

fn parse_docx_document(xml: &str) -> Result<Extracted, String> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut out = Extracted::default();
    let mut text = String::new();
    let mut in_text = false;
    let mut list_paragraphs = 0;
    let mut in_list = false;
    let mut paragraph_is_list = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e)) => match e.local_name().as_ref() {
                b"t" => in_text = true,
                b"p" => paragraph_is_list = false,
                b"tbl" => out.add(Feature::Tables, 1),
                b"drawing" | b"pict" => out.add(Feature::EmbeddedDiagrams, 1),
                b"numPr" => paragraph_is_list = true,
                b"pStyle" => {
                    let is_heading = e.attributes().flatten().any(|a| {
                        a.key.local_name().as_ref() == b"val"
                            && (a.value.starts_with(b"Heading") || a.value.as_ref() == b"Title")
                    });
                    if is_heading {
                        out.add(Feature::Headings, 1);
                    }
                }
                _ => {}
            },
            Ok(Event::End(ref e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => {
                    text.push('\n');
                    if paragraph_is_list && !in_list {
                        list_paragraphs += 1;
                    }
                    in_list = paragraph_is_list;
                }
                _ => {}
            },
            Ok(Event::Text(e)) => {
                if in_text {
                    let decoded = e.decode().map_err(|e| e.to_string())?;
                    text.push_str(&decoded);
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(format!("XML parsing error: {e}")),
            _ => {}
        }
    }
    out.add(Feature::Lists, list_paragraphs);
    out.text = text;
    Ok(out)
}

fn parse_docx_core(xml: &str) -> Result<BTreeSet<MetaField>, String> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut fields = BTreeSet::new();
    let mut current: Option<MetaField> = None;
    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) => {
                current = match e.local_name().as_ref() {
                    b"title" => Some(MetaField::Title),
                    b"creator" => Some(MetaField::Author),
                    b"created" => Some(MetaField::Created),
                    _ => None,
                };
            }
            Ok(Event::Text(ref e)) => {
                if let Some(field) = current {
                    if !e.is_empty() {
                        fields.insert(field);
                    }
                }
            }
            Ok(Event::End(_)) => current = None,
            Ok(Event::Eof) => break,
            Err(e) => return Err(format!("XML parsing error: {e}")),
            _ => {}
        }
    }
    Ok(fields)
}
