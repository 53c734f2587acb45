use crate::{
    config::Limits,
    error::DetectionError,
    extract::{self, is_mermaid_header, read_prefix},
    format::{Feature, Format},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormatProfile {
    pub detected_format: Format,
    pub structural_features: BTreeSet<Feature>,
    pub confidence: f32,
    /// Format suggested by the content signature, if any matched.
    pub content_format: Option<Format>,
    /// Format suggested by the file extension, if it is a known one.
    pub extension_format: Option<Format>,
    pub file_bytes: u64,
}

impl FormatProfile {
    pub fn signals_disagree(&self) -> bool {
        matches!(
            (self.content_format, self.extension_format),
            (Some(c), Some(e)) if !formats_agree(c, e)
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct FormatDetector {
    limits: Limits,
}

impl FormatDetector {
    pub fn new(limits: &Limits) -> Self {
        Self {
            limits: limits.clone(),
        }
    }

    pub fn detect(&self, path: &Path, hint: Option<&str>) -> Result<FormatProfile, DetectionError> {
        let unreadable = |source| DetectionError::Unreadable {
            path: path.to_path_buf(),
            source,
        };
        let meta = std::fs::metadata(path).map_err(unreadable)?;
        let file_bytes = meta.len();
        if file_bytes > self.limits.max_input_file_bytes {
            return Err(DetectionError::TooLarge {
                path: path.to_path_buf(),
                size: file_bytes,
                limit: self.limits.max_input_file_bytes,
            });
        }

        let head = read_prefix(path, self.limits.max_sniff_bytes).map_err(unreadable)?;
        let content_format = sniff(&head, path);
        let extension_format = path
            .extension()
            .and_then(|e| e.to_str())
            .and_then(Format::from_extension);

        let hinted = match hint {
            Some(h) => match h.parse::<Format>() {
                Ok(f) => Some(f),
                Err(_) => {
                    warn!("ignoring unknown format hint '{h}' for {}", path.display());
                    None
                }
            },
            None => None,
        };

        let (detected_format, confidence) = match hinted {
            Some(f) => (f, agreement(Some(f), content_format).1),
            None => match agreement(content_format, extension_format) {
                (Some(f), confidence) => (f, confidence),
                (None, _) => {
                    return Err(DetectionError::Unrecognized {
                        path: path.to_path_buf(),
                    });
                }
            },
        };

        let structural_features = extract::extract(path, detected_format, self.limits.max_extract_bytes)
            .map(|x| x.feature_set())
            .unwrap_or_else(|e| {
                warn!("feature extraction failed for {}: {e}", path.display());
                BTreeSet::new()
            });

        let profile = FormatProfile {
            detected_format,
            structural_features,
            confidence,
            content_format,
            extension_format,
            file_bytes,
        };
        if profile.signals_disagree() {
            warn!(
                "content signature says {:?} but extension says {:?}: {}",
                profile.content_format,
                profile.extension_format,
                path.display()
            );
        }
        debug!(?profile, "format profile");
        Ok(profile)
    }
}

/// Resolves two format signals into a format and a confidence.
/// The first signal wins on disagreement, except that a generic text
/// signature defers to a more specific text-family format.
fn agreement(primary: Option<Format>, secondary: Option<Format>) -> (Option<Format>, f32) {
    match (primary, secondary) {
        (Some(p), Some(s)) if p == s => (Some(p), 1.0),
        (Some(Format::Text), Some(s)) if s.is_text_family() => (Some(s), 1.0),
        (Some(p), Some(Format::Text)) if p.is_text_family() => (Some(p), 1.0),
        (Some(p), Some(_)) => (Some(p), 0.2),
        (Some(p), None) => (Some(p), 0.5),
        (None, Some(s)) => (Some(s), 0.5),
        (None, None) => (None, 0.0),
    }
}

fn formats_agree(a: Format, b: Format) -> bool {
    agreement(Some(a), Some(b)).1 >= 1.0
}

/// Classifies content by signature. Magic bytes come first; UTF-8 content is
/// then narrowed by its leading markup.
pub fn sniff(head: &[u8], path: &Path) -> Option<Format> {
    match head {
        [0x25, 0x50, 0x44, 0x46, ..] => return Some(Format::Pdf),
        [0x89, 0x50, 0x4E, 0x47, ..] => return Some(Format::Png),
        [0xFF, 0xD8, 0xFF, ..] => return Some(Format::Jpeg),
        [0x50, 0x4B, 0x03, 0x04, ..] => return sniff_zip(path),
        _ => {}
    }

    let text = likely_text(head)?;
    let trimmed = text.trim_start_matches('\u{feff}').trim_start();
    let lower: String = trimmed.chars().take(512).collect::<String>().to_ascii_lowercase();

    if lower.starts_with("<svg") || (lower.starts_with("<?xml") && lower.contains("<svg")) {
        return Some(Format::Svg);
    }
    if lower.starts_with("<!doctype html") || lower.starts_with("<html") {
        return Some(Format::Html);
    }
    if (trimmed.starts_with('{') || trimmed.starts_with('['))
        && serde_json::from_str::<serde_json::Value>(trimmed).is_ok()
    {
        return Some(Format::Json);
    }

    let lines: Vec<&str> = trimmed
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with("%%"))
        .take(20)
        .collect();
    if lines.first().is_some_and(|l| is_mermaid_header(l)) {
        return Some(Format::Mermaid);
    }
    if lines.iter().any(|l| {
        l.starts_with("# ") || l.starts_with("## ") || l.starts_with("```") || l.starts_with("|---")
    }) {
        return Some(Format::Markdown);
    }
    if looks_like_csv(&lines) {
        return Some(Format::Csv);
    }
    Some(Format::Text)
}

fn sniff_zip(path: &Path) -> Option<Format> {
    let file = std::fs::File::open(path).ok()?;
    let archive = zip::ZipArchive::new(file).ok()?;
    archive
        .file_names()
        .any(|n| n == "word/document.xml")
        .then_some(Format::Docx)
}

/// Valid UTF-8 (allowing a truncated trailing sequence) and mostly printable.
fn likely_text(head: &[u8]) -> Option<&str> {
    if head.is_empty() {
        return None;
    }
    let text = match std::str::from_utf8(head) {
        Ok(t) => t,
        Err(e) if e.error_len().is_none() => std::str::from_utf8(&head[..e.valid_up_to()]).ok()?,
        Err(_) => return None,
    };
    let total = text.chars().count().max(1);
    let printable = text
        .chars()
        .filter(|c| !c.is_control() || c.is_whitespace())
        .count();
    (printable as f64 / total as f64 > 0.80).then_some(text)
}

fn looks_like_csv(lines: &[&str]) -> bool {
    if lines.len() < 2 {
        return false;
    }
    let cols = lines[0].matches(',').count();
    cols >= 1 && lines.iter().all(|l| l.matches(',').count() == cols)
}
