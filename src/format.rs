use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Formats the orchestrator knows how to reason about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    Pdf,
    Docx,
    Markdown,
    Html,
    Text,
    Mermaid,
    Svg,
    Png,
    Jpeg,
    Csv,
    Json,
}

/// Structural feature tags attached to a [`crate::detect::FormatProfile`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Feature {
    #[serde(rename = "has-tables")]
    Tables,
    #[serde(rename = "has-headings")]
    Headings,
    #[serde(rename = "has-lists")]
    Lists,
    #[serde(rename = "has-embedded-diagrams")]
    EmbeddedDiagrams,
    #[serde(rename = "is-scanned-image")]
    ScannedImage,
}

/// Metadata fields the validator looks for on both sides of a conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetaField {
    Title,
    Author,
    Created,
}

impl Format {
    pub const ALL: [Format; 11] = [
        Format::Pdf,
        Format::Docx,
        Format::Markdown,
        Format::Html,
        Format::Text,
        Format::Mermaid,
        Format::Svg,
        Format::Png,
        Format::Jpeg,
        Format::Csv,
        Format::Json,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pdf => "pdf",
            Self::Docx => "docx",
            Self::Markdown => "markdown",
            Self::Html => "html",
            Self::Text => "text",
            Self::Mermaid => "mermaid",
            Self::Svg => "svg",
            Self::Png => "png",
            Self::Jpeg => "jpeg",
            Self::Csv => "csv",
            Self::Json => "json",
        }
    }

    /// Preferred file extension for outputs of this format.
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Markdown => "md",
            Self::Text => "txt",
            Self::Mermaid => "mmd",
            Self::Jpeg => "jpg",
            other => other.as_str(),
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "pdf" => Some(Self::Pdf),
            "docx" => Some(Self::Docx),
            "md" | "markdown" => Some(Self::Markdown),
            "html" | "htm" => Some(Self::Html),
            "txt" | "text" => Some(Self::Text),
            "mmd" | "mermaid" => Some(Self::Mermaid),
            "svg" => Some(Self::Svg),
            "png" => Some(Self::Png),
            "jpg" | "jpeg" => Some(Self::Jpeg),
            "csv" => Some(Self::Csv),
            "json" => Some(Self::Json),
            _ => None,
        }
    }

    /// Plain UTF-8 formats. A generic text signature is compatible with all of them.
    pub fn is_text_family(&self) -> bool {
        matches!(
            self,
            Self::Markdown | Self::Html | Self::Text | Self::Mermaid | Self::Svg | Self::Csv | Self::Json
        )
    }

    pub fn carries_text(&self) -> bool {
        !matches!(self, Self::Png | Self::Jpeg)
    }

    pub fn carries_metadata(&self) -> bool {
        matches!(
            self,
            Self::Pdf | Self::Docx | Self::Markdown | Self::Html | Self::Svg | Self::Json
        )
    }

    /// Features that can be observed in a file of this format.
    pub fn observable_features(&self) -> &'static [Feature] {
        use Feature::*;
        match self {
            Self::Docx | Self::Html | Self::Markdown => &[Tables, Headings, Lists, EmbeddedDiagrams],
            Self::Text => &[Lists],
            Self::Csv | Self::Json => &[Tables],
            Self::Pdf | Self::Mermaid | Self::Svg | Self::Png | Self::Jpeg => &[EmbeddedDiagrams],
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Format {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        Format::ALL
            .iter()
            .copied()
            .find(|f| f.as_str().eq_ignore_ascii_case(s))
            .or_else(|| Format::from_extension(s.trim_start_matches('.')))
            .ok_or_else(|| format!("unknown format: {s}"))
    }
}

impl Feature {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tables => "has-tables",
            Self::Headings => "has-headings",
            Self::Lists => "has-lists",
            Self::EmbeddedDiagrams => "has-embedded-diagrams",
            Self::ScannedImage => "is-scanned-image",
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Feature {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "has-tables" => Ok(Self::Tables),
            "has-headings" => Ok(Self::Headings),
            "has-lists" => Ok(Self::Lists),
            "has-embedded-diagrams" => Ok(Self::EmbeddedDiagrams),
            "is-scanned-image" => Ok(Self::ScannedImage),
            other => Err(format!("unknown feature tag: {other}")),
        }
    }
}
