use crate::{
    config::{Limits, QualityWeights},
    error::ValidationError,
    extract::{self, Extracted},
    format::{Feature, Format, MetaField},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Component {
    Structure,
    Content,
    Metadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentScore {
    /// Sub-score in `[0, 1]`.
    pub score: f64,
    /// Effective weight after redistribution.
    pub weight: f64,
    pub applicable: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    /// Composite fidelity, 0-100.
    pub score: f64,
    pub breakdown: BTreeMap<Component, ComponentScore>,
    #[serde(default)]
    pub lost_features: Vec<Feature>,
    #[serde(default)]
    pub missing_metadata: Vec<MetaField>,
}

impl QualityReport {
    /// A report carrying only a composite score, for scorers without a breakdown.
    pub fn from_score(score: f64) -> Self {
        Self {
            score: score.clamp(0.0, 100.0),
            breakdown: BTreeMap::new(),
            lost_features: Vec::new(),
            missing_metadata: Vec::new(),
        }
    }
}

/// Scores a finished conversion. Implementations must be pure.
pub trait Scorer: Send + Sync {
    fn score(
        &self,
        source: &Path,
        output: &Path,
        source_format: Format,
        target_format: Format,
    ) -> Result<QualityReport, ValidationError>;
}

#[derive(Debug, Clone, Default)]
pub struct QualityValidator {
    weights: QualityWeights,
    limits: Limits,
}

impl QualityValidator {
    pub fn new(weights: &QualityWeights, limits: &Limits) -> Self {
        Self {
            weights: weights.clone(),
            limits: limits.clone(),
        }
    }

    fn extract(&self, path: &Path, format: Format) -> Result<Extracted, ValidationError> {
        std::fs::metadata(path).map_err(|source| ValidationError::Unreadable {
            path: path.to_path_buf(),
            source,
        })?;
        extract::extract(path, format, self.limits.max_extract_bytes).map_err(|reason| {
            ValidationError::Extraction {
                path: path.to_path_buf(),
                format,
                reason,
            }
        })
    }

    /// Scores already-extracted content; the file-level entry point delegates here.
    pub fn score_extracted(
        &self,
        source: &Extracted,
        output: &Extracted,
        source_format: Format,
        target_format: Format,
    ) -> QualityReport {
        let (structure, lost_features) = structure_score(source, output, target_format);
        let content = content_score(source, output, source_format, target_format);
        let (metadata, missing_metadata) = metadata_score(source, output, target_format);

        let parts = [
            (Component::Structure, structure, self.weights.structure),
            (Component::Content, content, self.weights.content),
            (Component::Metadata, metadata, self.weights.metadata),
        ];

        let total_weight: f64 = parts.iter().map(|(_, _, w)| w.max(0.0)).sum();
        let count = parts.len() as f64;
        let normalized = |w: f64| {
            if total_weight > 0.0 {
                w.max(0.0) / total_weight
            } else {
                1.0 / count
            }
        };
        let applicable = parts.iter().filter(|(_, s, _)| s.is_some()).count();
        let unusable: f64 = parts
            .iter()
            .filter(|(_, s, _)| s.is_none())
            .map(|(_, _, w)| normalized(*w))
            .sum();
        // Weight of non-applicable components is split evenly over the rest.
        let share = if applicable > 0 {
            unusable / applicable as f64
        } else {
            0.0
        };

        let mut breakdown = BTreeMap::new();
        let mut weighted = 0.0;
        for (component, sub, weight) in parts {
            let entry = match sub {
                Some(s) => {
                    let effective = normalized(weight) + share;
                    weighted += s * effective;
                    ComponentScore {
                        score: s,
                        weight: effective,
                        applicable: true,
                    }
                }
                None => ComponentScore {
                    score: 1.0,
                    weight: 0.0,
                    applicable: false,
                },
            };
            breakdown.insert(component, entry);
        }

        let score = if applicable == 0 {
            if output.text.is_empty() && output.features.is_empty() {
                0.0
            } else {
                100.0
            }
        } else {
            round2((weighted * 100.0).clamp(0.0, 100.0))
        };

        QualityReport {
            score,
            breakdown,
            lost_features,
            missing_metadata,
        }
    }
}

impl Scorer for QualityValidator {
    fn score(
        &self,
        source: &Path,
        output: &Path,
        source_format: Format,
        target_format: Format,
    ) -> Result<QualityReport, ValidationError> {
        let src = self.extract(source, source_format)?;
        let out = self.extract(output, target_format)?;
        let report = self.score_extracted(&src, &out, source_format, target_format);
        debug!(
            "quality {} -> {}: {} {:?}",
            source.display(),
            output.display(),
            report.score,
            report.breakdown
        );
        Ok(report)
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Mean per-feature preservation ratio over source features the target can express.
fn structure_score(
    source: &Extracted,
    output: &Extracted,
    target_format: Format,
) -> (Option<f64>, Vec<Feature>) {
    let present: Vec<(Feature, usize)> = source
        .features
        .iter()
        .filter(|(f, n)| **f != Feature::ScannedImage && **n > 0)
        .map(|(f, n)| (*f, *n))
        .collect();
    if present.is_empty() {
        return (Some(1.0), Vec::new());
    }

    let expressible: Vec<(Feature, usize)> = present
        .into_iter()
        .filter(|(f, _)| target_format.observable_features().contains(f))
        .collect();
    if expressible.is_empty() {
        return (None, Vec::new());
    }

    let mut lost = Vec::new();
    let mut sum = 0.0;
    for (feature, want) in &expressible {
        let got = output.count(*feature);
        if got == 0 {
            lost.push(*feature);
        }
        sum += (got as f64 / *want as f64).min(1.0);
    }
    (Some(sum / expressible.len() as f64), lost)
}

fn content_score(
    source: &Extracted,
    output: &Extracted,
    source_format: Format,
    target_format: Format,
) -> Option<f64> {
    if !source_format.carries_text() || !target_format.carries_text() {
        return None;
    }
    let want = source.normalized_len();
    if want == 0 {
        return None;
    }
    let got = output.normalized_len();
    let ratio = want.min(got) as f64 / want.max(got) as f64;
    Some(ratio.clamp(0.0, 1.0))
}

fn metadata_score(
    source: &Extracted,
    output: &Extracted,
    target_format: Format,
) -> (Option<f64>, Vec<MetaField>) {
    if source.metadata.is_empty() {
        return (Some(1.0), Vec::new());
    }
    if !target_format.carries_metadata() {
        return (None, Vec::new());
    }
    let missing: Vec<MetaField> = source
        .metadata
        .difference(&output.metadata)
        .copied()
        .collect();
    let found = source.metadata.len() - missing.len();
    (Some(found as f64 / source.metadata.len() as f64), missing)
}
