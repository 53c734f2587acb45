use crate::{
    detect::FormatProfile, error::JobFailure, format::Format, util::sha256_hex,
    validate::QualityReport,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

fn default_min_quality() -> f64 {
    70.0
}

/// A request to convert one file. Never mutated once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionJob {
    pub source_path: PathBuf,
    /// Optional caller hint; trusted when it names a known format.
    #[serde(default)]
    pub source_format: Option<String>,
    pub target_format: Format,
    #[serde(default = "default_min_quality")]
    pub min_quality_score: f64,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

impl ConversionJob {
    pub fn new(source_path: impl Into<PathBuf>, target_format: Format) -> Self {
        Self {
            source_path: source_path.into(),
            source_format: None,
            target_format,
            min_quality_score: default_min_quality(),
            options: BTreeMap::new(),
        }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.source_format = Some(hint.into());
        self
    }

    /// Sets the acceptance threshold, clamped to `0..=100`. A non-finite score
    /// keeps the current threshold.
    pub fn with_min_quality(mut self, score: f64) -> Self {
        if score.is_finite() {
            self.min_quality_score = score.clamp(0.0, 100.0);
        }
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// Stable id derived from everything that shapes the job.
    pub fn id(&self) -> String {
        let mut key = format!("{}:{}", self.source_path.display(), self.target_format);
        if let Some(hint) = &self.source_format {
            key.push_str(&format!(";hint={hint}"));
        }
        key.push_str(&format!(";min={}", self.min_quality_score));
        for (k, v) in &self.options {
            key.push_str(&format!(";{k}={v}"));
        }
        sha256_hex(key.as_bytes())[..16].to_string()
    }

    /// Id for the job at `index` of a batch. Identical jobs in one batch get
    /// separate ids and therefore separate output directories.
    pub fn batch_id(&self, index: usize) -> String {
        format!("{}-{index}", self.id())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    Failure { reason: String },
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionAttempt {
    pub method_id: String,
    pub started_at: String,
    pub finished_at: String,
    pub duration_ms: u64,
    pub outcome: AttemptOutcome,
    /// Present while the output is retained on disk.
    pub output_path: Option<PathBuf>,
    pub quality: Option<QualityReport>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl ConversionAttempt {
    pub fn quality_score(&self) -> Option<f64> {
        self.quality.as_ref().map(|q| q.score)
    }

    pub fn is_success(&self) -> bool {
        self.outcome == AttemptOutcome::Success
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalStatus {
    Completed,
    CompletedWithWarnings,
    Failed,
    NeedsReview,
    Cancelled,
}

impl FinalStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed | Self::CompletedWithWarnings)
    }

    pub fn needs_attention(&self) -> bool {
        matches!(self, Self::Failed | Self::NeedsReview)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionResult {
    pub job_id: String,
    pub job: ConversionJob,
    pub profile: Option<FormatProfile>,
    pub attempts: Vec<ConversionAttempt>,
    pub final_status: FinalStatus,
    pub final_quality_score: Option<f64>,
    pub output_path: Option<PathBuf>,
    pub failure: Option<JobFailure>,
}

impl ConversionResult {
    /// Result for a job that never started.
    pub fn cancelled(job_id: String, job: ConversionJob) -> Self {
        Self {
            job_id,
            job,
            profile: None,
            attempts: Vec::new(),
            final_status: FinalStatus::Cancelled,
            final_quality_score: None,
            output_path: None,
            failure: Some(JobFailure::Cancelled),
        }
    }

    /// Result for a job whose executor stopped without reporting.
    pub fn aborted(job_id: String, job: ConversionJob, reason: &str) -> Self {
        Self::failed(
            job_id,
            job,
            JobFailure::Aborted {
                reason: reason.to_string(),
            },
        )
    }

    /// Result for a job that failed before any attempt was made.
    pub fn failed(job_id: String, job: ConversionJob, failure: JobFailure) -> Self {
        Self {
            final_status: FinalStatus::Failed,
            failure: Some(failure),
            ..Self::cancelled(job_id, job)
        }
    }
}

/// Cooperative cancellation flag shared between a caller and running jobs.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
