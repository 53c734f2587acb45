use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub global: Global,
    #[serde(default)]
    pub jobs: Jobs,
    #[serde(default)]
    pub execution: Execution,
    #[serde(default)]
    pub batch: Batch,
    #[serde(default)]
    pub limits: Limits,
    #[serde(default)]
    pub quality: Quality,
    #[serde(default)]
    pub converters: BTreeMap<String, ConverterDef>,
    #[serde(default)]
    pub methods: Vec<MethodDef>,
    #[serde(default)]
    pub output: Output,
    #[serde(default)]
    pub logging: Logging,
    #[serde(default)]
    pub debug: Debug,
    #[serde(default)]
    pub security: Security,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config: {}", path.display()))?;
        let cfg: Config = toml::from_str(&raw).with_context(|| "parsing TOML")?;
        cfg.validate()
            .with_context(|| format!("invalid config: {}", path.display()))?;
        Ok(cfg)
    }

    /// Rejects thresholds and weights the cascade cannot act on.
    pub fn validate(&self) -> Result<()> {
        check_quality_score("jobs.min_quality_score", self.jobs.min_quality_score)?;
        check_quality_score("jobs.quality_floor", self.jobs.quality_floor)?;
        if self.jobs.quality_floor > self.jobs.min_quality_score {
            bail!(
                "jobs.quality_floor ({}) is above jobs.min_quality_score ({})",
                self.jobs.quality_floor,
                self.jobs.min_quality_score
            );
        }
        let w = &self.quality.weights;
        for (name, value) in [
            ("quality.weights.structure", w.structure),
            ("quality.weights.content", w.content),
            ("quality.weights.metadata", w.metadata),
        ] {
            if !value.is_finite() || value < 0.0 {
                bail!("{name} must be a non-negative number, got {value}");
            }
        }
        if w.structure + w.content + w.metadata <= 0.0 {
            bail!("quality.weights must not all be zero");
        }
        Ok(())
    }
}

/// Scores live on a 0-100 scale.
pub fn check_quality_score(name: &str, value: f64) -> Result<()> {
    if !value.is_finite() || !(0.0..=100.0).contains(&value) {
        bail!("{name} must be between 0 and 100, got {value}");
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Global {
    pub print_summary: bool,
}
impl Default for Global {
    fn default() -> Self {
        Self {
            print_summary: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Jobs {
    /// Default caller threshold for an unconditional `Completed`.
    pub min_quality_score: f64,
    /// Absolute floor below which an output is never retained.
    pub quality_floor: f64,
}
impl Default for Jobs {
    fn default() -> Self {
        Self {
            min_quality_score: 70.0,
            quality_floor: 40.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    /// Per-attempt converter budget; 0 disables the timeout.
    pub attempt_timeout_seconds: u64,
    pub out_dir: String,
}
impl Default for Execution {
    fn default() -> Self {
        Self {
            attempt_timeout_seconds: 300,
            out_dir: "out".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub max_concurrency: usize,
    pub escalate_failure_ratio: f64,
}
impl Default for Batch {
    fn default() -> Self {
        Self {
            max_concurrency: 2,
            escalate_failure_ratio: 0.2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Limits {
    pub max_input_file_bytes: u64,
    pub max_sniff_bytes: u64,
    pub max_extract_bytes: u64,
}
impl Default for Limits {
    fn default() -> Self {
        Self {
            max_input_file_bytes: 512 * 1024 * 1024,
            max_sniff_bytes: 4096,
            max_extract_bytes: 16 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Quality {
    #[serde(default)]
    pub weights: QualityWeights,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityWeights {
    pub structure: f64,
    pub content: f64,
    pub metadata: f64,
}
impl Default for QualityWeights {
    fn default() -> Self {
        Self {
            structure: 0.4,
            content: 0.4,
            metadata: 0.2,
        }
    }
}

/// An external program used as a converter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConverterDef {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// One `[[methods]]` row of the catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MethodDef {
    pub id: String,
    pub from: String,
    pub to: String,
    pub rank: u32,
    pub converter: String,
    #[serde(default)]
    pub requires: Vec<String>,
    #[serde(default)]
    pub excludes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Output {
    pub write_report_json: bool,
    pub report_filename: String,
    pub batch_report_filename: String,
    /// Delete outputs of attempts that were not selected as the job's result.
    pub discard_rejected: bool,
}
impl Default for Output {
    fn default() -> Self {
        Self {
            write_report_json: true,
            report_filename: "result.json".into(),
            batch_report_filename: "batch-report.json".into(),
            discard_rejected: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Logging {
    pub level: String,
    pub json: bool,
    pub write_to_file: bool,
    pub file_path: String,
}
impl Default for Logging {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
            write_to_file: true,
            file_path: "".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Debug {
    pub dump_effective_config: bool,
}
impl Default for Debug {
    fn default() -> Self {
        Self {
            dump_effective_config: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Security {
    pub reject_url_inputs: bool,
}
impl Default for Security {
    fn default() -> Self {
        Self {
            reject_url_inputs: true,
        }
    }
}
