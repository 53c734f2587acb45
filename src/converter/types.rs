use crate::format::Format;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ConvertRequest<'a> {
    pub source: &'a Path,
    pub source_format: Format,
    pub target_format: Format,
    pub options: &'a BTreeMap<String, String>,
    /// Directory the converter writes its output into.
    pub out_dir: &'a Path,
    /// Suggested output location, unique per method within a job.
    pub output: PathBuf,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvertOutput {
    pub path: PathBuf,
    #[serde(default)]
    pub warnings: Vec<String>,
}
