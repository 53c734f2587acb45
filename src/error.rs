use crate::format::Format;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DetectionError {
    #[error("cannot read '{path}': {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unrecognized format: {path}")]
    Unrecognized { path: PathBuf },

    #[error("input exceeds max_input_file_bytes ({size} > {limit}): {path}")]
    TooLarge { path: PathBuf, size: u64, limit: u64 },
}

/// Outcome of a single converter invocation that did not produce output.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConvertError {
    #[error("converter failed: {0}")]
    Failed(String),

    #[error("converter exceeded its time budget")]
    Timeout,

    /// The backing tool is missing; other methods using the same tool are skipped.
    #[error("converter unavailable: {0}")]
    Unavailable(String),
}

#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("cannot read '{path}': {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot extract {format} content from '{path}': {reason}")]
    Extraction {
        path: PathBuf,
        format: Format,
        reason: String,
    },
}

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("duplicate method id: {0}")]
    DuplicateMethod(String),

    #[error("method '{method}' references unknown converter '{converter}'")]
    UnknownConverter { method: String, converter: String },

    #[error("invalid format '{value}' in method '{method}'")]
    InvalidFormat { method: String, value: String },

    #[error("invalid precondition '{value}' in method '{method}'")]
    InvalidPrecondition { method: String, value: String },

    #[error("no method of last resort (without preconditions) for {from} -> {to}")]
    NoLastResort { from: Format, to: Format },
}

/// Job-level terminal error recorded on a [`crate::job::ConversionResult`].
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobFailure {
    #[error("input rejected: {reason}")]
    InvalidInput { reason: String },

    #[error("detection failed: {reason}")]
    Detection { reason: String },

    #[error("no eligible method for {from} -> {to}")]
    NoEligibleMethod { from: Format, to: Format },

    #[error("all {attempts} methods failed or scored below the quality floor")]
    Exhausted { attempts: usize },

    #[error("cancelled before a usable result was produced")]
    Cancelled,

    #[error("aborted: {reason}")]
    Aborted { reason: String },
}
