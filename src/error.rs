//! Error types for dataset construction and evaluation

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// A cache file was expected but is absent and the remote fetch failed too.
    #[error("missing asset {}: {source}", path.display())]
    MissingAsset {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("instruction has no client assignment: {0:?}")]
    UnassignedInstruction(String),

    #[error("prompt template `{template}` requires field `{field}`")]
    Formatting { template: String, field: String },

    #[error("validation error: {0}")]
    Validation(String),

    #[error("no usable model checkpoint for {basename} (tried {tried:?})")]
    ModelUnavailable { basename: String, tried: Vec<String> },

    #[error("malformed record at {}:{line}: {reason}", path.display())]
    MalformedRecord {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PipelineError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
}
