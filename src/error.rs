//! Error types shared across the pipeline

use std::path::PathBuf;
use thiserror::Error;

/// Failure while loading the filter rules file
#[derive(Debug, Error)]
pub enum FilterError {
    #[error("failed to read filter file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid pattern on line {line} of {}: {source}", path.display())]
    Pattern {
        path: PathBuf,
        line: usize,
        #[source]
        source: regex::Error,
    },
}

/// Failure talking to an out-of-process worker
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("failed to spawn worker `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("worker i/o failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("worker exited before finishing the batch ({status})")]
    Crashed { status: String },

    #[error("worker sent a malformed message: {0}")]
    Protocol(String),

    #[error("worker command is empty")]
    EmptyCommand,
}

/// Failure of one selection pass
#[derive(Debug, Error)]
pub enum SelectionError {
    #[error(transparent)]
    Filter(#[from] FilterError),
}
