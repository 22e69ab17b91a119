use cluster_map_lib::MapError;
use std::path::PathBuf;
use thiserror::Error;

/// Errors of the command line driver
#[derive(Debug, Error)]
pub enum CliError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Failed to write output: {0}")]
    Output(#[from] serde_json::Error),

    #[error(transparent)]
    Map(#[from] MapError),

    #[error("Engine ended in error state: {0}")]
    Engine(String),

    #[error("Engine task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("Failed to start runtime: {0}")]
    Runtime(std::io::Error),
}

pub type Result<T> = std::result::Result<T, CliError>;
