use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SweepError {
    #[error("cache storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("i/o error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("none of the application folders could be read: {}", display_paths(.0))]
    NoReadableRoot(Vec<PathBuf>),

    #[error("cache schema version {found} does not match expected {expected}")]
    SchemaMismatch { found: i32, expected: i32 },

    #[error("invalid exclusion pattern {pattern:?}: {message}")]
    Pattern { pattern: String, message: String },
}

impl SweepError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SweepError::Io {
            path: path.into(),
            source,
        }
    }
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

pub type Result<T> = std::result::Result<T, SweepError>;
