//! Error types for instance isolation and launching.

use std::path::Path;

use thiserror::Error;

/// Errors surfaced by the isolation and launch engine.
#[derive(Error, Debug)]
pub enum InstanceError {
    /// Target application or instance record is missing
    #[error("Not found: {0}")]
    NotFound(String),

    /// Bundle is unusable (no identifier/executable, protected or sandboxed)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Filesystem or OS environment refused an operation
    #[error("Environment error: {0}")]
    Environment(String),

    /// The OS refused to spawn the process
    #[error("Launch failed: {0}")]
    Launch(String),

    /// A document did not match any expected shape
    #[error("Format error: {0}")]
    Format(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl InstanceError {
    /// Wrap an I/O failure on `path` as an environment error.
    pub fn environment(action: &str, path: &Path, err: std::io::Error) -> Self {
        Self::Environment(format!("{} {}: {}", action, path.display(), err))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_invalid_input(&self) -> bool {
        matches!(self, Self::InvalidInput(_))
    }
}

pub type Result<T> = std::result::Result<T, InstanceError>;
