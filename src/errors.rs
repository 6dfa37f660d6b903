use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SandboxError>;

/// Host-side failures of the sandbox plumbing.
///
/// Script-level failures (policy rejections, exceptions raised by the script,
/// deadline expiry) are not errors: they are reported through
/// [`crate::ExecutionOutcome`] and always end up in a response envelope.
#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("Python not installed or not found in PATH")]
    PythonNotFound,

    #[error("Dataset not available at {path}: {source}")]
    DatasetUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Malformed worker response: {0}")]
    Protocol(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}
