use thiserror::Error;

/// The eight error kinds the coordinator distinguishes between. Most are
/// handled locally by the owning loop; `Config` is the only kind that
/// terminates the process.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    #[error("model timed out after {elapsed_ms}ms")]
    ModelTimeout { elapsed_ms: u64 },

    #[error("model absent or unreachable")]
    ModelAbsent,

    #[error("inference output failed validation: {0}")]
    OutputValidation(String),

    #[error("scoring function error: {0}")]
    Scoring(String),

    #[error("ground truth currently unresolvable")]
    ResolverIndeterminate,

    #[error("storage error: {0}")]
    Storage(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl From<rusqlite::Error> for CoordinatorError {
    fn from(e: rusqlite::Error) -> Self {
        CoordinatorError::Storage(e.to_string())
    }
}

impl From<anyhow::Error> for CoordinatorError {
    fn from(e: anyhow::Error) -> Self {
        CoordinatorError::Storage(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CoordinatorError>;
