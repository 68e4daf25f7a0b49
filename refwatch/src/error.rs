// refwatch/src/error.rs
//
// Error taxonomy shared by the store, scheduler, leaderboard and review paths.
// Callers branch on the kind: Conflict is "already exists", NotFound is an
// absent row, TransientIo is a failed storage / gateway call.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("transient i/o failure: {0}")]
    TransientIo(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl EngineError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        Self::TransientIo(e.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        Self::TransientIo(e.to_string())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
