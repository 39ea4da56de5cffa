//! Engine error taxonomy.
//!
//! Rule handlers never surface these: they degrade and log. Batch workers map
//! `is_transient` to retry signals; everything else fails the job.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed row, out-of-range amount, future date, missing mapping.
    /// Surfaced per-row as a warning; the row is skipped.
    #[error("validation: {0}")]
    Validation(String),

    /// Duplicate unique key or an attempt to mutate a sealed artifact.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Store I/O error or external-service timeout. Retryable.
    #[error("transient: {0}")]
    Transient(String),

    /// Invariant violated (sealed-case mutation, hash mismatch). Fails the
    /// containing job and emits `system.error`.
    #[error("permanent: {0}")]
    Permanent(String),
}

impl EngineError {
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::Transient(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation",
            EngineError::Conflict(_) => "conflict",
            EngineError::NotFound(_) => "not_found",
            EngineError::Transient(_) => "transient",
            EngineError::Permanent(_) => "permanent",
        }
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::QueryReturnedNoRows => {
                EngineError::NotFound("row not found".to_string())
            }
            rusqlite::Error::SqliteFailure(code, msg) => {
                use rusqlite::ErrorCode;
                match code.code {
                    ErrorCode::ConstraintViolation => EngineError::Conflict(
                        msg.clone().unwrap_or_else(|| "constraint violation".to_string()),
                    ),
                    ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => {
                        EngineError::Transient(format!("sqlite busy: {err}"))
                    }
                    _ => EngineError::Transient(format!("sqlite: {err}")),
                }
            }
            _ => EngineError::Transient(format!("sqlite: {err}")),
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Validation(format!("json: {err}"))
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
