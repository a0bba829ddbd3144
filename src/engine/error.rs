use thiserror::Error;

use crate::model::BookingId;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("slot conflicts with booking {0}")]
    Conflict(BookingId),
    #[error("booking not found: {0}")]
    NotFound(BookingId),
    #[error("booking {0} belongs to another user")]
    Forbidden(BookingId),
    #[error("booking {id} cannot leave state {from}")]
    InvalidTransition { id: BookingId, from: &'static str },
    /// Internal: retried with a fresh reference, never returned from a charge.
    #[error("transaction reference already issued: {0}")]
    DuplicateReference(String),
    #[error("no unique transaction reference after {0} attempts")]
    ReferencesExhausted(usize),
    #[error("WAL error: {0}")]
    WalError(String),
}

/// Caller-facing failure classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidInput,
    Conflict,
    NotFound,
    Forbidden,
    Internal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::Conflict => "conflict",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::Internal => "internal",
        }
    }
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::InvalidInput(_) => ErrorKind::InvalidInput,
            EngineError::Conflict(_) => ErrorKind::Conflict,
            EngineError::NotFound(_) => ErrorKind::NotFound,
            EngineError::Forbidden(_) => ErrorKind::Forbidden,
            EngineError::InvalidTransition { .. }
            | EngineError::DuplicateReference(_)
            | EngineError::ReferencesExhausted(_)
            | EngineError::WalError(_) => ErrorKind::Internal,
        }
    }
}
