//! Parse and validation errors for shared primitives.

use thiserror::Error;

pub type DomainResult<T> = Result<T, DomainError>;

/// Raised when a value coming from storage, config, or a message payload does
/// not describe a valid ledger primitive.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    #[error("validation failed: {0}")]
    Validation(String),

    /// Identifier text that is not a UUID.
    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }
}
