//! OSI errors

use thiserror::Error;

/// Errors that can occur while reading, writing or transforming OSI data
#[derive(Debug, Error)]
pub enum OsiError {
    /// A value or offset lies outside a required bound
    #[error("Range error: {0}")]
    Range(String),

    /// Malformed literal, wrong argument type or forbidden byte
    #[error("Value error: {0}")]
    Value(String),

    /// Mutation attempted on a read-only view
    #[error("Read-only error: {0}")]
    ReadOnly(String),

    /// Structural contradiction (bad opcode, duplicate name or ID, broken reference)
    #[error("Invalid: {0}")]
    Invalid(String),

    /// Corrupt subroutine table layout
    #[error("Subroutine error: {0}")]
    Subroutine(String),

    /// Known encoding that is not supported
    #[error("Unimplemented: {0}")]
    Unimplemented(String),

    /// An invariant the implementation must guarantee was violated
    #[error("Internal error: {0}")]
    Internal(String),

    /// IO error while loading or saving a file
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Option document could not be parsed
    #[error("Options error: {0}")]
    Options(#[from] serde_json::Error),
}

impl OsiError {
    pub(crate) fn range(message: impl Into<String>) -> Self {
        Self::Range(message.into())
    }

    pub(crate) fn value(message: impl Into<String>) -> Self {
        Self::Value(message.into())
    }

    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid(message.into())
    }

    pub(crate) fn subroutine(message: impl Into<String>) -> Self {
        Self::Subroutine(message.into())
    }

    pub(crate) fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }
}

/// Result type for OSI operations
pub type Result<T> = std::result::Result<T, OsiError>;
