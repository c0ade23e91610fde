//! Error types shared by every quern crate.
//!
//! Execution is all-or-nothing: there are no retryable errors, so the enum is
//! deliberately flat. Operators translate collaborator failures into one of
//! these variants and propagate with `?`.

use std::io;

use thiserror::Error;

/// The workspace-wide error type.
#[derive(Debug, Error)]
pub enum QuernError {
    /// A memory reservation failed even after the overflow arena was tried,
    /// or the very first row did not fit after a fresh buffer init. The byte
    /// count is the configured buffer size, not the exact failed request.
    #[error("out of memory (needed {bytes} bytes)")]
    OutOfMemory { bytes: usize },

    /// Writing to a spill chunk file or the probe-row-saving file failed.
    #[error("error writing temporary file")]
    TempFileWrite(#[source] io::Error),

    /// Reading from a spill chunk file or the probe-row-saving file failed.
    #[error("error reading temporary file")]
    TempFileRead(#[source] io::Error),

    /// A join condition or residual predicate raised a typed error.
    #[error("evaluation error: {0}")]
    Evaluation(String),

    /// The session's kill flag was observed set.
    #[error("query execution was interrupted")]
    Killed,

    /// An internal invariant was violated.
    #[error("internal error: {0}")]
    Internal(String),
}

impl QuernError {
    /// Shorthand for an [`QuernError::Internal`] with a formatted message.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

/// Workspace-wide result alias.
pub type Result<T> = std::result::Result<T, QuernError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oom_reports_configured_byte_count() {
        let err = QuernError::OutOfMemory { bytes: 262_144 };
        assert_eq!(err.to_string(), "out of memory (needed 262144 bytes)");
    }

    #[test]
    fn internal_helper_builds_variant() {
        let err = QuernError::internal("chain crossed arena boundary");
        assert!(matches!(err, QuernError::Internal(_)));
    }

    #[test]
    fn temp_file_errors_carry_source() {
        let err = QuernError::TempFileWrite(io::Error::other("disk full"));
        assert_eq!(err.to_string(), "error writing temporary file");
        assert!(std::error::Error::source(&err).is_some());
    }
}
