//! Crate-wide error type.
//!
//! Models the error kinds enumerated in the error handling design: the HTTP
//! layer maps a `ClawkerError` to a status code in one place, and the bridge
//! layer decides fatal-vs-recoverable without string matching.

use thiserror::Error;

/// Crate-local `Result` alias.
pub type Result<T> = std::result::Result<T, ClawkerError>;

/// Error kinds observed across the host proxy and socket bridge.
#[derive(Debug, Error)]
pub enum ClawkerError {
    /// Bad JSON, missing fields, bad scheme, bad port. Reported as 400.
    #[error("{0}")]
    Validation(String),

    /// Unknown session, dead PID. Reported as 404, or treated as a no-op
    /// for idempotent deletes.
    #[error("not found: {0}")]
    NotFound(String),

    /// A host dependency is unavailable: GPG socket missing, `SSH_AUTH_SOCK`
    /// unset, `git credential` non-zero exit, browser open failed.
    #[error("dependency unavailable: {0}")]
    Dependency(String),

    /// Transient I/O: socket read/write after the peer closed. The affected
    /// stream is closed; the session continues.
    #[error("transient I/O error: {0}")]
    Transient(#[from] std::io::Error),

    /// Bridge frame length out of range, or a short read. Fatal to the
    /// bridge session.
    #[error("framing error: {0}")]
    Framing(String),

    /// Cannot bind both loopback listeners, cannot write the PID file.
    /// The daemon exits non-zero.
    #[error("fatal startup error: {0}")]
    Fatal(String),

    /// Wraps an `anyhow::Error` from a process-boundary helper (PID-file
    /// I/O, config directory resolution) so it can cross into the
    /// `ClawkerError` world with `?`.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),

    /// JSON (de)serialization failure reading or writing session metadata.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ClawkerError {
    /// Validation-kind constructor for call sites that build a `String`.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// NotFound-kind constructor.
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Dependency-kind constructor.
    pub fn dependency(msg: impl Into<String>) -> Self {
        Self::Dependency(msg.into())
    }

    /// Framing-kind constructor.
    pub fn framing(msg: impl Into<String>) -> Self {
        Self::Framing(msg.into())
    }

    /// The HTTP status code this error kind maps to, per the router's
    /// universal error-reply behavior.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Validation(_) => 400,
            Self::NotFound(_) => 404,
            Self::Dependency(_) => 503,
            Self::Transient(_) => 500,
            Self::Framing(_) => 500,
            Self::Fatal(_) => 500,
            Self::Internal(_) => 500,
            Self::Serialization(_) => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_error_policy() {
        assert_eq!(ClawkerError::validation("x").status_code(), 400);
        assert_eq!(ClawkerError::not_found("x").status_code(), 404);
        assert_eq!(ClawkerError::dependency("x").status_code(), 503);
        assert_eq!(ClawkerError::framing("x").status_code(), 500);
    }
}
