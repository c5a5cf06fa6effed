//! Error types for sandpit-core

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SandpitError {
    #[error("no active sandbox for session {0}")]
    SandboxNotFound(String),

    #[error("sandbox creation failed: {0}")]
    CreationFailure(String),

    #[error("code injection failed: {0}")]
    InjectionFailure(String),

    #[error(
        "execution exceeded the {0}-second limit and was forcibly terminated"
    )]
    ExecutionTimeout(u64),

    #[error("execution failed:\n{0}")]
    ExecutionFailure(String),

    #[error("{0}")]
    LintFailure(String),

    #[error("sandbox for session {0} is busy with another run")]
    SandboxBusy(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

impl SandpitError {
    /// Wire-level classification of this error
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::SandboxNotFound(_) => ErrorKind::SandboxNotFound,
            Self::CreationFailure(_) => ErrorKind::CreationFailure,
            Self::InjectionFailure(_) => ErrorKind::InjectionFailure,
            Self::ExecutionTimeout(_) => ErrorKind::ExecutionTimeout,
            Self::ExecutionFailure(_) => ErrorKind::ExecutionFailure,
            Self::LintFailure(_) => ErrorKind::LintFailure,
            Self::SandboxBusy(_) => ErrorKind::SandboxBusy,
            Self::InvalidRequest(_) => ErrorKind::InvalidRequest,
            Self::Backend(_) | Self::Io(_) | Self::Config(_) => ErrorKind::Internal,
        }
    }

    /// Message carried to the caller
    ///
    /// Execution and lint failures pass the raw process output through
    /// untouched; everything else uses the display form.
    #[must_use]
    pub fn message(&self) -> String {
        match self {
            Self::ExecutionFailure(output) | Self::LintFailure(output) => output.clone(),
            other => other.to_string(),
        }
    }
}

/// Error classification shared with transport clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    SandboxNotFound,
    CreationFailure,
    InjectionFailure,
    ExecutionTimeout,
    ExecutionFailure,
    LintFailure,
    SandboxBusy,
    InvalidRequest,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::SandboxNotFound => "SandboxNotFound",
            Self::CreationFailure => "CreationFailure",
            Self::InjectionFailure => "InjectionFailure",
            Self::ExecutionTimeout => "ExecutionTimeout",
            Self::ExecutionFailure => "ExecutionFailure",
            Self::LintFailure => "LintFailure",
            Self::SandboxBusy => "SandboxBusy",
            Self::InvalidRequest => "InvalidRequest",
            Self::Internal => "Internal",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_message_names_the_limit() {
        let err = SandpitError::ExecutionTimeout(30);
        assert_eq!(err.kind(), ErrorKind::ExecutionTimeout);
        assert!(err.message().contains("30-second"));
        assert!(err.message().contains("forcibly terminated"));
    }

    #[test]
    fn failure_output_is_passed_through_verbatim() {
        let output = "Traceback (most recent call last):\nZeroDivisionError: division by zero";
        let err = SandpitError::ExecutionFailure(output.into());
        assert_eq!(err.message(), output);

        let lint = SandpitError::LintFailure("script.py:1:1: E001 bad".into());
        assert_eq!(lint.message(), "script.py:1:1: E001 bad");
    }

    #[test]
    fn backend_faults_collapse_to_internal() {
        assert_eq!(SandpitError::Backend("boom".into()).kind(), ErrorKind::Internal);
        assert_eq!(SandpitError::Config("bad".into()).kind(), ErrorKind::Internal);
    }
}
