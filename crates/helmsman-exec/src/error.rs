//! Error taxonomy shared by every part of helmsman-exec
//!
//! Every fallible operation returns one of these kinds instead of panicking.
//! [`Error`] unifies the families for pipelines that mix them.

use thiserror::Error;

/// Failures tied to spawning or running a command
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProcessError {
    /// The process ran to completion but its exit code signaled failure
    #[error("{message}")]
    NonZeroExit {
        /// Human-readable, host and command prefixed
        message: String,
        /// Exit code reported by the process
        exit_code: i32,
    },

    /// The host identity could not be established or is not trusted
    #[error("{host}: {message}")]
    UnknownHost {
        /// Host that failed verification
        host: String,
        /// Reason reported by the transport
        message: String,
    },

    /// The executable or target path does not exist on the host
    #[error("{message}")]
    NotFound {
        /// Human-readable, host and command prefixed
        message: String,
    },

    /// The host was reached and trusted but refused our credentials
    #[error("{host}: {message}")]
    AuthenticationFailed {
        /// Host that refused authentication
        host: String,
        /// Reason reported by the transport
        message: String,
    },

    /// Any other spawn, connection or runtime failure
    #[error("{message}")]
    Failed {
        /// Human-readable, host and command prefixed
        message: String,
    },
}

impl ProcessError {
    /// Generic process failure
    pub fn failed(message: impl Into<String>) -> Self {
        ProcessError::Failed {
            message: message.into(),
        }
    }

    /// Executable or path missing on the host
    pub fn not_found(message: impl Into<String>) -> Self {
        ProcessError::NotFound {
            message: message.into(),
        }
    }

    /// Host identity not trusted
    pub fn unknown_host(host: impl Into<String>, message: impl Into<String>) -> Self {
        ProcessError::UnknownHost {
            host: host.into(),
            message: message.into(),
        }
    }

    /// Exit code carried by a [`ProcessError::NonZeroExit`]
    #[must_use]
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            ProcessError::NonZeroExit { exit_code, .. } => Some(*exit_code),
            _ => None,
        }
    }

    /// Check if error is retryable
    ///
    /// Only generic failures (lost connections, spawn hiccups) qualify; a distrusted
    /// host, a missing binary or a clean non-zero exit will fail the same way again.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProcessError::Failed { .. })
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, ProcessError::NotFound { .. })
    }

    #[must_use]
    pub fn is_unknown_host(&self) -> bool {
        matches!(self, ProcessError::UnknownHost { .. })
    }
}

/// Structured text or bytes did not match the expected shape
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("parsing error: {message}")]
pub struct ParsingError {
    pub message: String,
}

impl ParsingError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// A caller supplied a value outside the accepted domain
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid value: {message}")]
pub struct ValueError {
    pub message: String,
}

impl ValueError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Failures that must never be shown to the user
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SilentError {
    /// An in-flight operation was aborted on purpose; treat as a no-op
    #[error("cancelled by user: {0}")]
    CancelledByUser(String),
}

/// Any failure produced by helmsman-exec
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error(transparent)]
    Parsing(#[from] ParsingError),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error(transparent)]
    Value(#[from] ValueError),

    #[error(transparent)]
    Silent(#[from] SilentError),
}

impl Error {
    /// Whether the failure must be swallowed instead of reported
    #[must_use]
    pub fn is_silent(&self) -> bool {
        matches!(self, Error::Silent(_))
    }

    /// The process failure, if this is one
    #[must_use]
    pub fn as_process(&self) -> Option<&ProcessError> {
        match self {
            Error::Process(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_only_for_non_zero_exit() {
        let e = ProcessError::NonZeroExit {
            message: "localhost: false: (1)".to_string(),
            exit_code: 1,
        };
        assert_eq!(e.exit_code(), Some(1));
        assert_eq!(ProcessError::failed("boom").exit_code(), None);
    }

    #[test]
    fn test_retryable() {
        assert!(ProcessError::failed("connection reset").is_retryable());
        assert!(!ProcessError::not_found("nope").is_retryable());
        assert!(!ProcessError::unknown_host("db1", "host key changed").is_retryable());
    }

    #[test]
    fn test_silent_classification() {
        let silent: Error = SilentError::CancelledByUser("ctrl-c".to_string()).into();
        assert!(silent.is_silent());

        let loud: Error = ProcessError::failed("boom").into();
        assert!(!loud.is_silent());
        assert!(loud.as_process().is_some());
    }

    #[test]
    fn test_unknown_host_display() {
        let e = ProcessError::unknown_host("nas01", "unknown server key");
        assert_eq!(e.to_string(), "nas01: unknown server key");
    }
}
