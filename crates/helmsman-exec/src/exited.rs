//! Snapshot of a finished invocation

use std::borrow::Cow;
use std::fmt;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::command::Command;
use crate::error::ParsingError;
use crate::glue::parse_json;
use crate::session::ExitStatus;

/// Exit status and captured output of a terminated process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitedProcess {
    host: String,
    command: Command,
    exit_code: Option<i32>,
    signal: Option<String>,
    stdout: Vec<u8>,
    stderr: String,
    duration: Duration,
}

impl ExitedProcess {
    pub(crate) fn new(
        host: impl Into<String>,
        command: Command,
        status: ExitStatus,
        stdout: Vec<u8>,
        stderr: String,
        duration: Duration,
    ) -> Self {
        Self {
            host: host.into(),
            command,
            exit_code: status.code,
            signal: status.signal,
            stdout,
            stderr,
            duration,
        }
    }

    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    #[must_use]
    pub fn command(&self) -> &Command {
        &self.command
    }

    /// Exit code, `None` when a signal ended the process
    #[must_use]
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    /// Terminating signal name, `None` on a normal exit
    #[must_use]
    pub fn signal(&self) -> Option<&str> {
        self.signal.as_deref()
    }

    /// stdout decoded as UTF-8, invalid sequences replaced
    #[must_use]
    pub fn stdout(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stdout)
    }

    /// stdout as raw bytes
    #[must_use]
    pub fn stdout_bytes(&self) -> &[u8] {
        &self.stdout
    }

    #[must_use]
    pub fn stderr(&self) -> &str {
        &self.stderr
    }

    /// Wall-clock time from spawn to exit
    #[must_use]
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Exit code 0 and no signal
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0) && self.signal.is_none()
    }

    /// Non-zero exit code or killed by a signal
    #[must_use]
    pub fn failed(&self) -> bool {
        !self.succeeded()
    }

    /// Decode stdout as JSON
    ///
    /// # Errors
    /// Returns `ParsingError` if stdout is not valid JSON for `T`
    pub fn stdout_json<T: DeserializeOwned>(&self) -> Result<T, ParsingError> {
        parse_json(&self.stdout())
    }

    /// Dump everything at debug level
    pub fn log_debug(&self) {
        debug!(
            process = %self,
            stdout = %self.stdout(),
            stderr = %self.stderr,
            duration = ?self.duration,
            "process exited"
        );
    }

    pub(crate) fn log_failure(&self) {
        error!(
            process = %self,
            stdout = %self.stdout(),
            stderr = %self.stderr,
            "process failed"
        );
    }
}

impl fmt::Display for ExitedProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ExitedProcess({}, {})", self.host, self.command)?;
        match (&self.exit_code, &self.signal) {
            (Some(code), _) => write!(f, " (exited {code})"),
            (None, Some(signal)) => write!(f, " (killed by {signal})"),
            (None, None) => write!(f, " (exit status unknown)"),
        }
    }
}
