//! Host session layer
//!
//! A [`Session`] is the transport a `Server` owns: it can probe the host and spawn an
//! argument vector, handing back a [`SessionChild`] that streams bytes in and events out.

pub mod local;
pub mod ssh;

use std::fmt;
use std::pin::Pin;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWrite;

use crate::error::ProcessError;

/// What a session is asked to run, after privilege handling
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Invocation {
    /// Full argument vector, escalation prefix included
    pub argv: Vec<String>,
    /// Working directory
    pub directory: Option<String>,
    /// Environment additions
    pub environ: Vec<(String, String)>,
    /// Allocate a pseudo-terminal
    pub pty: bool,
}

impl Invocation {
    #[must_use]
    pub fn new(argv: Vec<String>) -> Self {
        Self {
            argv,
            ..Self::default()
        }
    }

    /// Executable name, for messages
    #[must_use]
    pub fn program(&self) -> &str {
        self.argv.first().map_or("", String::as_str)
    }
}

/// Signals that can be delivered to a running invocation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Signal {
    Hup,
    Int,
    Quit,
    Kill,
    Usr1,
    Usr2,
    #[default]
    Term,
}

impl Signal {
    /// Name without the `SIG` prefix, as SSH reports it
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Signal::Hup => "HUP",
            Signal::Int => "INT",
            Signal::Quit => "QUIT",
            Signal::Kill => "KILL",
            Signal::Usr1 => "USR1",
            Signal::Usr2 => "USR2",
            Signal::Term => "TERM",
        }
    }

    /// POSIX signal number
    #[must_use]
    pub fn number(self) -> i32 {
        match self {
            Signal::Hup => libc::SIGHUP,
            Signal::Int => libc::SIGINT,
            Signal::Quit => libc::SIGQUIT,
            Signal::Kill => libc::SIGKILL,
            Signal::Usr1 => libc::SIGUSR1,
            Signal::Usr2 => libc::SIGUSR2,
            Signal::Term => libc::SIGTERM,
        }
    }

    /// Name for a raw signal number, `SIG<n>` when unknown
    #[must_use]
    pub fn name_of(number: i32) -> String {
        [
            Signal::Hup,
            Signal::Int,
            Signal::Quit,
            Signal::Kill,
            Signal::Usr1,
            Signal::Usr2,
            Signal::Term,
        ]
        .into_iter()
        .find(|s| s.number() == number)
        .map_or_else(|| format!("SIG{number}"), |s| s.name().to_string())
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How an invocation ended
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitStatus {
    /// Exit code, absent when killed by a signal
    pub code: Option<i32>,
    /// Terminating signal name, absent on normal exit
    pub signal: Option<String>,
}

impl ExitStatus {
    #[must_use]
    pub fn code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    #[must_use]
    pub fn signaled(signal: impl Into<String>) -> Self {
        Self {
            code: None,
            signal: Some(signal.into()),
        }
    }

    #[must_use]
    pub fn success(&self) -> bool {
        self.code == Some(0) && self.signal.is_none()
    }
}

/// Output or termination reported by a running invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChildEvent {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    Exited(ExitStatus),
}

/// Standard input of a spawned invocation; shutting it down sends EOF
pub type StdinWriter = Pin<Box<dyn AsyncWrite + Send>>;

/// A spawned invocation as seen by the transport
///
/// `next_event` must be cancel safe: the process pump races it against caller input.
#[async_trait]
pub trait SessionChild: Send {
    /// Next output chunk or the exit status; `None` once the invocation is gone
    async fn next_event(&mut self) -> Option<ChildEvent>;

    /// Hand out standard input; only the first call returns it
    ///
    /// The writer is driven independently of `next_event` so a reader that never
    /// drains its input cannot stall output or signals.
    fn take_stdin(&mut self) -> Option<StdinWriter>;

    /// Deliver a signal
    async fn signal(&mut self, signal: Signal) -> Result<(), ProcessError>;

    /// Tear the invocation down without waiting for it to cooperate
    async fn abort(&mut self);
}

/// Transport to one host
#[async_trait]
pub trait Session: Send + Sync + fmt::Debug {
    /// Open the transport if needed and confirm the host is usable
    async fn probe(&self) -> Result<(), ProcessError>;

    /// Start an invocation
    async fn spawn(&self, invocation: &Invocation) -> Result<Box<dyn SessionChild>, ProcessError>;

    /// Release the transport; the next use reopens it
    async fn close(&self) -> Result<(), ProcessError>;

    /// Whether command lookup failures surface as exit code 127
    fn reports_missing_as_127(&self) -> bool;

    fn session_type(&self) -> &'static str;
}

/// Quote one word for a POSIX shell
#[must_use]
pub fn shell_quote(word: &str) -> String {
    if !word.is_empty()
        && word
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"-_./=:,+@%".contains(&b))
    {
        return word.to_string();
    }
    format!("'{}'", word.replace('\'', "'\"'\"'"))
}

/// Render an invocation as a shell command line
///
/// Used by transports that only accept a string (SSH `exec`).
#[must_use]
pub fn shell_line(invocation: &Invocation) -> String {
    let mut line = String::new();
    if let Some(dir) = &invocation.directory {
        line.push_str("cd ");
        line.push_str(&shell_quote(dir));
        line.push_str(" && ");
    }
    line.push_str("exec ");
    if !invocation.environ.is_empty() {
        line.push_str("env ");
        for (key, value) in &invocation.environ {
            line.push_str(&shell_quote(&format!("{key}={value}")));
            line.push(' ');
        }
    }
    let words: Vec<String> = invocation.argv.iter().map(|w| shell_quote(w)).collect();
    line.push_str(&words.join(" "));
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("ls"), "ls");
        assert_eq!(shell_quote("/usr/bin/env"), "/usr/bin/env");
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), "'it'\"'\"'s'");
        assert_eq!(shell_quote("$HOME"), "'$HOME'");
    }

    #[test]
    fn test_shell_line() {
        let invocation = Invocation {
            argv: vec!["echo".into(), "hello world".into()],
            directory: Some("/srv/data".into()),
            environ: vec![("LANG".into(), "C".into())],
            pty: false,
        };
        assert_eq!(
            shell_line(&invocation),
            "cd /srv/data && exec env LANG=C echo 'hello world'"
        );
        assert_eq!(
            shell_line(&Invocation::new(vec!["true".into()])),
            "exec true"
        );
    }

    #[test]
    fn test_signal_names() {
        assert_eq!(Signal::default(), Signal::Term);
        assert_eq!(Signal::Kill.to_string(), "KILL");
        assert_eq!(Signal::name_of(libc::SIGTERM), "TERM");
        assert_eq!(Signal::name_of(64), "SIG64");
    }

    #[test]
    fn test_exit_status_success() {
        assert!(ExitStatus::code(0).success());
        assert!(!ExitStatus::code(3).success());
        assert!(!ExitStatus::signaled("TERM").success());
    }
}
