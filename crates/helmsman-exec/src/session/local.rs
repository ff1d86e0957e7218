//! Local execution using `tokio::process`

use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tracing::{debug, instrument, warn};

use crate::error::ProcessError;
use crate::session::{
    ChildEvent, ExitStatus, Invocation, Session, SessionChild, Signal, StdinWriter,
};

const READ_CHUNK: usize = 8192;

/// Session for the machine we are running on
///
/// Argument vectors are executed directly, never through a shell.
#[derive(Debug, Clone, Default)]
pub struct LocalSession;

impl LocalSession {
    /// Create a new local session
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Session for LocalSession {
    async fn probe(&self) -> Result<(), ProcessError> {
        Ok(())
    }

    #[instrument(skip(self, invocation), fields(program = %invocation.program()), level = "debug")]
    async fn spawn(&self, invocation: &Invocation) -> Result<Box<dyn SessionChild>, ProcessError> {
        let (program, args) = invocation
            .argv
            .split_first()
            .ok_or_else(|| ProcessError::failed("empty argv"))?;

        if invocation.pty {
            return Err(ProcessError::failed(format!(
                "{program}: pty is not supported for local sessions"
            )));
        }

        let mut command = Command::new(program);
        command
            .args(args)
            .envs(invocation.environ.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &invocation.directory {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => ProcessError::not_found(format!("{program}: {e}")),
            _ => ProcessError::failed(format!("{program}: failed to spawn process: {e}")),
        })?;

        debug!(pid = ?child.id(), "spawned local process");

        let (tx, events) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            forward(stdout, tx.clone(), ChildEvent::Stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            forward(stderr, tx, ChildEvent::Stderr);
        }
        let stdin = child.stdin.take();

        Ok(Box::new(LocalChild {
            child,
            stdin,
            events,
            exited: false,
            aborted: false,
        }))
    }

    async fn close(&self) -> Result<(), ProcessError> {
        Ok(())
    }

    fn reports_missing_as_127(&self) -> bool {
        false
    }

    fn session_type(&self) -> &'static str {
        "local"
    }
}

/// Copy a pipe into the event channel until EOF
fn forward<R>(mut reader: R, tx: mpsc::UnboundedSender<ChildEvent>, wrap: fn(Vec<u8>) -> ChildEvent)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if tx.send(wrap(buf[..n].to_vec())).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "failed to read process output");
                    break;
                }
            }
        }
    });
}

/// A running local process
struct LocalChild {
    child: Child,
    stdin: Option<ChildStdin>,
    /// Closes once both output pipes reach EOF
    events: mpsc::UnboundedReceiver<ChildEvent>,
    exited: bool,
    /// Set by `abort`; orphaned grandchildren may hold the pipes open forever
    aborted: bool,
}

#[async_trait]
impl SessionChild for LocalChild {
    async fn next_event(&mut self) -> Option<ChildEvent> {
        if self.aborted {
            if let Ok(event) = self.events.try_recv() {
                return Some(event);
            }
        } else if let Some(event) = self.events.recv().await {
            return Some(event);
        }
        if self.exited {
            return None;
        }
        let status = self.child.wait().await;
        self.exited = true;
        match status {
            Ok(status) => {
                let status = match (status.code(), status.signal()) {
                    (Some(code), _) => ExitStatus::code(code),
                    (None, Some(signal)) => ExitStatus::signaled(Signal::name_of(signal)),
                    (None, None) => ExitStatus::default(),
                };
                Some(ChildEvent::Exited(status))
            }
            Err(e) => {
                warn!(error = %e, "failed to wait for local process");
                None
            }
        }
    }

    fn take_stdin(&mut self) -> Option<StdinWriter> {
        self.stdin.take().map(|stdin| Box::pin(stdin) as StdinWriter)
    }

    async fn signal(&mut self, signal: Signal) -> Result<(), ProcessError> {
        if signal == Signal::Kill {
            return self
                .child
                .start_kill()
                .or_else(|e| match e.kind() {
                    io::ErrorKind::InvalidInput => Ok(()),
                    _ => Err(e),
                })
                .map_err(|e| ProcessError::failed(format!("failed to kill process: {e}")));
        }

        let Some(pid) = self.child.id() else {
            // already reaped
            return Ok(());
        };
        let pid = libc::pid_t::try_from(pid)
            .map_err(|_| ProcessError::failed(format!("pid {pid} out of range")))?;

        // SAFETY: kill(2) has no memory-safety preconditions
        let rc = unsafe { libc::kill(pid, signal.number()) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ESRCH) {
                return Err(ProcessError::failed(format!(
                    "failed to send {signal} to {pid}: {err}"
                )));
            }
        }
        Ok(())
    }

    async fn abort(&mut self) {
        self.stdin = None;
        self.aborted = true;
        if let Err(e) = self.child.start_kill() {
            debug!(error = %e, "abort on finished process");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn collect(mut child: Box<dyn SessionChild>) -> (Vec<u8>, Vec<u8>, Option<ExitStatus>) {
        let (mut out, mut err, mut status) = (Vec::new(), Vec::new(), None);
        while let Some(event) = child.next_event().await {
            match event {
                ChildEvent::Stdout(d) => out.extend(d),
                ChildEvent::Stderr(d) => err.extend(d),
                ChildEvent::Exited(s) => status = Some(s),
            }
        }
        (out, err, status)
    }

    #[tokio::test]
    async fn test_spawn_echo() {
        let session = LocalSession::new();
        let child = session
            .spawn(&Invocation::new(vec!["echo".into(), "hello".into()]))
            .await
            .unwrap();
        let (out, _, status) = collect(child).await;
        assert_eq!(out, b"hello\n");
        assert_eq!(status, Some(ExitStatus::code(0)));
    }

    #[tokio::test]
    async fn test_spawn_missing_binary() {
        let session = LocalSession::new();
        let result = session
            .spawn(&Invocation::new(vec!["/nonexistent/helmsman-test".into()]))
            .await;
        assert!(matches!(result, Err(ProcessError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_directory_and_environ() {
        let session = LocalSession::new();
        let invocation = Invocation {
            argv: vec!["sh".into(), "-c".into(), "pwd; echo $GREETING >&2".into()],
            directory: Some("/".into()),
            environ: vec![("GREETING".into(), "hi".into())],
            pty: false,
        };
        let child = session.spawn(&invocation).await.unwrap();
        let (out, err, status) = collect(child).await;
        assert_eq!(out, b"/\n");
        assert_eq!(err, b"hi\n");
        assert_eq!(status, Some(ExitStatus::code(0)));
    }

    #[tokio::test]
    async fn test_pty_rejected() {
        let session = LocalSession::new();
        let invocation = Invocation {
            pty: true,
            ..Invocation::new(vec!["true".into()])
        };
        assert!(matches!(
            session.spawn(&invocation).await,
            Err(ProcessError::Failed { .. })
        ));
    }

    #[tokio::test]
    async fn test_signal_reported_by_name() {
        let session = LocalSession::new();
        let mut child = session
            .spawn(&Invocation::new(vec!["sleep".into(), "30".into()]))
            .await
            .unwrap();
        child.signal(Signal::Term).await.unwrap();
        let (_, _, status) = collect(child).await;
        assert_eq!(status, Some(ExitStatus::signaled("TERM")));
    }

    #[tokio::test]
    async fn test_stdin_taken_once() {
        use tokio::io::AsyncWriteExt;

        let session = LocalSession::new();
        let mut child = session
            .spawn(&Invocation::new(vec!["cat".into()]))
            .await
            .unwrap();
        let mut stdin = child.take_stdin().unwrap();
        assert!(child.take_stdin().is_none());

        stdin.write_all(b"piped").await.unwrap();
        stdin.shutdown().await.unwrap();
        drop(stdin);

        let (out, _, status) = collect(child).await;
        assert_eq!(out, b"piped");
        assert_eq!(status, Some(ExitStatus::code(0)));
    }
}
