//! Handle to one command invocation
//!
//! A [`Process`] starts out `Created`, becomes `Running` once the session has spawned
//! it, and ends in exactly one of `Succeeded`, `Failed` or `Killed`. A background pump
//! task owns the session child: it collects output, delivers signals and reports the
//! exit status back through a oneshot channel. Input goes through a separate writer
//! task so a child that never reads cannot hold up a kill.

use std::future::IntoFuture;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, instrument, warn};

use crate::command::Command;
use crate::error::{ProcessError, ValueError};
use crate::exited::ExitedProcess;
use crate::server::Server;
use crate::session::{ChildEvent, ExitStatus, Invocation, SessionChild, Signal, StdinWriter};

/// How long a signalled process may take before it is torn down
const KILL_GRACE: Duration = Duration::from_secs(3);

/// Lifecycle of a [`Process`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    /// Not spawned yet; input is queued
    Created,
    /// Spawned; input is delivered and output collected
    Running,
    /// Exited with code 0
    Succeeded,
    /// Exited non-zero, died by signal, or never started
    Failed,
    /// Ended by [`Process::kill`]
    Killed,
}

impl ProcessState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ProcessState::Succeeded | ProcessState::Failed | ProcessState::Killed
        )
    }

    fn can_advance_to(self, next: ProcessState) -> bool {
        match self {
            ProcessState::Created => next != ProcessState::Created,
            ProcessState::Running => next.is_terminal(),
            _ => false,
        }
    }
}

/// Whether a non-zero exit is an error
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExitPolicy {
    /// Non-zero exit or signal resolves `wait` with an error
    #[default]
    FailOnNonZero,
    /// Every exit resolves `wait` with an [`ExitedProcess`]
    AllowFailure,
}

/// Shared, monotonic state cell
#[derive(Debug, Clone)]
struct Lifecycle(Arc<watch::Sender<ProcessState>>);

impl Lifecycle {
    fn new() -> Self {
        Self(Arc::new(watch::Sender::new(ProcessState::Created)))
    }

    fn current(&self) -> ProcessState {
        *self.0.borrow()
    }

    /// Move to `next` if allowed; terminal states never change
    fn advance(&self, next: ProcessState) -> bool {
        self.0.send_if_modified(|state| {
            let allowed = state.can_advance_to(next);
            if allowed {
                *state = next;
            }
            allowed
        })
    }

    fn subscribe(&self) -> watch::Receiver<ProcessState> {
        self.0.subscribe()
    }
}

/// Messages from the handle to the pump, delivered in order
#[derive(Debug)]
enum Control {
    Input(Vec<u8>),
    CloseStdin,
    Signal(Signal),
    Forward(mpsc::UnboundedSender<Vec<u8>>),
}

/// What the pump hands back
#[derive(Debug, Clone)]
struct Finished {
    status: ExitStatus,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    duration: Duration,
}

#[derive(Debug)]
enum Completion {
    NotStarted,
    Pending(oneshot::Receiver<Result<Finished, ProcessError>>),
    Done(Result<Finished, ProcessError>),
}

/// Cloneable handle that can kill a process from another task
#[derive(Debug, Clone)]
pub struct Killer {
    control: mpsc::UnboundedSender<Control>,
    lifecycle: Lifecycle,
}

impl Killer {
    /// Send `signal` and mark the process `Killed`
    ///
    /// No-op once the process has succeeded or failed on its own.
    pub fn kill(&self, signal: Signal) {
        if !self.lifecycle.advance(ProcessState::Killed)
            && self.lifecycle.current() != ProcessState::Killed
        {
            return;
        }
        debug!(%signal, "killing process");
        // the pump may already be gone; then there is nothing left to signal
        let _ = self.control.send(Control::Signal(signal));
    }
}

/// A live or finished command invocation
///
/// Obtained from [`Server::execute`] (already running) or [`Server::prepare`]
/// (`Created`, started with [`Process::start`]). Awaiting a `Process` closes stdin and
/// waits for it. Dropping a process that has not finished kills it.
#[derive(Debug)]
pub struct Process {
    server: Server,
    command: Command,
    lifecycle: Lifecycle,
    control: mpsc::UnboundedSender<Control>,
    /// Handed to the pump on start
    queued: Option<mpsc::UnboundedReceiver<Control>>,
    stdin_closed: bool,
    escalated: bool,
    policy: ExitPolicy,
    completion: Completion,
}

impl Process {
    pub(crate) fn new(server: Server, command: Command) -> Self {
        let (control, queued) = mpsc::unbounded_channel();
        Self {
            server,
            command,
            lifecycle: Lifecycle::new(),
            control,
            queued: Some(queued),
            stdin_closed: false,
            escalated: false,
            policy: ExitPolicy::default(),
            completion: Completion::NotStarted,
        }
    }

    #[must_use]
    pub fn command(&self) -> &Command {
        &self.command
    }

    #[must_use]
    pub fn server(&self) -> &Server {
        &self.server
    }

    /// Name used in diagnostics
    #[must_use]
    pub fn name(&self) -> &str {
        self.command.name()
    }

    #[must_use]
    pub fn state(&self) -> ProcessState {
        self.lifecycle.current()
    }

    /// Observe state transitions from another task
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ProcessState> {
        self.lifecycle.subscribe()
    }

    /// `"<host>: <name>: <message>"`, without doubling an existing name prefix
    #[must_use]
    pub fn prefix_message(&self, message: &str) -> String {
        let name_prefix = format!("{}: ", self.name());
        let message = message.strip_prefix(&name_prefix).unwrap_or(message);
        format!("{}: {name_prefix}{message}", self.server.host())
    }

    /// Treat non-zero exits as ordinary results
    pub fn allow_failure(&mut self) -> &mut Self {
        self.policy = ExitPolicy::AllowFailure;
        self
    }

    pub fn set_exit_policy(&mut self, policy: ExitPolicy) -> &mut Self {
        self.policy = policy;
        self
    }

    /// Spawn a `Created` process
    ///
    /// Runs the server's accessibility and privilege checks first. Input queued before
    /// this call is delivered once the invocation is up. A process killed before start
    /// is never spawned.
    ///
    /// # Errors
    /// Returns the spawn-time failure (`UnknownHost`, `NotFound`, `Failed`); the process
    /// is then `Failed` and `wait` returns the same error.
    #[instrument(skip(self), fields(host = %self.server.host(), command = %self.name()))]
    pub async fn start(&mut self) -> Result<&mut Self, ProcessError> {
        match self.lifecycle.current() {
            ProcessState::Created => {}
            ProcessState::Killed if self.queued.is_some() => {
                self.finish_unspawned();
                return Ok(self);
            }
            _ => {
                return Err(ProcessError::failed(
                    self.prefix_message("process already started"),
                ));
            }
        }

        match self.server.plan(&self.command).await {
            Ok((invocation, escalated)) => {
                self.launch(invocation, escalated).await?;
                Ok(self)
            }
            Err(e) => Err(self.fail_start(e)),
        }
    }

    /// Spawn `invocation` as-is and start the pump
    pub(crate) async fn launch(
        &mut self,
        invocation: Invocation,
        escalated: bool,
    ) -> Result<(), ProcessError> {
        let child = match self.server.session().spawn(&invocation).await {
            Ok(child) => child,
            Err(e) => return Err(self.fail_start(e)),
        };
        let Some(queued) = self.queued.take() else {
            return Err(ProcessError::failed(
                self.prefix_message("process already started"),
            ));
        };

        // a kill that raced the spawn stays queued for the pump
        self.lifecycle.advance(ProcessState::Running);
        self.escalated = escalated;

        let (done_tx, done_rx) = oneshot::channel();
        tokio::spawn(pump(child, queued, self.lifecycle.clone(), done_tx));
        self.completion = Completion::Pending(done_rx);

        debug!(argv = ?invocation.argv, escalated, "process running");
        Ok(())
    }

    /// Add host and command to messages the transport left bare
    fn prefixed(&self, e: ProcessError) -> ProcessError {
        match e {
            ProcessError::NotFound { message } => {
                ProcessError::not_found(self.prefix_message(&message))
            }
            ProcessError::Failed { message } => ProcessError::failed(self.prefix_message(&message)),
            other => other,
        }
    }

    fn fail_start(&mut self, e: ProcessError) -> ProcessError {
        let e = self.prefixed(e);
        warn!(error = %e, "failed to start process");
        self.lifecycle.advance(ProcessState::Failed);
        self.queued = None;
        self.completion = Completion::Done(Err(e.clone()));
        e
    }

    fn finish_unspawned(&mut self) {
        let signal = self
            .queued
            .take()
            .as_mut()
            .and_then(pending_signal)
            .unwrap_or_default();
        self.completion = Completion::Done(Ok(Finished {
            status: ExitStatus::signaled(signal.name()),
            stdout: Vec::new(),
            stderr: Vec::new(),
            duration: Duration::ZERO,
        }));
    }

    /// Append to standard input
    ///
    /// Writes are delivered in call order.
    ///
    /// # Errors
    /// Returns `ValueError` once stdin is closed or the process has terminated
    pub fn input(&mut self, data: impl AsRef<[u8]>) -> Result<&mut Self, ValueError> {
        if self.stdin_closed {
            return Err(ValueError::new(self.prefix_message("stdin already closed")));
        }
        if self.lifecycle.current().is_terminal() {
            return Err(ValueError::new(
                self.prefix_message("process has already terminated"),
            ));
        }
        self.control
            .send(Control::Input(data.as_ref().to_vec()))
            .map_err(|_| ValueError::new(self.prefix_message("process has already terminated")))?;
        Ok(self)
    }

    /// Owned form of [`Process::input`] for chaining
    ///
    /// # Errors
    /// Returns `ValueError` once stdin is closed or the process has terminated
    pub fn with_input(mut self, data: impl AsRef<[u8]>) -> Result<Self, ValueError> {
        self.input(data)?;
        Ok(self)
    }

    /// Signal end of input; idempotent
    pub fn close_stdin(&mut self) -> &mut Self {
        if !self.stdin_closed {
            self.stdin_closed = true;
            let _ = self.control.send(Control::CloseStdin);
        }
        self
    }

    /// Forward stdout chunks to the returned receiver instead of capturing them
    ///
    /// # Errors
    /// Returns `ValueError` if the process has terminated
    pub fn stream(&mut self) -> Result<mpsc::UnboundedReceiver<Vec<u8>>, ValueError> {
        if self.lifecycle.current().is_terminal() {
            return Err(ValueError::new(
                self.prefix_message("process has already terminated"),
            ));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.control
            .send(Control::Forward(tx))
            .map_err(|_| ValueError::new(self.prefix_message("process has already terminated")))?;
        Ok(rx)
    }

    /// Handle for killing this process from elsewhere
    #[must_use]
    pub fn killer(&self) -> Killer {
        Killer {
            control: self.control.clone(),
            lifecycle: self.lifecycle.clone(),
        }
    }

    /// Send `signal`, moving to `Killed`
    ///
    /// A pending `wait` resolves promptly; a process that ignores the signal is torn
    /// down after a grace period.
    pub fn kill(&self, signal: Signal) {
        self.killer().kill(signal);
    }

    /// `kill(Signal::Term)`
    pub fn terminate(&self) {
        self.kill(Signal::Term);
    }

    /// Wait for the process to end
    ///
    /// Cancel safe: dropping the future leaves the process waitable again. Repeated
    /// calls return the same outcome.
    ///
    /// # Errors
    /// Returns the spawn or runtime failure, `NotFound` when the executable was
    /// missing, or, under [`ExitPolicy::FailOnNonZero`], `NonZeroExit` for a non-zero
    /// exit and `Failed` for a signal
    pub async fn wait(&mut self) -> Result<ExitedProcess, ProcessError> {
        if let Completion::Pending(rx) = &mut self.completion {
            let raw = rx.await.unwrap_or_else(|_| {
                Err(ProcessError::failed(
                    "process pump ended without reporting a result",
                ))
            });
            let raw = raw.map_err(|e| self.prefixed(e));
            self.completion = Completion::Done(raw);
        }
        match &self.completion {
            Completion::Done(raw) => self.classify(raw.clone()),
            _ => Err(ProcessError::failed(
                self.prefix_message("process never started"),
            )),
        }
    }

    /// Close stdin, wait, and return stdout as text
    ///
    /// # Errors
    /// Same as [`Process::wait`]
    pub async fn output(&mut self) -> Result<String, ProcessError> {
        self.close_stdin();
        let exited = self.wait().await?;
        Ok(exited.stdout().into_owned())
    }

    fn classify(&self, raw: Result<Finished, ProcessError>) -> Result<ExitedProcess, ProcessError> {
        let finished = raw?;

        let exited = ExitedProcess::new(
            self.server.host(),
            self.command.clone(),
            finished.status,
            finished.stdout,
            String::from_utf8_lossy(&finished.stderr).into_owned(),
            finished.duration,
        );
        exited.log_debug();

        if self.missing_executable(&exited) {
            return Err(ProcessError::not_found(
                self.prefix_message(exited.stderr().trim()),
            ));
        }

        if self.policy == ExitPolicy::FailOnNonZero && exited.failed() {
            exited.log_failure();
            return Err(match (exited.exit_code(), exited.signal()) {
                (Some(code), _) => {
                    let stderr = exited.stderr().trim();
                    let message = if stderr.is_empty() {
                        format!("exited with code {code}")
                    } else {
                        format!("{stderr} ({code})")
                    };
                    ProcessError::NonZeroExit {
                        message: self.prefix_message(&message),
                        exit_code: code,
                    }
                }
                (None, signal) => ProcessError::failed(self.prefix_message(&format!(
                    "terminated by signal ({})",
                    signal.unwrap_or("unknown")
                ))),
            });
        }

        Ok(exited)
    }

    fn missing_executable(&self, exited: &ExitedProcess) -> bool {
        match exited.exit_code() {
            Some(127) => self.server.session().reports_missing_as_127(),
            Some(1) if self.escalated => exited
                .stderr()
                .lines()
                .any(|l| l.starts_with("sudo: ") && l.ends_with("command not found")),
            _ => false,
        }
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        if self.queued.is_none() && !self.lifecycle.current().is_terminal() {
            debug!(command = %self.name(), "dropping running process");
            self.kill(Signal::Kill);
        }
    }
}

impl IntoFuture for Process {
    type Output = Result<ExitedProcess, ProcessError>;
    type IntoFuture = BoxFuture<'static, Self::Output>;

    /// Close stdin, then wait
    fn into_future(mut self) -> Self::IntoFuture {
        Box::pin(async move {
            self.close_stdin();
            self.wait().await
        })
    }
}

enum Step {
    Event(Option<ChildEvent>),
    Control(Option<Control>),
    Force,
}

/// Copy queued input into the child's stdin; closing `input` sends EOF
fn spawn_stdin_writer(
    mut stdin: StdinWriter,
    mut input: mpsc::UnboundedReceiver<Vec<u8>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(data) = input.recv().await {
            match stdin.write_all(&data).await {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                    // the process stopped reading; whatever it produced is still collected
                    debug!("stdin closed by process");
                    return;
                }
                Err(e) => {
                    warn!(error = %e, "dropping input");
                    return;
                }
            }
        }
        if let Err(e) = stdin.shutdown().await {
            debug!(error = %e, "failed to close stdin");
        }
    })
}

/// Last signal still waiting in the control queue
fn pending_signal(control: &mut mpsc::UnboundedReceiver<Control>) -> Option<Signal> {
    let mut signal = None;
    while let Ok(message) = control.try_recv() {
        if let Control::Signal(s) = message {
            signal = Some(s);
        }
    }
    signal
}

/// Collect output and deliver control messages until the session child exits
async fn pump(
    mut child: Box<dyn SessionChild>,
    mut control: mpsc::UnboundedReceiver<Control>,
    lifecycle: Lifecycle,
    done: oneshot::Sender<Result<Finished, ProcessError>>,
) {
    let started = Instant::now();
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut forward: Option<mpsc::UnboundedSender<Vec<u8>>> = None;
    let mut control_open = true;
    let mut killed_with: Option<Signal> = None;
    let mut force_at: Option<Instant> = None;

    let (mut stdin, writer) = match child.take_stdin() {
        Some(pipe) => {
            let (tx, rx) = mpsc::unbounded_channel();
            (Some(tx), Some(spawn_stdin_writer(pipe, rx)))
        }
        None => (None, None),
    };

    let outcome = loop {
        // queued control messages go first so input and stream switches precede output
        let step = tokio::select! {
            biased;
            message = control.recv(), if control_open => Step::Control(message),
            () = sleep_until(force_at.unwrap_or_else(Instant::now)), if force_at.is_some() => Step::Force,
            event = child.next_event() => Step::Event(event),
        };

        match step {
            Step::Event(Some(ChildEvent::Stdout(data))) => match &forward {
                Some(tx) => {
                    if let Err(mpsc::error::SendError(data)) = tx.send(data) {
                        // receiver gone, fall back to capturing
                        forward = None;
                        stdout.extend(data);
                    }
                }
                None => stdout.extend(data),
            },
            Step::Event(Some(ChildEvent::Stderr(data))) => stderr.extend(data),
            Step::Event(Some(ChildEvent::Exited(status))) => break Ok(status),
            Step::Event(None) => {
                break match killed_with {
                    Some(signal) => Ok(ExitStatus::signaled(signal.name())),
                    None => Err(ProcessError::failed(
                        "connection lost before exit status was reported",
                    )),
                };
            }
            Step::Control(Some(Control::Input(data))) => {
                if let Some(tx) = &stdin
                    && tx.send(data).is_err()
                {
                    debug!("stdin writer gone, dropping input");
                    stdin = None;
                }
            }
            Step::Control(Some(Control::CloseStdin)) => stdin = None,
            Step::Control(Some(Control::Signal(signal))) => {
                killed_with = Some(signal);
                if let Err(e) = child.signal(signal).await {
                    warn!(error = %e, %signal, "failed to signal process");
                }
                force_at.get_or_insert_with(|| Instant::now() + KILL_GRACE);
            }
            Step::Control(Some(Control::Forward(tx))) => forward = Some(tx),
            Step::Control(None) => {
                control_open = false;
                stdin = None;
            }
            Step::Force => {
                force_at = None;
                warn!("process ignored signal, tearing it down");
                if let Some(writer) = &writer {
                    writer.abort();
                }
                child.abort().await;
            }
        }
    };

    if let Some(writer) = writer {
        writer.abort();
    }

    let mut finished = outcome.map(|status| Finished {
        status,
        stdout,
        stderr,
        duration: started.elapsed(),
    });

    let terminal = match &finished {
        Ok(f) if f.status.success() => ProcessState::Succeeded,
        _ => ProcessState::Failed,
    };
    // no-op when already Killed
    lifecycle.advance(terminal);

    // a kill that lands between the exit and the line above still wins
    if lifecycle.current() == ProcessState::Killed
        && let Ok(f) = &mut finished
        && f.status.success()
    {
        let signal = killed_with
            .or_else(|| pending_signal(&mut control))
            .unwrap_or_default();
        f.status = ExitStatus::signaled(signal.name());
    }

    let _ = done.send(finished);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_transitions() {
        let lifecycle = Lifecycle::new();
        assert!(!lifecycle.advance(ProcessState::Created));
        assert!(lifecycle.advance(ProcessState::Running));
        assert!(!lifecycle.advance(ProcessState::Created));
        assert!(lifecycle.advance(ProcessState::Killed));
        assert!(!lifecycle.advance(ProcessState::Succeeded));
        assert_eq!(lifecycle.current(), ProcessState::Killed);
    }

    #[test]
    fn test_created_may_fail_directly() {
        let lifecycle = Lifecycle::new();
        assert!(lifecycle.advance(ProcessState::Failed));
        assert!(!lifecycle.advance(ProcessState::Running));
    }

    #[test]
    fn test_terminal_states() {
        assert!(!ProcessState::Created.is_terminal());
        assert!(!ProcessState::Running.is_terminal());
        assert!(ProcessState::Succeeded.is_terminal());
        assert!(ProcessState::Failed.is_terminal());
        assert!(ProcessState::Killed.is_terminal());
    }

    #[tokio::test]
    async fn test_prefix_message() {
        let server = Server::localhost();
        let command = Command::new(["zpool", "list"], Default::default()).unwrap();
        let process = Process::new(server, command);
        assert_eq!(process.prefix_message("oops"), "localhost: zpool: oops");
        assert_eq!(process.prefix_message("zpool: oops"), "localhost: zpool: oops");
    }

    #[tokio::test]
    async fn test_wait_before_start() {
        let command = Command::new(["true"], Default::default()).unwrap();
        let mut process = Process::new(Server::localhost(), command);
        let result = process.wait().await;
        assert!(matches!(result, Err(ProcessError::Failed { message }) if message.ends_with("process never started")));
    }

    /// Child that has already exited by the time the pump looks at it
    struct AlreadyExited(Option<ExitStatus>);

    #[async_trait::async_trait]
    impl SessionChild for AlreadyExited {
        async fn next_event(&mut self) -> Option<ChildEvent> {
            self.0.take().map(ChildEvent::Exited)
        }

        fn take_stdin(&mut self) -> Option<StdinWriter> {
            None
        }

        async fn signal(&mut self, _signal: Signal) -> Result<(), ProcessError> {
            Ok(())
        }

        async fn abort(&mut self) {}
    }

    fn running() -> (Lifecycle, Killer, mpsc::UnboundedReceiver<Control>) {
        let lifecycle = Lifecycle::new();
        lifecycle.advance(ProcessState::Running);
        let (control, queued) = mpsc::unbounded_channel();
        let killer = Killer {
            control,
            lifecycle: lifecycle.clone(),
        };
        (lifecycle, killer, queued)
    }

    #[tokio::test]
    async fn test_kill_racing_clean_exit_is_reported_as_kill() {
        let (lifecycle, killer, queued) = running();
        killer.kill(Signal::Kill);

        let (done, result) = oneshot::channel();
        let child = Box::new(AlreadyExited(Some(ExitStatus::code(0))));
        pump(child, queued, lifecycle.clone(), done).await;

        let finished = result.await.unwrap().unwrap();
        assert_eq!(lifecycle.current(), ProcessState::Killed);
        assert_eq!(finished.status, ExitStatus::signaled("KILL"));
    }

    #[tokio::test]
    async fn test_kill_after_clean_exit_is_ignored() {
        let (lifecycle, killer, queued) = running();

        let (done, result) = oneshot::channel();
        let child = Box::new(AlreadyExited(Some(ExitStatus::code(0))));
        pump(child, queued, lifecycle.clone(), done).await;
        killer.kill(Signal::Term);

        let finished = result.await.unwrap().unwrap();
        assert_eq!(lifecycle.current(), ProcessState::Succeeded);
        assert_eq!(finished.status, ExitStatus::code(0));
    }

    #[tokio::test]
    async fn test_killed_process_never_waits_successfully() {
        let command = Command::new(["true"], Default::default()).unwrap();
        let mut process = Process::new(Server::localhost(), command);
        let (lifecycle, _killer, queued) = running();
        process.lifecycle = lifecycle.clone();
        process.queued = None;

        // state flipped to Killed before the signal reached the queue
        lifecycle.advance(ProcessState::Killed);
        let (done, result) = oneshot::channel();
        let child = Box::new(AlreadyExited(Some(ExitStatus::code(0))));
        pump(child, queued, lifecycle, done).await;
        process.completion = Completion::Pending(result);

        let err = process.wait().await.unwrap_err();
        assert!(matches!(&err, ProcessError::Failed { message } if message.ends_with("terminated by signal (TERM)")));
        assert_eq!(process.state(), ProcessState::Killed);
    }
}
