//! A host that commands run on

use std::fmt;
use std::sync::Arc;

use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, instrument, warn};

use crate::command::{Command, CommandOptions, Superuser};
use crate::error::{Error, ParsingError, ProcessError};
use crate::exited::ExitedProcess;
use crate::process::{ExitPolicy, Process};
use crate::session::local::LocalSession;
use crate::session::ssh::{SshConfig, SshSession};
use crate::session::{Invocation, Session};

const LOCALHOST: &str = "localhost";

/// What privilege escalation is possible on a host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Privilege {
    /// Already running as uid 0
    Root,
    /// Non-interactive `sudo -n` works
    Sudo,
    /// Neither
    Unavailable,
}

#[derive(Debug)]
struct ServerInner {
    host: String,
    session: Arc<dyn Session>,
    /// Only a successful probe is remembered
    accessible: Mutex<bool>,
    privilege: OnceCell<Privilege>,
    hostname: Mutex<Option<String>>,
    ip_address: Mutex<Option<String>>,
}

/// Handle to one host and its session
///
/// Cheap to clone; clones share the session and every cached probe result.
#[derive(Debug, Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    /// Server backed by an arbitrary session
    pub fn new(host: impl Into<String>, session: Arc<dyn Session>) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                host: host.into(),
                session,
                accessible: Mutex::new(false),
                privilege: OnceCell::new(),
                hostname: Mutex::new(None),
                ip_address: Mutex::new(None),
            }),
        }
    }

    /// The machine we are running on
    #[must_use]
    pub fn localhost() -> Self {
        Self::new(LOCALHOST, Arc::new(LocalSession::new()))
    }

    /// Remote host reached over SSH
    #[must_use]
    pub fn ssh(config: SshConfig) -> Self {
        let host = config.host.clone();
        Self::new(host, Arc::new(SshSession::new(config)))
    }

    /// Local session for `"localhost"`, SSH with `template` settings otherwise
    #[must_use]
    pub fn connect(host: &str, template: &SshConfig) -> Self {
        if host == LOCALHOST {
            return Self::localhost();
        }
        Self::ssh(SshConfig {
            host: host.to_string(),
            ..template.clone()
        })
    }

    #[must_use]
    pub fn host(&self) -> &str {
        &self.inner.host
    }

    pub(crate) fn session(&self) -> &Arc<dyn Session> {
        &self.inner.session
    }

    /// Transport kind, `"local"` or `"ssh"`
    #[must_use]
    pub fn session_type(&self) -> &'static str {
        self.inner.session.session_type()
    }

    /// Check that the host can run commands
    ///
    /// Probes once; after the first success the answer is remembered. Failures are not
    /// cached, so a later call probes again.
    ///
    /// # Errors
    /// `UnknownHost`, `AuthenticationFailed` or `Failed` from the probe
    pub async fn is_accessible(&self) -> Result<(), ProcessError> {
        let mut accessible = self.inner.accessible.lock().await;
        if *accessible {
            return Ok(());
        }
        self.probe().await?;
        *accessible = true;
        Ok(())
    }

    /// Probe the host again, ignoring any remembered answer
    ///
    /// # Errors
    /// Same as [`Server::is_accessible`]
    pub async fn recheck_accessible(&self) -> Result<(), ProcessError> {
        let mut accessible = self.inner.accessible.lock().await;
        let result = self.probe().await;
        *accessible = result.is_ok();
        result
    }

    #[instrument(skip(self), fields(host = %self.host()))]
    async fn probe(&self) -> Result<(), ProcessError> {
        self.inner.session.probe().await?;
        let exited = self.run_direct(["true"]).await?;
        if exited.failed() {
            warn!(process = %exited, "accessibility probe failed");
            return Err(ProcessError::failed(format!(
                "{}: accessibility probe failed: {}",
                self.host(),
                exited.stderr().trim()
            )));
        }
        info!(session = self.session_type(), "host accessible");
        Ok(())
    }

    /// Privilege escalation available on this host, probed once
    ///
    /// # Errors
    /// Returns transport failures from the probes; those are not remembered
    pub async fn privilege(&self) -> Result<Privilege, ProcessError> {
        self.inner
            .privilege
            .get_or_try_init(|| async {
                let id = self.run_direct(["id", "-u"]).await?;
                if id.succeeded() && id.stdout().trim() == "0" {
                    return Ok(Privilege::Root);
                }
                let sudo = match self.run_direct(["sudo", "-n", "true"]).await {
                    Ok(exited) => exited.succeeded(),
                    Err(ProcessError::NotFound { .. }) => false,
                    Err(e) => return Err(e),
                };
                let privilege = if sudo {
                    Privilege::Sudo
                } else {
                    Privilege::Unavailable
                };
                debug!(host = %self.host(), ?privilege, "probed privilege escalation");
                Ok(privilege)
            })
            .await
            .copied()
    }

    /// Run a helper invocation without the accessibility gate or escalation
    async fn run_direct<const N: usize>(
        &self,
        argv: [&str; N],
    ) -> Result<ExitedProcess, ProcessError> {
        let command = Command::new(argv, CommandOptions::default())
            .map_err(|e| ProcessError::failed(e.to_string()))?;
        let invocation = Invocation::new(command.argv().to_vec());
        let mut process = Process::new(self.clone(), command);
        process.allow_failure();
        process.launch(invocation, false).await?;
        process.close_stdin();
        process.wait().await
    }

    /// Work out what the session should actually spawn for `command`
    ///
    /// Returns the invocation and whether it goes through `sudo`.
    pub(crate) async fn plan(&self, command: &Command) -> Result<(Invocation, bool), ProcessError> {
        self.is_accessible().await?;

        let options = command.options();
        let mut invocation = Invocation {
            argv: command.argv().to_vec(),
            directory: options.directory.clone(),
            environ: options
                .env_pairs()
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            pty: options.pty,
        };

        let Some(mode) = options.superuser else {
            return Ok((invocation, false));
        };
        match (self.privilege().await?, mode) {
            (Privilege::Root, _) | (Privilege::Unavailable, Superuser::Try) => {
                Ok((invocation, false))
            }
            (Privilege::Unavailable, Superuser::Require) => Err(ProcessError::failed(
                "privilege escalation required but unavailable",
            )),
            (Privilege::Sudo, _) => {
                invocation.argv = escalated_argv(&invocation);
                invocation.environ.clear();
                Ok((invocation, true))
            }
        }
    }

    /// Create a process without starting it
    ///
    /// Input may be queued before [`Process::start`].
    #[must_use]
    pub fn prepare(&self, command: Command) -> Process {
        Process::new(self.clone(), command)
    }

    /// Start `command`
    ///
    /// # Errors
    /// Spawn-time failures: `UnknownHost`, `AuthenticationFailed`, `NotFound`, `Failed`
    #[instrument(skip(self, command), fields(host = %self.host(), command = %command.name()))]
    pub async fn execute(&self, command: Command) -> Result<Process, ProcessError> {
        let mut process = self.prepare(command);
        process.start().await?;
        Ok(process)
    }

    /// Start `command`, close its stdin and wait
    ///
    /// # Errors
    /// Spawn-time failures, or what [`Process::wait`] reports under `policy`
    pub async fn run(
        &self,
        command: Command,
        policy: ExitPolicy,
    ) -> Result<ExitedProcess, ProcessError> {
        let mut process = self.execute(command).await?;
        process.set_exit_policy(policy);
        process.close_stdin();
        process.wait().await
    }

    /// Host name as reported by `hostname`
    ///
    /// # Errors
    /// Process failures, or `ParsingError` if nothing was printed
    pub async fn hostname(&self, cache: bool) -> Result<String, Error> {
        let mut cached = self.inner.hostname.lock().await;
        if cache && let Some(name) = cached.as_ref() {
            return Ok(name.clone());
        }
        let command = Command::new(["hostname"], CommandOptions::default())?;
        let exited = self.run(command, ExitPolicy::FailOnNonZero).await?;
        let name = exited.stdout().trim().to_string();
        if name.is_empty() {
            let message = format!("{}: hostname printed nothing", self.host());
            return Err(ParsingError::new(message).into());
        }
        *cached = Some(name.clone());
        Ok(name)
    }

    /// Source address of the default route
    ///
    /// # Errors
    /// Process failures, or `ParsingError` if `ip route` output has no `src` field
    pub async fn ip_address(&self, cache: bool) -> Result<String, Error> {
        let mut cached = self.inner.ip_address.lock().await;
        if cache && let Some(addr) = cached.as_ref() {
            return Ok(addr.clone());
        }
        let command = Command::new(["ip", "route", "get", "1.1.1.1"], CommandOptions::default())?;
        let exited = self.run(command, ExitPolicy::FailOnNonZero).await?;
        let stdout = exited.stdout();
        let addr = route_source(&stdout).ok_or_else(|| {
            ParsingError::new(format!(
                "{}: no source address in route output: {}",
                self.host(),
                stdout.trim()
            ))
        })?;
        *cached = Some(addr.to_string());
        Ok(addr.to_string())
    }

    /// Release the session; the next command reopens it
    ///
    /// # Errors
    /// Transport failure while closing
    pub async fn disconnect(&self) -> Result<(), ProcessError> {
        *self.inner.accessible.lock().await = false;
        self.inner.session.close().await
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::localhost()
    }
}

impl fmt::Display for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Server({})", self.inner.host)
    }
}

/// Build a server for `host` and make sure it is usable
///
/// # Errors
/// Whatever [`Server::is_accessible`] reports
pub async fn get_server(host: &str, template: &SshConfig) -> Result<Server, ProcessError> {
    let server = Server::connect(host, template);
    server.is_accessible().await?;
    Ok(server)
}

/// `sudo -n -- [env K=V...] argv...`
fn escalated_argv(invocation: &Invocation) -> Vec<String> {
    let mut argv: Vec<String> = ["sudo", "-n", "--"].map(String::from).to_vec();
    if !invocation.environ.is_empty() {
        argv.push("env".to_string());
        argv.extend(invocation.environ.iter().map(|(k, v)| format!("{k}={v}")));
    }
    argv.extend(invocation.argv.iter().cloned());
    argv
}

/// Token following `src` in `ip route get` output
fn route_source(output: &str) -> Option<&str> {
    let mut tokens = output.split_whitespace();
    tokens.find(|t| *t == "src")?;
    tokens.next()
}
