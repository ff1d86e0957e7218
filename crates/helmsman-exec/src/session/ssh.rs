//! Remote execution over SSH using the russh crate

use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use russh::client::{self, Msg};
use russh::keys::ssh_key;
use russh::keys::{PrivateKeyWithHashAlg, check_known_hosts_path};
use russh::{Channel, ChannelMsg, Disconnect, Sig};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::error::ProcessError;
use crate::keys::KeySource;
use crate::session::{
    ChildEvent, ExitStatus, Invocation, Session, SessionChild, Signal, StdinWriter, shell_line,
};

/// How server host keys are verified
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostKeyPolicy {
    /// Require the key to be listed in a known_hosts file (`~/.ssh/known_hosts` if unset)
    KnownHosts(Option<PathBuf>),
    /// Accept any key; for throwaway lab hosts only
    AcceptAny,
}

impl Default for HostKeyPolicy {
    fn default() -> Self {
        HostKeyPolicy::KnownHosts(None)
    }
}

/// Connection settings for an SSH host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshConfig {
    /// Host address
    pub host: String,
    /// Port (default 22)
    #[serde(default = "default_port")]
    pub port: u16,
    /// Username
    #[serde(default = "default_user")]
    pub user: String,
    /// Private key location
    #[serde(default)]
    pub key: KeySource,
    /// Host key verification
    #[serde(default)]
    pub host_key_policy: HostKeyPolicy,
}

fn default_port() -> u16 {
    22
}

fn default_user() -> String {
    "root".to_string()
}

impl SshConfig {
    /// Create config with required fields
    pub fn new(host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: default_port(),
            user: user.into(),
            key: KeySource::default(),
            host_key_policy: HostKeyPolicy::default(),
        }
    }

    /// Set custom port
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set SSH key path
    #[must_use]
    pub fn with_key_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.key = KeySource::Path(path.into());
        self
    }

    /// Set key from environment variable (base64)
    #[must_use]
    pub fn with_env_key(mut self, var_name: impl Into<String>) -> Self {
        self.key = KeySource::Env(var_name.into());
        self
    }

    /// Set host key verification policy
    #[must_use]
    pub fn with_host_key_policy(mut self, policy: HostKeyPolicy) -> Self {
        self.host_key_policy = policy;
        self
    }
}

/// russh handler that checks the server key against our policy
#[derive(Debug)]
struct HostKeyVerifier {
    host: String,
    port: u16,
    policy: HostKeyPolicy,
    /// Why the key was refused, read back after a failed connect
    rejection: Arc<StdMutex<Option<String>>>,
}

impl HostKeyVerifier {
    fn reject(&self, reason: String) {
        warn!(host = %self.host, reason = %reason, "rejecting server host key");
        if let Ok(mut slot) = self.rejection.lock() {
            *slot = Some(reason);
        }
    }
}

impl client::Handler for HostKeyVerifier {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &ssh_key::PublicKey,
    ) -> Result<bool, Self::Error> {
        let path = match &self.policy {
            HostKeyPolicy::AcceptAny => {
                warn!(host = %self.host, "accepting server key without verification");
                return Ok(true);
            }
            HostKeyPolicy::KnownHosts(Some(path)) => path.clone(),
            HostKeyPolicy::KnownHosts(None) => {
                match dirs::home_dir().map(|h| h.join(".ssh").join("known_hosts")) {
                    Some(path) => path,
                    None => {
                        self.reject("no home directory to locate known_hosts".to_string());
                        return Ok(false);
                    }
                }
            }
        };

        match check_known_hosts_path(&self.host, self.port, server_public_key, &path) {
            Ok(true) => Ok(true),
            Ok(false) => {
                self.reject(format!("host key not found in {}", path.display()));
                Ok(false)
            }
            Err(e) => {
                self.reject(format!("host key verification failed: {e}"));
                Ok(false)
            }
        }
    }
}

/// SSH transport to one host
///
/// The connection is opened on first use and shared by every process spawned through
/// it; each process gets its own channel.
pub struct SshSession {
    config: SshConfig,
    handle: Mutex<Option<Arc<client::Handle<HostKeyVerifier>>>>,
}

impl std::fmt::Debug for SshSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshSession")
            .field("config", &self.config)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl SshSession {
    #[must_use]
    pub fn new(config: SshConfig) -> Self {
        Self {
            config,
            handle: Mutex::new(None),
        }
    }

    /// Get connection config
    pub fn config(&self) -> &SshConfig {
        &self.config
    }

    /// Whether a live connection is currently held
    ///
    /// Synchronous best effort; a connection can still drop right after.
    pub fn is_connected(&self) -> bool {
        self.handle
            .try_lock()
            .map(|h| h.as_ref().is_some_and(|h| !h.is_closed()))
            .unwrap_or(false)
    }

    /// Connect and authenticate, reusing a live connection
    #[instrument(skip(self), fields(host = %self.config.host))]
    async fn connect(&self) -> Result<Arc<client::Handle<HostKeyVerifier>>, ProcessError> {
        let mut slot = self.handle.lock().await;

        if let Some(handle) = slot.as_ref()
            && !handle.is_closed()
        {
            return Ok(Arc::clone(handle));
        }

        let host = &self.config.host;
        info!(
            host = %host,
            port = self.config.port,
            user = %self.config.user,
            "connecting to SSH"
        );

        let rejection = Arc::new(StdMutex::new(None));
        let handler = HostKeyVerifier {
            host: host.clone(),
            port: self.config.port,
            policy: self.config.host_key_policy.clone(),
            rejection: Arc::clone(&rejection),
        };

        let config = Arc::new(client::Config::default());
        let mut session = match client::connect(config, (&host[..], self.config.port), handler)
            .await
        {
            Ok(session) => session,
            Err(e) => {
                let reason = rejection.lock().ok().and_then(|mut r| r.take());
                return Err(match reason {
                    Some(reason) => ProcessError::unknown_host(host, reason),
                    None => ProcessError::failed(format!("{host}: connection failed: {e}")),
                });
            }
        };

        let key_pair = self
            .config
            .key
            .load()
            .map_err(|e| ProcessError::AuthenticationFailed {
                host: host.clone(),
                message: e.to_string(),
            })?;

        let hash_alg = session
            .best_supported_rsa_hash()
            .await
            .ok()
            .flatten()
            .flatten();
        let auth_res = session
            .authenticate_publickey(
                &self.config.user,
                PrivateKeyWithHashAlg::new(Arc::new(key_pair), hash_alg),
            )
            .await
            .map_err(|e| ProcessError::AuthenticationFailed {
                host: host.clone(),
                message: e.to_string(),
            })?;

        if !auth_res.success() {
            return Err(ProcessError::AuthenticationFailed {
                host: host.clone(),
                message: format!("public key authentication failed for {}", self.config.user),
            });
        }

        info!(host = %host, "SSH connected and authenticated");

        let handle = Arc::new(session);
        *slot = Some(Arc::clone(&handle));
        Ok(handle)
    }
}

#[async_trait]
impl Session for SshSession {
    async fn probe(&self) -> Result<(), ProcessError> {
        self.connect().await.map(|_| ())
    }

    #[instrument(skip(self, invocation), fields(host = %self.config.host, program = %invocation.program()))]
    async fn spawn(&self, invocation: &Invocation) -> Result<Box<dyn SessionChild>, ProcessError> {
        let handle = self.connect().await?;
        let host = &self.config.host;

        let channel = handle
            .channel_open_session()
            .await
            .map_err(|e| ProcessError::failed(format!("{host}: failed to open channel: {e}")))?;

        if invocation.pty {
            channel
                .request_pty(true, "xterm", 80, 24, 0, 0, &[])
                .await
                .map_err(|e| ProcessError::failed(format!("{host}: pty request failed: {e}")))?;
        }

        let line = shell_line(invocation);
        debug!(command = %line, "executing remote command");

        channel
            .exec(true, line)
            .await
            .map_err(|e| ProcessError::failed(format!("{host}: exec failed: {e}")))?;

        Ok(Box::new(SshChild {
            channel,
            exit: None,
            done: false,
            stdin_taken: false,
        }))
    }

    /// Disconnect from remote host
    async fn close(&self) -> Result<(), ProcessError> {
        let mut slot = self.handle.lock().await;

        if let Some(handle) = slot.take() {
            handle
                .disconnect(Disconnect::ByApplication, "", "English")
                .await
                .map_err(|e| ProcessError::failed(e.to_string()))?;
            info!(host = %self.config.host, "SSH disconnected");
        }
        Ok(())
    }

    fn reports_missing_as_127(&self) -> bool {
        true
    }

    fn session_type(&self) -> &'static str {
        "ssh"
    }
}

/// One remote invocation on its own channel
struct SshChild {
    channel: Channel<Msg>,
    exit: Option<ExitStatus>,
    done: bool,
    stdin_taken: bool,
}

fn to_sig(signal: Signal) -> Sig {
    match signal {
        Signal::Hup => Sig::HUP,
        Signal::Int => Sig::INT,
        Signal::Quit => Sig::QUIT,
        Signal::Kill => Sig::KILL,
        Signal::Usr1 => Sig::USR1,
        Signal::Usr2 => Sig::Custom("USR2".to_string()),
        Signal::Term => Sig::TERM,
    }
}

fn sig_name(sig: &Sig) -> String {
    match sig {
        Sig::Custom(name) => name.clone(),
        other => format!("{other:?}"),
    }
}

#[async_trait]
impl SessionChild for SshChild {
    async fn next_event(&mut self) -> Option<ChildEvent> {
        if self.done {
            return None;
        }
        loop {
            match self.channel.wait().await {
                Some(ChannelMsg::Data { data }) => return Some(ChildEvent::Stdout(data.to_vec())),
                Some(ChannelMsg::ExtendedData { data, ext }) => {
                    if ext == 1 {
                        return Some(ChildEvent::Stderr(data.to_vec()));
                    }
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    self.exit = Some(ExitStatus::code(exit_status.cast_signed()));
                }
                Some(ChannelMsg::ExitSignal { signal_name, .. }) => {
                    self.exit = Some(ExitStatus::signaled(sig_name(&signal_name)));
                }
                // exit status may still follow EOF
                Some(ChannelMsg::Eof) => {}
                Some(ChannelMsg::Close) | None => {
                    self.done = true;
                    return self.exit.take().map(ChildEvent::Exited);
                }
                Some(_) => {}
            }
        }
    }

    fn take_stdin(&mut self) -> Option<StdinWriter> {
        if std::mem::replace(&mut self.stdin_taken, true) {
            return None;
        }
        // shutting the writer down sends channel EOF
        Some(Box::pin(self.channel.make_writer()))
    }

    async fn signal(&mut self, signal: Signal) -> Result<(), ProcessError> {
        self.channel
            .signal(to_sig(signal))
            .await
            .map_err(|e| ProcessError::failed(format!("failed to send {signal}: {e}")))
    }

    async fn abort(&mut self) {
        if let Err(e) = self.channel.close().await {
            debug!(error = %e, "channel already closed");
        }
        self.done = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = SshConfig::new("nas01", "admin")
            .with_port(2222)
            .with_key_path("/home/admin/.ssh/id_ed25519");
        assert_eq!(config.port, 2222);
        assert_eq!(
            config.key,
            KeySource::Path(PathBuf::from("/home/admin/.ssh/id_ed25519"))
        );
        assert_eq!(config.host_key_policy, HostKeyPolicy::KnownHosts(None));
    }

    #[test]
    fn test_config_defaults_from_toml_like_json() {
        let config: SshConfig = serde_json::from_str(r#"{"host":"nas01"}"#).unwrap();
        assert_eq!(config.port, 22);
        assert_eq!(config.user, "root");
        assert_eq!(config.key, KeySource::Default);
    }

    #[test]
    fn test_signal_mapping() {
        assert_eq!(sig_name(&to_sig(Signal::Usr2)), "USR2");
        assert!(matches!(to_sig(Signal::Term), Sig::TERM));
    }

    #[tokio::test]
    async fn test_unreachable_host_is_generic_failure() {
        let session = SshSession::new(
            SshConfig::new("127.0.0.1", "root").with_port(1),
        );
        let result = session.probe().await;
        assert!(matches!(result, Err(ProcessError::Failed { .. })));
        assert!(!session.is_connected());
    }

    #[tokio::test]
    #[ignore = "requires SSH server"]
    async fn test_ssh_echo() {
        let session = SshSession::new(SshConfig::new("localhost", "root"));
        let mut child = session
            .spawn(&Invocation::new(vec!["echo".into(), "hi".into()]))
            .await
            .unwrap();
        let mut stdin = child.take_stdin().unwrap();
        tokio::io::AsyncWriteExt::shutdown(&mut stdin).await.unwrap();
        let mut out = Vec::new();
        let mut status = None;
        while let Some(event) = child.next_event().await {
            match event {
                ChildEvent::Stdout(d) => out.extend(d),
                ChildEvent::Exited(s) => status = Some(s),
                ChildEvent::Stderr(_) => {}
            }
        }
        assert_eq!(out, b"hi\n");
        assert_eq!(status, Some(ExitStatus::code(0)));
    }
}
