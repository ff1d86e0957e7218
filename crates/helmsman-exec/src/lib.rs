//! helmsman-exec: run commands on local and remote hosts
//!
//! A [`Server`] owns a session to one host (local or SSH). [`Server::execute`] starts a
//! [`Command`] and hands back a [`Process`]; awaiting it yields an [`ExitedProcess`] or a
//! typed [`ProcessError`].

pub mod command;
pub mod error;
pub mod exited;
pub mod glue;
pub mod keys;
pub mod process;
pub mod server;
pub mod session;

pub use command::{Command, CommandOptions, Superuser};
pub use error::{Error, ParsingError, ProcessError, SilentError, ValueError};
pub use exited::ExitedProcess;
pub use glue::{ProcessFutureExt, lift, parse_json, unwrap};
pub use keys::{KeyError, KeySource};
pub use process::{ExitPolicy, Killer, Process, ProcessState};
pub use server::{Privilege, Server, get_server};
pub use session::ssh::{HostKeyPolicy, SshConfig};
pub use session::{ExitStatus, Signal};
