//! Immutable description of a program invocation

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ValueError;

const BASH_SENTINEL: &str = "HelmsmanBashCommand";
const PYTHON_SENTINEL: &str = "HelmsmanPythonCommand";

/// Privilege escalation mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Superuser {
    /// Escalate if possible, run unelevated otherwise
    Try,
    /// Escalate or fail the whole invocation
    Require,
}

/// Execution options for a [`Command`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandOptions {
    /// Working directory on the target host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<String>,
    /// `KEY=VALUE` entries merged into the environment
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub environ: Vec<String>,
    /// Allocate a pseudo-terminal instead of pipes
    #[serde(default)]
    pub pty: bool,
    /// Privilege escalation mode
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub superuser: Option<Superuser>,
}

impl CommandOptions {
    /// Set working directory
    #[must_use]
    pub fn directory(mut self, dir: impl Into<String>) -> Self {
        self.directory = Some(dir.into());
        self
    }

    /// Add an environment variable
    #[must_use]
    pub fn env(mut self, key: impl AsRef<str>, value: impl AsRef<str>) -> Self {
        self.environ
            .push(format!("{}={}", key.as_ref(), value.as_ref()));
        self
    }

    /// Request a pseudo-terminal
    #[must_use]
    pub fn pty(mut self, pty: bool) -> Self {
        self.pty = pty;
        self
    }

    /// Set privilege escalation mode
    #[must_use]
    pub fn superuser(mut self, mode: Superuser) -> Self {
        self.superuser = Some(mode);
        self
    }

    /// Split `environ` into key/value pairs
    #[must_use]
    pub fn env_pairs(&self) -> Vec<(&str, &str)> {
        self.environ
            .iter()
            .filter_map(|entry| entry.split_once('='))
            .collect()
    }

    fn validate(&self) -> Result<(), ValueError> {
        for entry in &self.environ {
            match entry.split_once('=') {
                Some((key, _)) if !key.is_empty() => {}
                _ => {
                    return Err(ValueError::new(format!(
                        "environment entry must be KEY=VALUE: {entry:?}"
                    )));
                }
            }
        }
        if let Some(dir) = &self.directory
            && dir.is_empty()
        {
            return Err(ValueError::new("working directory must not be empty"));
        }
        Ok(())
    }
}

/// Argument vector plus options
///
/// Built once and never mutated. Variants (a different working directory, a script
/// wrapper) are new values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawCommand")]
pub struct Command {
    argv: Vec<String>,
    options: CommandOptions,
    #[serde(skip_serializing_if = "Option::is_none")]
    arg0: Option<String>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawCommand {
    argv: Vec<String>,
    #[serde(default)]
    options: CommandOptions,
    #[serde(default)]
    arg0: Option<String>,
}

impl TryFrom<RawCommand> for Command {
    type Error = ValueError;

    fn try_from(raw: RawCommand) -> Result<Self, Self::Error> {
        let mut command = Command::new(raw.argv, raw.options)?;
        command.arg0 = raw.arg0;
        Ok(command)
    }
}

impl Command {
    /// Create a command
    ///
    /// # Errors
    /// Returns `ValueError` if `argv` is empty or an `environ` entry is malformed
    pub fn new<I, S>(argv: I, options: CommandOptions) -> Result<Self, ValueError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let argv: Vec<String> = argv.into_iter().map(Into::into).collect();
        if argv.is_empty() {
            return Err(ValueError::new("argv must not be empty"));
        }
        options.validate()?;
        Ok(Self {
            argv,
            options,
            arg0: None,
        })
    }

    /// Run `script` with bash
    ///
    /// Inside the script `$0` is a fixed sentinel and `args` are `$1..`.
    ///
    /// # Errors
    /// Returns `ValueError` if an `environ` entry is malformed
    pub fn bash<I, S>(script: &str, args: I, options: CommandOptions) -> Result<Self, ValueError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut argv = vec![
            "/usr/bin/env".to_string(),
            "bash".to_string(),
            "-c".to_string(),
            script.to_string(),
            BASH_SENTINEL.to_string(),
        ];
        argv.extend(args.into_iter().map(Into::into));
        let mut command = Self::new(argv, options)?;
        command.arg0 = Some(BASH_SENTINEL.to_string());
        Ok(command)
    }

    /// Run `script` with python3; `args` land in `sys.argv[1:]`
    ///
    /// # Errors
    /// Returns `ValueError` if an `environ` entry is malformed
    pub fn python<I, S>(script: &str, args: I, options: CommandOptions) -> Result<Self, ValueError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut argv = vec![
            "/usr/bin/env".to_string(),
            "python3".to_string(),
            "-c".to_string(),
            script.to_string(),
        ];
        argv.extend(args.into_iter().map(Into::into));
        let mut command = Self::new(argv, options)?;
        command.arg0 = Some(PYTHON_SENTINEL.to_string());
        Ok(command)
    }

    /// Same argv with different options
    ///
    /// # Errors
    /// Returns `ValueError` if an `environ` entry is malformed
    pub fn with_options(&self, options: CommandOptions) -> Result<Self, ValueError> {
        options.validate()?;
        Ok(Self {
            argv: self.argv.clone(),
            options,
            arg0: self.arg0.clone(),
        })
    }

    /// Name used in diagnostics: the script sentinel or the executable
    #[must_use]
    pub fn name(&self) -> &str {
        self.arg0
            .as_deref()
            .or_else(|| self.argv.first().map(String::as_str))
            .unwrap_or("")
    }

    #[must_use]
    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    #[must_use]
    pub fn options(&self) -> &CommandOptions {
        &self.options
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let argv = serde_json::to_string(&self.argv).map_err(|_| fmt::Error)?;
        let options = serde_json::to_string(&self.options).map_err(|_| fmt::Error)?;
        write!(f, "Command({argv}, {options})")
    }
}
