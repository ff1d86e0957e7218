//! SSH private key resolution

use std::env;
use std::path::{Path, PathBuf};

use russh::keys::{PrivateKey, decode_secret_key, load_secret_key};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Where the private key for SSH authentication comes from
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeySource {
    /// First of `~/.ssh/id_ed25519`, `~/.ssh/id_ecdsa`, `~/.ssh/id_rsa` that exists
    #[default]
    Default,
    /// Explicit path to a key file
    Path(PathBuf),
    /// Base64-encoded key held in an environment variable
    Env(String),
}

impl KeySource {
    /// Load the private key
    ///
    /// Key files must not be readable by group or others.
    ///
    /// # Errors
    /// Returns `KeyError` if the key is missing, badly protected or cannot be decoded
    pub fn load(&self) -> Result<PrivateKey, KeyError> {
        match self {
            KeySource::Default => {
                let path = default_key_paths()
                    .into_iter()
                    .find(|p| p.exists())
                    .ok_or_else(|| KeyError::NotFound("~/.ssh/id_*".to_string()))?;
                load_from_path(&path)
            }
            KeySource::Path(path) => load_from_path(path),
            KeySource::Env(var_name) => {
                let encoded =
                    env::var(var_name).map_err(|_| KeyError::EnvNotSet(var_name.clone()))?;
                let pem = base64_decode(&encoded)?;
                let pem = String::from_utf8(pem).map_err(|_| KeyError::InvalidBase64)?;
                debug!(var = %var_name, "loaded SSH key from environment");
                decode_secret_key(&pem, None).map_err(|e| KeyError::Decode(e.to_string()))
            }
        }
    }
}

/// Key resolution errors
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("environment variable {0} not set")]
    EnvNotSet(String),

    #[error("invalid base64 encoding")]
    InvalidBase64,

    #[error("key file permissions too open: {0} (should be 600)")]
    BadPermissions(String),

    #[error("key file not found: {0}")]
    NotFound(String),

    #[error("failed to decode key: {0}")]
    Decode(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn default_key_paths() -> Vec<PathBuf> {
    let Some(home) = dirs::home_dir() else {
        return Vec::new();
    };
    ["id_ed25519", "id_ecdsa", "id_rsa"]
        .into_iter()
        .map(|name| home.join(".ssh").join(name))
        .collect()
}

fn load_from_path(path: &Path) -> Result<PrivateKey, KeyError> {
    if !path.exists() {
        return Err(KeyError::NotFound(path.display().to_string()));
    }
    validate_key_permissions(path)?;
    debug!(path = %path.display(), "loading SSH key");
    load_secret_key(path, None).map_err(|e| KeyError::Decode(e.to_string()))
}

fn base64_decode(input: &str) -> Result<Vec<u8>, KeyError> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD
        .decode(input.trim())
        .map_err(|_| KeyError::InvalidBase64)
}

fn validate_key_permissions(path: &Path) -> Result<(), KeyError> {
    use std::os::unix::fs::PermissionsExt;

    let mode = std::fs::metadata(path)?.permissions().mode();

    // group and other bits must be clear
    if mode & 0o77 != 0 {
        return Err(KeyError::BadPermissions(path.display().to_string()));
    }

    Ok(())
}
