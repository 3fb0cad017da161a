//! Secret blob providers for the `deploy:secrets` task.
//!
//! Storage is external: the environment or the system keychain
//! (macOS Keychain, Linux Secret Service, Windows Credential Manager).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use keyring::Entry;
use serde_json::Value;

use crate::error::{Error, ErrorCode, Result};

const SERVICE_NAME: &str = "hoist";

pub trait SecretProvider: Send + Sync {
    /// Returns `None` when the secret does not exist.
    fn secret(&self, name: &str) -> Result<Option<String>>;
}

/// Reads secrets from process environment variables.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvSecrets;

impl SecretProvider for EnvSecrets {
    fn secret(&self, name: &str) -> Result<Option<String>> {
        Ok(std::env::var(name).ok())
    }
}

/// Reads secrets from the system keychain under the `hoist` service.
#[derive(Debug, Clone)]
pub struct KeyringSecrets {
    service: String,
}

impl KeyringSecrets {
    pub fn new() -> Self {
        Self {
            service: SERVICE_NAME.to_string(),
        }
    }
}

impl Default for KeyringSecrets {
    fn default() -> Self {
        Self::new()
    }
}

fn keyring_error(e: keyring::Error) -> Error {
    Error::new(
        ErrorCode::InternalUnexpected,
        format!("Keychain error: {}", e),
        Value::Null,
    )
}

impl SecretProvider for KeyringSecrets {
    fn secret(&self, name: &str) -> Result<Option<String>> {
        let entry = Entry::new(&self.service, name).map_err(keyring_error)?;

        match entry.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(keyring_error(e)),
        }
    }
}

/// Fixed in-memory secrets.
#[derive(Debug, Default, Clone)]
pub struct StaticSecrets {
    values: HashMap<String, String>,
}

impl StaticSecrets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }
}

impl SecretProvider for StaticSecrets {
    fn secret(&self, name: &str) -> Result<Option<String>> {
        Ok(self.values.get(name).cloned())
    }
}

/// A local file holding a secret, deleted when dropped.
pub struct TempSecretFile {
    path: PathBuf,
}

impl TempSecretFile {
    /// Write `contents` to a uniquely named file in the temp directory,
    /// readable by the owner only.
    pub fn write(contents: &str) -> Result<Self> {
        let path = std::env::temp_dir().join(format!("hoist-secret-{}", uuid::Uuid::new_v4()));
        std::fs::write(&path, contents).map_err(|e| {
            Error::internal_io(e.to_string(), Some("write secret file".to_string()))
        })?;
        let file = Self { path };

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&file.path, std::fs::Permissions::from_mode(0o600)).map_err(
                |e| Error::internal_io(e.to_string(), Some("restrict secret file".to_string())),
            )?;
        }

        Ok(file)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempSecretFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}
