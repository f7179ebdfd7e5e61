//! Credential loading from a runtime `.env` file.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::error::{Error, Result};

/// Runtime credentials loaded from the `.env` file.
///
/// `Debug` never prints values — only the set of known keys — so a stray
/// `{credentials:?}` in a log line cannot leak the gateway bearer token.
#[derive(Clone, Default)]
pub struct Credentials {
    vars: BTreeMap<String, String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("keys", &self.vars.keys().collect::<Vec<_>>())
            .field("values", &"[REDACTED]")
            .finish()
    }
}

impl Credentials {
    /// Build credentials from a key-value map, e.g. for tests.
    pub fn from_map(vars: BTreeMap<String, String>) -> Self {
        Self { vars }
    }

    /// Returns a credential value for a key, if present.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    /// Returns a required credential or a [`Error::AuthFailure`] when missing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AuthFailure`] when the key is absent or empty.
    pub fn require(&self, key: &str) -> Result<String> {
        self.vars
            .get(key)
            .filter(|v| !v.trim().is_empty())
            .cloned()
            .ok_or_else(|| Error::AuthFailure(format!("missing required credential: {key}")))
    }

    /// Returns every non-empty credential value, for registering with a
    /// [`crate::gateway::redactor::Redactor`].
    pub fn known_secrets(&self) -> Vec<String> {
        self.vars
            .values()
            .filter(|value| !value.trim().is_empty())
            .cloned()
            .collect()
    }
}

/// Load credentials from a specific `.env` path.
///
/// # Errors
///
/// Returns [`Error::ConfigError`] if the file does not exist, has group- or
/// world-readable permissions, or fails to parse.
pub fn load_credentials(path: &Path) -> Result<Credentials> {
    if !path.exists() {
        return Err(Error::ConfigError(format!(
            "credentials file does not exist: {}",
            path.display()
        )));
    }

    validate_private_permissions(path)?;

    let mut vars = BTreeMap::new();
    let iter = dotenvy::from_path_iter(path).map_err(|e| {
        Error::ConfigError(format!(
            "failed to read credentials at {}: {e}",
            path.display()
        ))
    })?;

    for item in iter {
        let (key, value) = item.map_err(|e| {
            Error::ConfigError(format!(
                "failed to parse key-value entry in credentials file {}: {e}",
                path.display()
            ))
        })?;
        vars.insert(key, value);
    }

    Ok(Credentials { vars })
}

#[cfg(unix)]
fn validate_private_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let metadata = fs::metadata(path).map_err(Error::Io)?;
    let mode = metadata.permissions().mode() & 0o777;

    if mode & 0o077 != 0 {
        return Err(Error::ConfigError(format!(
            "credentials file {} must be 0600, found {:o}",
            path.display(),
            mode
        )));
    }

    Ok(())
}

#[cfg(not(unix))]
fn validate_private_permissions(_path: &Path) -> Result<()> {
    Ok(())
}
