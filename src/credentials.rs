//! Suite-private registry credential store.
//!
//! Registry clients persist `login` state in an auth file keyed by registry
//! address. The store points the client at a private file (via
//! `REGISTRY_AUTH_FILE`) instead of the user's real one, and can read and
//! edit that file with the same layout the client uses:
//!
//! ```json
//! {"auths": {"127.0.0.1:5001": {"auth": "<base64 username:password>"}}}
//! ```

use crate::auth::Credentials;
use crate::error::{HarnessError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Environment variable that redirects the client's auth file.
pub const AUTH_FILE_ENV: &str = "REGISTRY_AUTH_FILE";

#[derive(Serialize, Deserialize, Default)]
struct AuthFile {
    #[serde(default)]
    auths: BTreeMap<String, AuthEntry>,
    #[serde(flatten)]
    other: Map<String, Value>,
}

#[derive(Serialize, Deserialize, Default)]
struct AuthEntry {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    auth: String,
    #[serde(flatten)]
    other: Map<String, Value>,
}

pub struct CredentialStore {
    path: PathBuf,
    _dir: Option<tempfile::TempDir>,
}

impl CredentialStore {
    /// A store backed by `auth.json` in a fresh temporary directory, removed on drop.
    pub fn temporary() -> Result<Self> {
        let dir = tempfile::Builder::new().prefix("registry-auth").tempdir()?;
        Ok(Self {
            path: dir.path().join("auth.json"),
            _dir: Some(dir),
        })
    }

    /// A store backed by an existing or future file at `path`.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _dir: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, address: &str) -> Result<Option<Credentials>> {
        let file = self.load()?;
        let Some(entry) = file.auths.get(address) else {
            return Ok(None);
        };
        Credentials::decode(&entry.auth)
            .map(Some)
            .ok_or_else(|| HarnessError::CredentialStore(format!("malformed entry for {}", address)))
    }

    pub fn set(&self, address: &str, credentials: &Credentials) -> Result<()> {
        let mut file = self.load()?;
        file.auths.entry(address.to_string()).or_default().auth = credentials.encode();
        self.save(&file)?;
        debug!("Stored credentials for {} in {}", address, self.path.display());
        Ok(())
    }

    /// Removes the entry for `address`; returns whether one existed.
    pub fn clear(&self, address: &str) -> Result<bool> {
        let mut file = self.load()?;
        let removed = file.auths.remove(address).is_some();
        if removed {
            self.save(&file)?;
            debug!("Cleared credentials for {}", address);
        }
        Ok(removed)
    }

    pub fn addresses(&self) -> Result<Vec<String>> {
        Ok(self.load()?.auths.into_keys().collect())
    }

    fn load(&self) -> Result<AuthFile> {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) if contents.trim().is_empty() => Ok(AuthFile::default()),
            Ok(contents) => Ok(serde_json::from_str(&contents)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(AuthFile::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, file: &AuthFile) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(file)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
