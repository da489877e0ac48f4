use crate::auth::Credentials;
use crate::error::{HarnessError, Result};
use std::path::PathBuf;
use std::time::Duration;

/// Default address of the fixture that accepts anonymous requests.
pub const DEFAULT_ADDRESS: &str = "127.0.0.1:5000";
/// Default address of the fixture that requires basic auth.
pub const DEFAULT_AUTH_ADDRESS: &str = "127.0.0.1:5001";

const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_INVOCATION_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone)]
pub enum StorageBackend {
    Memory,
    TempDir,
    Directory(PathBuf),
}

/// Configuration of a single registry fixture. Immutable once the fixture starts.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub storage: StorageBackend,
    pub port: Option<u16>,
    pub host: String,
    pub auth: Option<Credentials>,
    pub tls: bool,
    pub startup_timeout: Duration,
}

impl RegistryConfig {
    pub fn new(storage: StorageBackend) -> Self {
        Self {
            storage,
            port: None,
            host: "127.0.0.1".to_string(),
            auth: None,
            tls: false,
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
        }
    }

    pub fn memory() -> Self {
        Self::new(StorageBackend::Memory)
    }

    pub fn temp_dir() -> Self {
        Self::new(StorageBackend::TempDir)
    }

    pub fn directory(path: PathBuf) -> Self {
        Self::new(StorageBackend::Directory(path))
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Binds to an explicit `host:port` address.
    pub fn with_address(self, address: &str) -> Result<Self> {
        let (host, port) = address
            .rsplit_once(':')
            .ok_or_else(|| HarnessError::InvalidAddress {
                address: address.to_string(),
                reason: "expected host:port".to_string(),
            })?;
        let port = port.parse::<u16>().map_err(|e| HarnessError::InvalidAddress {
            address: address.to_string(),
            reason: e.to_string(),
        })?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        Ok(self.with_host(host).with_port(port))
    }

    /// Requires basic auth with a freshly generated credential pair.
    pub fn with_auth(self) -> Self {
        self.with_credentials(Credentials::generate())
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.auth = Some(credentials);
        self
    }

    pub fn with_tls(mut self, tls: bool) -> Self {
        self.tls = tls;
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    pub(crate) fn bind_addr(&self) -> String {
        let port = self.port.unwrap_or(0);
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, port)
        } else {
            format!("{}:{}", self.host, port)
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self::memory()
    }
}

/// Configuration of a whole suite run: which binary to drive and where the
/// two fixtures live.
#[derive(Debug, Clone)]
pub struct SuiteConfig {
    pub binary: String,
    pub address: String,
    pub auth_address: String,
    pub expected_version: Option<String>,
    pub invocation_timeout: Duration,
    pub copy_source: Option<String>,
    pub tls: bool,
}

impl SuiteConfig {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            address: DEFAULT_ADDRESS.to_string(),
            auth_address: DEFAULT_AUTH_ADDRESS.to_string(),
            expected_version: None,
            invocation_timeout: DEFAULT_INVOCATION_TIMEOUT,
            copy_source: None,
            tls: false,
        }
    }

    /// Defaults overlaid with `REGISTRY_HARNESS_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(binary) = lookup("REGISTRY_HARNESS_BINARY") {
            config.binary = binary;
        }
        if let Some(address) = lookup("REGISTRY_HARNESS_ADDR") {
            config.address = address;
        }
        if let Some(address) = lookup("REGISTRY_HARNESS_AUTH_ADDR") {
            config.auth_address = address;
        }
        config.expected_version = lookup("REGISTRY_HARNESS_VERSION");
        if let Some(secs) = lookup("REGISTRY_HARNESS_TIMEOUT_SECS").and_then(|s| s.parse().ok()) {
            config.invocation_timeout = Duration::from_secs(secs);
        }
        config.copy_source = lookup("REGISTRY_HARNESS_COPY_SOURCE");
        config
    }

    pub fn with_addresses(mut self, address: impl Into<String>, auth_address: impl Into<String>) -> Self {
        self.address = address.into();
        self.auth_address = auth_address.into();
        self
    }

    pub fn with_expected_version(mut self, version: impl Into<String>) -> Self {
        self.expected_version = Some(version.into());
        self
    }

    pub fn with_invocation_timeout(mut self, timeout: Duration) -> Self {
        self.invocation_timeout = timeout;
        self
    }

    pub fn with_copy_source(mut self, source: impl Into<String>) -> Self {
        self.copy_source = Some(source.into());
        self
    }

    pub fn with_tls(mut self, tls: bool) -> Self {
        self.tls = tls;
        self
    }
}

impl Default for SuiteConfig {
    fn default() -> Self {
        Self::new("skopeo")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_address_splits_host_and_port() {
        let config = RegistryConfig::memory().with_address("127.0.0.1:5001").unwrap();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, Some(5001));
        assert_eq!(config.bind_addr(), "127.0.0.1:5001");
    }

    #[test]
    fn test_with_address_rejects_missing_port() {
        let err = RegistryConfig::memory().with_address("localhost").unwrap_err();
        assert!(matches!(err, HarnessError::InvalidAddress { .. }));
    }

    #[test]
    fn test_ipv6_bind_addr_is_bracketed() {
        let config = RegistryConfig::memory().with_address("[::1]:5000").unwrap();
        assert_eq!(config.bind_addr(), "[::1]:5000");
    }

    #[test]
    fn test_suite_config_env_overlay() {
        let config = SuiteConfig::from_lookup(|key| match key {
            "REGISTRY_HARNESS_BINARY" => Some("/opt/bin/skopeo".to_string()),
            "REGISTRY_HARNESS_AUTH_ADDR" => Some("127.0.0.1:6001".to_string()),
            "REGISTRY_HARNESS_TIMEOUT_SECS" => Some("5".to_string()),
            _ => None,
        });
        assert_eq!(config.binary, "/opt/bin/skopeo");
        assert_eq!(config.address, DEFAULT_ADDRESS);
        assert_eq!(config.auth_address, "127.0.0.1:6001");
        assert_eq!(config.invocation_timeout, Duration::from_secs(5));
        assert!(config.expected_version.is_none());
    }
}
