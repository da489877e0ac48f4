//! Disposable registry fixtures.
//!
//! A [`RegistryFixture`] owns a [`RegistryServer`] together with the runtime
//! that drives it, so it can be used from plain synchronous test code. It is
//! only handed out once the registry answers on its address, and it is torn
//! down exactly once: explicitly through [`RegistryFixture::tear_down`] or
//! implicitly on drop.
//!
//! Fixtures must not be created or dropped from inside an async context.

use crate::auth::Credentials;
use crate::config::RegistryConfig;
use crate::error::{HarnessError, Result};
use crate::server::RegistryServer;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::runtime::Runtime;
use tracing::{debug, info, warn};

const READINESS_REQUEST_TIMEOUT: Duration = Duration::from_millis(500);
const READINESS_INITIAL_BACKOFF: Duration = Duration::from_millis(10);
const READINESS_MAX_BACKOFF: Duration = Duration::from_millis(250);

static CLAIMED: Mutex<BTreeSet<String>> = Mutex::new(BTreeSet::new());

/// An address reserved by a live fixture in this process.
struct AddressClaim(String);

impl AddressClaim {
    fn acquire(address: String) -> Result<Self> {
        let mut claimed = CLAIMED.lock().unwrap_or_else(|poison| poison.into_inner());
        if !claimed.insert(address.clone()) {
            return Err(HarnessError::AddressInUse { address });
        }
        Ok(Self(address))
    }
}

impl Drop for AddressClaim {
    fn drop(&mut self) {
        let mut claimed = CLAIMED.lock().unwrap_or_else(|poison| poison.into_inner());
        claimed.remove(&self.0);
    }
}

/// A running, addressable registry owned by a test suite.
pub struct RegistryFixture {
    address: String,
    url: String,
    credentials: Option<Credentials>,
    cert_dir: Option<tempfile::TempDir>,
    server: Option<RegistryServer>,
    runtime: Option<Runtime>,
    _claim: Option<AddressClaim>,
}

impl RegistryFixture {
    /// Starts a memory-backed fixture on `address`.
    pub fn start_at(address: &str, auth: bool, tls: bool) -> Result<Self> {
        let mut config = RegistryConfig::memory().with_address(address)?.with_tls(tls);
        if auth {
            config = config.with_auth();
        }
        Self::start(config)
    }

    /// Starts a fixture and blocks until it answers on its address, or fails
    /// with [`HarnessError::StartupTimeout`] after `config.startup_timeout`.
    pub fn start(config: RegistryConfig) -> Result<Self> {
        let claim = match config.port {
            Some(port) if port != 0 => Some(AddressClaim::acquire(config.bind_addr())?),
            _ => None,
        };

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("registry-fixture")
            .enable_all()
            .build()?;

        let server = runtime.block_on(RegistryServer::new(config.clone()))?;
        let address = server.addr().to_string();
        let url = server.url();
        let claim = match claim {
            Some(claim) => claim,
            None => AddressClaim::acquire(address.clone())?,
        };

        let cert_dir = match server.tls() {
            Some(material) => {
                let dir = tempfile::Builder::new().prefix("registry-certs").tempdir()?;
                material.write_cert_dir(dir.path())?;
                Some(dir)
            }
            None => None,
        };

        let fixture = Self {
            address,
            url,
            credentials: config.auth.clone(),
            cert_dir,
            server: Some(server),
            runtime: Some(runtime),
            _claim: Some(claim),
        };

        fixture.await_ready(config.startup_timeout)?;
        Ok(fixture)
    }

    fn await_ready(&self, timeout: Duration) -> Result<()> {
        let runtime = self.runtime.as_ref().ok_or_else(|| HarnessError::NotRunning {
            address: self.address.clone(),
        })?;
        let started = Instant::now();
        runtime.block_on(wait_until_ready(&self.url, &self.address, timeout))?;
        info!("Fixture {} ready after {:?}", self.url, started.elapsed());
        Ok(())
    }

    /// The `host:port` the fixture is bound to.
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_tls(&self) -> bool {
        self.cert_dir.is_some()
    }

    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    pub fn username(&self) -> Option<&str> {
        self.credentials.as_ref().map(|c| c.username.as_str())
    }

    pub fn password(&self) -> Option<&str> {
        self.credentials.as_ref().map(|c| c.password.as_str())
    }

    /// Directory holding `ca.crt` for TLS fixtures.
    pub fn cert_dir(&self) -> Option<&Path> {
        self.cert_dir.as_ref().map(|d| d.path())
    }

    /// `docker://<address>/<repo>:<tag>`
    pub fn reference(&self, repo: &str, tag: &str) -> String {
        format!("docker://{}/{}:{}", self.address, repo, tag)
    }

    pub fn is_running(&self) -> bool {
        self.server.as_ref().is_some_and(|s| s.is_running())
    }

    /// Stores a minimal image as `repo:tag`; returns its manifest digest.
    pub fn seed_image(&self, repo: &str, tag: &str) -> Result<String> {
        match (&self.runtime, &self.server) {
            (Some(runtime), Some(server)) => runtime.block_on(server.seed_image(repo, tag)),
            _ => Err(HarnessError::NotRunning {
                address: self.address.clone(),
            }),
        }
    }

    /// Stops the registry and releases its address. Idempotent.
    pub fn tear_down(&mut self) -> Result<()> {
        let Some(mut server) = self.server.take() else {
            return Ok(());
        };

        let result = match &self.runtime {
            Some(runtime) => runtime.block_on(server.shutdown()),
            None => Ok(()),
        };
        drop(server);

        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_timeout(Duration::from_secs(1));
        }
        self._claim = None;
        self.cert_dir = None;

        debug!("Fixture {} torn down", self.address);
        result
    }
}

impl Drop for RegistryFixture {
    fn drop(&mut self) {
        if let Err(e) = self.tear_down() {
            warn!("Teardown of {} failed: {}", self.address, e);
        }
    }
}

/// Polls `GET /v2/` until the registry answers (200, or 401 when auth is on).
/// No request outlives the deadline; the error reports the time actually spent.
async fn wait_until_ready(url: &str, address: &str, timeout: Duration) -> Result<()> {
    let client = reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .build()
        .map_err(|e| HarnessError::Tls(e.to_string()))?;

    let started = Instant::now();
    let deadline = started + timeout;
    let mut backoff = READINESS_INITIAL_BACKOFF;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let request = client
            .get(format!("{}/v2/", url))
            .timeout(remaining.min(READINESS_REQUEST_TIMEOUT));
        match request.send().await {
            Ok(response) if response.status().is_success() || response.status() == 401 => {
                return Ok(());
            }
            Ok(response) => debug!("Readiness check of {} answered {}", url, response.status()),
            Err(e) => debug!("Readiness check of {} failed: {}", url, e),
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(HarnessError::StartupTimeout {
                address: address.to_string(),
                waited: started.elapsed(),
            });
        }
        tokio::time::sleep(backoff.min(remaining)).await;
        backoff = (backoff * 2).min(READINESS_MAX_BACKOFF);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_silent_listener_is_startup_timeout() {
        // Accepted by the kernel backlog, never answered.
        let silent = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let address = silent.local_addr().unwrap().to_string();
        let bound = Duration::from_millis(300);

        let err = wait_until_ready(&format!("http://{}", address), &address, bound)
            .await
            .unwrap_err();

        match &err {
            HarnessError::StartupTimeout { address: a, waited } => {
                assert_eq!(a, &address);
                assert!(*waited >= bound, "{waited:?}");
                assert!(*waited < Duration::from_millis(550), "{waited:?}");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(err.is_fatal());
    }

    #[test]
    fn test_claim_is_released_on_drop() {
        let address = "127.0.0.1:1".to_string();
        let claim = AddressClaim::acquire(address.clone()).unwrap();
        assert!(matches!(
            AddressClaim::acquire(address.clone()),
            Err(HarnessError::AddressInUse { .. })
        ));
        drop(claim);
        AddressClaim::acquire(address).unwrap();
    }
}
