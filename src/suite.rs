//! Suite lifecycle: start fixtures once, run scenarios serially, tear down once.

use crate::auth::Credentials;
use crate::config::SuiteConfig;
use crate::credentials::CredentialStore;
use crate::driver::CliDriver;
use crate::error::{HarnessError, Result};
use crate::fixture::RegistryFixture;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Repository and tag of the image seeded as the default copy source.
pub const SEED_REPO: &str = "harness/seed";
pub const SEED_TAG: &str = "latest";

/// A named end-to-end check. Returns at the first violated assertion.
#[derive(Clone, Copy)]
pub struct Scenario {
    pub name: &'static str,
    pub run: fn(&Suite) -> Result<()>,
}

impl Scenario {
    pub const fn new(name: &'static str, run: fn(&Suite) -> Result<()>) -> Self {
        Self { name, run }
    }
}

#[derive(Debug)]
pub struct ScenarioOutcome {
    pub name: String,
    pub result: Result<()>,
    pub elapsed: Duration,
}

impl ScenarioOutcome {
    pub fn passed(&self) -> bool {
        self.result.is_ok()
    }
}

#[derive(Debug, Default)]
pub struct SuiteReport {
    pub outcomes: Vec<ScenarioOutcome>,
    pub teardown_errors: Vec<HarnessError>,
}

impl SuiteReport {
    pub fn passed(&self) -> impl Iterator<Item = &ScenarioOutcome> {
        self.outcomes.iter().filter(|o| o.passed())
    }

    pub fn failed(&self) -> impl Iterator<Item = &ScenarioOutcome> {
        self.outcomes.iter().filter(|o| !o.passed())
    }

    /// Every scenario passed. Teardown errors do not count against it.
    pub fn is_success(&self) -> bool {
        self.failed().next().is_none()
    }

    /// Failed scenarios with their full error text.
    pub fn failure_summary(&self) -> String {
        self.failed()
            .filter_map(|o| o.result.as_ref().err().map(|e| format!("{}: {}", o.name, e)))
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

/// Two fixtures (anonymous and basic-auth) plus a driver wired to a
/// suite-private credential store. Fixtures are released on every exit path,
/// including panics, through `Drop`.
pub struct Suite {
    config: SuiteConfig,
    driver: CliDriver,
    credentials: CredentialStore,
    registry: RegistryFixture,
    auth_registry: RegistryFixture,
    auth_credentials: Credentials,
    copy_source: String,
    copy_source_is_local: bool,
    outcomes: Vec<ScenarioOutcome>,
    torn_down: bool,
}

fn join_startup(
    handle: thread::ScopedJoinHandle<'_, Result<RegistryFixture>>,
) -> Result<RegistryFixture> {
    handle
        .join()
        .unwrap_or_else(|payload| Err(std::io::Error::other(panic_message(payload)).into()))
}

impl Suite {
    /// Checks the binary and starts both fixtures. Any error here is fatal:
    /// no scenario can run without them.
    pub fn set_up(config: SuiteConfig) -> Result<Self> {
        let credentials = CredentialStore::temporary()?;
        let driver = CliDriver::new(config.binary.clone())?
            .with_timeout(config.invocation_timeout)
            .with_credential_store(&credentials);
        let resolved = driver.check_binary()?;
        info!("Driving {}", resolved.display());

        let (registry, auth_registry) = thread::scope(|s| {
            let plain = s.spawn(|| RegistryFixture::start_at(&config.address, false, config.tls));
            let auth = s.spawn(|| RegistryFixture::start_at(&config.auth_address, true, config.tls));
            (join_startup(plain), join_startup(auth))
        });
        let registry = registry?;
        let auth_registry = auth_registry?;

        let auth_credentials = auth_registry.credentials().cloned().ok_or_else(|| {
            HarnessError::CredentialStore(format!(
                "fixture {} has no credentials",
                auth_registry.address()
            ))
        })?;

        let (copy_source, copy_source_is_local) = match &config.copy_source {
            Some(source) => (source.clone(), false),
            None => {
                registry.seed_image(SEED_REPO, SEED_TAG)?;
                (registry.reference(SEED_REPO, SEED_TAG), true)
            }
        };

        Ok(Self {
            config,
            driver,
            credentials,
            registry,
            auth_registry,
            auth_credentials,
            copy_source,
            copy_source_is_local,
            outcomes: Vec::new(),
            torn_down: false,
        })
    }

    pub fn config(&self) -> &SuiteConfig {
        &self.config
    }

    pub fn driver(&self) -> &CliDriver {
        &self.driver
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    /// The fixture that accepts anonymous requests.
    pub fn registry(&self) -> &RegistryFixture {
        &self.registry
    }

    /// The fixture that requires basic auth.
    pub fn auth_registry(&self) -> &RegistryFixture {
        &self.auth_registry
    }

    pub fn auth_credentials(&self) -> &Credentials {
        &self.auth_credentials
    }

    /// Arguments of a `copy` from the configured source to `destination`.
    pub fn copy_args(&self, destination: &str) -> Vec<String> {
        let mut args = vec!["copy".to_string()];
        if self.copy_source_is_local {
            args.push("--src-tls-verify=false".to_string());
        }
        args.push("--dest-tls-verify=false".to_string());
        args.push(self.copy_source.clone());
        args.push(destination.to_string());
        args
    }

    /// Runs one scenario and records its outcome. A panic inside the scenario
    /// is recorded as a failure; sibling scenarios still run.
    pub fn run(&mut self, scenario: &Scenario) -> &ScenarioOutcome {
        info!("Running scenario {}", scenario.name);
        let started = Instant::now();
        let suite: &Suite = self;
        let result = match panic::catch_unwind(AssertUnwindSafe(|| (scenario.run)(suite))) {
            Ok(result) => result,
            Err(payload) => Err(HarnessError::ScenarioPanicked(panic_message(payload))),
        };
        let elapsed = started.elapsed();

        match &result {
            Ok(()) => info!("Scenario {} passed in {:?}", scenario.name, elapsed),
            Err(e) => warn!("Scenario {} failed: {}", scenario.name, e),
        }
        self.discard_residual_logins(scenario.name);

        self.outcomes.push(ScenarioOutcome {
            name: scenario.name.to_string(),
            result,
            elapsed,
        });
        &self.outcomes[self.outcomes.len() - 1]
    }

    pub fn run_all(&mut self, scenarios: &[Scenario]) {
        for scenario in scenarios {
            self.run(scenario);
        }
    }

    pub fn outcomes(&self) -> &[ScenarioOutcome] {
        &self.outcomes
    }

    fn discard_residual_logins(&self, scenario: &str) {
        for address in [self.registry.address(), self.auth_registry.address()] {
            match self.credentials.clear(address) {
                Ok(true) => warn!("Scenario {} left a login for {} behind", scenario, address),
                Ok(false) => {}
                Err(e) => warn!("Could not reset credentials for {}: {}", address, e),
            }
        }
    }

    /// Stops both fixtures. Errors are logged and returned; a second call
    /// does nothing.
    pub fn tear_down(&mut self) -> Vec<HarnessError> {
        if self.torn_down {
            return Vec::new();
        }
        self.torn_down = true;

        let mut errors = Vec::new();
        for fixture in [&mut self.registry, &mut self.auth_registry] {
            if let Err(e) = fixture.tear_down() {
                warn!("{}", e);
                errors.push(e);
            }
        }
        errors
    }

    /// Tears down and hands back everything recorded.
    pub fn finish(mut self) -> SuiteReport {
        let teardown_errors = self.tear_down();
        SuiteReport {
            outcomes: std::mem::take(&mut self.outcomes),
            teardown_errors,
        }
    }
}

impl Drop for Suite {
    fn drop(&mut self) {
        self.tear_down();
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
