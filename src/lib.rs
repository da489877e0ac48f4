//! Disposable container-registry fixtures and a driver that asserts on what a
//! registry client prints and how it exits.
//!
//! ```no_run
//! use registry_harness::{scenarios, Suite, SuiteConfig};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! registry_harness::telemetry::init();
//! let mut suite = Suite::set_up(SuiteConfig::from_env())?;
//! suite.run_all(&scenarios::all());
//! let report = suite.finish();
//! assert!(report.is_success(), "{}", report.failure_summary());
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod config;
pub mod credentials;
pub mod driver;
pub mod error;
pub mod fixture;
pub mod scenarios;
pub mod server;
pub mod storage;
pub mod suite;
pub mod telemetry;
pub mod tls;

pub use auth::Credentials;
pub use config::{RegistryConfig, StorageBackend, SuiteConfig};
pub use credentials::CredentialStore;
pub use driver::{CliDriver, Expectation, Invocation};
pub use error::{HarnessError, Result};
pub use fixture::RegistryFixture;
pub use server::RegistryServer;
pub use suite::{Scenario, ScenarioOutcome, Suite, SuiteReport};
