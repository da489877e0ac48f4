//! Error types for the harness.

use std::time::Duration;
use thiserror::Error;

/// Result type alias for harness operations.
pub type Result<T> = std::result::Result<T, HarnessError>;

/// Errors that can occur while provisioning fixtures or driving the binary.
#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Upload not found: {0}")]
    UploadNotFound(String),

    #[error("registry at {address} did not become reachable within {waited:?}")]
    StartupTimeout { address: String, waited: Duration },

    #[error("address {address} is already in use")]
    AddressInUse { address: String },

    #[error("registry at {address} is not running")]
    NotRunning { address: String },

    #[error("invalid fixture address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("cannot execute {binary}: {reason}")]
    ProcessInvocation { binary: String, reason: String },

    #[error("{binary} did not exit within {timeout:?}")]
    InvocationTimeout { binary: String, timeout: Duration },

    #[error(
        "assertion mismatch: expected {} with output matching\n--- pattern ---\n{expected}\n--- got {status} ---\n{output}\n--- end output ---",
        outcome_word(.expect_success)
    )]
    AssertionMismatch {
        expected: String,
        expect_success: bool,
        status: String,
        output: String,
    },

    #[error("invalid pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("TLS setup failed: {0}")]
    Tls(String),

    #[error("credential store error: {0}")]
    CredentialStore(String),

    #[error("failed to stop registry at {address}: {reason}")]
    Teardown { address: String, reason: String },

    #[error("scenario panicked: {0}")]
    ScenarioPanicked(String),
}

fn outcome_word(expect_success: &bool) -> &'static str {
    if *expect_success {
        "success"
    } else {
        "failure"
    }
}

impl HarnessError {
    /// Whether the error prevents the suite from running any scenario.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            HarnessError::StartupTimeout { .. }
                | HarnessError::AddressInUse { .. }
                | HarnessError::InvalidAddress { .. }
                | HarnessError::ProcessInvocation { .. }
                | HarnessError::Tls(_)
        )
    }
}
