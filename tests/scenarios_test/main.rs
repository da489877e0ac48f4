//! Runs every scenario against the stand-in client in `client.rs`, once over
//! plain HTTP and once over TLS.
//!
//! The test binary doubles as the client. It copies itself into a scratch
//! directory under the client's name, and a process started under that name
//! acts as the client instead of running the suite.

mod client;

use registry_harness::{scenarios, Suite, SuiteConfig};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

fn install_client(dir: &Path) -> std::io::Result<PathBuf> {
    let target = dir.join(format!("{}{}", client::NAME, std::env::consts::EXE_SUFFIX));
    std::fs::copy(std::env::current_exe()?, &target)?;
    Ok(target)
}

/// Returns whether every scenario passed and both fixtures stopped cleanly.
fn run_scenarios(binary: &Path, tls: bool) -> bool {
    let config = SuiteConfig::new(binary.to_string_lossy())
        .with_addresses("127.0.0.1:0", "127.0.0.1:0")
        .with_invocation_timeout(Duration::from_secs(30))
        .with_tls(tls);

    let mut suite = match Suite::set_up(config) {
        Ok(suite) => suite,
        Err(e) => {
            println!("suite set up (tls: {}) ... FAILED: {}", tls, e);
            return false;
        }
    };
    let catalogue = scenarios::all();
    suite.run_all(&catalogue);
    let report = suite.finish();

    for outcome in &report.outcomes {
        let verdict = if outcome.passed() { "ok" } else { "FAILED" };
        println!("scenario {} (tls: {}) ... {}", outcome.name, tls, verdict);
    }
    if !report.is_success() {
        println!("\n{}\n", report.failure_summary());
    }
    for error in &report.teardown_errors {
        println!("teardown (tls: {}) ... FAILED: {}", tls, error);
    }

    report.is_success()
        && report.teardown_errors.is_empty()
        && report.outcomes.len() == catalogue.len()
}

fn main() -> ExitCode {
    if client::invoked() {
        return client::main();
    }
    registry_harness::telemetry::init();

    let scratch = match tempfile::tempdir() {
        Ok(dir) => dir,
        Err(e) => {
            println!("scratch directory ... FAILED: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let binary = match install_client(scratch.path()) {
        Ok(path) => path,
        Err(e) => {
            println!("client install ... FAILED: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let mut passed = true;
    for tls in [false, true] {
        passed &= run_scenarios(&binary, tls);
    }

    if passed {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
