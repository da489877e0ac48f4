//! End-to-end run against a real registry client.
//!
//! Needs `skopeo` (or `REGISTRY_HARNESS_BINARY`) on `PATH`:
//!
//! ```sh
//! cargo test --test skopeo_test -- --ignored
//! ```

use registry_harness::{scenarios, Suite, SuiteConfig};

#[test]
#[ignore = "requires skopeo"]
fn test_all_scenarios_against_skopeo() {
    registry_harness::telemetry::init();

    let mut suite = Suite::set_up(SuiteConfig::from_env()).unwrap();
    suite.run_all(&scenarios::all());
    let report = suite.finish();

    for outcome in &report.outcomes {
        println!(
            "{:<48} {} ({:?})",
            outcome.name,
            if outcome.passed() { "ok" } else { "FAILED" },
            outcome.elapsed
        );
    }
    assert!(report.is_success(), "{}", report.failure_summary());
    assert!(report.teardown_errors.is_empty(), "{:?}", report.teardown_errors);
}

#[test]
#[ignore = "requires skopeo"]
fn test_auth_scenarios_over_tls() {
    registry_harness::telemetry::init();

    let config = SuiteConfig::from_env().with_addresses("127.0.0.1:0", "127.0.0.1:0");
    let mut suite = Suite::set_up(config.with_tls(true)).unwrap();
    let selected = scenarios::all()
        .into_iter()
        .filter(|s| s.name.contains("auth"))
        .collect::<Vec<_>>();
    suite.run_all(&selected);

    let report = suite.finish();
    assert!(report.is_success(), "{}", report.failure_summary());
}
