//! End-to-end scenarios for a registry client such as `skopeo`.
//!
//! Each scenario is independent; the ones that log in also log out.

use crate::driver::Expectation;
use crate::error::{HarnessError, Result};
use crate::suite::{Scenario, Suite};
use std::path::Path;

const UNAUTHORIZED: &str = ".*unauthorized: authentication required.*";
const DEFAULT_CERT_DIR: &str = "/etc/docker/certs.d/";

/// All scenarios, in a stable order. Order does not affect outcomes.
pub fn all() -> Vec<Scenario> {
    vec![
        Scenario::new("version", version),
        Scenario::new("can_auth_to_private_registry_with_creds", can_auth_with_creds),
        Scenario::new("need_auth_to_private_registry_without_creds", need_auth_without_creds),
        Scenario::new("cert_dir_instead_of_cert_path", cert_dir_instead_of_cert_path),
        Scenario::new("no_auth_registry_image_not_found", no_auth_image_not_found),
        Scenario::new("inspect_fails_when_reference_is_invalid", invalid_reference),
        Scenario::new("login_logout", login_logout),
        Scenario::new("copy_with_local_auth", copy_with_local_auth),
    ]
}

fn binary_name(suite: &Suite) -> String {
    let binary = suite.driver().binary();
    Path::new(binary)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(binary)
        .to_string()
}

fn version(suite: &Suite) -> Result<()> {
    let version = suite
        .config()
        .expected_version
        .as_deref()
        .map(regex::escape)
        .unwrap_or_else(|| r"\d+\.\d+\.\d+".to_string());
    let wanted = format!(".*{} version {}.*", regex::escape(&binary_name(suite)), version);
    suite.driver().assert_succeeds(&wanted, ["--version"])?;
    Ok(())
}

/// Correct credentials get past auth, so the missing image is reported as such.
fn can_auth_with_creds(suite: &Suite) -> Result<()> {
    let registry = suite.auth_registry();
    let creds = format!("--creds={}", suite.auth_credentials().creds_arg());
    suite.driver().assert_fails(
        ".*manifest unknown: manifest unknown.*",
        [
            "inspect",
            "--tls-verify=false",
            creds.as_str(),
            registry.reference("busybox", "latest").as_str(),
        ],
    )?;
    Ok(())
}

fn need_auth_without_creds(suite: &Suite) -> Result<()> {
    let reference = suite.auth_registry().reference("busybox", "latest");
    suite
        .driver()
        .assert_fails(UNAUTHORIZED, ["inspect", "--tls-verify=false", reference.as_str()])?;
    Ok(())
}

/// `--cert-path` is gone; `--cert-dir` is accepted and the request reaches auth.
fn cert_dir_instead_of_cert_path(suite: &Suite) -> Result<()> {
    let registry = suite.auth_registry();
    let reference = registry.reference("busybox", "latest");
    suite.driver().assert_fails(
        ".*unknown flag: --cert-path.*",
        ["inspect", "--tls-verify=false", reference.as_str(), "--cert-path=/"],
    )?;

    let cert_dir = registry
        .cert_dir()
        .and_then(|d| d.to_str())
        .unwrap_or(DEFAULT_CERT_DIR);
    suite.driver().assert_fails(
        UNAUTHORIZED,
        [
            "inspect",
            "--tls-verify=false",
            reference.as_str(),
            format!("--cert-dir={}", cert_dir).as_str(),
        ],
    )?;
    Ok(())
}

/// "not found" and "auth required" must never be confused.
fn no_auth_image_not_found(suite: &Suite) -> Result<()> {
    let reference = suite.registry().reference("busybox", "latest");
    let invocation = suite
        .driver()
        .run(["inspect", "--tls-verify=false", reference.as_str()])?;
    Expectation::failure(".*manifest unknown.*")?.check(&invocation)?;
    invocation.assert_not_matches(UNAUTHORIZED)?;
    Ok(())
}

fn invalid_reference(suite: &Suite) -> Result<()> {
    suite
        .driver()
        .assert_fails(".*Invalid image name.*", ["inspect", "unknown"])?;
    Ok(())
}

fn login(suite: &Suite) -> Result<()> {
    let address = suite.auth_registry().address();
    let creds = suite.auth_credentials();
    suite.driver().assert_succeeds(
        "^Login Succeeded!\n$",
        [
            "login",
            "--tls-verify=false",
            format!("--username={}", creds.username).as_str(),
            format!("--password={}", creds.password).as_str(),
            address,
        ],
    )?;

    if suite.credentials().get(address)?.as_ref() != Some(creds) {
        return Err(HarnessError::CredentialStore(format!(
            "login did not store credentials for {} in {}",
            address,
            suite.credentials().path().display()
        )));
    }
    Ok(())
}

fn logout(suite: &Suite) -> Result<()> {
    let address = suite.auth_registry().address();
    suite.driver().assert_succeeds(
        &format!("^Removed login credentials for {}\n$", regex::escape(address)),
        ["logout", address],
    )?;

    if suite.credentials().get(address)?.is_some() {
        return Err(HarnessError::CredentialStore(format!(
            "logout left credentials for {} behind",
            address
        )));
    }
    Ok(())
}

fn login_logout(suite: &Suite) -> Result<()> {
    let address = suite.auth_registry().address();
    login(suite)?;

    let username = regex::escape(&suite.auth_credentials().username);
    suite.driver().assert_succeeds(
        &format!("^{}\n$", username),
        ["login", "--tls-verify=false", "--get-login", address],
    )?;

    logout(suite)
}

/// login, copy in, inspect, logout, then the same inspect must be refused.
fn copy_with_local_auth(suite: &Suite) -> Result<()> {
    login(suite)?;

    let image = suite.auth_registry().reference("busybox", "mine");
    suite.driver().assert_succeeds("", suite.copy_args(&image))?;
    suite
        .driver()
        .assert_succeeds("", ["inspect", "--tls-verify=false", image.as_str()])?;

    logout(suite)?;

    suite
        .driver()
        .assert_fails(UNAUTHORIZED, ["inspect", "--tls-verify=false", image.as_str()])?;
    Ok(())
}
