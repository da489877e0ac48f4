//! Runs the binary under test and judges what a user would see.
//!
//! stdout and stderr are read concurrently into one buffer in arrival order,
//! so patterns are matched against the combined text. Patterns are anchored
//! to the whole output and `.` matches newlines.

use crate::credentials::{CredentialStore, AUTH_FILE_ENV};
use crate::error::{HarnessError, Result};
use regex::Regex;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::runtime::Runtime;
use tracing::debug;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Compiles `pattern` for whole-text, dot-matches-newline matching.
pub fn compile_pattern(pattern: &str) -> Result<Regex> {
    Regex::new(&format!("(?s)^(?:{})$", pattern)).map_err(|source| HarnessError::InvalidPattern {
        pattern: pattern.to_string(),
        source,
    })
}

/// One finished run of the binary.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub binary: String,
    pub arguments: Vec<String>,
    pub output: String,
    pub status: ExitStatus,
}

impl Invocation {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    pub fn status_description(&self) -> String {
        match self.status.code() {
            Some(code) => format!("exit status {}", code),
            None => "termination by signal".to_string(),
        }
    }

    pub fn matches(&self, pattern: &str) -> Result<bool> {
        Ok(compile_pattern(pattern)?.is_match(&self.output))
    }

    /// Fails unless the output matches `pattern`.
    pub fn assert_matches(&self, pattern: &str) -> Result<()> {
        if self.matches(pattern)? {
            Ok(())
        } else {
            Err(self.mismatch(pattern.to_string(), self.success()))
        }
    }

    /// Fails if the output matches `pattern`.
    pub fn assert_not_matches(&self, pattern: &str) -> Result<()> {
        if self.matches(pattern)? {
            Err(self.mismatch(format!("anything but: {}", pattern), self.success()))
        } else {
            Ok(())
        }
    }

    fn mismatch(&self, expected: String, expect_success: bool) -> HarnessError {
        HarnessError::AssertionMismatch {
            expected,
            expect_success,
            status: self.status_description(),
            output: self.output.clone(),
        }
    }
}

/// An expected exit outcome plus an output pattern. An empty pattern checks
/// the exit outcome only.
#[derive(Debug, Clone)]
pub struct Expectation {
    pattern: String,
    regex: Option<Regex>,
    expect_success: bool,
}

impl Expectation {
    pub fn success(pattern: &str) -> Result<Self> {
        Self::new(pattern, true)
    }

    pub fn failure(pattern: &str) -> Result<Self> {
        Self::new(pattern, false)
    }

    fn new(pattern: &str, expect_success: bool) -> Result<Self> {
        let regex = if pattern.is_empty() {
            None
        } else {
            Some(compile_pattern(pattern)?)
        };
        Ok(Self {
            pattern: pattern.to_string(),
            regex,
            expect_success,
        })
    }

    pub fn check(&self, invocation: &Invocation) -> Result<()> {
        let output_ok = self
            .regex
            .as_ref()
            .map_or(true, |regex| regex.is_match(&invocation.output));
        if invocation.success() == self.expect_success && output_ok {
            Ok(())
        } else {
            Err(invocation.mismatch(self.pattern.clone(), self.expect_success))
        }
    }
}

/// Synchronous driver for the binary under test.
pub struct CliDriver {
    binary: String,
    envs: Vec<(OsString, OsString)>,
    timeout: Duration,
    runtime: Runtime,
}

impl CliDriver {
    pub fn new(binary: impl Into<String>) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        Ok(Self {
            binary: binary.into(),
            envs: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
            runtime,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Routes the binary's login state into `store`.
    pub fn with_credential_store(self, store: &CredentialStore) -> Self {
        self.with_env(AUTH_FILE_ENV, store.path())
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    /// Resolves the binary on `PATH`, failing with `ProcessInvocation` if absent.
    pub fn check_binary(&self) -> Result<PathBuf> {
        locate(&self.binary).ok_or_else(|| HarnessError::ProcessInvocation {
            binary: self.binary.clone(),
            reason: "not found or not executable".to_string(),
        })
    }

    /// Runs the binary to completion without judging the outcome.
    ///
    /// Output is read until both pipes close, not just until the child
    /// exits. A background process that inherits stdout or stderr keeps the
    /// invocation open, and it ends in `InvocationTimeout` if that process
    /// outlives the timeout.
    pub fn run<I, S>(&self, args: I) -> Result<Invocation>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let arguments: Vec<String> = args.into_iter().map(|a| a.as_ref().to_string()).collect();
        debug!("Running {} {}", self.binary, arguments.join(" "));
        let started = Instant::now();
        let invocation = self.runtime.block_on(capture(
            &self.binary,
            arguments,
            &self.envs,
            self.timeout,
        ))?;
        debug!(
            "{} finished with {} after {:?}",
            self.binary,
            invocation.status_description(),
            started.elapsed()
        );
        Ok(invocation)
    }

    /// Runs the binary and fails unless it exits successfully with output
    /// matching `pattern`.
    pub fn assert_succeeds<I, S>(&self, pattern: &str, args: I) -> Result<Invocation>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let expectation = Expectation::success(pattern)?;
        let invocation = self.run(args)?;
        expectation.check(&invocation)?;
        Ok(invocation)
    }

    /// Runs the binary and fails unless it exits with an error and output
    /// matching `pattern`.
    pub fn assert_fails<I, S>(&self, pattern: &str, args: I) -> Result<Invocation>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let expectation = Expectation::failure(pattern)?;
        let invocation = self.run(args)?;
        expectation.check(&invocation)?;
        Ok(invocation)
    }
}

async fn capture(
    binary: &str,
    arguments: Vec<String>,
    envs: &[(OsString, OsString)],
    timeout: Duration,
) -> Result<Invocation> {
    let invocation_error = |reason: String| HarnessError::ProcessInvocation {
        binary: binary.to_string(),
        reason,
    };

    let mut child = tokio::process::Command::new(binary)
        .args(&arguments)
        .envs(envs.iter().map(|(k, v)| (k, v)))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| invocation_error(e.to_string()))?;

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| invocation_error("stdout not captured".to_string()))?;
    let mut stderr = child
        .stderr
        .take()
        .ok_or_else(|| invocation_error("stderr not captured".to_string()))?;

    let collect = async {
        let mut combined = Vec::new();
        let mut out_buf = [0u8; 8192];
        let mut err_buf = [0u8; 8192];
        let (mut out_open, mut err_open) = (true, true);
        while out_open || err_open {
            tokio::select! {
                read = stdout.read(&mut out_buf), if out_open => match read? {
                    0 => out_open = false,
                    n => combined.extend_from_slice(&out_buf[..n]),
                },
                read = stderr.read(&mut err_buf), if err_open => match read? {
                    0 => err_open = false,
                    n => combined.extend_from_slice(&err_buf[..n]),
                },
            }
        }
        let status = child.wait().await?;
        Ok::<_, std::io::Error>((combined, status))
    };

    let outcome = tokio::time::timeout(timeout, collect).await;
    match outcome {
        Ok(Ok((combined, status))) => Ok(Invocation {
            binary: binary.to_string(),
            arguments,
            output: String::from_utf8_lossy(&combined).into_owned(),
            status,
        }),
        Ok(Err(e)) => Err(invocation_error(e.to_string())),
        Err(_) => {
            let _ = child.kill().await;
            Err(HarnessError::InvocationTimeout {
                binary: binary.to_string(),
                timeout,
            })
        }
    }
}

/// Finds `binary` either as a path or on `PATH`.
pub fn locate(binary: &str) -> Option<PathBuf> {
    let candidate = Path::new(binary);
    if candidate.components().count() > 1 {
        return is_executable(candidate).then(|| candidate.to_path_buf());
    }
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(binary))
        .find(|path| is_executable(path))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
