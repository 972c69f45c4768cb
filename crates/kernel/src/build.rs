use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{info, warn};

use crate::error::{Error, Result};

/// Boxed future returned by `BuildTool::build` (for dyn compatibility).
pub type BuildFuture<'a> = Pin<Box<dyn Future<Output = Result<BuildReport>> + Send + 'a>>;

// ---------------------------------------------------------------------------
// DiagnosticPolicy — how build output is classified
// ---------------------------------------------------------------------------

/// What to do with the build process's own exit status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitStatusPolicy {
    /// Exit status is ignored; only the diagnostic marker decides.
    #[default]
    Ignore,
    /// A non-zero (or missing) exit status also counts as failure.
    Fail,
}

/// Textual build classification.
///
/// A build has failed iff its combined output contains `marker`. This is a
/// heuristic: a marker that shows up in ordinary output (a test named
/// `handles_error:` for example) is read as a failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticPolicy {
    pub marker: String,
    #[serde(default = "default_true")]
    pub case_sensitive: bool,
    #[serde(default)]
    pub exit_status: ExitStatusPolicy,
}

fn default_true() -> bool {
    true
}

impl Default for DiagnosticPolicy {
    fn default() -> Self {
        Self {
            marker: "error:".into(),
            case_sensitive: true,
            exit_status: ExitStatusPolicy::Ignore,
        }
    }
}

impl DiagnosticPolicy {
    /// True if `output` contains the diagnostic marker.
    pub fn has_marker(&self, output: &str) -> bool {
        if self.case_sensitive {
            output.contains(self.marker.as_str())
        } else {
            output
                .to_lowercase()
                .contains(self.marker.to_lowercase().as_str())
        }
    }

    /// Classify a finished build. `exit_code` is `None` when the process was
    /// killed by a signal.
    pub fn succeeded(&self, output: &str, exit_code: Option<i32>) -> bool {
        if self.has_marker(output) {
            return false;
        }
        match self.exit_status {
            ExitStatusPolicy::Ignore => true,
            ExitStatusPolicy::Fail => exit_code == Some(0),
        }
    }
}

// ---------------------------------------------------------------------------
// BuildReport
// ---------------------------------------------------------------------------

/// Result of one build invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildReport {
    /// Stdout and stderr, interleaved as the process wrote them.
    pub combined_output: String,

    /// Classification under the active `DiagnosticPolicy`.
    pub succeeded: bool,

    /// Process exit code (informational unless the policy says otherwise).
    #[serde(default)]
    pub exit_code: Option<i32>,

    /// Wall-clock duration in milliseconds.
    #[serde(default)]
    pub duration_ms: u64,
}

impl BuildReport {
    pub fn classify(
        combined_output: String,
        exit_code: Option<i32>,
        duration_ms: u64,
        policy: &DiagnosticPolicy,
    ) -> Self {
        let succeeded = policy.succeeded(&combined_output, exit_code);
        Self {
            combined_output,
            succeeded,
            exit_code,
            duration_ms,
        }
    }
}

// ---------------------------------------------------------------------------
// BuildTool — the external toolchain seam
// ---------------------------------------------------------------------------

/// Runs the project build and reports its output.
///
/// `Err` is reserved for builds that could not run at all (spawn failure,
/// timeout). A build that ran and printed diagnostics is `Ok` with
/// `succeeded: false`.
pub trait BuildTool: Send + Sync {
    fn build(&self) -> BuildFuture<'_>;

    /// Short description for logs and status output.
    fn describe(&self) -> String;
}

/// Runs a shell command line as the build.
pub struct ShellBuild {
    command: String,
    working_dir: PathBuf,
    timeout: Duration,
    policy: DiagnosticPolicy,
}

impl ShellBuild {
    pub fn new(
        command: String,
        working_dir: PathBuf,
        timeout: Duration,
        policy: DiagnosticPolicy,
    ) -> Self {
        Self {
            command,
            working_dir,
            timeout,
            policy,
        }
    }

    /// The directory the build runs in.
    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub fn policy(&self) -> &DiagnosticPolicy {
        &self.policy
    }

    async fn run(&self) -> Result<BuildReport> {
        // Redirect the shell's stderr into stdout before running the command so
        // both streams land in one pipe in write order.
        let script = format!("exec 2>&1\n{}", self.command);

        info!(command = %self.command, dir = %self.working_dir.display(), "build: starting");
        let start = Instant::now();

        let output = tokio::time::timeout(
            self.timeout,
            Command::new("sh")
                .arg("-c")
                .arg(&script)
                .current_dir(&self.working_dir)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| Error::Build {
            reason: format!(
                "command `{}` timed out after {}s",
                self.command,
                self.timeout.as_secs()
            ),
        })?
        .map_err(|e| Error::Build {
            reason: format!("failed to start `{}`: {e}", self.command),
        })?;

        let duration_ms = start.elapsed().as_millis() as u64;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.is_empty() {
            combined.push_str(&stderr);
        }

        let exit_code = output.status.code();
        let report = BuildReport::classify(combined, exit_code, duration_ms, &self.policy);

        if report.succeeded && exit_code != Some(0) {
            warn!(
                ?exit_code,
                marker = %self.policy.marker,
                "build: classified clean but exited non-zero (toolchain missing or crashed?)"
            );
        }
        info!(
            succeeded = report.succeeded,
            ?exit_code,
            duration_ms,
            output_bytes = report.combined_output.len(),
            "build: finished"
        );

        Ok(report)
    }
}

impl BuildTool for ShellBuild {
    fn build(&self) -> BuildFuture<'_> {
        Box::pin(self.run())
    }

    fn describe(&self) -> String {
        format!("sh -c `{}` in {}", self.command, self.working_dir.display())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
