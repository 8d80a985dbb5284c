//! Code Sandbox
//!
//! Executes untrusted, model-produced code in a child interpreter process.
//! The child sees only the environment values the request's tool list
//! authorizes, never the host's full environment; output is captured, and
//! a hard wall-clock timeout fails the result instead of hanging the loop.
//!
//! The sandbox does not interpret what the code does. Side effects happen
//! inside the executed code and are reported back through its printed
//! output; the sandbox only isolates execution and captures results.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::fs;
use tokio::process::Command;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::SentinelError;
use crate::types::{ExecutionResult, Sandbox};

/// Fallback PATH for the child when no tool binding provides one. Without
/// it most interpreters cannot resolve their own subprocesses.
const DEFAULT_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Maximum bytes of stdout/stderr kept on a result.
const MAX_CAPTURED_OUTPUT: usize = 64 * 1024;

/// Executes generated code by spawning the configured interpreter on a
/// scratch file with a cleared environment.
pub struct ProcessSandbox {
    interpreter: String,
    scratch_dir: PathBuf,
    timeout: Duration,
}

impl ProcessSandbox {
    pub fn new(interpreter: impl Into<String>, scratch_dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            interpreter: interpreter.into(),
            scratch_dir: scratch_dir.into(),
            timeout,
        }
    }
}

#[async_trait]
impl Sandbox for ProcessSandbox {
    async fn execute(&self, code: &str, env: &BTreeMap<String, String>) -> ExecutionResult {
        let started = Instant::now();

        if let Err(e) = fs::create_dir_all(&self.scratch_dir).await {
            return ExecutionResult::failed(format!(
                "failed to create scratch dir {}: {}",
                self.scratch_dir.display(),
                e
            ));
        }

        let script_path = self.scratch_dir.join(format!("exec-{}.src", Uuid::new_v4()));
        if let Err(e) = fs::write(&script_path, code).await {
            return ExecutionResult::failed(format!(
                "failed to write code to {}: {}",
                script_path.display(),
                e
            ));
        }

        let mut cmd = Command::new(&self.interpreter);
        cmd.arg(&script_path)
            .env_clear()
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if !env.contains_key("PATH") {
            cmd.env("PATH", DEFAULT_PATH);
        }

        debug!(
            "Executing generated code ({} bytes) with {} env values bound",
            code.len(),
            env.len()
        );

        let outcome = tokio::time::timeout(self.timeout, cmd.output()).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        if let Err(e) = fs::remove_file(&script_path).await {
            warn!("Failed to remove scratch file {}: {}", script_path.display(), e);
        }

        match outcome {
            // Timeout: kill_on_drop reaps the child when the future drops.
            Err(_) => ExecutionResult {
                success: false,
                stdout: String::new(),
                stderr: String::new(),
                findings: None,
                error: Some(
                    SentinelError::ExecutionFailure(format!(
                        "timed out after {}s",
                        self.timeout.as_secs()
                    ))
                    .to_string(),
                ),
                duration_ms,
            },
            Ok(Err(e)) => ExecutionResult {
                success: false,
                stdout: String::new(),
                stderr: String::new(),
                findings: None,
                error: Some(
                    SentinelError::ExecutionFailure(format!(
                        "failed to spawn {}: {}",
                        self.interpreter, e
                    ))
                    .to_string(),
                ),
                duration_ms,
            },
            Ok(Ok(output)) => {
                let stdout = truncate(String::from_utf8_lossy(&output.stdout).into_owned());
                let stderr = truncate(String::from_utf8_lossy(&output.stderr).into_owned());
                let success = output.status.success();

                let error = if success {
                    None
                } else {
                    let code_desc = output
                        .status
                        .code()
                        .map(|c| c.to_string())
                        .unwrap_or_else(|| "killed by signal".to_string());
                    Some(format!(
                        "process exited with status {}: {}",
                        code_desc,
                        last_lines(&stderr, 20)
                    ))
                };

                ExecutionResult {
                    findings: if success { extract_findings(&stdout) } else { None },
                    success,
                    stdout,
                    stderr,
                    error,
                    duration_ms,
                }
            }
        }
    }
}

/// Pull structured findings out of captured stdout: the last line that
/// parses as a JSON object. Generated code reports its results by printing
/// a JSON summary as its final output.
pub fn extract_findings(stdout: &str) -> Option<serde_json::Value> {
    stdout
        .lines()
        .rev()
        .map(str::trim)
        .filter(|line| line.starts_with('{'))
        .find_map(|line| {
            serde_json::from_str::<serde_json::Value>(line)
                .ok()
                .filter(|v| v.is_object())
        })
}

fn truncate(mut s: String) -> String {
    if s.len() > MAX_CAPTURED_OUTPUT {
        s.truncate(MAX_CAPTURED_OUTPUT);
        s.push_str("\n...[truncated]");
    }
    s
}

fn last_lines(s: &str, n: usize) -> String {
    let lines: Vec<&str> = s.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}
