//! Bounded subprocess execution
//!
//! Every system tool the agent drives (`ip`, `wg`, `birdc`, `iptables`,
//! `ping`, `traceroute`) goes through here: async spawn, captured output,
//! wall-clock deadline. On timeout the child is killed and the caller sees
//! a timeout result rather than a hung future.

use crate::AgentError;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, error};

/// Captured result of a finished command.
#[derive(Debug, Clone)]
pub struct CmdOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Run a command with a deadline. `Err` means the tool could not be
/// spawned (not installed, permission denied) or the deadline elapsed.
pub async fn run(program: &str, args: &[&str], limit: Duration) -> Result<CmdOutput, AgentError> {
    run_with_stdin(program, args, None, limit).await
}

/// Like [`run`], optionally feeding data on stdin.
pub async fn run_with_stdin(
    program: &str,
    args: &[&str],
    stdin_data: Option<&str>,
    limit: Duration,
) -> Result<CmdOutput, AgentError> {
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(if stdin_data.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command
        .spawn()
        .map_err(|e| AgentError::Executor(format!("spawn {program}: {e}")))?;

    if let Some(data) = stdin_data {
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(data.as_bytes())
                .await
                .map_err(|e| AgentError::Executor(format!("{program} stdin: {e}")))?;
        }
    }

    // kill_on_drop reaps the child when the timeout drops the future.
    let output = tokio::time::timeout(limit, child.wait_with_output())
        .await
        .map_err(|_| AgentError::Executor(format!("{program} timed out after {limit:?}")))?
        .map_err(|e| AgentError::Executor(format!("{program}: {e}")))?;

    Ok(CmdOutput {
        success: output.status.success(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Diagnostic helper: stdout on success, stderr on failure, `None` on
/// timeout or missing tool. Mirrors what the operator endpoints report.
pub async fn capture(program: &str, args: &[&str], limit: Duration) -> Option<String> {
    match run(program, args, limit).await {
        Ok(out) if out.success => Some(out.stdout),
        Ok(out) => Some(out.stderr),
        Err(e) => {
            debug!(program, error = %e, "command unavailable or timed out");
            None
        }
    }
}

/// Fire-and-check helper for idempotent mutations; logs failures.
pub async fn run_ok(program: &str, args: &[&str], limit: Duration) -> bool {
    match run(program, args, limit).await {
        Ok(out) => out.success,
        Err(e) => {
            error!(program, error = %e, "command failed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_captures_stdout() {
        let out = run("echo", &["hello"], Duration::from_secs(5)).await.unwrap();
        assert!(out.success);
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn test_run_reports_failure() {
        let out = run("false", &[], Duration::from_secs(5)).await.unwrap();
        assert!(!out.success);
    }

    #[tokio::test]
    async fn test_missing_tool_is_error() {
        let err = run("definitely-not-a-real-tool", &[], Duration::from_secs(1)).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn test_timeout_kills_child() {
        let start = std::time::Instant::now();
        let err = run("sleep", &["30"], Duration::from_millis(200)).await;
        assert!(err.is_err());
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_stdin_roundtrip() {
        let out = run_with_stdin("cat", &[], Some("key-material"), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out.stdout, "key-material");
    }

    #[tokio::test]
    async fn test_capture_returns_none_for_missing_tool() {
        assert!(capture("definitely-not-a-real-tool", &[], Duration::from_secs(1))
            .await
            .is_none());
    }
}
