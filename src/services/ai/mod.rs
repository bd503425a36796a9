//! AI command-line tool integration.
//!
//! Each task is executed by spawning the configured tool as a child
//! process, writing the prompt to its stdin, and capturing stdout/stderr
//! verbatim. Success is exit code 0; a rate limit is detected from known
//! stderr signatures. The worker owns the timeout and kill policy; this
//! module owns the child's stdio plumbing.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};

use crate::config::AiToolConfig;
use crate::error::RepoPilotError;
use crate::Result;

/// One execution request for the AI tool.
pub struct AiRequest<'a> {
    /// Prompt written to the child's stdin
    pub prompt: &'a str,
    /// Working directory for the child (project checkout)
    pub working_dir: Option<&'a Path>,
    /// Environment overlay applied on top of the daemon's environment
    pub env: &'a HashMap<String, String>,
}

/// Captured output of a finished child.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Spawns the configured AI tool for task execution.
#[derive(Debug, Clone)]
pub struct AiToolRunner {
    command: String,
    args: Vec<String>,
}

impl AiToolRunner {
    /// Build a runner from configuration.
    pub fn from_config(config: &AiToolConfig) -> Self {
        Self {
            command: config.command.clone(),
            args: config.args.clone(),
        }
    }

    /// Build a runner with an explicit command line (tests).
    pub fn new(command: &str, args: &[&str]) -> Self {
        Self {
            command: command.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Spawn the tool and feed it the prompt.
    ///
    /// The child is detached from our lifetime: it is NOT killed when the
    /// handle drops, so an in-flight execution survives daemon shutdown.
    pub async fn spawn(&self, request: AiRequest<'_>) -> Result<RunningTool> {
        let mut command = Command::new(&self.command);
        command
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false);
        if let Some(dir) = request.working_dir {
            command.current_dir(dir);
        }
        for (key, value) in request.env {
            command.env(key, value);
        }

        let mut child = command.spawn().map_err(|e| {
            RepoPilotError::ai_tool(format!("failed to spawn '{}': {}", self.command, e))
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(request.prompt.as_bytes())
                .await
                .map_err(|e| RepoPilotError::ai_tool(format!("failed to write prompt: {}", e)))?;
            // Dropping stdin closes the pipe so the tool sees EOF
        }

        // Drain stdout/stderr in the background so a chatty child cannot
        // deadlock on a full pipe while we wait for its exit
        let stdout = tokio::spawn(drain(child.stdout.take()));
        let stderr = tokio::spawn(drain(child.stderr.take()));

        Ok(RunningTool {
            child,
            exit_code: None,
            stdout,
            stderr,
        })
    }
}

async fn drain<R: tokio::io::AsyncRead + Unpin>(stream: Option<R>) -> String {
    use tokio::io::AsyncReadExt;
    let mut buf = String::new();
    if let Some(mut s) = stream {
        let _ = s.read_to_string(&mut buf).await;
    }
    buf
}

/// Handle to a spawned, still-running AI tool child.
pub struct RunningTool {
    child: Child,
    exit_code: Option<i32>,
    stdout: tokio::task::JoinHandle<String>,
    stderr: tokio::task::JoinHandle<String>,
}

impl RunningTool {
    /// OS process id of the child, while it is still running.
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Wait for the child to exit and return its exit code.
    ///
    /// Cancel safe: a caller may wrap this in a timeout, observe the
    /// stall, and call it again without losing the exit status.
    pub async fn wait_exit(&mut self) -> Result<i32> {
        if let Some(code) = self.exit_code {
            return Ok(code);
        }
        let status = self
            .child
            .wait()
            .await
            .map_err(|e| RepoPilotError::ai_tool(format!("wait failed: {}", e)))?;
        let code = status.code().unwrap_or(-1);
        self.exit_code = Some(code);
        Ok(code)
    }

    /// Collect the exited child's full output.
    pub async fn into_output(mut self) -> Result<ToolOutput> {
        let exit_code = self.wait_exit().await?;
        let stdout = self.stdout.await.unwrap_or_default();
        let stderr = self.stderr.await.unwrap_or_default();
        Ok(ToolOutput {
            exit_code,
            stdout,
            stderr,
        })
    }

    /// Ask the child to stop: graceful signal first, force kill after the
    /// grace period if it is still alive.
    pub async fn terminate(&mut self, grace: Duration) {
        #[cfg(unix)]
        if let Some(pid) = self.child.id() {
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
            let deadline = tokio::time::Instant::now() + grace;
            loop {
                match self.child.try_wait() {
                    Ok(Some(_)) => return,
                    Ok(None) if tokio::time::Instant::now() < deadline => {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                    _ => break,
                }
            }
        }
        let _ = self.child.start_kill();
        let _ = self.child.wait().await;
    }
}

/// Whether stderr output matches a known AI-tool rate-limit signature.
pub fn is_rate_limit_signature(stderr: &str) -> bool {
    static SIGNATURES: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"(?i)rate.?limit|usage limit|too many requests|overloaded|\b429\b").unwrap()
    });
    SIGNATURES.is_match(stderr)
}
