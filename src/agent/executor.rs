//! §4.9 Session executor: marker-framed command execution through a
//! terminal-multiplexer pane (so working directory and environment persist
//! across calls), with a non-mux fresh-child-process fallback.
//!
//! Grounded on the teacher's subprocess-management idiom in
//! `git_worktree.rs` (`Command::new(...).args([...]).output()`, status
//! checked explicitly), generalized to `tokio::process::Command` for the
//! async exec path; the marker algorithm itself is `spec.md` §4.9,
//! implemented as specified. Marker parsing uses `regex` (the teacher's own
//! dependency).

use std::time::Duration;

use anyhow::{Context, Result};
use regex::Regex;
use tokio::process::Command;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::bootstrap::shell_quote;
use crate::logging::agent_log;

const SESSION_NAME: &str = "nanobot";
const DEFAULT_EXEC_TIMEOUT_SECS: u64 = 60;
const POLL_INTERVAL_MS: u64 = 150;

pub struct ExecOutcome {
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
    pub exit_code: Option<i32>,
}

/// Owns the on-host multiplexer session (when enabled) and serializes exec
/// calls against it - "exec handlers for a given connection are serialized"
/// (`spec.md` §5).
pub struct SessionExecutor {
    mux_enabled: bool,
    session_dir: std::path::PathBuf,
    started: Mutex<bool>,
}

impl SessionExecutor {
    pub fn new(mux_enabled: bool, session_dir: std::path::PathBuf) -> Self {
        Self {
            mux_enabled,
            session_dir,
            started: Mutex::new(false),
        }
    }

    /// §4.9: run `command`, optionally within `working_dir`, bounded by
    /// `timeout` (default 60s). Non-mux mode spawns a fresh child process
    /// with no preserved state.
    pub async fn exec(&self, command: &str, working_dir: Option<&str>, timeout: Option<u64>) -> Result<ExecOutcome> {
        let deadline = Duration::from_secs(timeout.unwrap_or(DEFAULT_EXEC_TIMEOUT_SECS));
        let effective = match working_dir {
            Some(dir) => format!("cd '{}' && {{ {}; }}", shell_quote(dir), command),
            None => command.to_string(),
        };

        if self.mux_enabled {
            self.exec_mux(&effective, deadline).await
        } else {
            self.exec_child(&effective, deadline).await
        }
    }

    async fn ensure_session(&self) -> Result<()> {
        let mut started = self.started.lock().await;
        if *started {
            return Ok(());
        }

        // Destroy any pre-existing same-named session first (`spec.md` §4.9).
        let _ = tmux(&["kill-session", "-t", SESSION_NAME]).await;
        tmux(&["new-session", "-d", "-s", SESSION_NAME, "-x", "220", "-y", "50"])
            .await
            .context("failed to create tmux session")?;
        *started = true;
        agent_log(&self.session_dir, "executor", &format!("created mux session {}", SESSION_NAME));
        Ok(())
    }

    async fn exec_mux(&self, command: &str, deadline: Duration) -> Result<ExecOutcome> {
        self.ensure_session().await?;

        let marker_id = Uuid::new_v4().simple().to_string();
        let start_marker = format!("__START_{}__", marker_id);
        let end_prefix = format!("__END_{}__", marker_id);

        let wrapped = format!(
            "echo {start}\n{cmd}\n__ec=$?\necho\necho {end}$__ec",
            start = start_marker,
            cmd = command,
            end = end_prefix,
        );

        send_keys(&wrapped).await.context("failed to send command to mux session")?;

        let end_re = Regex::new(&format!(r"{}(\d+)", regex::escape(&end_prefix)))
            .context("failed to compile end-marker regex")?;

        let deadline_at = tokio::time::Instant::now() + deadline;
        loop {
            if tokio::time::Instant::now() >= deadline_at {
                return Ok(ExecOutcome {
                    success: false,
                    output: String::new(),
                    error: Some("timeout".to_string()),
                    exit_code: None,
                });
            }

            let pane = capture_pane().await.unwrap_or_default();
            if let Some(end_match) = end_re.find(&pane) {
                let exit_code: i32 = end_re
                    .captures(&pane)
                    .and_then(|c| c.get(1))
                    .and_then(|m| m.as_str().parse().ok())
                    .unwrap_or(-1);

                let start_idx = pane.find(&start_marker).map(|i| i + start_marker.len());
                let output = match start_idx {
                    Some(start) => pane.get(start..end_match.start()).unwrap_or_default().to_string(),
                    None => String::new(),
                };
                let output = strip_echoed_command(&output, command);

                return Ok(ExecOutcome {
                    success: exit_code == 0,
                    output,
                    error: None,
                    exit_code: Some(exit_code),
                });
            }

            tokio::time::sleep(Duration::from_millis(POLL_INTERVAL_MS)).await;
        }
    }

    async fn exec_child(&self, command: &str, deadline: Duration) -> Result<ExecOutcome> {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .context("failed to spawn child process")?;

        match tokio::time::timeout(deadline, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
                combined.push_str(&String::from_utf8_lossy(&output.stderr));
                Ok(ExecOutcome {
                    success: output.status.success(),
                    output: combined,
                    error: None,
                    exit_code: output.status.code(),
                })
            }
            Ok(Err(e)) => Ok(ExecOutcome {
                success: false,
                output: String::new(),
                error: Some(e.to_string()),
                exit_code: None,
            }),
            Err(_) => Ok(ExecOutcome {
                success: false,
                output: String::new(),
                error: Some("timeout".to_string()),
                exit_code: None,
            }),
        }
    }

    /// Cleanup on `shutdown` or connection loss with no survivors: send
    /// `exit` into the pane first (graceful), then destroy the session.
    pub async fn shutdown(&self) {
        let started = *self.started.lock().await;
        if !started {
            return;
        }
        let _ = send_keys("exit").await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        let _ = tmux(&["kill-session", "-t", SESSION_NAME]).await;
        agent_log(&self.session_dir, "executor", "mux session destroyed");
    }
}

async fn send_keys(command: &str) -> Result<()> {
    tmux(&["send-keys", "-t", SESSION_NAME, command, "Enter"]).await
}

async fn capture_pane() -> Result<String> {
    let output = Command::new("tmux")
        .args(["capture-pane", "-t", SESSION_NAME, "-p", "-S", "-2000"])
        .output()
        .await
        .context("failed to run tmux capture-pane")?;
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

async fn tmux(args: &[&str]) -> Result<()> {
    let status = Command::new("tmux")
        .args(args)
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .await
        .with_context(|| format!("failed to run tmux {:?}", args))?;
    if !status.success() {
        anyhow::bail!("tmux {:?} exited with {:?}", args, status.code());
    }
    Ok(())
}

/// The pane echoes the sent command itself before running it; strip that
/// leading echo line so `output` holds only what the command printed.
fn strip_echoed_command(raw: &str, command: &str) -> String {
    let mut lines: Vec<&str> = raw.lines().collect();
    if lines.first().map(|l| l.trim() == command.trim()).unwrap_or(false) {
        lines.remove(0);
    }
    let mut joined = lines.join("\n");
    if raw.ends_with('\n') && !joined.is_empty() {
        joined.push('\n');
    }
    joined.trim_start_matches('\n').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_echoed_command_removes_leading_echo() {
        let raw = "echo hi\nhi\n";
        assert_eq!(strip_echoed_command(raw, "echo hi"), "hi\n");
    }

    #[test]
    fn strip_echoed_command_is_noop_without_echo() {
        let raw = "hi\n";
        assert_eq!(strip_echoed_command(raw, "echo hi"), "hi\n");
    }

    #[tokio::test]
    async fn non_mux_exec_reports_true_exit_code() {
        let executor = SessionExecutor::new(false, std::env::temp_dir());
        let outcome = executor.exec("exit 2", None, Some(5)).await.unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.exit_code, Some(2));
    }

    #[tokio::test]
    async fn non_mux_exec_captures_stdout() {
        let executor = SessionExecutor::new(false, std::env::temp_dir());
        let outcome = executor.exec("printf hello", None, Some(5)).await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.output, "hello");
        assert_eq!(outcome.exit_code, Some(0));
    }

    #[tokio::test]
    async fn non_mux_exec_honors_working_dir() {
        let executor = SessionExecutor::new(false, std::env::temp_dir());
        let outcome = executor.exec("pwd", Some("/tmp"), Some(5)).await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.output.trim(), "/tmp");
    }
}
