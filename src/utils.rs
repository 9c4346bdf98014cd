//! Utility functions for command execution, Grid Engine output parsing and
//! host lookups.

use anyhow::{Context, Result};
use regex::Regex;
use std::env;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::OnceLock;

/// Result of running an external command
#[derive(Debug, Clone, Default)]
pub struct CommandResult {
    pub stdout: String,
    pub stderr: String,
    pub return_code: i32,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.return_code == 0
    }

    /// Stdout followed by stderr, the way a terminal would show them.
    pub fn combined_output(&self) -> String {
        let mut out = self.stdout.clone();
        if !self.stderr.is_empty() {
            if !out.is_empty() && !out.ends_with('\n') {
                out.push('\n');
            }
            out.push_str(&self.stderr);
        }
        out
    }
}

/// Execute a command and return stdout, stderr, and return code.
///
/// # Arguments
/// * `cmd` - Command and arguments as a slice
/// * `check` - If true, return error on non-zero return code
pub fn run_command(cmd: &[&str], check: bool) -> Result<CommandResult> {
    run_command_with_input(cmd, None, check)
}

/// Execute a command, optionally feeding `input` on its stdin.
pub fn run_command_with_input(
    cmd: &[&str],
    input: Option<&str>,
    check: bool,
) -> Result<CommandResult> {
    if cmd.is_empty() {
        anyhow::bail!("Empty command");
    }

    tracing::debug!(command = ?cmd, "running");

    let mut command = Command::new(cmd[0]);
    command
        .args(&cmd[1..])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

    let mut child = command
        .spawn()
        .with_context(|| format!("Failed to execute command: {}", cmd[0]))?;

    if let Some(text) = input {
        let mut stdin = child
            .stdin
            .take()
            .context("child stdin was not captured")?;
        stdin
            .write_all(text.as_bytes())
            .with_context(|| format!("Failed to write to stdin of {}", cmd[0]))?;
    }

    let output = child
        .wait_with_output()
        .with_context(|| format!("Failed to wait for command: {}", cmd[0]))?;

    let result = CommandResult {
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        return_code: output.status.code().unwrap_or(-1),
    };

    if check && !result.success() {
        anyhow::bail!(
            "Command {:?} failed with code {}: {}",
            cmd,
            result.return_code,
            result.stderr
        );
    }

    Ok(result)
}

fn job_id_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"Your job(?:-array)? (\d+)").expect("qsub job id pattern is valid"))
}

/// Parse job ID from qsub output.
///
/// Typical qsub output: `Your job 12345 ("jupyter.9h") has been submitted`
pub fn parse_job_id(qsub_output: &str) -> Option<u64> {
    job_id_regex()
        .captures(qsub_output)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Minimal POSIX shell quoting (single quotes) for words sent through ssh.
pub fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        return "''".to_string();
    }
    if s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:@=,+%".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Name of the invoking user.
pub fn current_user() -> Result<String> {
    if let Some(user) = env_non_empty("USER").or_else(|| env_non_empty("LOGNAME")) {
        return Ok(user);
    }
    let result = run_command(&["id", "-un"], true).context("Failed to determine user name")?;
    Ok(result.stdout.trim().to_string())
}

/// Host name of the machine we run on.
pub fn local_hostname() -> Result<String> {
    if let Some(host) = env_non_empty("HOSTNAME") {
        return Ok(host);
    }
    let result = run_command(&["hostname"], true).context("Failed to determine host name")?;
    Ok(result.stdout.trim().to_string())
}

/// The user's home directory.
pub fn home_dir() -> Result<PathBuf> {
    env_non_empty("HOME")
        .map(PathBuf::from)
        .context("HOME is not set")
}

/// Read an environment variable, treating blank values as unset.
pub fn env_non_empty(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Job status derived from the Grid Engine state column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Queued,
    Running,
    Suspended,
    Deleting,
    Error,
    Unknown,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "QUEUED",
            JobStatus::Running => "RUNNING",
            JobStatus::Suspended => "SUSPENDED",
            JobStatus::Deleting => "DELETING",
            JobStatus::Error => "ERROR",
            JobStatus::Unknown => "UNKNOWN",
        }
    }

    /// Classify a qstat state string such as `r`, `qw`, `hqw`, `Eqw` or `dr`.
    pub fn from_sge_state(state: &str) -> Self {
        if state.is_empty() {
            return JobStatus::Unknown;
        }
        // Order matters: "dr" is a running job being deleted, "Eqw" is queued in error.
        if state.contains('E') {
            JobStatus::Error
        } else if state.contains('d') {
            JobStatus::Deleting
        } else if state.contains('s') || state.contains('S') || state.contains('T') {
            JobStatus::Suspended
        } else if state.contains('r') || state.contains('t') {
            JobStatus::Running
        } else if state.contains('q') || state.contains('w') || state.contains('h') {
            JobStatus::Queued
        } else {
            JobStatus::Unknown
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
