//! Grid Engine access: job listings, submission and notebook logs.
//!
//! Everything that depends on the text printed by `qstat`/`qsub` or on the
//! notebook server's log format lives behind [`StatusProvider`] and
//! [`JobSubmitter`], so the waiting logic can be driven by canned output.

use crate::utils::{parse_job_id, run_command, run_command_with_input, CommandResult, JobStatus};
use anyhow::{Context, Result};
use regex::Regex;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::OnceLock;

/// Width of qstat's owner column; longer user names are cut to this many
/// characters.
pub const OWNER_COLUMN_WIDTH: usize = 12;

/// One job row of `qstat -u <user> -r`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRecord {
    pub job_id: u64,
    /// Full job name (qstat truncates the name column, `-r` repeats it in full).
    pub name: String,
    pub user: String,
    /// Raw state flags, e.g. `r`, `qw`, `Eqw`.
    pub state: String,
    /// Queue instance `queue@host`, present once the job is scheduled.
    pub queue: Option<String>,
    /// The listing row as printed, for diagnostics.
    pub row: String,
}

impl JobRecord {
    pub fn status(&self) -> JobStatus {
        JobStatus::from_sge_state(&self.state)
    }

    pub fn is_running(&self) -> bool {
        self.status() == JobStatus::Running
    }

    /// Whether the owner column names `user`, allowing for the column cutting
    /// long names short.
    pub fn owned_by(&self, user: &str) -> bool {
        if self.user == user {
            return true;
        }
        self.user.chars().count() == OWNER_COLUMN_WIDTH
            && user.chars().take(OWNER_COLUMN_WIDTH).eq(self.user.chars())
    }

    /// Execution host taken from the queue instance.
    pub fn node(&self) -> Option<&str> {
        self.queue
            .as_deref()
            .and_then(|q| q.split_once('@'))
            .map(|(_, host)| host)
            .filter(|host| !host.is_empty())
    }
}

/// Read access to the scheduler's job table and to job logs.
pub trait StatusProvider {
    /// Jobs currently listed for `user`.
    fn list_jobs(&self, user: &str) -> Result<Vec<JobRecord>>;

    /// Contents of a job log, `None` while the file does not exist.
    fn read_log(&self, path: &Path) -> Result<Option<String>>;
}

/// Submission of job scripts.
pub trait JobSubmitter {
    /// Run `qsub <args>` with `script` on stdin.
    fn submit(&self, args: &[String], script: &str) -> Result<CommandResult>;
}

/// The real scheduler, reached through the `qstat` and `qsub` commands.
#[derive(Debug, Default, Clone, Copy)]
pub struct GridEngine;

impl StatusProvider for GridEngine {
    fn list_jobs(&self, user: &str) -> Result<Vec<JobRecord>> {
        let result = run_command(&["qstat", "-u", user, "-r"], true)
            .context("Failed to list jobs with qstat")?;
        Ok(parse_qstat(&result.stdout))
    }

    fn read_log(&self, path: &Path) -> Result<Option<String>> {
        match fs::read(path) {
            Ok(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).into_owned())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read log {}", path.display())),
        }
    }
}

impl JobSubmitter for GridEngine {
    fn submit(&self, args: &[String], script: &str) -> Result<CommandResult> {
        let mut cmd: Vec<&str> = vec!["qsub"];
        cmd.extend(args.iter().map(String::as_str));
        run_command_with_input(&cmd, Some(script), false)
    }
}

fn row_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^\s*(\d+)\s+\S+\s+(\S+)\s+(\S+)\s+(\S+)\s+\d+/\d+/\d+\s+\d+:\d+:\d+(?:\s+(\S+@\S+))?",
        )
        .expect("qstat row pattern is valid")
    })
}

fn full_name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s+Full jobname:\s+(.*?)\s*$").expect("full jobname pattern is valid")
    })
}

/// Parse `qstat -r` output. Rows without a `Full jobname:` detail line keep
/// the name from the name column.
pub fn parse_qstat(output: &str) -> Vec<JobRecord> {
    let mut jobs: Vec<JobRecord> = Vec::new();

    for line in output.lines() {
        if let Some(caps) = row_regex().captures(line) {
            let Ok(job_id) = caps[1].parse::<u64>() else {
                continue;
            };
            jobs.push(JobRecord {
                job_id,
                name: caps[2].to_string(),
                user: caps[3].to_string(),
                state: caps[4].to_string(),
                queue: caps.get(5).map(|m| m.as_str().to_string()),
                row: line.trim_end().to_string(),
            });
        } else if let Some(caps) = full_name_regex().captures(line) {
            if let Some(job) = jobs.last_mut() {
                job.name = caps[1].to_string();
            }
        }
    }

    jobs
}

/// Jobs of `user` whose full name is `name`.
pub fn matching_jobs<'a>(jobs: &'a [JobRecord], user: &str, name: &str) -> Vec<&'a JobRecord> {
    jobs.iter()
        .filter(|job| job.owned_by(user) && job.name == name)
        .collect()
}

fn url_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\]\s+(?:or\s+)?(https?://\S+)").expect("server url pattern is valid")
    })
}

/// First server URL announced in a notebook log, e.g. from
/// `[I 12:00:00.123 ServerApp]  or http://127.0.0.1:7777/lab?token=...`.
pub fn find_server_url(log: &str) -> Option<String> {
    log.lines()
        .find_map(|line| url_regex().captures(line))
        .map(|caps| caps[1].to_string())
}
