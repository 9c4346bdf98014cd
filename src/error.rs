//! Error classification and process exit codes.

use thiserror::Error;

/// Everything went fine.
pub const EXIT_OK: i32 = 0;
/// Invalid input, scheduler failure or a broken remote call.
pub const EXIT_FAILURE: i32 = 1;
/// The job exists but is not usable yet; re-running later may succeed.
pub const EXIT_NOT_READY: i32 = 2;

/// Failures that decide how the process exits.
#[derive(Debug, Error)]
pub enum Error {
    /// Unknown flag, missing argument or malformed value.
    #[error("{0}")]
    Usage(String),

    /// qsub exited with a non-zero status.
    #[error("qsub failed with code {code}: {stderr}")]
    SubmitRejected { code: i32, stderr: String },

    /// qsub succeeded but did not report a job id.
    #[error("could not parse job id from qsub output: {0}")]
    SubmitOutput(String),

    /// More than one job carries the same derived name.
    #[error("found {} jobs named {name}, expected at most one:\n{}", .rows.len(), .rows.join("\n"))]
    DuplicateJobs { name: String, rows: Vec<String> },

    /// The job dropped out of the listing while we were waiting for it.
    #[error("job {job_id} ({name}) quit unexpectedly")]
    JobVanished { job_id: u64, name: String },

    /// The job did not reach the running state in time.
    #[error("job {job_id} is not running yet (state {state}), try again later")]
    NotRunning { job_id: u64, state: String },

    /// The job runs but its log has no server URL yet.
    #[error("job {job_id} has not reported a server URL in {} yet, try again later", .log.display())]
    LogNotReady {
        job_id: u64,
        log: std::path::PathBuf,
    },

    /// The launcher is already running on the submit host.
    #[error("refusing to run on {hostname}: it already looks like {remote}")]
    SelfInvocation { hostname: String, remote: String },

    /// The remote side did not print a NODE line.
    #[error("no NODE line in output from {remote}; remote output was:\n{output}")]
    MissingNode { remote: String, output: String },

    /// The remote command ended with a non-zero status.
    #[error("{program} on {remote} exited with code {code}:\n{output}")]
    RemoteFailed {
        remote: String,
        program: String,
        code: i32,
        output: String,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn usage(message: impl Into<String>) -> Self {
        Error::Usage(message.into())
    }

    /// Exit code the binaries terminate with for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::NotRunning { .. } | Error::LogNotReady { .. } => EXIT_NOT_READY,
            Error::RemoteFailed { code, .. } if *code > 0 => *code,
            _ => EXIT_FAILURE,
        }
    }

    /// Readiness failures are worth retrying by re-running the command.
    pub fn is_transient(&self) -> bool {
        self.exit_code() == EXIT_NOT_READY
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
