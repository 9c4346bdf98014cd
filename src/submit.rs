//! Job submission, deduplication and the wait for a usable notebook server.

use crate::defaults_file::{apply_runtime_default, default_path, DefaultsFile};
use crate::error::{Error, Result};
use crate::job_name::job_name_for;
use crate::options::{Invocation, JobOptions};
use crate::poll::{Check, PollOutcome, PollSchedule};
use crate::status::{find_server_url, matching_jobs, JobRecord, JobSubmitter, StatusProvider};
use crate::summary::ConnectionSummary;
use crate::utils::{env_non_empty, parse_job_id};
use anyhow::{anyhow, Context};
use std::cell::RefCell;
use std::fs;
use std::path::{Path, PathBuf};

/// Notebook server started by the job unless `RUN_JUPYTER_NOTEBOOK_CMD` is set.
pub const DEFAULT_NOTEBOOK_CMD: &str = "jupyter lab";

/// Everything needed to submit one notebook job.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub job_name: String,
    pub port: u16,
    /// `-o` target: a log file, or a directory qsub writes `<name>.o<id>` into.
    pub log_target: PathBuf,
    /// Final qsub options, `-N` included.
    pub options: JobOptions,
    pub notebook_cmd: String,
}

impl SubmitRequest {
    /// Turn parsed flags into a request. Reads (and if needed creates) the
    /// defaults file.
    pub fn prepare(inv: &Invocation, home: &Path) -> Result<Self> {
        let defaults = match &inv.defaults_file {
            Some(path) => DefaultsFile::load(path)?,
            None => DefaultsFile::load_or_create(&default_path(home))?,
        };
        let notebook_cmd =
            env_non_empty("RUN_JUPYTER_NOTEBOOK_CMD").unwrap_or_else(|| DEFAULT_NOTEBOOK_CMD.to_string());
        Ok(Self::with_defaults(inv, &defaults, home, notebook_cmd))
    }

    /// Build the request from an already loaded defaults file.
    ///
    /// Later options win in qsub, so the order is: built-ins, the defaults
    /// file, the command line, then the log path and the derived name.
    pub fn with_defaults(
        inv: &Invocation,
        defaults: &DefaultsFile,
        home: &Path,
        notebook_cmd: String,
    ) -> Self {
        let job_name = job_name_for(inv);

        let mut explicit = inv.qsub.clone();
        if apply_runtime_default(&mut explicit, Some(defaults)) {
            tracing::debug!("no runtime limit requested, using the default");
        }

        let log_target = inv
            .output
            .clone()
            .unwrap_or_else(|| home.join(format!(".run_jupyter.{job_name}.log")));

        let mut options = JobOptions::new();
        options.set("-S", "/bin/bash");
        options.set("-j", "y");
        options.set("-V", "");
        options.set("-@", &defaults.path.to_string_lossy());
        options.merge(&explicit);
        options.set("-o", &log_target.to_string_lossy());
        options.set("-N", &job_name);

        Self {
            job_name,
            port: inv.port,
            log_target,
            options,
            notebook_cmd,
        }
    }

    /// Job script fed to qsub on stdin.
    pub fn script(&self) -> String {
        format!(
            "#!/bin/bash\nexec {} --no-browser --ip=\"$(hostname)\" --port={}\n",
            self.notebook_cmd, self.port
        )
    }
}

/// Log file of a job: the `-o` target itself, or `<dir>/<name>.o<id>` when
/// the target is a directory.
pub fn resolve_log_path(target: &Path, job_name: &str, job_id: u64) -> PathBuf {
    if target.is_dir() {
        target.join(format!("{job_name}.o{job_id}"))
    } else {
        target.to_path_buf()
    }
}

/// Submits notebook jobs and waits for them to come up.
pub struct Submitter<'a, S> {
    scheduler: &'a S,
    user: String,
    schedule: PollSchedule,
}

impl<'a, S: StatusProvider + JobSubmitter> Submitter<'a, S> {
    pub fn new(scheduler: &'a S, user: impl Into<String>) -> Self {
        Self {
            scheduler,
            user: user.into(),
            schedule: PollSchedule::default(),
        }
    }

    pub fn with_schedule(mut self, schedule: PollSchedule) -> Self {
        self.schedule = schedule;
        self
    }

    /// Submit (if needed), wait for the server and report where it runs.
    pub fn run(&self, request: &SubmitRequest) -> Result<ConnectionSummary> {
        let job_id = self.ensure_submitted(request)?;
        let job = self.wait_until_running(&request.job_name, job_id)?;
        let node = job
            .node()
            .ok_or_else(|| anyhow!("job {job_id} is running but qstat shows no execution host"))?
            .to_string();

        let log_path = resolve_log_path(&request.log_target, &request.job_name, job_id);
        let url = self.wait_for_url(&request.job_name, job_id, &log_path)?;

        Ok(ConnectionSummary {
            job_id,
            port: request.port,
            node,
            url,
        })
    }

    /// Jobs of this user carrying `name`.
    pub fn find_jobs(&self, name: &str) -> Result<Vec<JobRecord>> {
        let jobs = self.scheduler.list_jobs(&self.user)?;
        Ok(matching_jobs(&jobs, &self.user, name)
            .into_iter()
            .cloned()
            .collect())
    }

    /// Id of the job for `request`, submitting it unless it is already listed.
    pub fn ensure_submitted(&self, request: &SubmitRequest) -> Result<u64> {
        let existing = self.find_jobs(&request.job_name)?;
        match existing.as_slice() {
            [] => {}
            [job] => {
                tracing::info!(job_id = job.job_id, name = %request.job_name, state = %job.state, "job already queued");
                return Ok(job.job_id);
            }
            _ => return Err(duplicate(&request.job_name, &existing)),
        }

        if request.log_target.is_file() {
            fs::remove_file(&request.log_target).with_context(|| {
                format!("Failed to remove stale log {}", request.log_target.display())
            })?;
        }

        let result = self
            .scheduler
            .submit(&request.options.to_args(), &request.script())?;
        if !result.success() {
            return Err(Error::SubmitRejected {
                code: result.return_code,
                stderr: result.combined_output().trim().to_string(),
            });
        }
        let job_id = parse_job_id(&result.stdout)
            .ok_or_else(|| Error::SubmitOutput(result.stdout.trim().to_string()))?;
        tracing::info!(job_id, name = %request.job_name, "submitted job");

        let listed = self.find_jobs(&request.job_name)?;
        if listed.len() > 1 {
            return Err(duplicate(&request.job_name, &listed));
        }

        Ok(job_id)
    }

    /// Wait until the job is in the running state.
    pub fn wait_until_running(&self, name: &str, job_id: u64) -> Result<JobRecord> {
        let latest: RefCell<Option<JobRecord>> = RefCell::new(None);

        let outcome = self.schedule.poll_until(
            || {
                let job = self.lookup(job_id)?;
                let present = job.is_some();
                if present {
                    *latest.borrow_mut() = job;
                }
                Ok::<_, Error>(present)
            },
            || {
                Ok(match latest.borrow().as_ref() {
                    Some(job) if job.is_running() => Check::Ready(job.clone()),
                    Some(job) => {
                        tracing::info!(job_id, state = %job.state, "waiting for job to start");
                        Check::Pending
                    }
                    None => Check::Pending,
                })
            },
        )?;

        match outcome {
            PollOutcome::Ready { value, attempts } => {
                tracing::debug!(job_id, attempts, "job is running");
                Ok(value)
            }
            PollOutcome::Gone { .. } => Err(Error::JobVanished {
                job_id,
                name: name.to_string(),
            }),
            PollOutcome::Exhausted { .. } => Err(Error::NotRunning {
                job_id,
                state: latest
                    .borrow()
                    .as_ref()
                    .map(|job| job.state.clone())
                    .unwrap_or_else(|| "unknown".to_string()),
            }),
        }
    }

    /// Wait until the job log announces the server URL.
    pub fn wait_for_url(&self, name: &str, job_id: u64, log_path: &Path) -> Result<String> {
        let outcome = self.schedule.poll_until(
            || Ok::<_, Error>(self.lookup(job_id)?.is_some()),
            || {
                let Some(log) = self.scheduler.read_log(log_path)? else {
                    tracing::info!(log = %log_path.display(), "waiting for log file");
                    return Ok(Check::Pending);
                };
                Ok(match find_server_url(&log) {
                    Some(url) => Check::Ready(url),
                    None => {
                        tracing::info!(log = %log_path.display(), "waiting for server URL");
                        Check::Pending
                    }
                })
            },
        )?;

        match outcome {
            PollOutcome::Ready { value, .. } => Ok(value),
            PollOutcome::Gone { .. } => Err(Error::JobVanished {
                job_id,
                name: name.to_string(),
            }),
            PollOutcome::Exhausted { .. } => Err(Error::LogNotReady {
                job_id,
                log: log_path.to_path_buf(),
            }),
        }
    }

    fn lookup(&self, job_id: u64) -> Result<Option<JobRecord>> {
        let jobs = self.scheduler.list_jobs(&self.user)?;
        Ok(jobs
            .into_iter()
            .find(|job| job.job_id == job_id && job.owned_by(&self.user)))
    }
}

fn duplicate(name: &str, jobs: &[JobRecord]) -> Error {
    Error::DuplicateJobs {
        name: name.to_string(),
        rows: jobs.iter().map(|job| job.row.clone()).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::{parse_args, Program};
    use crate::utils::CommandResult;
    use std::cell::Cell;
    use std::collections::VecDeque;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Scheduler double: each `list_jobs` call pops the next listing (the last
    /// one repeats), `read_log` returns nothing for the first `log_after` reads.
    struct FakeGrid {
        listings: RefCell<VecDeque<Vec<JobRecord>>>,
        log: Option<String>,
        log_after: u32,
        log_reads: Cell<u32>,
        submit_result: CommandResult,
        submissions: RefCell<Vec<(Vec<String>, String)>>,
    }

    impl FakeGrid {
        fn new(listings: Vec<Vec<JobRecord>>) -> Self {
            Self {
                listings: RefCell::new(listings.into()),
                log: None,
                log_after: 0,
                log_reads: Cell::new(0),
                submit_result: CommandResult {
                    stdout: "Your job 500 (\"jupyter.9h\") has been submitted\n".to_string(),
                    stderr: String::new(),
                    return_code: 0,
                },
                submissions: RefCell::new(Vec::new()),
            }
        }

        fn with_log(mut self, log: &str, after: u32) -> Self {
            self.log = Some(log.to_string());
            self.log_after = after;
            self
        }
    }

    impl StatusProvider for FakeGrid {
        fn list_jobs(&self, _user: &str) -> anyhow::Result<Vec<JobRecord>> {
            let mut listings = self.listings.borrow_mut();
            if listings.len() > 1 {
                Ok(listings.pop_front().unwrap_or_default())
            } else {
                Ok(listings.front().cloned().unwrap_or_default())
            }
        }

        fn read_log(&self, _path: &Path) -> anyhow::Result<Option<String>> {
            let reads = self.log_reads.get() + 1;
            self.log_reads.set(reads);
            if reads <= self.log_after {
                Ok(None)
            } else {
                Ok(self.log.clone())
            }
        }
    }

    impl JobSubmitter for FakeGrid {
        fn submit(&self, args: &[String], script: &str) -> anyhow::Result<CommandResult> {
            self.submissions
                .borrow_mut()
                .push((args.to_vec(), script.to_string()));
            Ok(self.submit_result.clone())
        }
    }

    fn job(id: u64, name: &str, state: &str, queue: Option<&str>) -> JobRecord {
        JobRecord {
            job_id: id,
            name: name.to_string(),
            user: "alice".to_string(),
            state: state.to_string(),
            queue: queue.map(str::to_string),
            row: format!("{id} 0.5 {name} alice {state}"),
        }
    }

    fn request(home: &Path, args: &[&str]) -> SubmitRequest {
        let inv = parse_args(args, Program::Submitter).unwrap();
        let defaults = DefaultsFile::from_text(&home.join("defaults"), "");
        SubmitRequest::with_defaults(&inv, &defaults, home, DEFAULT_NOTEBOOK_CMD.to_string())
    }

    fn fast() -> PollSchedule {
        PollSchedule::new(40, Duration::ZERO)
    }

    #[test]
    fn test_request_options() {
        let home = TempDir::new().unwrap();
        let req = request(home.path(), &["-l", "mem_free=4G", "-j", "n", "-P", "proj"]);
        assert_eq!(req.job_name, "jupyter.mem_free=4G.proj");
        assert_eq!(req.options.get("-l"), Some("mem_free=4G,h_rt=9:0:0"));
        assert_eq!(req.options.get("-j"), Some("n"));
        assert_eq!(req.options.get("-N"), Some("jupyter.mem_free=4G.proj"));
        assert_eq!(req.options.get("-S"), Some("/bin/bash"));
        let args = req.options.to_args();
        assert_eq!(args.last().map(String::as_str), Some("jupyter.mem_free=4G.proj"));
        assert!(args.windows(2).any(|w| w[0] == "-@" && w[1].ends_with("defaults")));
        assert_eq!(
            req.log_target,
            home.path().join(".run_jupyter.jupyter.mem_free=4G.proj.log")
        );
    }

    #[test]
    fn test_request_explicit_runtime_untouched() {
        let home = TempDir::new().unwrap();
        let req = request(home.path(), &["-l", "h_rt=1:0:0"]);
        assert_eq!(req.options.get("-l"), Some("h_rt=1:0:0"));
        assert_eq!(req.job_name, "jupyter.1h");
    }

    #[test]
    fn test_script_binds_host_and_port() {
        let home = TempDir::new().unwrap();
        let req = request(home.path(), &["-port", "8899"]);
        let script = req.script();
        assert!(script.starts_with("#!/bin/bash\n"));
        assert!(script.contains("jupyter lab --no-browser --ip=\"$(hostname)\" --port=8899"));
    }

    #[test]
    fn test_resolve_log_path() {
        let dir = TempDir::new().unwrap();
        assert_eq!(
            resolve_log_path(dir.path(), "jupyter.9h", 42),
            dir.path().join("jupyter.9h.o42")
        );
        let file = dir.path().join("nb.log");
        assert_eq!(resolve_log_path(&file, "jupyter.9h", 42), file);
    }

    #[test]
    fn test_existing_job_is_reused() {
        let home = TempDir::new().unwrap();
        let req = request(home.path(), &[]);
        let grid = FakeGrid::new(vec![vec![job(77, &req.job_name, "r", Some("all.q@node3"))]]);
        let submitter = Submitter::new(&grid, "alice").with_schedule(fast());

        assert_eq!(submitter.ensure_submitted(&req).unwrap(), 77);
        assert_eq!(submitter.ensure_submitted(&req).unwrap(), 77);
        assert!(grid.submissions.borrow().is_empty());
    }

    #[test]
    fn test_submits_when_absent_and_removes_stale_log() {
        let home = TempDir::new().unwrap();
        let req = request(home.path(), &[]);
        fs::write(&req.log_target, "old run\n").unwrap();
        let grid = FakeGrid::new(vec![
            vec![],
            vec![job(500, &req.job_name, "qw", None)],
        ]);
        let submitter = Submitter::new(&grid, "alice").with_schedule(fast());

        assert_eq!(submitter.ensure_submitted(&req).unwrap(), 500);
        assert!(!req.log_target.exists());
        let submissions = grid.submissions.borrow();
        assert_eq!(submissions.len(), 1);
        assert_eq!(submissions[0].0, req.options.to_args());
        assert!(submissions[0].1.contains("--port=7777"));
    }

    #[test]
    fn test_jobs_of_other_users_are_ignored() {
        let home = TempDir::new().unwrap();
        let req = request(home.path(), &[]);
        let mut other = job(9, &req.job_name, "r", Some("all.q@node1"));
        other.user = "bob".to_string();
        let grid = FakeGrid::new(vec![vec![other], vec![job(500, &req.job_name, "qw", None)]]);
        let submitter = Submitter::new(&grid, "alice").with_schedule(fast());

        assert_eq!(submitter.ensure_submitted(&req).unwrap(), 500);
        assert_eq!(grid.submissions.borrow().len(), 1);
    }

    #[test]
    fn test_long_user_name_reuses_and_waits_for_job() {
        let home = TempDir::new().unwrap();
        let req = request(home.path(), &[]);
        let listed = |state: &str, queue: Option<&str>| {
            let mut record = job(88, &req.job_name, state, queue);
            record.user = "christophers".to_string();
            record
        };
        let grid = FakeGrid::new(vec![
            vec![listed("qw", None)],
            vec![listed("qw", None)],
            vec![listed("r", Some("all.q@node4"))],
        ]);
        let submitter = Submitter::new(&grid, "christopherson").with_schedule(fast());

        assert_eq!(submitter.ensure_submitted(&req).unwrap(), 88);
        assert!(grid.submissions.borrow().is_empty());
        let running = submitter.wait_until_running(&req.job_name, 88).unwrap();
        assert_eq!(running.node(), Some("node4"));
    }

    #[test]
    fn test_duplicate_jobs_fail() {
        let home = TempDir::new().unwrap();
        let req = request(home.path(), &[]);
        let grid = FakeGrid::new(vec![vec![
            job(10, &req.job_name, "r", Some("all.q@node1")),
            job(11, &req.job_name, "qw", None),
        ]]);
        let submitter = Submitter::new(&grid, "alice").with_schedule(fast());

        let err = submitter.ensure_submitted(&req).unwrap_err();
        assert_eq!(err.exit_code(), 1);
        let text = err.to_string();
        assert!(text.contains("10 0.5"));
        assert!(text.contains("11 0.5"));
        assert!(grid.submissions.borrow().is_empty());
    }

    #[test]
    fn test_duplicate_after_submission_fails() {
        let home = TempDir::new().unwrap();
        let req = request(home.path(), &[]);
        let grid = FakeGrid::new(vec![
            vec![],
            vec![
                job(500, &req.job_name, "qw", None),
                job(501, &req.job_name, "qw", None),
            ],
        ]);
        let submitter = Submitter::new(&grid, "alice").with_schedule(fast());

        let err = submitter.ensure_submitted(&req).unwrap_err();
        assert!(matches!(err, Error::DuplicateJobs { ref rows, .. } if rows.len() == 2));
    }

    #[test]
    fn test_rejected_submission() {
        let home = TempDir::new().unwrap();
        let req = request(home.path(), &[]);
        let mut grid = FakeGrid::new(vec![vec![]]);
        grid.submit_result = CommandResult {
            stdout: String::new(),
            stderr: "Unable to run job: unknown resource \"foo\"".to_string(),
            return_code: 1,
        };
        let submitter = Submitter::new(&grid, "alice").with_schedule(fast());

        let err = submitter.ensure_submitted(&req).unwrap_err();
        assert!(matches!(err, Error::SubmitRejected { code: 1, .. }));
        assert!(err.to_string().contains("unknown resource"));
    }

    #[test]
    fn test_wait_until_running() {
        let grid = FakeGrid::new(vec![
            vec![job(5, "nb", "qw", None)],
            vec![job(5, "nb", "qw", None)],
            vec![job(5, "nb", "r", Some("all.q@node7"))],
        ]);
        let submitter = Submitter::new(&grid, "alice").with_schedule(fast());
        let running = submitter.wait_until_running("nb", 5).unwrap();
        assert_eq!(running.node(), Some("node7"));
    }

    #[test]
    fn test_vanished_job_fails_immediately() {
        let grid = FakeGrid::new(vec![vec![job(5, "nb", "qw", None)], vec![]]);
        let submitter = Submitter::new(&grid, "alice").with_schedule(fast());
        let err = submitter.wait_until_running("nb", 5).unwrap_err();
        assert!(matches!(err, Error::JobVanished { job_id: 5, .. }));
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn test_never_running_is_transient() {
        let grid = FakeGrid::new(vec![vec![job(5, "nb", "qw", None)]]);
        let submitter = Submitter::new(&grid, "alice").with_schedule(fast());
        let err = submitter.wait_until_running("nb", 5).unwrap_err();
        assert!(matches!(err, Error::NotRunning { ref state, .. } if state == "qw"));
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_url_appears_after_ten_polls() {
        let grid = FakeGrid::new(vec![vec![job(5, "nb", "r", Some("all.q@node1"))]])
            .with_log("[I 12:00] or http://node1:7777/lab\n", 10);
        let submitter = Submitter::new(&grid, "alice").with_schedule(fast());

        let url = submitter
            .wait_for_url("nb", 5, Path::new("/nonexistent/nb.log"))
            .unwrap();
        assert_eq!(url, "http://node1:7777/lab");
        assert_eq!(grid.log_reads.get(), 11);
    }

    #[test]
    fn test_log_without_url_is_transient() {
        let grid = FakeGrid::new(vec![vec![job(5, "nb", "r", Some("all.q@node1"))]])
            .with_log("[I 12:00] starting\n", 0);
        let submitter = Submitter::new(&grid, "alice").with_schedule(fast());

        let err = submitter
            .wait_for_url("nb", 5, Path::new("/nonexistent/nb.log"))
            .unwrap_err();
        assert!(matches!(err, Error::LogNotReady { job_id: 5, .. }));
        assert_eq!(err.exit_code(), 2);
        assert_eq!(grid.log_reads.get(), 40);
    }

    #[test]
    fn test_run_end_to_end() {
        let home = TempDir::new().unwrap();
        let req = request(home.path(), &["-port", "8000"]);
        let name = req.job_name.clone();
        let grid = FakeGrid::new(vec![
            vec![],
            vec![job(500, &name, "qw", None)],
            vec![job(500, &name, "qw", None)],
            vec![job(500, &name, "r", Some("all.q@node2.cluster"))],
        ])
        .with_log("[I 12:00:01 ServerApp] http://node2.cluster:8000/lab?token=t\n", 2);
        let submitter = Submitter::new(&grid, "alice").with_schedule(fast());

        let summary = submitter.run(&req).unwrap();
        assert_eq!(
            summary,
            ConnectionSummary {
                job_id: 500,
                port: 8000,
                node: "node2.cluster".to_string(),
                url: "http://node2.cluster:8000/lab?token=t".to_string(),
            }
        );
        assert_eq!(grid.submissions.borrow().len(), 1);
    }
}
