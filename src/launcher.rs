//! Local side: run the submitter over ssh and tunnel to the notebook server.

use crate::error::{Error, Result};
use crate::options::Invocation;
use crate::summary::{ConnectionSummary, RemoteReport};
use crate::utils::{run_command, shell_quote, CommandResult};
use anyhow::Context;
use std::process::Command;

/// Program started on the remote host unless `RUN_JUPYTER_SUBMITTER` is set.
pub const DEFAULT_SUBMITTER: &str = "qsub-jupyter";

/// Variable set in the tunnel's login shell so shell start-up files can tell
/// a notebook session is being entered.
pub const SESSION_ENV: &str = "RUN_JUPYTER_SESSION";

/// Remote execution and port forwarding.
pub trait RemoteShell {
    /// Run `command` on `remote` and capture its output.
    fn run(&self, remote: &str, command: &str) -> anyhow::Result<CommandResult>;

    /// Open an interactive login shell on `remote` that forwards
    /// `local_port` to `node:port`. Returns the session's exit code.
    fn open_tunnel(&self, remote: &str, local_port: u16, node: &str, port: u16)
        -> anyhow::Result<i32>;
}

/// The system `ssh` client.
#[derive(Debug, Default, Clone, Copy)]
pub struct Ssh;

impl Ssh {
    pub fn tunnel_args(remote: &str, local_port: u16, node: &str, port: u16) -> Vec<String> {
        vec![
            "-t".to_string(),
            "-L".to_string(),
            format!("{local_port}:{node}:{port}"),
            remote.to_string(),
            format!("exec env {SESSION_ENV}=1 \"${{SHELL:-/bin/bash}}\" -l"),
        ]
    }
}

impl RemoteShell for Ssh {
    fn run(&self, remote: &str, command: &str) -> anyhow::Result<CommandResult> {
        run_command(&["ssh", remote, command], false)
            .with_context(|| format!("Failed to run ssh {remote}"))
    }

    fn open_tunnel(
        &self,
        remote: &str,
        local_port: u16,
        node: &str,
        port: u16,
    ) -> anyhow::Result<i32> {
        let args = Self::tunnel_args(remote, local_port, node, port);
        tracing::debug!(?args, "opening tunnel");
        let status = Command::new("ssh")
            .args(&args)
            .status()
            .with_context(|| format!("Failed to start ssh session to {remote}"))?;
        Ok(status.code().unwrap_or(1))
    }
}

/// Fail when `hostname` already is (or belongs to) the remote host; running
/// there would only ssh back into itself.
pub fn check_not_on_remote(hostname: &str, remote: &str) -> Result<()> {
    if !remote.is_empty() && hostname.contains(remote) {
        return Err(Error::SelfInvocation {
            hostname: hostname.to_string(),
            remote: remote.to_string(),
        });
    }
    Ok(())
}

/// Shell command line that runs `program` with `args` on the remote side.
pub fn remote_command(program: &str, args: &[String]) -> String {
    std::iter::once(program.to_string())
        .chain(args.iter().map(|arg| shell_quote(arg)))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Drives one launch.
pub struct Launcher<'a, R> {
    shell: &'a R,
    hostname: String,
    program: String,
}

impl<'a, R: RemoteShell> Launcher<'a, R> {
    pub fn new(shell: &'a R, hostname: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            shell,
            hostname: hostname.into(),
            program: program.into(),
        }
    }

    /// Run the submitter on the remote host and read back where the server is.
    pub fn fetch_summary(&self, inv: &Invocation) -> Result<ConnectionSummary> {
        check_not_on_remote(&self.hostname, &inv.remote)?;

        let command = remote_command(&self.program, &inv.submitter_args());
        tracing::info!(remote = %inv.remote, %command, "starting notebook job");
        let result = self.shell.run(&inv.remote, &command)?;
        let output = result.combined_output();

        if !result.success() {
            return Err(Error::RemoteFailed {
                remote: inv.remote.clone(),
                program: self.program.clone(),
                code: result.return_code,
                output,
            });
        }

        let report = RemoteReport::parse(&output);
        let Some(node) = report.node else {
            return Err(Error::MissingNode {
                remote: inv.remote.clone(),
                output,
            });
        };
        if report.job_id.is_none() || report.url.is_none() {
            tracing::warn!(%output, "remote output is missing JOB_ID or URL");
        }

        Ok(ConnectionSummary {
            job_id: report.job_id.unwrap_or_default(),
            port: report.port.unwrap_or(inv.port),
            node,
            url: report.url.unwrap_or_default(),
        })
    }

    /// Forward `inv.port` locally to the server and hand the terminal over.
    pub fn open_tunnel(&self, inv: &Invocation, summary: &ConnectionSummary) -> Result<i32> {
        tracing::info!(
            local_port = inv.port,
            node = %summary.node,
            port = summary.port,
            "opening tunnel"
        );
        Ok(self
            .shell
            .open_tunnel(&inv.remote, inv.port, &summary.node, summary.port)?)
    }
}
