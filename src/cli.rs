//! CLI entry points for both binaries.

use crate::error::{Error, Result, EXIT_FAILURE, EXIT_OK};
use crate::launcher::{Launcher, Ssh, DEFAULT_SUBMITTER};
use crate::options::{parse_args, usage, Invocation, Program};
use crate::status::GridEngine;
use crate::submit::{SubmitRequest, Submitter};
use crate::summary::localize_url;
use crate::utils::{current_user, env_non_empty, home_dir, local_hostname};
use clap::Parser;

/// Launch a Jupyter server as a Grid Engine job and tunnel into it.
///
/// Options follow qsub's single-dash style and are classified by the
/// `options` table; run with `-help` for the list.
#[derive(Parser, Debug)]
#[command(name = "run-jupyter")]
#[command(about = "Start Jupyter on the cluster and forward its port over ssh")]
#[command(disable_help_flag = true, disable_version_flag = true)]
pub struct LauncherCli {
    /// -remote, -port, -@, -o, -N and qsub options
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, num_args = 0..)]
    pub args: Vec<String>,
}

/// Submit a Jupyter server job on the head node and report where it runs.
#[derive(Parser, Debug)]
#[command(name = "qsub-jupyter")]
#[command(about = "Submit (or reuse) a Jupyter job and print JOB_ID, PORT, NODE and URL")]
#[command(disable_help_flag = true, disable_version_flag = true)]
pub struct SubmitterCli {
    /// -port, -@, -o, -N and qsub options
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, num_args = 0..)]
    pub args: Vec<String>,
}

/// Handle the submitter command line. Returns the process exit code.
pub fn handle_submit(tokens: &[String]) -> i32 {
    let program = Program::Submitter;
    let Some(inv) = parse_or_usage(tokens, program) else {
        return EXIT_FAILURE;
    };
    if inv.help {
        print!("{}", usage(program));
        return EXIT_OK;
    }

    match submit(&inv) {
        Ok(()) => EXIT_OK,
        Err(e) => report(program, &e),
    }
}

fn submit(inv: &Invocation) -> Result<()> {
    let home = home_dir()?;
    let user = current_user()?;
    let request = SubmitRequest::prepare(inv, &home)?;
    tracing::info!(name = %request.job_name, user = %user, "preparing job");

    let grid = GridEngine;
    let summary = Submitter::new(&grid, user).run(&request)?;
    print!("{summary}");
    Ok(())
}

/// Handle the launcher command line. Returns the process exit code.
pub fn handle_launch(tokens: &[String]) -> i32 {
    let program = Program::Launcher;
    let Some(inv) = parse_or_usage(tokens, program) else {
        return EXIT_FAILURE;
    };
    if inv.help {
        print!("{}", usage(program));
        return EXIT_OK;
    }

    match launch(&inv) {
        Ok(code) => code,
        Err(e) => report(program, &e),
    }
}

fn launch(inv: &Invocation) -> Result<i32> {
    let hostname = local_hostname()?;
    let submitter = env_non_empty("RUN_JUPYTER_SUBMITTER").unwrap_or_else(|| DEFAULT_SUBMITTER.to_string());
    let shell = Ssh;
    let launcher = Launcher::new(&shell, hostname, submitter);

    let summary = launcher.fetch_summary(inv)?;
    print!("{summary}");
    if !summary.url.is_empty() {
        println!(
            "Notebook available at {}",
            localize_url(&summary.url, inv.port)
        );
    }

    launcher.open_tunnel(inv, &summary)
}

fn parse_or_usage(tokens: &[String], program: Program) -> Option<Invocation> {
    match parse_args(tokens, program) {
        Ok(inv) => Some(inv),
        Err(e) => {
            eprintln!("{}: {}", program.name(), e);
            eprint!("{}", usage(program));
            None
        }
    }
}

fn report(program: Program, e: &Error) -> i32 {
    eprintln!("{}: {:#}", program.name(), e);
    if e.is_transient() {
        eprintln!("{}: the job is still starting; run the same command again to reconnect", program.name());
    }
    e.exit_code()
}
