//! Start a Jupyter server as a Grid Engine job and reach it through an ssh
//! tunnel.
//!
//! `qsub-jupyter` runs on the cluster head node: it turns qsub-style flags
//! into a job with a deterministic name, reuses a matching job if one is
//! queued, and waits until the server prints its URL. `run-jupyter` runs on
//! the user's machine: it calls `qsub-jupyter` over ssh and opens a session
//! forwarding the server port.

pub mod cli;
pub mod defaults_file;
pub mod error;
pub mod job_name;
pub mod launcher;
pub mod logging;
pub mod options;
pub mod poll;
pub mod status;
pub mod submit;
pub mod summary;
pub mod utils;

pub use error::{Error, Result};
