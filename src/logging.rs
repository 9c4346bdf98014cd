//! tracing setup. Log lines go to stderr; stdout carries the summary the
//! launcher parses.

use std::env;
use std::io::{self, IsTerminal};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

/// Environment variable holding an `EnvFilter` directive, e.g. `debug`.
pub const LOG_ENV: &str = "RUN_JUPYTER_LOG";

pub fn init() {
    let layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_target(false)
        .with_ansi(io::stderr().is_terminal())
        .with_writer(io::stderr);

    // A second init (tests, embedding) keeps the first subscriber.
    let _ = Registry::default().with(build_filter()).with(layer).try_init();
}

fn build_filter() -> EnvFilter {
    match env::var(LOG_ENV) {
        Ok(value) if !value.trim().is_empty() => EnvFilter::new(value),
        _ => EnvFilter::new("info"),
    }
}
