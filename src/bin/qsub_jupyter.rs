use clap::Parser;
use run_jupyter::cli::{self, SubmitterCli};
use run_jupyter::logging;

fn main() {
    let cli = SubmitterCli::parse();
    logging::init();

    std::process::exit(cli::handle_submit(&cli.args));
}
