use clap::Parser;
use run_jupyter::cli::{self, LauncherCli};
use run_jupyter::logging;

fn main() {
    let cli = LauncherCli::parse();
    logging::init();

    std::process::exit(cli::handle_launch(&cli.args));
}
