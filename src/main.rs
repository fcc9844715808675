use std::process::ExitCode;

use clap::Parser;

use patchfill::cli::{self, CliArgs};
use patchfill::logger;

fn main() -> ExitCode {
    logger::init();
    let args = CliArgs::parse();
    cli::run(args)
}
