mod cli;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
mod logging;
mod validation;

use clap::Parser;

/// Entry point for the `migrate` binary. Returns the process exit code.
pub fn run() -> i32 {
    cli::run(cli::Cli::parse())
}
