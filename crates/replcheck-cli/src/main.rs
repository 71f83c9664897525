mod bootstrap_helpers;
mod cli_args;
mod commands;
mod port_file;

use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;

use crate::bootstrap_helpers::init_tracing;
use crate::cli_args::Cli;
use crate::commands::{report_failure, run_cli, INVOCATION_ERROR_EXIT_STATUS};

async fn run(cli: Cli) -> Result<u8> {
    let cwd = std::env::current_dir().context("failed to resolve working directory")?;
    run_cli(cli, &cwd).await
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();
    match run(cli).await {
        Ok(status) => ExitCode::from(status),
        Err(error) => {
            report_failure(&error);
            ExitCode::from(INVOCATION_ERROR_EXIT_STATUS)
        }
    }
}
