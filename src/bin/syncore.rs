//! Syncore CLI Binary
//!
//! Command-line interface for the two-way directory synchronization engine.

use anyhow::Context;
use clap::Parser;
use std::process;
use syncore::tooling::cli::{Cli, CliContext};

fn init(cli: &Cli) -> anyhow::Result<CliContext> {
    let mut context = CliContext::new(cli.root.clone(), cli.config.clone())
        .with_context(|| format!("loading configuration for {}", cli.root.display()))?;
    context.init_logging(cli).context("initializing logging")?;
    Ok(context)
}

fn main() {
    let cli = Cli::parse();

    let context = match init(&cli) {
        Ok(ctx) => ctx,
        Err(e) => {
            eprintln!("Error initializing sync root: {:#}", e);
            process::exit(1);
        }
    };

    match context.execute(&cli.command) {
        Ok(output) => {
            println!("{}", output);
        }
        Err(e) => {
            eprintln!("Error: {} {}", e.exit_info(), e);
            process::exit(1);
        }
    }
}
