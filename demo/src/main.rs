// Self-check harness: runs every check, prints [PASS]/[FAIL] per comparison
// and exits non-zero if anything failed.

mod checks;
mod cli;
mod logging;

use std::process;

use anyhow::{Context, Result};
use clap::Parser;

use bandgrad_core::{RecurrenceConfig, RecurrenceEngine};

use crate::cli::Cli;

fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    match run(&cli) {
        Ok(0) => {}
        Ok(_) => process::exit(1),
        Err(e) => {
            eprintln!("Error: {e:#}");
            process::exit(2);
        }
    }
}

fn load_config(cli: &Cli) -> Result<RecurrenceConfig> {
    let mut config = match &cli.config {
        Some(path) => RecurrenceConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => RecurrenceConfig::default(),
    };
    if let Some(m) = cli.band_width {
        config.band_width = m;
    }
    config.validate(cli.n)?;
    Ok(config)
}

/// Returns the number of failed comparisons.
fn run(cli: &Cli) -> Result<usize> {
    let config = load_config(cli)?;
    let engine = RecurrenceEngine::new(&config, cli.n)?;
    let m = config.band_width;
    tracing::info!(n = cli.n, horizon = cli.horizon, m, readout = config.readout, "starting checks");

    let mut results = Vec::new();
    println!("worked example (n=9, T=11, m=2)");
    results.push(("worked example", checks::worked_example()?));
    println!("banded vs dense");
    results.push(("banded vs dense", checks::dense_agreement(cli.n, cli.horizon, m)?));
    println!("adjoint identity");
    results.push(("adjoint identity", checks::adjoint_identity(cli.n, cli.seed)?));
    println!("gradient");
    results.push(("gradient", checks::gradient(&engine, cli.horizon, cli.seed)?));

    let mut total_pass = 0;
    let mut total_fail = 0;
    println!();
    for (name, (p, f)) in &results {
        let status = if *f == 0 { "PASS" } else { "FAIL" };
        println!("[{status}] {name:20} {p:>3}/{:<3}", p + f);
        total_pass += p;
        total_fail += f;
    }
    println!("total: {total_pass}/{} checks passed", total_pass + total_fail);
    Ok(total_fail)
}
