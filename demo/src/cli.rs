use std::path::PathBuf;

use clap::Parser;

/// Self-checks for the banded recurrence and its gradient.
#[derive(Parser)]
#[command(name = "bandgrad-demo", version, about = "Banded recurrence self-check harness")]
pub struct Cli {
    /// Increase verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Path to a JSON recurrence config (band_width, readout).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Band half-width; overrides the config file.
    #[arg(short = 'm', long)]
    pub band_width: Option<usize>,

    /// State dimension for the generated checks.
    #[arg(short, long, default_value_t = 9)]
    pub n: usize,

    /// Number of time steps for the generated checks.
    #[arg(short = 't', long, default_value_t = 11)]
    pub horizon: usize,

    /// Seed for the random vectors.
    #[arg(short, long, default_value_t = 42)]
    pub seed: u64,
}
