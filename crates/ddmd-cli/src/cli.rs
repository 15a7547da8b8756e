use crate::utils::parser::parse_grid;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

const HELP_TEMPLATE: &str = "\
{before-help}{name} {version}
{author-with-newline}{about-with-newline}
{usage-heading} {usage}

{all-args}{after-help}
";

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "DDMD CLI - Run domain-decomposed particle simulations over a grid of in-process domains.",
    help_template = HELP_TEMPLATE,
)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity level (-v for INFO, -vv for DEBUG, -vvv for TRACE)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all log output except for errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Write logs to a specified file in addition to the console output
    #[arg(long, global = true, value_name = "PATH")]
    pub log_file: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Generate a polymer melt, distribute it over the domain grid and advance it with a random walk.
    Run(RunArgs),
    /// Validate a configuration file and print the resolved settings.
    Check(CheckArgs),
}

/// Arguments for the `run` subcommand.
#[derive(Args, Debug)]
pub struct RunArgs {
    // --- Core Arguments ---
    /// Path to the run configuration file in TOML format.
    #[arg(short, long, required = true, value_name = "PATH")]
    pub config: PathBuf,

    /// Path for the final configuration, written as CSV.
    #[arg(short, long, value_name = "PATH")]
    pub output: Option<PathBuf>,

    // --- Overrides ---
    /// Override the domain grid, e.g. '2,2,1'.
    #[arg(short, long, value_name = "X,Y,Z", value_parser = parse_grid)]
    pub grid: Option<[usize; 3]>,

    /// Override the number of chains in the melt.
    #[arg(long, value_name = "INT")]
    pub chains: Option<usize>,

    /// Override the number of atoms per chain.
    #[arg(long, value_name = "INT")]
    pub chain_length: Option<usize>,

    /// Override the number of steps.
    #[arg(short = 'n', long, value_name = "INT")]
    pub steps: Option<u64>,

    /// Override the random seed.
    #[arg(long, value_name = "INT")]
    pub seed: Option<u64>,

    /// Send ghost forces back to their owners, overriding the config file.
    #[arg(long)]
    pub reverse_update: bool,

    /// Set a specific configuration value, overriding the config file.
    /// Can be used multiple times. Example: -S exchange.skin=0.5
    #[arg(short = 'S', long = "set", value_name = "KEY=VALUE", num_args(0..))]
    pub set_values: Vec<String>,
}

/// Arguments for the `check` subcommand.
#[derive(Args, Debug)]
pub struct CheckArgs {
    /// Path to the run configuration file in TOML format.
    #[arg(short, long, required = true, value_name = "PATH")]
    pub config: PathBuf,

    /// Set a specific configuration value before validation.
    #[arg(short = 'S', long = "set", value_name = "KEY=VALUE", num_args(0..))]
    pub set_values: Vec<String>,
}

/// Command-line values that take precedence over the configuration file.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub grid: Option<[usize; 3]>,
    pub chains: Option<usize>,
    pub chain_length: Option<usize>,
    pub steps: Option<u64>,
    pub seed: Option<u64>,
    pub reverse_update: bool,
    pub set_values: Vec<String>,
}

impl From<&RunArgs> for Overrides {
    fn from(args: &RunArgs) -> Self {
        Self {
            grid: args.grid,
            chains: args.chains,
            chain_length: args.chain_length,
            steps: args.steps,
            seed: args.seed,
            reverse_update: args.reverse_update,
            set_values: args.set_values.clone(),
        }
    }
}

impl From<&CheckArgs> for Overrides {
    fn from(args: &CheckArgs) -> Self {
        Self {
            set_values: args.set_values.clone(),
            ..Self::default()
        }
    }
}
