//! Configuration options specifically for the CLI portion of coalsweep
use std::path::PathBuf;

use clap::{AppSettings, Parser, Subcommand};

use coalsweep_core::cfg::{SimConfig, SummaryOutputConfig};

/// Configuration options for coalsweep command line app subcommands
#[derive(Parser)]
#[clap(version, about = "Backward-time coalescent simulation with selective sweeps")]
pub struct CliConfig {
    /// Subcommands of coalsweep
    #[clap(subcommand)]
    pub command: CliCommand,
}

/// Subcommand definitions
#[derive(Subcommand)]
#[clap(setting = AppSettings::DeriveDisplayOrder)]
pub enum CliCommand {
    /// Run simulations
    Simulate(SimulateConfig),
    /// Reproduce results from a previous simulation run
    Reproduce(ReproduceConfig),
}

/// Run the coalsweep simulation
#[derive(Parser)]
#[clap(version, setting = AppSettings::DeriveDisplayOrder)]
pub struct SimulateConfig {
    /// Output options for the CLI
    #[clap(flatten)]
    pub output_cfg: CliOutputConfig,

    /// Simulation options
    #[clap(flatten)]
    pub sim_cfg: SimConfig,
}

/// Reproduce results of a previous run of the coalsweep simulation
#[derive(Parser)]
#[clap(version, setting = AppSettings::DeriveDisplayOrder)]
pub struct ReproduceConfig {
    /// Path of the input file, which came from a previous run and contains
    /// the information needed to reproduce the results
    pub input_path: PathBuf,

    /// Output options for the CLI
    #[clap(flatten)]
    pub output_cfg: CliOutputConfig,
}

/// Command line inputs needed to output results
#[derive(Parser)]
#[clap(setting = AppSettings::DeriveDisplayOrder)]
pub struct CliOutputConfig {
    /// Path to output ms-style text genotypes; defaults to stdout unless a
    /// tree output was requested
    #[clap(short = 'o', long = "genotype-output")]
    pub genotype_output_path: Option<PathBuf>,

    /// Path to output the tree-sequence tables; with multiple replicates a
    /// _repN suffix is inserted before the extension
    #[clap(long = "tree-output")]
    pub tree_output_path: Option<PathBuf>,

    /// Path to output per-replicate summary statistics (as CSV)
    #[clap(long = "summary-output")]
    pub summary_output_path: Option<PathBuf>,

    /// Options for the summary output
    #[clap(flatten)]
    pub summary_cfg: SummaryOutputConfig,
}

impl CliOutputConfig {
    /// Should genotypes go to stdout?
    ///
    /// They do unless redirected to a file or displaced by a tree output.
    pub fn genotypes_to_stdout(&self) -> bool {
        self.genotype_output_path.is_none() && self.tree_output_path.is_none()
    }
}
