use clap::Parser;

use coalsweep_cli::{run_cli_config, CliConfig};

/// Entry-point for the main "coalsweep" command-line executable
fn main() {
    let cfg = CliConfig::parse();
    run_cli_config(cfg);
}
