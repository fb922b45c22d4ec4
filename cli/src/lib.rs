//! Library for concerns and functions specific to the coalsweep CLI, rather
//! than the coalsweep library
//!
//! This is kept separate to "dogfood" the core interface by making the CLI
//! use it, to prevent overly tight coupling of the CLI and the engine, and
//! to keep CLI concerns totally out of the public simulation interface.

use std::time;

use anyhow::{Error, Result};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

use coalsweep_core::cfg::SimConfig;
use coalsweep_core::sim::SimulationHandler;

use cfg::{CliCommand, CliOutputConfig, ReproduceConfig};
use io::{extract_sim_config_from_path, outputter_group_for_cli};

mod cfg;
mod io;

pub use cfg::CliConfig;

/// Run the CLI as specified by some `CliConfig`
pub fn run_cli_config(cfg: CliConfig) {
    env_logger::init();
    match cfg.command {
        CliCommand::Simulate(sim_cli_cfg) => {
            run_simulations(&sim_cli_cfg.output_cfg, sim_cli_cfg.sim_cfg)
        }
        CliCommand::Reproduce(reproduce_cfg) => reproduce_simulations(&reproduce_cfg),
    }
}

/// Run the simulations with command line display and display error results
/// if applicable
fn run_simulations(output_cfg: &CliOutputConfig, sim_cfg: SimConfig) {
    if let Err(e) = run_simulations_inner(output_cfg, sim_cfg) {
        report_error("Error: simulation failed.", e);
        std::process::exit(1);
    }
}

/// Reproduce simulation results by extracting settings and handing off to
/// the normal `Simulate` subcommand
fn reproduce_simulations(cfg: &ReproduceConfig) {
    match extract_sim_config_from_path(&cfg.input_path) {
        Ok(sim_cfg) => {
            if sim_cfg.seeds.len() != 2 {
                eprintln!(
                    "Note: The simulations were previously run without recorded seeds. \
                       Simulations will be run with the same settings but results will not be identical."
                );
            }

            run_simulations(&cfg.output_cfg, sim_cfg);
        }
        Err(e) => {
            report_error(
                "Error: Failed to read simulation options for reproduction",
                e,
            );
            std::process::exit(1);
        }
    }
}

/// Run the simulations with command line display and pass error results up
fn run_simulations_inner(output_cfg: &CliOutputConfig, sim_cfg: SimConfig) -> Result<()> {
    const TARGET_UPDATE_INTERVAL: time::Duration = time::Duration::from_millis(500);

    let command_line = command_line_string();
    let replicates = sim_cfg.replicates;

    // The handler validates the config and resolves missing seeds, so the
    // outputters see the seeds that actually get used
    let mut simulation_handler = SimulationHandler::new(sim_cfg)?;
    let mut output_handler = outputter_group_for_cli(
        output_cfg,
        simulation_handler.config(),
        &command_line,
    )?;

    let bar = styled_bar(u64::from(replicates), "Replicate:");
    let mut last_update = time::Instant::now();

    while let Some(result) = simulation_handler.next_replicate() {
        let result = result?;
        output_handler.record_replicate(&result)?;
        if last_update.elapsed() >= TARGET_UPDATE_INTERVAL {
            bar.set_position(u64::from(result.replicate));
            last_update = time::Instant::now();
        }
    }
    output_handler.finish()?;
    bar.finish_and_clear();

    Ok(())
}

/// The invocation as typed, echoed into genotype output headers
fn command_line_string() -> String {
    std::env::args().collect::<Vec<_>>().join(" ")
}

/// Report an `error` and a `message` to the user
fn report_error(message: &str, error: Error) {
    eprintln!("{}", message);
    eprintln!("{:#}", error);
}

/// Get `ProgressBar` with style options and a custom prefix set to use for
/// displaying progress
fn styled_bar(len: u64, prefix: &str) -> ProgressBar {
    let bar = ProgressBar::with_draw_target(len, ProgressDrawTarget::stderr_nohz())
        .with_style(ProgressStyle::default_bar().template("{prefix} {wide_bar} [{pos}/{len}]"));
    bar.set_prefix(prefix);

    bar
}
