//! IO helpers specifically for the CLI portion of coalsweep

use std::fs::File;
use std::io::{self, BufWriter};
use std::path::Path;

use anyhow::Result;

use coalsweep_core::cfg::SimConfig;
use coalsweep_core::io::{
    extract_sim_config, GenotypesOutputter, OutputterGroup, OutputterGroupBuilder,
    SummaryOutputter, TablesOutputter,
};

use crate::cfg::CliOutputConfig;

/// Get an `OutputterGroup` to generate output corresponding to the provided
/// configs
pub fn outputter_group_for_cli(
    output_cfg: &CliOutputConfig,
    sim_cfg: &SimConfig,
    command_line: &str,
) -> Result<OutputterGroup> {
    let mut builder = OutputterGroupBuilder::default();

    if let Some(path) = &output_cfg.genotype_output_path {
        builder = builder.outputter(Box::new(GenotypesOutputter::new(
            create_buffered_file(path)?,
            sim_cfg,
            command_line,
        )?));
    } else if output_cfg.genotypes_to_stdout() {
        builder = builder.outputter(Box::new(GenotypesOutputter::new(
            BufWriter::new(io::stdout()),
            sim_cfg,
            command_line,
        )?));
    }

    if let Some(path) = &output_cfg.tree_output_path {
        builder = builder.outputter(Box::new(TablesOutputter::new(path, sim_cfg)));
    }

    if let Some(path) = &output_cfg.summary_output_path {
        builder = builder.outputter(Box::new(SummaryOutputter::new(
            create_buffered_file(path)?,
            output_cfg.summary_cfg.clone(),
            sim_cfg,
        )?));
    }

    Ok(builder.build()?)
}

/// Buffer capacity to use for files
/// Set at 8 MB
const FILE_BUFFER_CAPACITY: usize = 8 * (1 << 20);

/// Create a buffered `File` to use
fn create_buffered_file<P: AsRef<Path>>(path: P) -> std::io::Result<BufWriter<File>> {
    Ok(BufWriter::with_capacity(
        FILE_BUFFER_CAPACITY,
        File::create(path)?,
    ))
}

/// Extract a `SimConfig` stored from a previous run from the file at a given
/// path
pub fn extract_sim_config_from_path<P: AsRef<Path>>(path: P) -> Result<SimConfig> {
    File::open(path)
        .map_err(anyhow::Error::from)
        .and_then(extract_sim_config)
}
