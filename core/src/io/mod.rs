//! Types to handle the output of simulation data and retrieval of encoded
//! metadata and configuration settings

use serde::{Deserialize, Serialize};

mod input_parsing;
mod output;

pub use input_parsing::extract_sim_config;
pub use output::{
    GenotypesOutputter, OutputterGroup, OutputterGroupBuilder, ReplicateOutputter,
    SummaryOutputter, TablesOutputter,
};

/// Type of output to produce
#[derive(Serialize, Deserialize, Copy, Clone)]
enum OutputMode {
    /// ms-style text genotypes
    Genotypes,
    /// Tree-sequence tables as self-describing row dumps
    Tables,
    /// Per-replicate summary statistics, as CSV
    Summary,
}

/// Information used to mark output files as having been created by a
/// specific version of coalsweep
#[derive(Serialize, Deserialize)]
struct Metadata {
    name: String,
    version: String,
    description: String,
    output_mode: OutputMode,
}

impl Metadata {
    /// Construct a new `Metadata` instance based on the current version of
    /// the code and the desired `OutputMode`
    fn new(output_mode: OutputMode) -> Self {
        Self {
            name: "coalsweep".to_string(),
            version: get_current_version_str().to_string(),
            description: "coalsweep backward-time coalescent simulation with selective sweeps"
                .to_string(),
            output_mode,
        }
    }
}

/// Get the current version of coalsweep as defined in Cargo.toml
fn get_current_version_str() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
