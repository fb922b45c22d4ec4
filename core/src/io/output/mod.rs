//! Output tools for coalsweep

use std::io::Write;

use anyhow::Result;
use derive_builder::Builder;

use crate::cfg::SimConfig;
use crate::sim::ReplicateResult;

use crate::io::{Metadata, OutputMode};

mod outputter_impls;

pub use outputter_impls::{GenotypesOutputter, SummaryOutputter, TablesOutputter};

////////////////////////////////////////////////////////////////////////////////////////////////////////////////////////
// OutputterGroup
////////////////////////////////////////////////////////////////////////////////////////////////////////////////////////

/// A handler which broadcasts each finished replicate to a group of
/// underlying outputters
#[allow(missing_docs)] // Builder will not have doc comment
#[derive(Builder)]
#[builder(pattern = "owned")]
pub struct OutputterGroup {
    /// Outputters receiving every replicate
    #[builder(setter(each(name = "outputter")), default)]
    outputters: Vec<Box<dyn ReplicateOutputter>>,
}

impl OutputterGroup {
    /// Record one finished replicate in all of the managed outputters
    pub fn record_replicate(&mut self, result: &ReplicateResult) -> Result<()> {
        for outputter in &mut self.outputters {
            outputter.record_replicate(result)?;
        }
        Ok(())
    }

    /// Flush every managed outputter
    pub fn finish(&mut self) -> Result<()> {
        for outputter in &mut self.outputters {
            outputter.finish()?;
        }
        Ok(())
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////////////////////////
// Traits
////////////////////////////////////////////////////////////////////////////////////////////////////////////////////////

/// An outputter that can record a finished replicate
pub trait ReplicateOutputter {
    /// Record the data for one replicate
    fn record_replicate(&mut self, result: &ReplicateResult) -> Result<()>;

    /// Flush any buffered output; called once after the last replicate
    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////////////////////////
// Utils
////////////////////////////////////////////////////////////////////////////////////////////////////////////////////////

/// Output `Metadata` and `SimConfig` options into a header using provided
/// `writer`
///
/// Allow an optional prefix for lines of the header (e.g. for comments)
fn initialize_output<W: Write>(
    writer: &mut W,
    sim_cfg: &SimConfig,
    output_mode: OutputMode,
    header_prefix: &'static str,
) -> Result<()> {
    // Write the metadata to the file with optional comment character
    write!(writer, "{}", header_prefix)?;
    let metadata = Metadata::new(output_mode);
    serde_json::to_writer(writer.by_ref(), &metadata)?;
    writeln!(writer)?;

    // Write the simulation configuration to the file with optional comment
    // character
    write!(writer, "{}", header_prefix)?;
    serde_json::to_writer(writer.by_ref(), sim_cfg)?;
    writeln!(writer)?;

    Ok(())
}

/// Manually moving onto the next record in the `csv` crate requires writing
/// an empty record
const EMPTY_CSV_RECORD: [&[u8]; 0] = [];

/// Buffer capacity to use for CSV writer
///
/// Set at 128 KB
const CSV_BUFFER_CAPACITY: usize = 128 * (1 << 10);

/// Initialize a `writer` as described in `initialize_output` and get a
/// `csv::Writer` over the underlying `writer`
fn initialize_output_as_csv<W: Write>(
    mut writer: W,
    sim_cfg: &SimConfig,
    output_mode: OutputMode,
) -> Result<csv::Writer<W>> {
    initialize_output(&mut writer, sim_cfg, output_mode, "# ")?;

    Ok(csv::WriterBuilder::new()
        .buffer_capacity(CSV_BUFFER_CAPACITY)
        .from_writer(writer))
}
