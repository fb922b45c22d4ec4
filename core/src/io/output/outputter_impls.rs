//! Implementations of the individual outputters in coalsweep

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde_tuple::Serialize_tuple;

use crate::cfg::{SimConfig, SummaryOutputConfig};
use crate::sim::recorder::{NodeFlags, TableCollection};
use crate::sim::{summarize, ReplicateResult};

use crate::io::OutputMode;

use crate::io::output::{
    initialize_output, initialize_output_as_csv, ReplicateOutputter, EMPTY_CSV_RECORD,
};

////////////////////////////////////////////////////////////////////////////////////////////////////////////////////////
// GenotypesOutputter
////////////////////////////////////////////////////////////////////////////////////////////////////////////////////////

/// Type which outputs ms-style text genotypes for the `Genotypes`
/// `OutputMode`
///
/// The stream starts with the command line and the two seeds; each
/// replicate is a `//` block with `segsites`, normalized positions, and one
/// `0`/`1` row per sample.
pub struct GenotypesOutputter<W: Write> {
    /// Writer to write data into
    writer: W,
}

impl<W: Write> GenotypesOutputter<W> {
    /// Create a new `GenotypesOutputter`, writing the command-line and seed
    /// header lines
    pub fn new(mut writer: W, sim_cfg: &SimConfig, command_line: &str) -> Result<Self> {
        writeln!(writer, "{}", command_line)?;
        writeln!(writer, "{} {}", sim_cfg.seeds[0], sim_cfg.seeds[1])?;
        Ok(Self { writer })
    }

    /// Consume the outputter and get back the underlying `writer`
    ///
    /// Will not necessarily flush the writer
    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> ReplicateOutputter for GenotypesOutputter<W> {
    fn record_replicate(&mut self, result: &ReplicateResult) -> Result<()> {
        let variants = result.variants();
        let n_sites = f64::from(result.tables.sequence_length);

        writeln!(self.writer)?;
        writeln!(self.writer, "//")?;
        writeln!(self.writer, "segsites: {}", variants.positions.len())?;
        if !variants.positions.is_empty() {
            write!(self.writer, "positions:")?;
            for p in &variants.positions {
                write!(self.writer, " {:.6}", p / n_sites)?;
            }
            writeln!(self.writer)?;
        }
        for row in &variants.genotypes {
            for &g in row {
                write!(self.writer, "{}", g)?;
            }
            writeln!(self.writer)?;
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////////////////////////
// TablesOutputter
////////////////////////////////////////////////////////////////////////////////////////////////////////////////////////

/// Type which dumps the finished tables for the `Tables` `OutputMode`
///
/// One file per replicate; with more than one replicate a `_repN` suffix is
/// inserted before the extension. The file is two header lines followed by a
/// shape line and the four tables as compact JSON rows, which is the
/// ingestion format of the external tree-sequence toolkit.
pub struct TablesOutputter {
    /// Output path the per-replicate paths derive from
    base_path: PathBuf,
    /// Total number of replicates, controlling the suffix
    replicates: u32,
    /// Configuration echoed into every file header
    sim_cfg: SimConfig,
}

/// Node row of the dump
#[derive(Serialize_tuple)]
struct NodeDump {
    time: f64,
    population: i32,
    is_sample: u8,
}

/// Edge row of the dump
#[derive(Serialize_tuple)]
struct EdgeDump {
    left: u32,
    right: u32,
    parent: u32,
    child: u32,
}

/// Site row of the dump
#[derive(Serialize_tuple)]
struct SiteDump {
    position: f64,
    ancestral_state: char,
}

/// Mutation row of the dump
#[derive(Serialize_tuple)]
struct MutationDump {
    site: u32,
    node: u32,
    derived_state: char,
}

/// Shape line of the dump
#[derive(serde::Serialize)]
struct TablesShape {
    sequence_length: u32,
    time_units: &'static str,
    nodes: usize,
    edges: usize,
    sites: usize,
    mutations: usize,
    samples: Vec<u32>,
}

impl TablesOutputter {
    /// Create a new `TablesOutputter` writing beside `path`
    pub fn new<P: AsRef<Path>>(path: P, sim_cfg: &SimConfig) -> Self {
        Self {
            base_path: path.as_ref().to_path_buf(),
            replicates: sim_cfg.replicates,
            sim_cfg: sim_cfg.clone(),
        }
    }

    /// Path for one replicate's file
    fn replicate_path(&self, replicate: u32) -> PathBuf {
        if self.replicates <= 1 {
            return self.base_path.clone();
        }
        let stem = self
            .base_path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("out");
        let name = match self.base_path.extension().and_then(|e| e.to_str()) {
            Some(ext) => format!("{}_rep{}.{}", stem, replicate, ext),
            None => format!("{}_rep{}", stem, replicate),
        };
        self.base_path.with_file_name(name)
    }

    fn write_tables<W: Write>(
        &self,
        mut writer: W,
        tables: &TableCollection,
        samples: &[crate::sim::recorder::NodeId],
    ) -> Result<()> {
        initialize_output(&mut writer, &self.sim_cfg, OutputMode::Tables, "# ")?;
        let shape = TablesShape {
            sequence_length: tables.sequence_length,
            time_units: "2N0 generations",
            nodes: tables.nodes.len(),
            edges: tables.edges.len(),
            sites: tables.sites.len(),
            mutations: tables.mutations.len(),
            samples: samples.iter().map(|s| s.0).collect(),
        };
        serde_json::to_writer(writer.by_ref(), &shape)?;
        writeln!(writer)?;

        for n in &tables.nodes {
            serde_json::to_writer(
                writer.by_ref(),
                &NodeDump {
                    time: n.time,
                    population: n.population,
                    is_sample: u8::from(n.flags.contains(NodeFlags::IS_SAMPLE)),
                },
            )?;
            writeln!(writer)?;
        }
        for e in &tables.edges {
            serde_json::to_writer(
                writer.by_ref(),
                &EdgeDump {
                    left: e.left,
                    right: e.right,
                    parent: e.parent.0,
                    child: e.child.0,
                },
            )?;
            writeln!(writer)?;
        }
        for s in &tables.sites {
            serde_json::to_writer(
                writer.by_ref(),
                &SiteDump {
                    position: s.position,
                    ancestral_state: s.ancestral_state,
                },
            )?;
            writeln!(writer)?;
        }
        for m in &tables.mutations {
            serde_json::to_writer(
                writer.by_ref(),
                &MutationDump {
                    site: m.site,
                    node: m.node.0,
                    derived_state: m.derived_state,
                },
            )?;
            writeln!(writer)?;
        }
        writer.flush()?;
        Ok(())
    }
}

impl ReplicateOutputter for TablesOutputter {
    fn record_replicate(&mut self, result: &ReplicateResult) -> Result<()> {
        let path = self.replicate_path(result.replicate);
        let writer = BufWriter::new(File::create(path)?);
        self.write_tables(writer, &result.tables, &result.samples)
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////////////////////////
// SummaryOutputter
////////////////////////////////////////////////////////////////////////////////////////////////////////////////////////

/// Type which outputs data for the `Summary` `OutputMode`
pub struct SummaryOutputter<W: Write> {
    /// Buffered csv file writer to write data into
    writer: csv::Writer<W>,
    /// What summary stats to output
    cfg: SummaryOutputConfig,
}

/// Create helper methods to get rid of repetitive typing of operations on
/// stats in the SummaryOutputter methods
///
/// Using this as a single macro with functions rather than separate macros
/// ensures the order of the stats is consistent, which we need it to be
macro_rules! summary_outputter_create_stats_helpers {
    ($($stat:ident),+ $(,)?) => {
        impl<W: Write> SummaryOutputter<W> {
            /// Push labels for enabled stats to the end of headers in proper order
            fn push_enabled_stat_headers(cfg: &SummaryOutputConfig, headers: &mut Vec<&str>) {
                $(
                    if cfg.$stat {
                        headers.push(stringify!($stat));
                    }
                )+
            }

            /// Write the CSV fields for enabled stats in proper order
            fn write_enabled_stat_fields(&mut self, tables: &TableCollection) -> Result<()> {
                $(
                    if self.cfg.$stat {
                        self.writer.write_field(format!("{}", summarize::$stat(tables)))?;
                    }
                )+

                Ok(())
            }
        }

        // Verify that all available statistics are accounted for in the macro invocation
        // Struct isn't actually used for anything but all fields must be supplied
        const _: () = {
            SummaryOutputConfig {
                $($stat: false),+
            };
        };
    }
}

summary_outputter_create_stats_helpers! {
    segregating_sites,
    tmrca,
    marginal_tree_count,
    total_edge_mass,
}

impl<W: Write> SummaryOutputter<W> {
    /// Create a new `SummaryOutputter` from options in a
    /// `SummaryOutputConfig` and `SimConfig`
    ///
    /// Writes header data to the underlying `writer`
    pub fn new(writer: W, summary_cfg: SummaryOutputConfig, sim_cfg: &SimConfig) -> Result<Self> {
        let mut writer = initialize_output_as_csv(writer, sim_cfg, OutputMode::Summary)?;

        // Header must be done manually for how we handle the output
        let mut header = vec!["replicate"];
        Self::push_enabled_stat_headers(&summary_cfg, &mut header);
        writer.write_record(header)?;

        Ok(Self {
            writer,
            cfg: summary_cfg,
        })
    }

    /// Consume the outputter and get back the underlying `writer`
    ///
    /// Will not necessarily flush the writer
    pub fn into_inner(self) -> Result<W, csv::IntoInnerError<csv::Writer<W>>> {
        self.writer.into_inner()
    }
}

impl<W: Write> ReplicateOutputter for SummaryOutputter<W> {
    fn record_replicate(&mut self, result: &ReplicateResult) -> Result<()> {
        self.writer.write_field(result.replicate.to_string())?;
        self.write_enabled_stat_fields(&result.tables)?;
        self.writer.write_record(EMPTY_CSV_RECORD)?;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}
