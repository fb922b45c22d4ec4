//! Configuration options for the simulations and output, with CLI parsing
//! traits derived
//!
//! `SimConfig` is both the command-line surface and the provenance record:
//! it serializes into every output header, and the reproduce flow parses it
//! back out. Validation happens once, before any simulation starts, and
//! turns flag soup into typed errors.

use clap::{AppSettings, ArgEnum, Parser};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::sim::events::{initial_event, DemographicEvent, EventKind};
use crate::sim::trajectory::SweepMode;

/// Largest supported sample size; ancestry counts and simplification queues
/// stay in comfortable range below this
pub const MAX_SAMPLE_SIZE: u32 = 1_048_576;

/// Largest supported number of discrete sites
pub const MAX_SITES: u32 = 100_000_000;

/// Which forward-time process the sweep frequency follows
#[derive(Copy, Clone, Debug, PartialEq, Eq, ArgEnum, Serialize, Deserialize)]
pub enum SweepKind {
    /// Stochastic genic selection conditioned on fixation
    Stochastic,
    /// Deterministic logistic path
    Deterministic,
    /// Neutral fixation (no selection on the focal allele)
    Neutral,
}

impl From<SweepKind> for SweepMode {
    fn from(kind: SweepKind) -> Self {
        match kind {
            SweepKind::Stochastic => SweepMode::Stochastic,
            SweepKind::Deterministic => SweepMode::Deterministic,
            SweepKind::Neutral => SweepMode::Neutral,
        }
    }
}

/// Options for summary output statistics
#[derive(Clone, Parser)]
#[clap(setting = AppSettings::DeriveDisplayOrder)]
pub struct SummaryOutputConfig {
    /// Output the number of segregating sites
    #[clap(skip = true)]
    pub segregating_sites: bool,
    /// Output the time of the oldest MRCA
    #[clap(long)]
    pub tmrca: bool,
    /// Output the number of distinct marginal trees
    #[clap(long)]
    pub marginal_tree_count: bool,
    /// Output the total branch mass of the recorded edges
    #[clap(long)]
    pub total_edge_mass: bool,
}

/// Options for coalsweep simulations
#[derive(Clone, Parser, Serialize, Deserialize)]
#[clap(setting = AppSettings::DeriveDisplayOrder)]
pub struct SimConfig {
    /// Number of sampled chromosomes
    pub sample_size: u32,
    /// Number of replicates to simulate
    pub replicates: u32,
    /// Number of discrete sites in the locus
    pub sites: u32,

    /// Per-population sample sizes (one value per population; their sum
    /// must equal the sample size)
    #[clap(short = 'p', long, multiple_values = true)]
    #[serde(default)]
    pub populations: Vec<u32>,

    /// Population-scaled mutation rate of the locus
    #[clap(short = 't', long, default_value = "0.0")]
    pub theta: f64,
    /// Population-scaled recombination rate of the locus
    #[clap(short = 'r', long, default_value = "0.0")]
    pub rho: f64,
    /// Gene conversion: initiation rate and mean tract length
    #[clap(short = 'g', long, number_of_values = 2)]
    #[serde(default)]
    pub gamma: Vec<f64>,
    /// Gene conversion as a ratio of rho: ratio and mean tract length
    #[clap(long, number_of_values = 2, conflicts_with = "gamma")]
    #[serde(default)]
    pub gamma_rho_ratio: Vec<f64>,

    /// Simulate a selective sweep ending (forward time) at --tau
    #[clap(short = 'w', long, arg_enum)]
    pub sweep: Option<SweepKind>,
    /// Time of the sweep end, in units of 2N generations before sampling
    #[clap(long, default_value = "0.0")]
    pub tau: f64,
    /// Scaled selection coefficient 2Ns of the beneficial allele
    #[clap(short = 'a', long, default_value = "0.0")]
    pub alpha: f64,
    /// Sweep position as a fraction of the locus (defaults to 0.5)
    #[clap(short = 'x', long)]
    pub sweep_site: Option<f64>,
    /// The sweep happens at a locus flanking the left end; within-locus
    /// crossovers no longer separate lineages from the sweep site
    #[clap(long)]
    #[serde(default)]
    pub left_sweep: bool,
    /// Scaled recombination rate between the left-flanking sweep locus and
    /// the simulated locus
    #[clap(long, default_value = "0.0")]
    pub left_rho: f64,
    /// Soft sweep: frequency at which the beneficial allele stops being
    /// neutral, forward in time
    #[clap(short = 'f', long, default_value = "0.0")]
    pub min_freq: f64,
    /// Rate of recurrent adaptive mutation at the sweep site
    #[clap(long, default_value = "0.0")]
    pub adaptive_mutation_rate: f64,
    /// Partial sweep: frequency the beneficial allele stops at
    #[clap(short = 'c', long)]
    pub final_freq: Option<f64>,
    /// Rate of recurrent sweeps at random positions in the locus
    #[clap(short = 'R', long, default_value = "0.0")]
    pub recurrent_rate: f64,
    /// Rate of recurrent sweeps at the left-flanking locus
    #[clap(short = 'L', long, default_value = "0.0")]
    pub recurrent_left_rate: f64,

    /// Population size change: time, population, size ratio (repeatable)
    #[clap(short = 'e', long, number_of_values = 3, multiple_occurrences = true)]
    #[serde(default)]
    pub size_change: Vec<f64>,
    /// Backward-time population join: time, source, destination (repeatable)
    #[clap(short = 'j', long, number_of_values = 3, multiple_occurrences = true)]
    #[serde(default)]
    pub join: Vec<f64>,
    /// Backward-time admixture: time, population, dest1, dest2, proportion
    /// (repeatable)
    #[clap(long, number_of_values = 5, multiple_occurrences = true)]
    #[serde(default)]
    pub admix: Vec<f64>,
    /// Ancient samples: count, population, time (repeatable)
    #[clap(short = 'A', long, number_of_values = 3, multiple_occurrences = true)]
    #[serde(default)]
    pub ancient_sample: Vec<f64>,
    /// Symmetric migration rate filling every off-diagonal matrix entry
    #[clap(short = 'M', long)]
    pub migration_rate: Option<f64>,
    /// One migration matrix entry: source, destination, rate (repeatable)
    #[clap(short = 'm', long, number_of_values = 3, multiple_occurrences = true)]
    #[serde(default)]
    pub migration_entry: Vec<f64>,
    /// Migration rate change at a time: time, source, destination, rate
    /// (repeatable)
    #[clap(long, number_of_values = 4, multiple_occurrences = true)]
    #[serde(default)]
    pub migration_change: Vec<f64>,

    /// The two RNG seeds; drawn from system entropy when absent and echoed
    /// in the output header
    #[clap(short = 'd', long, number_of_values = 2)]
    #[serde(default)]
    pub seeds: Vec<u64>,
    /// Reference effective population size N0
    #[clap(short = 'N', long, default_value = "1000000")]
    pub popn_size: f64,
    /// Trajectory time-step modifier: dt = 1 / (delta-t-mod * N)
    #[clap(short = 'i', long, default_value = "40.0")]
    pub delta_t_mod: f64,
    /// Record the full ARG: keep recombination junction nodes in the tables
    #[clap(short = 'F', long)]
    #[serde(default)]
    pub full_arg: bool,

    /// Uniform prior on theta: low, high
    #[clap(long, number_of_values = 2)]
    #[serde(default)]
    pub prior_theta: Vec<f64>,
    /// Uniform prior on rho: low, high
    #[clap(long, number_of_values = 2)]
    #[serde(default)]
    pub prior_rho: Vec<f64>,
    /// Exponential prior on rho: mean, upper cap
    #[clap(long, number_of_values = 2, conflicts_with = "prior-rho")]
    #[serde(default)]
    pub prior_rho_exp: Vec<f64>,
    /// Uniform prior on alpha: low, high
    #[clap(long, number_of_values = 2)]
    #[serde(default)]
    pub prior_alpha: Vec<f64>,
    /// Uniform prior on tau: low, high
    #[clap(long, number_of_values = 2)]
    #[serde(default)]
    pub prior_tau: Vec<f64>,
    /// Uniform prior on the sweep position: low, high
    #[clap(long, number_of_values = 2)]
    #[serde(default)]
    pub prior_sweep_site: Vec<f64>,
    /// Uniform prior on the soft-sweep starting frequency: low, high
    #[clap(long, number_of_values = 2)]
    #[serde(default)]
    pub prior_min_freq: Vec<f64>,
    /// Uniform prior on the recurrent adaptive mutation rate: low, high
    #[clap(long, number_of_values = 2)]
    #[serde(default)]
    pub prior_adaptive_rate: Vec<f64>,
    /// Uniform prior on the partial-sweep final frequency: low, high
    #[clap(long, number_of_values = 2)]
    #[serde(default)]
    pub prior_final_freq: Vec<f64>,
    /// Uniform prior on the first demographic event: tLow, tHigh, sizeLow,
    /// sizeHigh
    #[clap(long, number_of_values = 4)]
    #[serde(default)]
    pub prior_event1: Vec<f64>,
    /// Uniform prior on the second demographic event: tLow, tHigh, sizeLow,
    /// sizeHigh
    #[clap(long, number_of_values = 4)]
    #[serde(default)]
    pub prior_event2: Vec<f64>,
}

/// A configuration problem caught before any simulation starts
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The sample size exceeds the supported envelope
    #[error("sample size {0} exceeds the supported maximum {MAX_SAMPLE_SIZE}")]
    TooManySamples(u32),
    /// Fewer than two chromosomes cannot coalesce
    #[error("at least two sampled chromosomes are required")]
    TooFewSamples,
    /// The site count exceeds the supported envelope
    #[error("{0} sites exceeds the supported maximum {MAX_SITES}")]
    TooManySites(u32),
    /// A locus needs at least two sites
    #[error("at least two sites are required")]
    TooFewSites,
    /// Per-population sample sizes disagree with the total
    #[error("per-population sample sizes sum to {sum}, expected {expected}")]
    SampleSizeMismatch {
        /// Sum of the per-population sizes
        sum: u32,
        /// The positional sample size
        expected: u32,
    },
    /// A population index is out of range
    #[error("population {0} does not exist ({1} populations configured)")]
    UnknownPopulation(usize, usize),
    /// Migration was configured with a single population
    #[error("migration requires more than one population")]
    MigrationSinglePop,
    /// A probability or frequency left the unit interval
    #[error("{what} must lie in (0, 1], got {value}")]
    BadProportion {
        /// Name of the offending option
        what: &'static str,
        /// The rejected value
        value: f64,
    },
    /// A demographic event happens at a negative time
    #[error("event times must be non-negative, got {0}")]
    BadEventTime(f64),
    /// A sweep was requested without a positive selection coefficient
    #[error("sweep kind {0:?} requires --alpha > 0")]
    MissingAlpha(SweepKind),
    /// Recurrent sweeps need a sweep kind to draw trajectories from
    #[error("recurrent sweep rates require --sweep")]
    RecurrentWithoutSweep,
    /// The combination of recurrent sweeps and a soft-sweep floor is
    /// unspecified and rejected outright
    #[error("recurrent sweeps cannot be combined with a soft-sweep floor")]
    RecurrentSoftSweep,
    /// A left-flank sweep excludes an interior sweep site
    #[error("--left-sweep excludes an interior --sweep-site")]
    LeftSweepWithSite,
    /// Gene conversion tract mean must allow tracts of at least one site
    #[error("gene conversion mean tract length must be at least 1")]
    BadTractLength,
}

impl SimConfig {
    /// Per-population sample sizes, defaulting to one panmictic population
    pub fn sample_sizes(&self) -> Vec<u32> {
        if self.populations.is_empty() {
            vec![self.sample_size]
        } else {
            self.populations.clone()
        }
    }

    /// Number of populations
    pub fn npops(&self) -> usize {
        self.sample_sizes().len()
    }

    /// Gene conversion `(rate, mean tract length, rate is a rho ratio)`
    pub(crate) fn gene_conversion(&self) -> Option<(f64, f64, bool)> {
        if !self.gamma.is_empty() {
            Some((self.gamma[0], self.gamma[1], false))
        } else if !self.gamma_rho_ratio.is_empty() {
            Some((self.gamma_rho_ratio[0], self.gamma_rho_ratio[1], true))
        } else {
            None
        }
    }

    /// Whether any sweep dynamics are configured
    pub fn has_sweep(&self) -> bool {
        self.sweep.is_some()
    }

    /// Whether sweeps recur at a constant rate instead of at a fixed time
    pub fn recurrent_sweeps(&self) -> bool {
        self.recurrent_rate > 0.0 || self.recurrent_left_rate > 0.0
    }

    /// Check every option against the envelope and cross-option rules
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sample_size < 2 {
            return Err(ConfigError::TooFewSamples);
        }
        if self.sample_size > MAX_SAMPLE_SIZE {
            return Err(ConfigError::TooManySamples(self.sample_size));
        }
        if self.sites < 2 {
            return Err(ConfigError::TooFewSites);
        }
        if self.sites > MAX_SITES {
            return Err(ConfigError::TooManySites(self.sites));
        }
        let sizes = self.sample_sizes();
        let npops = sizes.len();
        let sum: u32 = sizes.iter().sum();
        if sum != self.sample_size {
            return Err(ConfigError::SampleSizeMismatch {
                sum,
                expected: self.sample_size,
            });
        }
        if npops == 1
            && (self.migration_rate.is_some()
                || !self.migration_entry.is_empty()
                || !self.migration_change.is_empty())
        {
            return Err(ConfigError::MigrationSinglePop);
        }
        if let Some((_, tract, _)) = self.gene_conversion() {
            if tract < 1.0 {
                return Err(ConfigError::BadTractLength);
            }
        }
        if let Some(kind) = self.sweep {
            if kind != SweepKind::Neutral && self.alpha <= 0.0 {
                return Err(ConfigError::MissingAlpha(kind));
            }
        }
        if self.recurrent_sweeps() {
            if self.sweep.is_none() {
                return Err(ConfigError::RecurrentWithoutSweep);
            }
            if self.min_freq > 0.0 {
                return Err(ConfigError::RecurrentSoftSweep);
            }
        }
        if self.left_sweep && self.sweep_site.is_some() {
            return Err(ConfigError::LeftSweepWithSite);
        }
        if let Some(c) = self.final_freq {
            if !(0.0..=1.0).contains(&c) || c == 0.0 {
                return Err(ConfigError::BadProportion {
                    what: "--final-freq",
                    value: c,
                });
            }
        }
        if let Some(x) = self.sweep_site {
            if !(0.0..=1.0).contains(&x) {
                return Err(ConfigError::BadProportion {
                    what: "--sweep-site",
                    value: x,
                });
            }
        }

        let pop_in_range = |p: f64| -> Result<usize, ConfigError> {
            let p = p as usize;
            if p >= npops {
                return Err(ConfigError::UnknownPopulation(p, npops));
            }
            Ok(p)
        };
        for chunk in self.size_change.chunks(3) {
            Self::time_in_range(chunk[0])?;
            pop_in_range(chunk[1])?;
        }
        for chunk in self.join.chunks(3) {
            Self::time_in_range(chunk[0])?;
            pop_in_range(chunk[1])?;
            pop_in_range(chunk[2])?;
        }
        for chunk in self.admix.chunks(5) {
            Self::time_in_range(chunk[0])?;
            pop_in_range(chunk[1])?;
            pop_in_range(chunk[2])?;
            pop_in_range(chunk[3])?;
            if !(0.0..=1.0).contains(&chunk[4]) {
                return Err(ConfigError::BadProportion {
                    what: "--admix proportion",
                    value: chunk[4],
                });
            }
        }
        for chunk in self.ancient_sample.chunks(3) {
            pop_in_range(chunk[1])?;
            Self::time_in_range(chunk[2])?;
        }
        for chunk in self.migration_entry.chunks(3) {
            pop_in_range(chunk[0])?;
            pop_in_range(chunk[1])?;
        }
        for chunk in self.migration_change.chunks(4) {
            Self::time_in_range(chunk[0])?;
            pop_in_range(chunk[1])?;
            pop_in_range(chunk[2])?;
        }
        Ok(())
    }

    fn time_in_range(time: f64) -> Result<(), ConfigError> {
        if time < 0.0 || !time.is_finite() {
            return Err(ConfigError::BadEventTime(time));
        }
        Ok(())
    }

    /// Build the unsorted event vector: the implicit head entry followed by
    /// the user events in option order
    pub fn events(&self) -> Vec<DemographicEvent> {
        let mut events = vec![initial_event()];
        for chunk in self.size_change.chunks(3) {
            events.push(DemographicEvent {
                time: chunk[0],
                kind: EventKind::SizeChange {
                    pop: chunk[1] as usize,
                    size: chunk[2],
                },
            });
        }
        for chunk in self.join.chunks(3) {
            events.push(DemographicEvent {
                time: chunk[0],
                kind: EventKind::Join {
                    src: chunk[1] as usize,
                    dest: chunk[2] as usize,
                },
            });
        }
        for chunk in self.admix.chunks(5) {
            events.push(DemographicEvent {
                time: chunk[0],
                kind: EventKind::Admix {
                    pop: chunk[1] as usize,
                    dest1: chunk[2] as usize,
                    dest2: chunk[3] as usize,
                    proportion: chunk[4],
                },
            });
        }
        for chunk in self.ancient_sample.chunks(3) {
            events.push(DemographicEvent {
                time: chunk[2],
                kind: EventKind::AncientSamples {
                    count: chunk[0] as usize,
                    pop: chunk[1] as usize,
                },
            });
        }
        for chunk in self.migration_change.chunks(4) {
            events.push(DemographicEvent {
                time: chunk[0],
                kind: EventKind::MigrationChange {
                    src: chunk[1] as usize,
                    dest: Some(chunk[2] as usize),
                    rate: chunk[3],
                },
            });
        }
        if self.has_sweep() && !self.recurrent_sweeps() {
            events.push(DemographicEvent {
                time: self.tau,
                kind: EventKind::SweepOnset,
            });
        }
        events
    }

    /// The constant part of the migration matrix
    pub fn migration_matrix(&self) -> Vec<Vec<f64>> {
        let npops = self.npops();
        let mut matrix = vec![vec![0.0; npops]; npops];
        if let Some(rate) = self.migration_rate {
            for (i, row) in matrix.iter_mut().enumerate() {
                for (j, entry) in row.iter_mut().enumerate() {
                    if i != j {
                        *entry = rate;
                    }
                }
            }
        }
        for chunk in self.migration_entry.chunks(3) {
            matrix[chunk[0] as usize][chunk[1] as usize] = chunk[2];
        }
        matrix
    }
}

/// Per-replicate parameter values after prior draws
///
/// With no priors configured these coincide with the `SimConfig` values;
/// with priors they differ per replicate and are what the outputs record.
#[derive(Clone, Debug, Serialize)]
pub struct ReplicateParams {
    /// Scaled mutation rate
    pub theta: f64,
    /// Scaled recombination rate
    pub rho: f64,
    /// Gene conversion initiation rate
    pub gamma: f64,
    /// Mean gene-conversion tract length in sites
    pub gc_mean: f64,
    /// Scaled selection coefficient
    pub alpha: f64,
    /// Sweep site as a fraction of the locus; `None` in left-flank mode
    pub sweep_site: Option<f64>,
    /// Recombination rate toward the left-flanking sweep locus
    pub left_rho: f64,
    /// Soft-sweep frequency floor
    pub f0: f64,
    /// Recurrent adaptive mutation rate
    pub u_a: f64,
    /// Partial-sweep final frequency
    pub final_freq: Option<f64>,
    /// Forward process of the sweep frequency
    #[serde(skip)]
    pub sweep_mode: Option<SweepMode>,
    /// Rate of recurrent sweep onsets during neutral phases
    pub recurrent_sweep_rate: f64,
    /// Trajectory step modifier
    pub delta_t_mod: f64,
    /// Reference population size
    pub n0: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::events::sort_events;

    fn base_config(extra: &[&str]) -> SimConfig {
        let mut args = vec!["coalsweep", "10", "1", "1000"];
        args.extend_from_slice(extra);
        SimConfig::parse_from(args)
    }

    #[test]
    fn minimal_invocation_parses_and_validates() {
        let cfg = base_config(&["-t", "5", "-r", "5"]);
        assert_eq!(cfg.sample_size, 10);
        assert_eq!(cfg.replicates, 1);
        assert_eq!(cfg.sites, 1000);
        assert_eq!(cfg.theta, 5.0);
        cfg.validate().unwrap();
        assert_eq!(cfg.npops(), 1);
    }

    #[test]
    fn population_sizes_must_sum() {
        let cfg = base_config(&["-p", "5", "4"]);
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::SampleSizeMismatch { sum: 9, .. })
        ));
    }

    #[test]
    fn migration_needs_multiple_populations() {
        let cfg = base_config(&["-M", "1.0"]);
        assert!(matches!(cfg.validate(), Err(ConfigError::MigrationSinglePop)));
    }

    #[test]
    fn sweep_event_is_generated_at_tau() {
        let cfg = base_config(&["-w", "stochastic", "--tau", "0.05", "-a", "1000"]);
        cfg.validate().unwrap();
        let events = cfg.events();
        assert!(events
            .iter()
            .any(|e| e.kind == EventKind::SweepOnset && e.time == 0.05));
    }

    #[test]
    fn recurrent_soft_sweep_is_rejected() {
        let cfg = base_config(&[
            "-w",
            "stochastic",
            "-a",
            "1000",
            "-R",
            "0.1",
            "-f",
            "0.05",
        ]);
        assert!(matches!(cfg.validate(), Err(ConfigError::RecurrentSoftSweep)));
    }

    #[test]
    fn left_sweep_excludes_interior_site() {
        let cfg = base_config(&[
            "-w",
            "stochastic",
            "-a",
            "1000",
            "--left-sweep",
            "-x",
            "0.5",
        ]);
        assert!(matches!(cfg.validate(), Err(ConfigError::LeftSweepWithSite)));
    }

    #[test]
    fn demography_round_trips_through_events() {
        let cfg = base_config(&[
            "-p", "5", "5", "-e", "0.2", "1", "0.5", "-j", "0.4", "1", "0",
        ]);
        cfg.validate().unwrap();
        let mut events = cfg.events();
        sort_events(&mut events);
        assert_eq!(events.len(), 3);
        assert!(matches!(events[1].kind, EventKind::SizeChange { pop: 1, .. }));
        assert!(matches!(events[2].kind, EventKind::Join { src: 1, dest: 0 }));
    }

    #[test]
    fn migration_matrix_is_symmetric_fill() {
        let cfg = base_config(&["-p", "5", "5", "-M", "2.0"]);
        let matrix = cfg.migration_matrix();
        assert_eq!(matrix[0][1], 2.0);
        assert_eq!(matrix[1][0], 2.0);
        assert_eq!(matrix[0][0], 0.0);
    }

    #[test]
    fn config_survives_json_round_trip() {
        let cfg = base_config(&["-t", "5", "-d", "42", "43"]);
        let json = serde_json::to_string(&cfg).unwrap();
        let back: SimConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.seeds, vec![42, 43]);
        assert_eq!(back.theta, 5.0);
    }
}
