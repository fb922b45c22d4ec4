//! The simulation engine: per-replicate driver and shared state
//!
//! `SimulationHandler` runs replicates one at a time through a pull-style
//! interface. Each replicate seeds the lineage registry and the recorder
//! with the sampled leaves, walks the sorted demographic event vector
//! alternating neutral and sweep phases, then finalizes: flush, sort,
//! simplify, place mutations, and hand the tables back as a
//! `ReplicateResult`.

use log::{debug, info};
use rand::prelude::*;
use rand_distr::Exp1;
use rand_pcg::Pcg64;
use thiserror::Error;

use crate::cfg::{ConfigError, ReplicateParams, SimConfig};

use events::{sort_events, DemographicEvent, EventKind};
use recorder::{NodeId, Recorder, SimplifyOptions};
use registry::{Lineage, LineageRegistry};
use segments::SegmentArena;
use trajectory::{Trajectory, TrajectoryRequest};

mod active;
mod ops;
mod phases;
mod registry;
mod segments;

pub mod events;
pub mod mutate;
pub mod recorder;
pub mod simplify;
pub mod summarize;
pub mod trajectory;

use active::ActiveMaterial;

/// Hard time horizon, in units of `2N0` generations; a replicate that has
/// not reached MRCA everywhere by then stops without claiming completion
pub const MAXTIME: f64 = 100_000.0;

/// RNG used for the simulations
///
/// Will be a type that implements the `Rng` trait from `rand`
pub type SimRng = Pcg64;

/// A failure during a running replicate; configuration problems are caught
/// earlier as [`ConfigError`]
#[derive(Error, Debug)]
pub enum SimError {
    /// Filesystem failure while writing or mapping a trajectory
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),
    /// A trajectory proposal ran past the hard step cap
    #[error("sweep trajectory exceeded the step limit at step {steps}")]
    TrajectoryOverflow {
        /// Step count at abort
        steps: u64,
    },
    /// The scheduler stepped past the end of the mapped trajectory
    #[error("sweep trajectory exhausted at step {step}; scheduler/trajectory coupling is broken")]
    TrajectoryExhausted {
        /// Cursor position of the failed read
        step: u64,
    },
}

/// All mutable state of one running replicate
pub(crate) struct SimState {
    /// Number of discrete sites
    pub n_sites: u32,
    /// Total number of sampled chromosomes
    pub sample_size: u32,
    /// Minimal recording (elide recombination junctions) vs full ARG
    pub minimal: bool,
    /// Per-replicate parameter values
    pub params: ReplicateParams,
    /// Ancestry-segment arena
    pub arena: SegmentArena,
    /// Sites that have not reached MRCA
    pub active: ActiveMaterial,
    /// Active lineages
    pub registry: LineageRegistry,
    /// Tables and edge buffer
    pub recorder: Recorder,
    /// The replicate's random stream
    pub rng: SimRng,
    /// Current migration matrix
    pub mig: Vec<Vec<f64>>,
    /// Current population size ratios
    pub current_size: Vec<f64>,
    /// Whether a sweep epoch is in progress across event boundaries
    pub still_sweeping: bool,
    /// Current beneficial-allele frequency during a sweep
    pub current_freq: f64,
    /// Sweep position for the running (or next) sweep; `None` = left-flank
    pub sweep_site: Option<f64>,
    /// Current left-flank recombination rate
    pub left_rho: f64,
    /// The accepted trajectory being replayed, while a sweep runs
    pub trajectory: Option<Trajectory>,
}

impl SimState {
    fn new(n_sites: u32, sample_size: u32, npops: usize, minimal: bool, params: ReplicateParams, rng: SimRng) -> Self {
        Self {
            n_sites,
            sample_size,
            minimal,
            sweep_site: params.sweep_site,
            left_rho: params.left_rho,
            params,
            arena: SegmentArena::new(),
            active: ActiveMaterial::new(n_sites),
            registry: LineageRegistry::new(npops),
            recorder: Recorder::new(n_sites),
            rng,
            mig: vec![vec![0.0; npops]; npops],
            current_size: vec![1.0; npops],
            still_sweeping: false,
            current_freq: 0.0,
            trajectory: None,
        }
    }

    /// Create one sampled leaf: recorder node, full-span ancestry, registry
    /// entry; dormant leaves wait for their ancient-sample activation event
    fn add_leaf(&mut self, pop: usize, time: f64, dormant: bool) {
        let node = self.recorder.add_sample(time, pop as i32);
        let head = self.arena.new_leaf_list(self.n_sites, node);
        let mut lineage = Lineage::new(time, pop as i32);
        lineage.head = Some(head);
        lineage.recorder = Some(node);
        lineage.active_sites = self.n_sites;
        lineage.left_limit = 0;
        lineage.right_limit = self.n_sites - 1;
        if dormant {
            lineage.population = -(pop as i32 + 1);
            self.registry.insert_dormant(lineage);
        } else {
            self.registry.insert(lineage);
        }
    }

    /// Bare state for unit tests of the operations and phases
    #[cfg(test)]
    pub(crate) fn for_tests(
        sample_size: u32,
        n_sites: u32,
        npops: usize,
        minimal: bool,
        seed: u64,
    ) -> Self {
        let params = ReplicateParams {
            theta: 0.0,
            rho: 0.0,
            gamma: 0.0,
            gc_mean: 100.0,
            alpha: 0.0,
            sweep_site: Some(0.5),
            left_rho: 0.0,
            f0: 0.0,
            u_a: 0.0,
            final_freq: None,
            sweep_mode: None,
            recurrent_sweep_rate: 0.0,
            delta_t_mod: 40.0,
            n0: 1e6,
        };
        Self::new(
            n_sites,
            sample_size,
            npops,
            minimal,
            params,
            SimRng::seed_from_u64(seed),
        )
    }

    /// Seed contemporary leaves per population, for unit tests
    #[cfg(test)]
    pub(crate) fn seed_samples(&mut self, sizes: &[usize]) {
        for (pop, &n) in sizes.iter().enumerate() {
            for _ in 0..n {
                self.add_leaf(pop, 0.0, false);
            }
        }
    }
}

/// Handler to run the simulations from config, exposing each finished
/// replicate through an iterator-like interface
pub struct SimulationHandler {
    /// Replicates finished so far
    replicate: u32,
    /// Validated configuration with derived quantities
    cfg: InternalSimConfig,
    /// RNG shared by all replicates, seeded once
    rng: SimRng,
    /// Segment arena recycled across replicates (O(1) reset)
    arena_pool: SegmentArena,
}

impl SimulationHandler {
    /// Validate `cfg`, resolve missing seeds from entropy, and prepare to run
    pub fn new(cfg: SimConfig) -> Result<Self, ConfigError> {
        cfg.validate()?;
        let cfg = InternalSimConfig::new(cfg);
        let rng = SimRng::new(
            u128::from(cfg.inner.seeds[0]),
            u128::from(cfg.inner.seeds[1]),
        );
        info!(
            "simulating {} replicate(s) of n={} over {} sites",
            cfg.inner.replicates, cfg.inner.sample_size, cfg.inner.sites
        );
        Ok(Self {
            replicate: 0,
            cfg,
            rng,
            arena_pool: SegmentArena::new(),
        })
    }

    /// The configuration, with seeds resolved
    pub fn config(&self) -> &SimConfig {
        &self.cfg.inner
    }

    /// Run the next replicate, or `None` when all are done
    pub fn next_replicate(&mut self) -> Option<Result<ReplicateResult, SimError>> {
        if self.replicate >= self.cfg.inner.replicates {
            return None;
        }
        self.replicate += 1;
        Some(self.run_replicate())
    }

    /// Draw per-replicate parameters from any configured priors and build
    /// the sorted event vector they imply
    fn resolve_replicate(&mut self) -> (ReplicateParams, Vec<DemographicEvent>) {
        let cfg = &self.cfg.inner;
        let rng = &mut self.rng;

        let rho = if !cfg.prior_rho.is_empty() {
            uniform(cfg.prior_rho[0], cfg.prior_rho[1], rng)
        } else if !cfg.prior_rho_exp.is_empty() {
            let draw: f64 = cfg.prior_rho_exp[0] * rand::distributions::Distribution::<f64>::sample(&Exp1, rng);
            draw.min(cfg.prior_rho_exp[1])
        } else {
            cfg.rho
        };
        let (gamma, gc_mean) = match self.cfg.gene_conversion {
            Some((rate, tract, true)) => (rho * rate, tract),
            Some((rate, tract, false)) => (rate, tract),
            None => (0.0, 100.0),
        };
        let sweep_site = if cfg.left_sweep || cfg.recurrent_left_rate > 0.0 {
            None
        } else if !cfg.prior_sweep_site.is_empty() {
            Some(uniform(cfg.prior_sweep_site[0], cfg.prior_sweep_site[1], rng))
        } else {
            Some(cfg.sweep_site.unwrap_or(0.5))
        };
        let final_freq = if !cfg.prior_final_freq.is_empty() {
            Some(uniform(cfg.prior_final_freq[0], cfg.prior_final_freq[1], rng))
        } else {
            cfg.final_freq
        };
        let params = ReplicateParams {
            theta: prior_or(&cfg.prior_theta, cfg.theta, rng),
            rho,
            gamma,
            gc_mean,
            alpha: prior_or(&cfg.prior_alpha, cfg.alpha, rng),
            sweep_site,
            left_rho: cfg.left_rho,
            f0: prior_or(&cfg.prior_min_freq, cfg.min_freq, rng),
            u_a: prior_or(&cfg.prior_adaptive_rate, cfg.adaptive_mutation_rate, rng),
            final_freq,
            sweep_mode: cfg.sweep.map(Into::into),
            recurrent_sweep_rate: if cfg.recurrent_left_rate > 0.0 {
                cfg.recurrent_left_rate
            } else {
                cfg.recurrent_rate
            },
            delta_t_mod: cfg.delta_t_mod,
            n0: cfg.popn_size,
        };

        let mut events = self.cfg.events_template.clone();
        let tau = prior_or(&cfg.prior_tau, cfg.tau, rng);
        for event in &mut events {
            if event.kind == EventKind::SweepOnset {
                event.time = tau;
            }
        }
        for (prior, index) in [(&cfg.prior_event1, 1usize), (&cfg.prior_event2, 2usize)] {
            if prior.len() == 4 {
                if let Some(event) = events.get_mut(index) {
                    event.time = uniform(prior[0], prior[1], rng);
                    if let EventKind::SizeChange { size, .. } = &mut event.kind {
                        *size = uniform(prior[2], prior[3], rng);
                    }
                }
            }
        }
        sort_events(&mut events);
        (params, events)
    }

    fn run_replicate(&mut self) -> Result<ReplicateResult, SimError> {
        let (params, events) = self.resolve_replicate();
        let minimal = !self.cfg.inner.full_arg;
        let npops = self.cfg.sample_sizes.len();
        let mut state = SimState::new(
            self.cfg.inner.sites,
            self.cfg.inner.sample_size,
            npops,
            minimal,
            params,
            self.rng.clone(),
        );
        state.mig = self.cfg.migration.clone();
        // Recycle the segment arena's allocations from the last replicate
        let mut arena = std::mem::take(&mut self.arena_pool);
        arena.reset();
        state.arena = arena;

        // Leaves, with ancient batches dormant until their activation event
        for (pop, &n) in self.cfg.sample_sizes.iter().enumerate() {
            let mut activations: Vec<(usize, f64)> = events
                .iter()
                .filter_map(|e| match e.kind {
                    EventKind::AncientSamples { count, pop: p } if p == pop && count > 0 => {
                        Some((count, e.time))
                    }
                    _ => None,
                })
                .collect();
            activations.reverse();
            let mut current: Option<(usize, f64)> = activations.pop();
            let mut used = 0usize;
            for _ in 0..n {
                match current {
                    Some((count, time)) => {
                        state.add_leaf(pop, time, true);
                        used += 1;
                        if used == count {
                            used = 0;
                            current = activations.pop();
                        }
                    }
                    None => state.add_leaf(pop, 0.0, false),
                }
            }
        }

        self.walk_events(&mut state, &events)?;

        // Finalize: flush, sort, simplify, mutate
        state.recorder.flush_edges();
        state.recorder.tables.sort_edges();
        let options = if minimal {
            SimplifyOptions::empty()
        } else {
            SimplifyOptions::KEEP_UNARY
        };
        let input_samples = state.recorder.samples.clone();
        let idmap = simplify::simplify(&mut state.recorder.tables, &input_samples, options);
        let samples: Vec<NodeId> = input_samples
            .iter()
            .map(|s| idmap[s.index()].expect("sample nodes survive simplification"))
            .collect();

        if state.params.sweep_mode.is_some() {
            if let Some(site) = state.params.sweep_site {
                let carriers: Vec<NodeId> = state
                    .recorder
                    .sweep_carriers
                    .iter()
                    .filter_map(|c| idmap[c.index()])
                    .collect();
                mutate::place_sweep_mutations(&mut state.recorder.tables, &carriers, site);
            }
        }
        mutate::drop_mutations(&mut state.recorder.tables, state.params.theta, &mut state.rng);

        // Hand the random stream and the arena back for the next replicate
        self.rng = state.rng.clone();
        self.arena_pool = std::mem::take(&mut state.arena);
        debug!(
            "replicate {} finished: {} nodes, {} edges, {} sites",
            self.replicate,
            state.recorder.tables.nodes.len(),
            state.recorder.tables.edges.len(),
            state.recorder.tables.sites.len()
        );

        Ok(ReplicateResult {
            replicate: self.replicate,
            params: state.params,
            tables: std::mem::take(&mut state.recorder.tables),
            samples,
        })
    }

    /// Walk the sorted event vector, running the appropriate phase between
    /// consecutive events, then close with a final neutral phase
    fn walk_events(
        &mut self,
        state: &mut SimState,
        events: &[DemographicEvent],
    ) -> Result<f64, SimError> {
        let mut t = 0.0;
        for (j, event) in events.iter().enumerate() {
            // Dormant ancient samples count: their activation events are
            // still ahead even when the contemporary lineages have coalesced
            if state.registry.num_active() + state.registry.num_dormant() <= 1 {
                break;
            }
            let next_time = events.get(j + 1).map(|e| e.time).unwrap_or(MAXTIME);
            t = event.time;
            match event.kind {
                EventKind::SizeChange { pop, size } => {
                    state.current_size[pop] = size;
                }
                EventKind::Join { src, dest } => ops::merge_populations(state, src, dest),
                EventKind::Admix {
                    pop,
                    dest1,
                    dest2,
                    proportion,
                } => ops::admix_populations(state, pop, dest1, dest2, proportion),
                EventKind::AncientSamples { count, pop } => {
                    ops::activate_ancient_samples(state, count, pop, event.time)
                }
                EventKind::MigrationChange { src, dest, rate } => match dest {
                    Some(dest) => state.mig[src][dest] = rate,
                    None => {
                        let npops = state.mig.len();
                        for q in 0..npops {
                            if q != src {
                                state.mig[src][q] = rate;
                            }
                        }
                    }
                },
                EventKind::SweepOnset => {
                    let hard =
                        1.0 - 1.0 / (2.0 * state.params.n0 * state.current_size[0]);
                    state.current_freq = match state.params.final_freq {
                        Some(c) => c.min(hard),
                        None => hard,
                    };
                    let request = TrajectoryRequest {
                        events_tail: &events[j..],
                        size_ratio: state.current_size[0],
                        mode: state
                            .params
                            .sweep_mode
                            .expect("sweep onset requires a sweep kind"),
                        initial_freq: state.current_freq,
                        alpha: state.params.alpha,
                        f0: state.params.f0,
                        current_time: t,
                        delta_t_mod: state.params.delta_t_mod,
                        n0: state.params.n0,
                    };
                    state.trajectory = Some(trajectory::generate(&request, &mut state.rng)?);
                    let u_a = state.params.u_a;
                    t = phases::sweep_phase(state, t, next_time, u_a)?;
                    if !state.still_sweeping {
                        state.trajectory = None;
                        state.registry.clear_sweep_classes();
                    }
                    if t < next_time {
                        t = self.run_quiet_phase(state, t, next_time, &events[j..])?;
                    }
                    continue;
                }
            }
            t = self.run_epoch(state, t, next_time, &events[j..])?;
        }
        if state.registry.num_active() > 1 {
            t = phases::neutral_phase(state, t, MAXTIME)?;
        }
        Ok(t)
    }

    /// Run one inter-event window: continue a sweep if one is in progress,
    /// then fill the rest with neutral (or recurrent-sweep) dynamics
    fn run_epoch(
        &mut self,
        state: &mut SimState,
        t: f64,
        next_time: f64,
        events_tail: &[DemographicEvent],
    ) -> Result<f64, SimError> {
        let mut t = t;
        if state.still_sweeping {
            let u_a = state.params.u_a;
            t = phases::sweep_phase(state, t, next_time, u_a)?;
            if !state.still_sweeping {
                state.trajectory = None;
                state.registry.clear_sweep_classes();
            }
        }
        if t < next_time {
            t = self.run_quiet_phase(state, t, next_time, events_tail)?;
        }
        Ok(t)
    }

    /// The no-sweep-in-progress phase: plain neutral, or neutral plus
    /// recurrent sweep onsets
    fn run_quiet_phase(
        &mut self,
        state: &mut SimState,
        t: f64,
        next_time: f64,
        events_tail: &[DemographicEvent],
    ) -> Result<f64, SimError> {
        if state.params.recurrent_sweep_rate > 0.0 && state.params.sweep_mode.is_some() {
            phases::recurrent_sweep_phase(state, t, next_time, events_tail)
        } else {
            phases::neutral_phase(state, t, next_time)
        }
    }
}

/// Uniform draw on `[low, high)`
fn uniform<R: Rng>(low: f64, high: f64, rng: &mut R) -> f64 {
    low + (high - low) * rng.gen::<f64>()
}

/// First value of a two-element prior, or the fixed fallback
fn prior_or<R: Rng>(prior: &[f64], fixed: f64, rng: &mut R) -> f64 {
    if prior.len() == 2 {
        uniform(prior[0], prior[1], rng)
    } else {
        fixed
    }
}

/// Simulation options, including those which cannot be set externally and
/// must be computed
struct InternalSimConfig {
    /// Underlying external config, seeds resolved
    pub inner: SimConfig,
    /// Per-population sample sizes
    pub sample_sizes: Vec<u32>,
    /// Unsorted event template (head entry plus user events in option order)
    pub events_template: Vec<DemographicEvent>,
    /// Constant part of the migration matrix
    pub migration: Vec<Vec<f64>>,
    /// Gene conversion `(rate, tract mean, rate is a rho ratio)`
    pub gene_conversion: Option<(f64, f64, bool)>,
}

impl InternalSimConfig {
    /// Create an `InternalSimConfig` from a validated `SimConfig`
    pub fn new(mut cfg: SimConfig) -> Self {
        if cfg.seeds.len() != 2 {
            cfg.seeds = vec![rand::random(), rand::random()];
        }
        Self {
            sample_sizes: cfg.sample_sizes(),
            events_template: cfg.events(),
            migration: cfg.migration_matrix(),
            gene_conversion: cfg.gene_conversion(),
            inner: cfg,
        }
    }
}

/// A finished replicate: final tables, sample ids, and the parameter values
/// the replicate actually used
pub struct ReplicateResult {
    /// 1-based replicate number
    pub replicate: u32,
    /// Parameter values after prior draws
    pub params: ReplicateParams,
    /// Simplified and mutated tables
    pub tables: recorder::TableCollection,
    /// Sample node ids after simplification, in sample order
    pub samples: Vec<NodeId>,
}

impl ReplicateResult {
    /// Positions and genotypes of every segregating site
    pub fn variants(&self) -> simplify::Variants {
        simplify::extract_variants(&self.tables, &self.samples)
    }
}
