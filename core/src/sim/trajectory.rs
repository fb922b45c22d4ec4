//! Forward-time sweep trajectory generation and replay
//!
//! A proposal walks the beneficial-allele frequency forward in time with the
//! configured diffusion, streaming one little-endian `f32` per step into a
//! temporary file. Proposals are rejection-sampled; losers are unlinked on
//! the spot and the winner is reopened and memory-mapped read-only for
//! backward replay during the sweep phase. Trajectories spanning demographic
//! size changes rescale the step size and accumulate the acceptance ratio.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use log::debug;
use memmap2::Mmap;
use rand::Rng;

use crate::sim::events::{DemographicEvent, EventKind};
use crate::sim::{SimError, MAXTIME};

/// Hard cap on proposal length; beyond this the run is aborted
pub const MAX_TRAJECTORY_STEPS: u64 = 500_000_000;

/// Distinguishes concurrently generated files from the same process
static FILE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Which forward-time process drives the allele frequency
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SweepMode {
    /// Deterministic logistic frequency path
    Deterministic,
    /// Stochastic genic selection conditioned on fixation
    Stochastic,
    /// Neutral jump process conditioned on loss (backwards)
    Neutral,
}

/// Hyperbolic-tangent-conditioned drift step toward fixation
pub fn genic_selection_forwards<R: Rng>(dt: f64, freq: f64, alpha: f64, rng: &mut R) -> f64 {
    let p_q = freq * (1.0 - freq);
    let drift = alpha * p_q / (alpha * freq).tanh();
    if p_q <= 0.0 {
        return freq + drift * dt;
    }
    let diffusion = (p_q * dt).sqrt();
    if rng.gen::<f64>() < 0.5 {
        freq + drift * dt + diffusion
    } else {
        freq + drift * dt - diffusion
    }
}

/// Neutral jump process conditioned on loss
pub fn neutral_jump<R: Rng>(dt: f64, freq: f64, rng: &mut R) -> f64 {
    let drift = -freq * dt;
    let p_q = freq * (1.0 - freq);
    if p_q <= 0.0 {
        return freq + drift;
    }
    let diffusion = (p_q * dt).sqrt();
    let sign = 2.0 * rng.gen::<f64>() - 1.0;
    freq + drift + sign.signum() * diffusion
}

/// Deterministic logistic sweep frequency at time `t` since onset
pub fn det_sweep_freq(t: f64, alpha: f64) -> f64 {
    let epsilon = 0.05 / alpha;
    let ts = -2.0 * epsilon.ln() / alpha;
    let denom = epsilon + (1.0 - epsilon) * (alpha * (t - ts)).exp();
    epsilon / denom
}

/// A proposed trajectory on disk, not yet accepted
struct Proposal {
    path: PathBuf,
    steps: u64,
    prob_accept: f64,
}

impl Proposal {
    fn discard(self) {
        // Losers leave no trace
        let _ = fs::remove_file(&self.path);
    }
}

/// Parameters of one proposal run
pub struct TrajectoryRequest<'a> {
    /// Events from the sweep onset onward; size changes rescale `N`
    pub events_tail: &'a [DemographicEvent],
    /// Size ratio of the sweeping population at onset
    pub size_ratio: f64,
    /// Forward process
    pub mode: SweepMode,
    /// Frequency the sweep starts from, backward in time
    pub initial_freq: f64,
    /// Scaled selection coefficient `2Ns`
    pub alpha: f64,
    /// Soft-sweep frequency floor; below it the walk turns neutral
    pub f0: f64,
    /// Coalescent time of the sweep onset
    pub current_time: f64,
    /// Step-size modifier: `dt = 1 / (delta_t_mod * N)`
    pub delta_t_mod: f64,
    /// Reference population size `N0`
    pub n0: f64,
}

fn temp_path() -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    let counter = FILE_COUNTER.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!(
        "coalsweep_traj_{}_{}_{}.traj",
        std::process::id(),
        nanos,
        counter
    ))
}

/// Generate one forward-time proposal, returning its acceptance probability
fn propose<R: Rng>(request: &TrajectoryRequest<'_>, rng: &mut R) -> Result<Proposal, SimError> {
    let path = temp_path();
    let file = File::create(&path)?;
    let mut writer = BufWriter::new(file);

    let t_inc_orig = 1.0 / (request.delta_t_mod * request.n0);
    let mut n = (request.n0 * request.size_ratio).floor();
    let mut current_size_ratio = request.size_ratio;
    let mut n_max = request.size_ratio;
    let mut x = request.initial_freq;
    let mut min_freq = request.f0;
    let mut in_sweep_phase = true;
    let mut ttau = 0.0;
    let mut steps: u64 = 0;

    for (i, event) in request.events_tail.iter().enumerate() {
        let next_time = match request.events_tail.get(i + 1) {
            Some(next) => next.time,
            None => MAXTIME,
        };
        if let EventKind::SizeChange { size, .. } = event.kind {
            current_size_ratio = size;
            n = (request.n0 * size).floor();
            n_max = n_max.max(size);
        }
        let loss = 1.0 / (2.0 * n);
        if min_freq < loss {
            min_freq = loss;
        }
        let t_inc = 1.0 / (request.delta_t_mod * n);
        while x > loss && request.current_time + ttau < next_time {
            ttau += t_inc_orig;
            if x > min_freq && in_sweep_phase {
                x = match request.mode {
                    SweepMode::Deterministic => {
                        det_sweep_freq(ttau, request.alpha * current_size_ratio)
                    }
                    SweepMode::Stochastic => {
                        1.0 - genic_selection_forwards(
                            t_inc,
                            1.0 - x,
                            request.alpha * current_size_ratio,
                            rng,
                        )
                    }
                    SweepMode::Neutral => neutral_jump(t_inc, x, rng),
                };
            } else {
                in_sweep_phase = false;
                x = neutral_jump(t_inc, x, rng);
            }
            if steps >= MAX_TRAJECTORY_STEPS {
                drop(writer);
                let _ = fs::remove_file(&path);
                return Err(SimError::TrajectoryOverflow { steps });
            }
            writer.write_all(&(x as f32).to_le_bytes())?;
            steps += 1;
        }
    }

    writer.flush()?;
    Ok(Proposal {
        path,
        steps,
        prob_accept: current_size_ratio / n_max,
    })
}

/// Propose trajectories until one is accepted, then map it for replay
pub fn generate<R: Rng>(
    request: &TrajectoryRequest<'_>,
    rng: &mut R,
) -> Result<Trajectory, SimError> {
    let mut attempts = 1u64;
    let mut proposal = propose(request, rng)?;
    while rng.gen::<f64>() > proposal.prob_accept {
        proposal.discard();
        proposal = propose(request, rng)?;
        attempts += 1;
    }
    debug!(
        "accepted sweep trajectory after {} proposal(s), {} steps",
        attempts, proposal.steps
    );
    Trajectory::map(proposal)
}

/// An accepted trajectory, memory-mapped read-only and replayed step by step
pub struct Trajectory {
    map: Mmap,
    path: PathBuf,
    steps: usize,
    cursor: usize,
}

impl Trajectory {
    fn map(proposal: Proposal) -> Result<Self, SimError> {
        let file = File::open(&proposal.path)?;
        // SAFETY: the file is private to this process and never written
        // again once accepted
        let map = unsafe { Mmap::map(&file)? };
        Ok(Self {
            map,
            path: proposal.path,
            steps: proposal.steps as usize,
            cursor: 0,
        })
    }

    /// Total number of stored steps
    pub fn len(&self) -> usize {
        self.steps
    }

    /// Whether the trajectory holds no steps
    pub fn is_empty(&self) -> bool {
        self.steps == 0
    }

    /// Consume the next frequency; stepping past the end is a programming
    /// error in the scheduler coupling and aborts the run
    pub fn next_freq(&mut self) -> Result<f64, SimError> {
        if self.cursor >= self.steps {
            return Err(SimError::TrajectoryExhausted {
                step: self.cursor as u64,
            });
        }
        let offset = self.cursor * 4;
        let bytes: [u8; 4] = self.map[offset..offset + 4]
            .try_into()
            .expect("mapped region holds whole steps");
        self.cursor += 1;
        Ok(f64::from(f32::from_le_bytes(bytes)))
    }
}

impl Drop for Trajectory {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}
