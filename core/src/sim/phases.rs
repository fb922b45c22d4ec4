//! The event-rate scheduler: neutral, sweep, and recurrent-sweep phases
//!
//! A neutral phase is a multi-rate Gillespie loop over coalescence,
//! recombination, gene conversion, and migration across all populations.
//! A sweep phase is a structured coalescent conditioned on the mapped
//! allele-frequency trajectory, advanced with the per-step rejection scheme
//! of Braverman et al.: each trajectory step survives with probability
//! `1 - Σ rates · dt`, and the first failing step fires one event chosen by
//! the normalized categorical.

use log::debug;
use rand::Rng;
use rand_distr::{Distribution, Exp1};

use crate::sim::events::DemographicEvent;
use crate::sim::registry::SweepClass;
use crate::sim::trajectory::{self, Trajectory, TrajectoryRequest};
use crate::sim::{ops, SimError, SimState};

/// Pick an index with probability proportional to `weights` (their sum is
/// `total`), by linear scan of the cumulative
fn pick_index<R: Rng>(weights: &[f64], total: f64, rng: &mut R) -> usize {
    let threshold = rng.gen::<f64>() * total;
    let mut cumulative = 0.0;
    for (i, w) in weights.iter().enumerate() {
        cumulative += w;
        if threshold < cumulative {
            return i;
        }
    }
    weights.len() - 1
}

/// Edge-buffer flush cadence, in coalescent events
const FLUSH_INTERVAL: usize = 10;

/// Run neutral dynamics from `start` until `end` or until every site has
/// reached its MRCA, returning the stopping time
pub(crate) fn neutral_phase(state: &mut SimState, start: f64, end: f64) -> Result<f64, SimError> {
    neutral_phase_inner(state, start, end, &[])
}

/// Neutral dynamics plus a constant rate of recurrent sweep onsets, each of
/// which runs a full conditional sweep inline
pub(crate) fn recurrent_sweep_phase(
    state: &mut SimState,
    start: f64,
    end: f64,
    events_tail: &[DemographicEvent],
) -> Result<f64, SimError> {
    neutral_phase_inner(state, start, end, events_tail)
}

fn neutral_phase_inner(
    state: &mut SimState,
    start: f64,
    end: f64,
    recurrent_events_tail: &[DemographicEvent],
) -> Result<f64, SimError> {
    if start == end {
        return Ok(end);
    }
    let npops = state.current_size.len();
    let recur_rate = if recurrent_events_tail.is_empty() {
        0.0
    } else {
        state.params.recurrent_sweep_rate
    };
    let mut t = start;
    let mut coalescences = 0usize;

    let mut c_rate = vec![0.0; npops];
    let mut r_rate = vec![0.0; npops];
    let mut g_rate = vec![0.0; npops];
    let mut m_rate = vec![0.0; npops];

    while state.active.total_active() > 0 {
        let mut tot_c = 0.0;
        let mut tot_r = 0.0;
        let mut tot_g = 0.0;
        let mut tot_m = 0.0;
        for p in 0..npops {
            let n = state.registry.population_size(p) as f64;
            c_rate[p] = n * (n - 1.0) * 0.5 / state.current_size[p];
            r_rate[p] = state.params.rho * n * 0.5;
            g_rate[p] = state.params.gamma * n * 0.5;
            m_rate[p] = state.mig[p].iter().sum::<f64>() * n * 0.5;
            tot_c += c_rate[p];
            tot_r += r_rate[p];
            tot_g += g_rate[p];
            tot_m += m_rate[p];
        }
        // Accumulated in the same order as the category boundaries below so
        // a draw can never land past the last real category
        let total = tot_r + tot_g + tot_m + tot_c + recur_rate;
        if total <= 0.0 {
            return Ok(end);
        }

        let wait: f64 = Exp1.sample(&mut state.rng);
        t += wait / total;
        if t >= end {
            return Ok(end);
        }

        let u = state.rng.gen::<f64>() * total;
        if u < tot_r {
            let p = pick_index(&r_rate, tot_r, &mut state.rng);
            let _ = ops::recombine(state, t, p);
        } else if u < tot_r + tot_g {
            let p = pick_index(&g_rate, tot_g, &mut state.rng);
            ops::gene_convert(state, t, p);
        } else if u < tot_r + tot_g + tot_m {
            let src = pick_index(&m_rate, tot_m, &mut state.rng);
            let row = state.mig[src].clone();
            let row_total: f64 = row.iter().sum();
            let dest = pick_index(&row, row_total, &mut state.rng);
            ops::migrate(state, src, dest);
        } else if u < tot_r + tot_g + tot_m + tot_c {
            let p = pick_index(&c_rate, tot_c, &mut state.rng);
            ops::coalesce(state, t, p);
            coalescences += 1;
            // Buffered edges must not outlive the phase unboundedly
            if coalescences % FLUSH_INTERVAL == 0 {
                state.recorder.flush_edges();
            }
        } else {
            t = start_recurrent_sweep(state, t, end, recurrent_events_tail)?;
            if t >= end {
                return Ok(end);
            }
        }
    }

    state.recorder.flush_edges();
    Ok(t)
}

/// One recurrent sweep: draw the sweep site (or the left-flank recombination
/// strength), generate a conditioned trajectory, and run the sweep phase
/// inline
fn start_recurrent_sweep(
    state: &mut SimState,
    t: f64,
    end: f64,
    events_tail: &[DemographicEvent],
) -> Result<f64, SimError> {
    let alpha = state.params.alpha;
    state.sweep_site = match state.params.sweep_site {
        Some(_) => Some(state.rng.gen::<f64>()),
        None => {
            state.left_rho = state.rng.gen::<f64>() * 2.0 * alpha;
            None
        }
    };
    let hard_start = 1.0 - 1.0 / (2.0 * state.current_size[0] * state.params.n0);
    let initial_freq = match state.params.final_freq {
        Some(c) => c.min(hard_start),
        None => hard_start,
    };
    state.current_freq = initial_freq;
    debug!("recurrent sweep onset at {t}, site {:?}", state.sweep_site);

    let request = TrajectoryRequest {
        events_tail,
        size_ratio: state.current_size[0],
        mode: state.params.sweep_mode.expect("recurrent mode has a sweep kind"),
        initial_freq,
        alpha,
        f0: state.params.f0,
        current_time: t,
        delta_t_mod: state.params.delta_t_mod,
        n0: state.params.n0,
    };
    state.trajectory = Some(trajectory::generate(&request, &mut state.rng)?);

    // Recurrent sweeps run without recurrent adaptive mutation
    let t = sweep_phase(state, t, end, 0.0)?;
    if !state.still_sweeping {
        state.trajectory = None;
        state.registry.clear_sweep_classes();
    }
    Ok(t)
}

/// Per-step event probabilities during a sweep
#[derive(Clone, Debug, Default)]
struct SweepStepRates {
    coal_favored: f64,
    coal_unfavored: f64,
    rec_favored: f64,
    rec_unfavored: f64,
    gc_favored: f64,
    gc_unfavored: f64,
    recurrent_mutation: f64,
    left_favored: f64,
    left_unfavored: f64,
    sweep_total: f64,
    c_rate: Vec<f64>,
    r_rate: Vec<f64>,
    g_rate: Vec<f64>,
    tot_c: f64,
    tot_r: f64,
    tot_g: f64,
    total: f64,
}

fn sweep_step_rates(state: &SimState, x: f64, dt: f64, u_a: f64) -> SweepStepRates {
    let npops = state.current_size.len();
    let favored = state.registry.sweep_size(SweepClass::Favored) as f64;
    let unfavored = state.registry.sweep_size(SweepClass::Unfavored) as f64;
    let size0 = state.current_size[0];
    let rho = state.params.rho;
    let gamma = state.params.gamma;

    // Empty classes contribute nothing; dividing their zero rate by a
    // vanishing frequency would produce NaN
    let coal_favored = if favored >= 2.0 {
        favored * (favored - 1.0) * 0.5 / x * dt / size0
    } else {
        0.0
    };
    let coal_unfavored = if unfavored >= 2.0 {
        unfavored * (unfavored - 1.0) * 0.5 / (1.0 - x) * dt / size0
    } else {
        0.0
    };
    let mut rates = SweepStepRates {
        coal_favored,
        coal_unfavored,
        rec_favored: rho * favored * 0.5 * dt,
        rec_unfavored: rho * unfavored * 0.5 * dt,
        gc_favored: gamma * favored * 0.5 * dt,
        gc_unfavored: gamma * unfavored * 0.5 * dt,
        recurrent_mutation: u_a * favored * 0.5 * dt / x,
        c_rate: vec![0.0; npops],
        r_rate: vec![0.0; npops],
        g_rate: vec![0.0; npops],
        ..SweepStepRates::default()
    };
    if state.sweep_site.is_none() {
        // Sweep site flanks the locus; crossovers between it and the locus
        // flip class membership instead of splitting material
        rates.left_favored = state.left_rho * favored * 0.5 * dt * (1.0 - x);
        rates.left_unfavored = state.left_rho * unfavored * 0.5 * dt * x;
    }
    rates.sweep_total = rates.coal_favored
        + rates.coal_unfavored
        + rates.rec_favored
        + rates.rec_unfavored
        + rates.gc_favored
        + rates.gc_unfavored
        + rates.recurrent_mutation
        + rates.left_favored
        + rates.left_unfavored;
    rates.total = rates.sweep_total;
    for p in 1..npops {
        let n = state.registry.population_size(p) as f64;
        rates.c_rate[p] = n * (n - 1.0) * 0.5 * dt / state.current_size[p];
        rates.r_rate[p] = rho * n * 0.5 * dt;
        rates.g_rate[p] = gamma * n * 0.5 * dt;
        rates.tot_c += rates.c_rate[p];
        rates.tot_r += rates.r_rate[p];
        rates.tot_g += rates.g_rate[p];
        rates.total += rates.c_rate[p] + rates.r_rate[p] + rates.g_rate[p];
    }
    rates
}

/// Run the structured coalescent against the accepted trajectory from
/// `start` until the allele is lost backwards in time or `end` is reached
///
/// Returns the stopping time; `state.still_sweeping` records whether the
/// sweep continues past the epoch boundary and `state.current_freq` the
/// frequency it stopped at.
pub(crate) fn sweep_phase(
    state: &mut SimState,
    start: f64,
    end: f64,
    u_a: f64,
) -> Result<f64, SimError> {
    let n0 = state.params.n0;
    let n = (n0 * state.current_size[0]).floor();
    let loss = 1.0 / (2.0 * n);

    if !state.still_sweeping {
        assign_sweep_classes(state);
        state.still_sweeping = true;
    }

    let mut traj = state.trajectory.take().expect("sweep phase requires a trajectory");
    let result = sweep_loop(state, &mut traj, start, end, loss, u_a);
    state.trajectory = Some(traj);
    let (t, x) = result?;

    state.still_sweeping = t >= end;
    if state.registry.sweep_size(SweepClass::Favored) == 0 {
        state.still_sweeping = false;
    }
    state.current_freq = x;
    debug!(
        "sweep phase stopped at t={t}, x={x}, continuing={}",
        state.still_sweeping
    );
    Ok(t)
}

/// Assign sweep classes to every population-0 lineage at sweep onset
///
/// Hard and soft sweeps put everyone in the favored class. Partial sweeps
/// draw membership from the final frequency and flag favored lineages that
/// are ancestral at the sweep site as carriers of the beneficial mutation.
fn assign_sweep_classes(state: &mut SimState) {
    let partial = state.params.final_freq;
    for id in state.registry.population_members(0) {
        let class = match partial {
            Some(final_freq) if state.rng.gen::<f64>() > final_freq => SweepClass::Unfavored,
            _ => SweepClass::Favored,
        };
        state.registry.set_sweep_class(id, class);
        if partial.is_some() && class == SweepClass::Favored {
            if let Some(site) = state.sweep_site {
                let position = (site * f64::from(state.n_sites)).floor() as u32;
                let count = state
                    .arena
                    .count_at(state.registry.get(id).head, position.min(state.n_sites - 1));
                if count > 0 && count < state.sample_size {
                    let lineage = state.registry.get_mut(id);
                    lineage.carries_sweep_mutation = true;
                    if let Some(node) = lineage.recorder {
                        state.recorder.mark_sweep_carrier(node);
                    }
                }
            }
        }
    }
}

fn sweep_loop(
    state: &mut SimState,
    traj: &mut Trajectory,
    start: f64,
    end: f64,
    loss: f64,
    u_a: f64,
) -> Result<(f64, f64), SimError> {
    let t_inc = 1.0 / (state.params.delta_t_mod * state.params.n0);
    let npops = state.current_size.len();
    let mut ttau = 0.0;
    let mut x = state.current_freq;

    while x > loss && start + ttau < end && state.registry.population_size(0) > 1 {
        let event_rand: f64 = state.rng.gen();
        let mut event_prob = 1.0;
        let mut rates = SweepStepRates::default();
        while event_prob > event_rand && x > loss && start + ttau < end {
            ttau += t_inc;
            x = traj.next_freq()?;
            rates = sweep_step_rates(state, x, t_inc, u_a);
            event_prob *= 1.0 - rates.total;
        }
        if start + ttau >= end {
            break;
        }
        let t = start + ttau;

        if state.rng.gen::<f64>() < rates.sweep_total / rates.total {
            // Event in the sweeping population; walk the cumulative menu
            let pick = state.rng.gen::<f64>() * rates.sweep_total;
            let menu = [
                rates.coal_favored,
                rates.coal_unfavored,
                rates.rec_unfavored,
                rates.rec_favored,
                rates.gc_favored,
                rates.gc_unfavored,
                rates.left_unfavored,
                rates.left_favored,
                rates.recurrent_mutation,
            ];
            let mut cumulative = 0.0;
            let mut chosen = menu.len() - 1;
            for (i, weight) in menu.iter().enumerate() {
                cumulative += weight;
                if pick < cumulative {
                    chosen = i;
                    break;
                }
            }
            match chosen {
                0 => ops::coalesce_sweep(state, t, 0, SweepClass::Favored),
                1 => ops::coalesce_sweep(state, t, 0, SweepClass::Unfavored),
                2 => {
                    let _ = ops::recombine_sweep(state, t, SweepClass::Unfavored, 1.0 - x);
                }
                3 => {
                    let _ = ops::recombine_sweep(state, t, SweepClass::Favored, x);
                }
                4 => ops::gene_convert_sweep(state, t, SweepClass::Favored, x),
                5 => ops::gene_convert_sweep(state, t, SweepClass::Unfavored, x),
                6 => ops::sweep_class_flip(state, SweepClass::Unfavored),
                7 => ops::sweep_class_flip(state, SweepClass::Favored),
                _ => ops::sweep_class_flip(state, SweepClass::Favored),
            }
        } else if npops > 1 {
            // Event in a non-sweeping population (no migration during the
            // sweep; its probability is not in the menu)
            let remaining = rates.total - rates.sweep_total;
            if remaining > 0.0 {
                let u = state.rng.gen::<f64>() * remaining;
                if u < rates.tot_r {
                    let p = pick_index(&rates.r_rate, rates.tot_r, &mut state.rng);
                    let _ = ops::recombine(state, t, p);
                } else if u < rates.tot_r + rates.tot_g {
                    let p = pick_index(&rates.g_rate, rates.tot_g, &mut state.rng);
                    ops::gene_convert(state, t, p);
                } else {
                    let p = pick_index(&rates.c_rate, rates.tot_c, &mut state.rng);
                    ops::coalesce(state, t, p);
                }
            }
        }
    }

    Ok((start + ttau, x))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn pick_index_respects_weights() {
        let mut rng = rand_pcg::Pcg64::seed_from_u64(5);
        let weights = [0.0, 2.0, 0.0, 1.0];
        let total = 3.0;
        let mut counts = [0usize; 4];
        for _ in 0..3000 {
            counts[pick_index(&weights, total, &mut rng)] += 1;
        }
        assert_eq!(counts[0], 0);
        assert_eq!(counts[2], 0);
        assert!(counts[1] > counts[3]);
    }

    #[test]
    fn neutral_phase_reaches_mrca_without_recombination() {
        let mut state = SimState::for_tests(6, 100, 1, true, 42);
        state.seed_samples(&[6]);
        let t = neutral_phase(&mut state, 0.0, crate::sim::MAXTIME).unwrap();
        assert!(t < crate::sim::MAXTIME);
        assert_eq!(state.active.total_active(), 0);
        // 5 coalescences for 6 leaves
        assert_eq!(state.recorder.tables.nodes.len(), 11);
    }

    #[test]
    fn neutral_phase_stops_at_epoch_boundary() {
        let mut state = SimState::for_tests(50, 100, 1, true, 43);
        state.seed_samples(&[50]);
        let t = neutral_phase(&mut state, 0.0, 1e-6).unwrap();
        assert_eq!(t, 1e-6);
        assert!(state.active.total_active() > 0);
    }

    #[test]
    fn migration_eventually_merges_isolated_demes() {
        let mut state = SimState::for_tests(4, 50, 2, true, 44);
        state.seed_samples(&[2, 2]);
        state.mig[0][1] = 2.0;
        state.mig[1][0] = 2.0;
        let t = neutral_phase(&mut state, 0.0, crate::sim::MAXTIME).unwrap();
        assert!(t < crate::sim::MAXTIME);
        assert_eq!(state.active.total_active(), 0);
    }
}
