//! Demographic event descriptors
//!
//! The driver walks a time-sorted vector of these between phases. All times
//! are in units of `2N0` generations. An implicit size-change to ratio 1.0
//! for population 0 heads the list so the first phase always has a defined
//! epoch start.

use serde::{Deserialize, Serialize};

/// What happens at an event time
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum EventKind {
    /// Population `pop` changes to `size` times the reference size
    SizeChange {
        /// Affected population
        pop: usize,
        /// New size as a ratio of `N0`
        size: f64,
    },
    /// Backward-time join: every lineage of `src` moves into `dest`
    Join {
        /// Emptied population
        src: usize,
        /// Receiving population
        dest: usize,
    },
    /// Backward-time admixture: lineages of `pop` move to `dest1` with the
    /// given probability, otherwise to `dest2`
    Admix {
        /// Daughter population being dissolved
        pop: usize,
        /// First source population
        dest1: usize,
        /// Second source population
        dest2: usize,
        /// Probability of tracing back into `dest1`
        proportion: f64,
    },
    /// Activate `count` dormant ancient samples destined for `pop`
    AncientSamples {
        /// Number of lineages to activate
        count: usize,
        /// Population they join
        pop: usize,
    },
    /// A selective sweep ends (forward time) at this moment
    SweepOnset,
    /// Replace one migration-matrix entry, or all off-diagonal entries when
    /// `dest` is `None`
    MigrationChange {
        /// Source population
        src: usize,
        /// Destination population, or every other population
        dest: Option<usize>,
        /// New backward migration rate
        rate: f64,
    },
}

/// An event at a point in coalescent time
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct DemographicEvent {
    /// Time of the event in units of `2N0` generations
    pub time: f64,
    /// What happens
    pub kind: EventKind,
}

/// Stable-sort events by time, keeping the entry order of ties
pub fn sort_events(events: &mut [DemographicEvent]) {
    events.sort_by(|a, b| a.time.partial_cmp(&b.time).expect("finite event times"));
}

/// The implicit t = 0 head event
pub fn initial_event() -> DemographicEvent {
    DemographicEvent {
        time: 0.0,
        kind: EventKind::SizeChange { pop: 0, size: 1.0 },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sorting_is_stable_for_ties() {
        let mut events = vec![
            DemographicEvent {
                time: 0.5,
                kind: EventKind::Join { src: 1, dest: 0 },
            },
            DemographicEvent {
                time: 0.0,
                kind: EventKind::SizeChange { pop: 0, size: 1.0 },
            },
            DemographicEvent {
                time: 0.5,
                kind: EventKind::SizeChange { pop: 0, size: 2.0 },
            },
        ];
        sort_events(&mut events);
        assert_eq!(events[0].time, 0.0);
        assert!(matches!(events[1].kind, EventKind::Join { .. }));
        assert!(matches!(events[2].kind, EventKind::SizeChange { .. }));
    }
}
