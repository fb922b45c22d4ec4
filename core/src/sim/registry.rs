//! Registry of active lineages, partitioned by population and sweep class
//!
//! Lineages live in a slab with free-slot reuse. Dense per-population id
//! lists (with back-indices stored on the lineage) give O(1) random draws
//! and O(1) swap-removal. During a sweep, population 0 is additionally
//! partitioned into the beneficial and unfavored classes with their own
//! lists. Ancient samples that have not activated yet are held outside every
//! list, so no event can draw them.

use rand::Rng;

use crate::sim::recorder::NodeId;
use crate::sim::segments::SegmentId;

/// Identifier of a lineage slot
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct LineageId(u32);

impl LineageId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

/// Sweep-class membership of a population-0 lineage during a sweep epoch
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SweepClass {
    /// Carries the beneficial background (frequency `x`)
    Favored,
    /// Ancestral background (frequency `1 - x`)
    Unfavored,
}

impl SweepClass {
    /// The opposite class
    pub fn flipped(self) -> Self {
        match self {
            SweepClass::Favored => SweepClass::Unfavored,
            SweepClass::Unfavored => SweepClass::Favored,
        }
    }

    fn list_index(self) -> usize {
        match self {
            SweepClass::Unfavored => 0,
            SweepClass::Favored => 1,
        }
    }
}

/// One extant backward-time lineage
#[derive(Clone, Debug)]
pub struct Lineage {
    /// Coalescent time the lineage was created at
    pub time: f64,
    /// Population id; negative `-(p + 1)` marks a dormant ancient sample
    pub population: i32,
    /// Sweep class while a sweep is running, `None` otherwise
    pub sweep_class: Option<SweepClass>,
    /// Whether the lineage carries the beneficial mutation
    pub carries_sweep_mutation: bool,
    /// Head of the ancestry-segment list
    pub head: Option<SegmentId>,
    /// Recorder node, absent for unrecorded junctions in minimal mode
    pub recorder: Option<NodeId>,
    /// Number of polymorphic sites the lineage carries
    pub active_sites: u32,
    /// Leftmost polymorphic site
    pub left_limit: u32,
    /// Rightmost polymorphic site, inclusive
    pub right_limit: u32,
    pop_slot: usize,
    sweep_slot: usize,
}

impl Lineage {
    /// A lineage not yet wired into any list
    pub fn new(time: f64, population: i32) -> Self {
        Self {
            time,
            population,
            sweep_class: None,
            carries_sweep_mutation: false,
            head: None,
            recorder: None,
            active_sites: 0,
            left_limit: 0,
            right_limit: 0,
            pop_slot: usize::MAX,
            sweep_slot: usize::MAX,
        }
    }

    /// Whether a crossover site falls strictly inside the polymorphic span
    pub fn site_between_limits(&self, site: u32) -> bool {
        self.active_sites > 0 && self.left_limit < site && site <= self.right_limit
    }
}

/// Slab of lineages plus the population and sweep-class indexes
#[derive(Debug, Default)]
pub struct LineageRegistry {
    slab: Vec<Option<Lineage>>,
    free: Vec<u32>,
    pop_lists: Vec<Vec<LineageId>>,
    sweep_lists: [Vec<LineageId>; 2],
    dormant: Vec<LineageId>,
}

impl LineageRegistry {
    /// Empty registry over `npops` populations
    pub fn new(npops: usize) -> Self {
        Self {
            pop_lists: vec![Vec::new(); npops],
            ..Self::default()
        }
    }

    /// Read a lineage
    pub fn get(&self, id: LineageId) -> &Lineage {
        self.slab[id.index()].as_ref().expect("live lineage")
    }

    /// Mutable access; list membership must not be edited through this
    pub fn get_mut(&mut self, id: LineageId) -> &mut Lineage {
        self.slab[id.index()].as_mut().expect("live lineage")
    }

    /// Total number of lineages available to events
    pub fn num_active(&self) -> usize {
        self.pop_lists.iter().map(Vec::len).sum()
    }

    /// Number of dormant ancient-sample lineages awaiting activation
    pub fn num_dormant(&self) -> usize {
        self.dormant.len()
    }

    /// Number of active lineages in population `pop`
    pub fn population_size(&self, pop: usize) -> usize {
        self.pop_lists[pop].len()
    }

    /// Number of population-0 lineages in `class`
    pub fn sweep_size(&self, class: SweepClass) -> usize {
        self.sweep_lists[class.list_index()].len()
    }

    /// Ids currently active in population `pop`
    pub fn population_members(&self, pop: usize) -> Vec<LineageId> {
        self.pop_lists[pop].clone()
    }

    fn alloc(&mut self, lineage: Lineage) -> LineageId {
        match self.free.pop() {
            Some(slot) => {
                self.slab[slot as usize] = Some(lineage);
                LineageId(slot)
            }
            None => {
                self.slab.push(Some(lineage));
                LineageId((self.slab.len() - 1) as u32)
            }
        }
    }

    /// Insert an active lineage, wiring it into its population list and, if
    /// classed, the sweep list
    pub fn insert(&mut self, lineage: Lineage) -> LineageId {
        debug_assert!(lineage.population >= 0);
        let pop = lineage.population as usize;
        let class = lineage.sweep_class;
        let id = self.alloc(lineage);
        let slot = self.pop_lists[pop].len();
        self.get_mut(id).pop_slot = slot;
        self.pop_lists[pop].push(id);
        if pop == 0 {
            if let Some(class) = class {
                self.push_sweep(id, class);
            }
        }
        id
    }

    /// Insert a dormant ancient sample (`population` already negated)
    pub fn insert_dormant(&mut self, lineage: Lineage) -> LineageId {
        debug_assert!(lineage.population < 0);
        let id = self.alloc(lineage);
        self.dormant.push(id);
        id
    }

    /// Remove a lineage from every index and return it
    pub fn remove(&mut self, id: LineageId) -> Lineage {
        let (pop, class, pop_slot, sweep_slot) = {
            let l = self.get(id);
            (l.population as usize, l.sweep_class, l.pop_slot, l.sweep_slot)
        };
        Self::swap_remove_at(&mut self.pop_lists[pop], &mut self.slab, id, pop_slot, ListKind::Pop);
        if pop == 0 {
            if let Some(class) = class {
                Self::swap_remove_at(
                    &mut self.sweep_lists[class.list_index()],
                    &mut self.slab,
                    id,
                    sweep_slot,
                    ListKind::Sweep,
                );
            }
        }
        let lineage = self.slab[id.index()].take().expect("live lineage");
        self.free.push(id.0);
        lineage
    }

    /// Uniform random draw from population `pop`
    pub fn pick<R: Rng>(&self, pop: usize, rng: &mut R) -> LineageId {
        let list = &self.pop_lists[pop];
        list[rng.gen_range(0..list.len())]
    }

    /// Uniform random draw from a sweep class of population 0
    pub fn pick_sweep<R: Rng>(&self, class: SweepClass, rng: &mut R) -> LineageId {
        let list = &self.sweep_lists[class.list_index()];
        list[rng.gen_range(0..list.len())]
    }

    /// Move a lineage to another population; leaving population 0 drops its
    /// sweep-class membership
    pub fn move_population(&mut self, id: LineageId, dest: usize) {
        let (pop, class, pop_slot, sweep_slot) = {
            let l = self.get(id);
            (l.population as usize, l.sweep_class, l.pop_slot, l.sweep_slot)
        };
        if pop == dest {
            return;
        }
        Self::swap_remove_at(&mut self.pop_lists[pop], &mut self.slab, id, pop_slot, ListKind::Pop);
        if pop == 0 {
            if let Some(class) = class {
                Self::swap_remove_at(
                    &mut self.sweep_lists[class.list_index()],
                    &mut self.slab,
                    id,
                    sweep_slot,
                    ListKind::Sweep,
                );
                self.get_mut(id).sweep_class = None;
            }
        }
        let slot = self.pop_lists[dest].len();
        let lineage = self.get_mut(id);
        lineage.population = dest as i32;
        lineage.pop_slot = slot;
        self.pop_lists[dest].push(id);
    }

    /// Set or change the sweep class of a population-0 lineage
    pub fn set_sweep_class(&mut self, id: LineageId, class: SweepClass) {
        let (old, sweep_slot) = {
            let l = self.get(id);
            (l.sweep_class, l.sweep_slot)
        };
        if old == Some(class) {
            return;
        }
        debug_assert_eq!(self.get(id).population, 0);
        if let Some(old) = old {
            Self::swap_remove_at(
                &mut self.sweep_lists[old.list_index()],
                &mut self.slab,
                id,
                sweep_slot,
                ListKind::Sweep,
            );
        }
        self.push_sweep(id, class);
    }

    /// Clear sweep classes everywhere (sweep epoch over)
    pub fn clear_sweep_classes(&mut self) {
        for list in &mut self.sweep_lists {
            for id in list.drain(..) {
                if let Some(l) = &mut self.slab[id.index()] {
                    l.sweep_class = None;
                    l.sweep_slot = usize::MAX;
                }
            }
        }
    }

    /// Activate up to `count` dormant samples destined for `pop`
    ///
    /// Returns the activated ids; they join the population list with their
    /// time set to `time`.
    pub fn activate_dormant(&mut self, pop: usize, count: usize, time: f64) -> Vec<LineageId> {
        let marker = -(pop as i32 + 1);
        let mut activated = Vec::with_capacity(count);
        let mut i = 0;
        while i < self.dormant.len() && activated.len() < count {
            let id = self.dormant[i];
            if self.get(id).population == marker {
                self.dormant.swap_remove(i);
                let slot = self.pop_lists[pop].len();
                {
                    let lineage = self.get_mut(id);
                    lineage.population = pop as i32;
                    lineage.time = time;
                    lineage.pop_slot = slot;
                }
                self.pop_lists[pop].push(id);
                activated.push(id);
            } else {
                i += 1;
            }
        }
        activated
    }

    fn push_sweep(&mut self, id: LineageId, class: SweepClass) {
        let slot = self.sweep_lists[class.list_index()].len();
        self.sweep_lists[class.list_index()].push(id);
        let lineage = self.get_mut(id);
        lineage.sweep_class = Some(class);
        lineage.sweep_slot = slot;
    }

    fn swap_remove_at(
        list: &mut Vec<LineageId>,
        slab: &mut [Option<Lineage>],
        id: LineageId,
        slot: usize,
        kind: ListKind,
    ) {
        debug_assert_eq!(list[slot], id);
        list.swap_remove(slot);
        if let Some(&moved) = list.get(slot) {
            let moved = slab[moved.index()].as_mut().expect("live lineage");
            match kind {
                ListKind::Pop => moved.pop_slot = slot,
                ListKind::Sweep => moved.sweep_slot = slot,
            }
        }
    }
}

#[derive(Copy, Clone)]
enum ListKind {
    Pop,
    Sweep,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_pcg::Pcg64;

    fn rng() -> Pcg64 {
        Pcg64::seed_from_u64(11)
    }

    #[test]
    fn insert_and_counts() {
        let mut reg = LineageRegistry::new(2);
        for _ in 0..5 {
            reg.insert(Lineage::new(0.0, 0));
        }
        for _ in 0..3 {
            reg.insert(Lineage::new(0.0, 1));
        }
        assert_eq!(reg.population_size(0), 5);
        assert_eq!(reg.population_size(1), 3);
        assert_eq!(reg.num_active(), 8);
    }

    #[test]
    fn remove_keeps_back_indices_consistent() {
        let mut reg = LineageRegistry::new(1);
        let ids: Vec<_> = (0..6).map(|_| reg.insert(Lineage::new(0.0, 0))).collect();
        reg.remove(ids[2]);
        reg.remove(ids[0]);
        assert_eq!(reg.population_size(0), 4);
        let mut r = rng();
        for _ in 0..20 {
            let picked = reg.pick(0, &mut r);
            assert!(ids.contains(&picked));
            assert_ne!(picked, ids[0]);
            assert_ne!(picked, ids[2]);
        }
    }

    #[test]
    fn slots_are_reused() {
        let mut reg = LineageRegistry::new(1);
        let a = reg.insert(Lineage::new(0.0, 0));
        reg.remove(a);
        let b = reg.insert(Lineage::new(1.0, 0));
        assert_eq!(a, b);
    }

    #[test]
    fn migration_updates_both_lists() {
        let mut reg = LineageRegistry::new(2);
        let id = reg.insert(Lineage::new(0.0, 0));
        reg.set_sweep_class(id, SweepClass::Favored);
        reg.move_population(id, 1);
        assert_eq!(reg.population_size(0), 0);
        assert_eq!(reg.population_size(1), 1);
        assert_eq!(reg.sweep_size(SweepClass::Favored), 0);
        assert!(reg.get(id).sweep_class.is_none());
    }

    #[test]
    fn sweep_class_flip() {
        let mut reg = LineageRegistry::new(1);
        let id = reg.insert(Lineage::new(0.0, 0));
        reg.set_sweep_class(id, SweepClass::Favored);
        assert_eq!(reg.sweep_size(SweepClass::Favored), 1);
        reg.set_sweep_class(id, SweepClass::Unfavored);
        assert_eq!(reg.sweep_size(SweepClass::Favored), 0);
        assert_eq!(reg.sweep_size(SweepClass::Unfavored), 1);
    }

    #[test]
    fn dormant_lineages_never_drawn() {
        let mut reg = LineageRegistry::new(1);
        reg.insert(Lineage::new(0.0, 0));
        reg.insert_dormant(Lineage::new(0.0, -1));
        assert_eq!(reg.num_active(), 1);
        let activated = reg.activate_dormant(0, 5, 0.3);
        assert_eq!(activated.len(), 1);
        assert_eq!(reg.num_active(), 2);
        assert_eq!(reg.get(activated[0]).time, 0.3);
    }
}
