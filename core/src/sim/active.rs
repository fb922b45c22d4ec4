//! Map of sites that have not yet reached their MRCA
//!
//! Kept as a sorted, disjoint interval set over `[0, n_sites)` with a running
//! total. The event scheduler terminates a replicate when the total hits
//! zero, and crossovers landing outside the map are no-ops.

use crate::sim::segments::{SegmentArena, SegmentId};

/// Sorted disjoint set of still-segregating site intervals
#[derive(Clone, Debug, Default)]
pub struct ActiveMaterial {
    spans: Vec<(u32, u32)>,
    total: u64,
}

impl ActiveMaterial {
    /// All of `[0, n_sites)` starts active
    pub fn new(n_sites: u32) -> Self {
        Self {
            spans: vec![(0, n_sites)],
            total: u64::from(n_sites),
        }
    }

    /// Number of sites that have not reached MRCA
    pub fn total_active(&self) -> u64 {
        self.total
    }

    /// Whether `site` is still segregating
    pub fn is_active(&self, site: u32) -> bool {
        let idx = self.spans.partition_point(|&(_, end)| end <= site);
        match self.spans.get(idx) {
            Some(&(start, _)) => start <= site,
            None => false,
        }
    }

    /// Subtract the half-open interval `[left, right)`
    pub fn remove_region(&mut self, left: u32, right: u32) {
        if left >= right {
            return;
        }
        let mut replaced: Vec<(u32, u32)> = Vec::with_capacity(2);
        let start_idx = self.spans.partition_point(|&(_, end)| end <= left);
        let mut idx = start_idx;
        while idx < self.spans.len() && self.spans[idx].0 < right {
            let (s, e) = self.spans[idx];
            let overlap = e.min(right) - s.max(left);
            self.total -= u64::from(overlap);
            if s < left {
                replaced.push((s, left));
            }
            if e > right {
                replaced.push((right, e));
            }
            idx += 1;
        }
        self.spans.splice(start_idx..idx, replaced);
    }

    /// Purge every interval of `head` whose ancestry count reached the
    /// sample size, i.e. found its MRCA on the lineage just created
    pub fn absorb(&mut self, arena: &SegmentArena, head: Option<SegmentId>, sample_size: u32) {
        let mut cursor = head;
        while let Some(id) = cursor {
            let seg = *arena.get(id);
            if seg.count == sample_size {
                self.remove_region(seg.start, seg.end);
            }
            cursor = seg.next;
        }
    }

    /// Invariant check: spans sorted, disjoint, non-empty, total consistent
    #[cfg(test)]
    fn validate(&self) {
        let mut sum = 0u64;
        let mut last_end = 0;
        for (i, &(s, e)) in self.spans.iter().enumerate() {
            assert!(s < e);
            if i > 0 {
                assert!(s > last_end, "adjacent spans must have been merged away");
            }
            last_end = e;
            sum += u64::from(e - s);
        }
        assert_eq!(sum, self.total);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::recorder::NodeId;

    #[test]
    fn starts_fully_active() {
        let active = ActiveMaterial::new(1000);
        assert_eq!(active.total_active(), 1000);
        assert!(active.is_active(0));
        assert!(active.is_active(999));
        assert!(!active.is_active(1000));
    }

    #[test]
    fn remove_middle_splits_span() {
        let mut active = ActiveMaterial::new(100);
        active.remove_region(40, 60);
        active.validate();
        assert_eq!(active.total_active(), 80);
        assert!(active.is_active(39));
        assert!(!active.is_active(40));
        assert!(!active.is_active(59));
        assert!(active.is_active(60));
    }

    #[test]
    fn remove_across_spans() {
        let mut active = ActiveMaterial::new(100);
        active.remove_region(10, 20);
        active.remove_region(30, 40);
        active.remove_region(15, 35);
        active.validate();
        assert_eq!(active.total_active(), 70);
        assert!(active.is_active(9));
        assert!(!active.is_active(25));
        assert!(active.is_active(40));
    }

    #[test]
    fn remove_everything() {
        let mut active = ActiveMaterial::new(50);
        active.remove_region(0, 50);
        active.validate();
        assert_eq!(active.total_active(), 0);
        assert!(!active.is_active(0));
    }

    #[test]
    fn repeated_removal_is_idempotent() {
        let mut active = ActiveMaterial::new(100);
        active.remove_region(10, 30);
        let total = active.total_active();
        active.remove_region(10, 30);
        active.validate();
        assert_eq!(active.total_active(), total);
    }

    #[test]
    fn absorb_purges_only_fixed_intervals() {
        let mut arena = SegmentArena::new();
        let fixed = arena.merge(None, None, None);
        assert!(fixed.is_none());
        let a = arena.new_leaf_list(100, NodeId(0));
        let b = arena.new_leaf_list(100, NodeId(1));
        let merged = arena.merge(Some(a), Some(b), Some(NodeId(2)));
        let mut active = ActiveMaterial::new(100);
        // Sample size two: the merged list is fixed everywhere
        active.absorb(&arena, merged, 2);
        assert_eq!(active.total_active(), 0);

        // Sample size three: nothing is fixed yet
        let mut active = ActiveMaterial::new(100);
        active.absorb(&arena, merged, 3);
        assert_eq!(active.total_active(), 100);
    }
}
