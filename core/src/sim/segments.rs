//! Reference-counted ancestry-segment arena
//!
//! Every lineage exposes a singly linked, ascending, disjoint list of
//! half-open site intervals, each carrying the number of sampled leaves that
//! descend through it and the recorder node the interval is currently
//! attributed to. Segments are immutable once allocated; splits share the
//! untouched tail of a list by bumping reference counts and only allocate
//! the intervals they clip. The arena resets in O(1) between replicates.

use crate::sim::recorder::NodeId;

/// Identifier of a segment slot in the arena
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct SegmentId(u32);

impl SegmentId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

/// A contiguous interval of ancestral material
#[derive(Copy, Clone, Debug)]
pub struct AncestrySegment {
    /// First site covered (inclusive)
    pub start: u32,
    /// One past the last site covered
    pub end: u32,
    /// Number of sampled leaves descending through this interval
    pub count: u32,
    /// Recorder node this interval is attributed to when an edge is emitted
    pub node: Option<NodeId>,
    /// Next segment in the owning list, strictly to the right
    pub next: Option<SegmentId>,
}

struct Slot {
    segment: AncestrySegment,
    refs: u32,
}

/// Arena owning every live ancestry segment of a replicate
#[derive(Default)]
pub struct SegmentArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

/// Summary of the polymorphic material a lineage carries
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SpanStats {
    /// Number of sites with `0 < count < sample_size`
    pub active_sites: u32,
    /// Leftmost polymorphic site (meaningless when `active_sites == 0`)
    pub left_limit: u32,
    /// Rightmost polymorphic site, inclusive
    pub right_limit: u32,
}

impl SegmentArena {
    /// Create an empty arena
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every segment, keeping allocations for the next replicate
    pub fn reset(&mut self) {
        self.slots.clear();
        self.free.clear();
    }

    /// Number of live segments, for leak assertions in tests
    #[cfg(test)]
    pub fn live_segments(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    /// Read a segment
    pub fn get(&self, id: SegmentId) -> &AncestrySegment {
        debug_assert!(self.slots[id.index()].refs > 0, "read of freed segment");
        &self.slots[id.index()].segment
    }

    fn alloc(&mut self, segment: AncestrySegment) -> SegmentId {
        match self.free.pop() {
            Some(slot) => {
                self.slots[slot as usize] = Slot { segment, refs: 1 };
                SegmentId(slot)
            }
            None => {
                self.slots.push(Slot { segment, refs: 1 });
                SegmentId((self.slots.len() - 1) as u32)
            }
        }
    }

    /// Take an additional reference to `id`
    pub fn retain(&mut self, id: SegmentId) {
        self.slots[id.index()].refs += 1;
    }

    /// Release one reference to the list starting at `head`
    ///
    /// Walks the chain freeing segments until it reaches one that is still
    /// referenced from another list (a shared tail), which keeps the
    /// remainder alive.
    pub fn release(&mut self, head: Option<SegmentId>) {
        let mut cursor = head;
        while let Some(id) = cursor {
            let slot = &mut self.slots[id.index()];
            debug_assert!(slot.refs > 0, "double release");
            slot.refs -= 1;
            if slot.refs > 0 {
                break;
            }
            cursor = slot.segment.next;
            self.free.push(id.0);
        }
    }

    /// Single full-span segment for a sampled leaf
    pub fn new_leaf_list(&mut self, n_sites: u32, node: NodeId) -> SegmentId {
        self.alloc(AncestrySegment {
            start: 0,
            end: n_sites,
            count: 1,
            node: Some(node),
            next: None,
        })
    }

    /// Ancestry count at `site`, zero outside any interval
    pub fn count_at(&self, head: Option<SegmentId>, site: u32) -> u32 {
        let mut cursor = head;
        while let Some(id) = cursor {
            let seg = self.get(id);
            if site < seg.start {
                return 0;
            }
            if site < seg.end {
                return seg.count;
            }
            cursor = seg.next;
        }
        0
    }

    /// Collect a list into `(start, end, count, node)` tuples
    pub fn collect(&self, head: Option<SegmentId>) -> Vec<(u32, u32, u32, Option<NodeId>)> {
        let mut out = Vec::new();
        let mut cursor = head;
        while let Some(id) = cursor {
            let seg = self.get(id);
            out.push((seg.start, seg.end, seg.count, seg.node));
            cursor = seg.next;
        }
        out
    }

    /// Polymorphic-span statistics for a list
    pub fn span_stats(&self, head: Option<SegmentId>, sample_size: u32) -> SpanStats {
        let mut stats = SpanStats {
            active_sites: 0,
            left_limit: u32::MAX,
            right_limit: 0,
        };
        let mut cursor = head;
        while let Some(id) = cursor {
            let seg = self.get(id);
            if seg.count > 0 && seg.count < sample_size {
                stats.active_sites += seg.end - seg.start;
                stats.left_limit = stats.left_limit.min(seg.start);
                stats.right_limit = stats.right_limit.max(seg.end - 1);
            }
            cursor = seg.next;
        }
        if stats.active_sites == 0 {
            stats.left_limit = 0;
            stats.right_limit = 0;
        }
        stats
    }

    /// Merge two lists, summing counts where they overlap
    ///
    /// Every emitted segment is attributed to `parent`, the recorder node of
    /// the coalescence that consumed both children. Neither input list is
    /// released.
    pub fn merge(
        &mut self,
        a: Option<SegmentId>,
        b: Option<SegmentId>,
        parent: Option<NodeId>,
    ) -> Option<SegmentId> {
        let left = self.collect(a);
        let right = self.collect(b);

        let mut pieces: Vec<(u32, u32, u32)> = Vec::new();
        let (mut i, mut j) = (0, 0);
        // Sweep over the union of both interval sets, one breakpoint at a
        // time, summing whatever covers the current position.
        let mut pos = match (left.first(), right.first()) {
            (Some(l), Some(r)) => l.0.min(r.0),
            (Some(l), None) => l.0,
            (None, Some(r)) => r.0,
            (None, None) => return None,
        };
        while i < left.len() || j < right.len() {
            let mut next = u32::MAX;
            let mut count = 0;
            if let Some(&(s, e, c, _)) = left.get(i) {
                if pos >= e {
                    i += 1;
                    continue;
                }
                if pos >= s {
                    count += c;
                    next = next.min(e);
                } else {
                    next = next.min(s);
                }
            }
            if let Some(&(s, e, c, _)) = right.get(j) {
                if pos >= e {
                    j += 1;
                    continue;
                }
                if pos >= s {
                    count += c;
                    next = next.min(e);
                } else {
                    next = next.min(s);
                }
            }
            if next == u32::MAX {
                break;
            }
            if count > 0 {
                // Coalesce equal-count runs so lists stay short
                match pieces.last_mut() {
                    Some(last) if last.1 == pos && last.2 == count => last.1 = next,
                    _ => pieces.push((pos, next, count)),
                }
            }
            pos = next;
        }

        self.build_list(pieces.into_iter().map(|(s, e, c)| (s, e, c, parent)))
    }

    /// Sub-list of intervals strictly below `x`
    ///
    /// A segment straddling `x` is clipped. With `reassign` set (full-ARG
    /// recording) emitted segments are attributed to the new parent node;
    /// otherwise they keep the child attribution, which is how edges later
    /// point through unary junctions at the deepest recorded descendant.
    pub fn split_left(
        &mut self,
        head: Option<SegmentId>,
        x: u32,
        reassign: Option<NodeId>,
    ) -> Option<SegmentId> {
        let mut pieces = Vec::new();
        let mut cursor = head;
        while let Some(id) = cursor {
            let seg = *self.get(id);
            if seg.start >= x {
                break;
            }
            let node = reassign.or(seg.node);
            pieces.push((seg.start, seg.end.min(x), seg.count, node));
            cursor = seg.next;
        }
        self.build_list(pieces.into_iter())
    }

    /// Sub-list of intervals at or above `x`
    ///
    /// Whole segments beyond the clip point are shared with the original
    /// list by reference count when no reattribution is requested.
    pub fn split_right(
        &mut self,
        head: Option<SegmentId>,
        x: u32,
        reassign: Option<NodeId>,
    ) -> Option<SegmentId> {
        let mut cursor = head;
        while let Some(id) = cursor {
            let seg = *self.get(id);
            if seg.end <= x {
                cursor = seg.next;
                continue;
            }
            if seg.start >= x && reassign.is_none() {
                // Untouched suffix: share it
                self.retain(id);
                return Some(id);
            }
            if reassign.is_none() {
                // Clip the straddler, share the rest of the chain
                if let Some(next) = seg.next {
                    self.retain(next);
                }
                return Some(self.alloc(AncestrySegment {
                    start: seg.start.max(x),
                    end: seg.end,
                    count: seg.count,
                    node: seg.node,
                    next: seg.next,
                }));
            }
            // Full-ARG mode re-tags every segment, so copy the remainder
            let mut pieces = Vec::new();
            let mut tail = Some(id);
            while let Some(tid) = tail {
                let t = *self.get(tid);
                pieces.push((t.start.max(x), t.end, t.count, reassign));
                tail = t.next;
            }
            return self.build_list(pieces.into_iter());
        }
        None
    }

    /// Split for gene conversion: `(converted, unconverted)` where the
    /// converted list is the intersection with `[lo, hi)` and the
    /// unconverted list is its complement within the original intervals
    pub fn split_gene_conversion(
        &mut self,
        head: Option<SegmentId>,
        lo: u32,
        hi: u32,
        reassign_converted: Option<NodeId>,
        reassign_unconverted: Option<NodeId>,
    ) -> (Option<SegmentId>, Option<SegmentId>) {
        let source = self.collect(head);

        let converted = self.build_list(source.iter().filter_map(|&(s, e, c, node)| {
            let (cs, ce) = (s.max(lo), e.min(hi));
            (cs < ce).then(|| (cs, ce, c, reassign_converted.or(node)))
        }));

        let mut unconverted_pieces = Vec::new();
        for &(s, e, c, node) in &source {
            let node = reassign_unconverted.or(node);
            if s < lo {
                unconverted_pieces.push((s, e.min(lo), c, node));
            }
            if e > hi {
                unconverted_pieces.push((s.max(hi), e, c, node));
            }
        }
        let unconverted = self.build_list(unconverted_pieces.into_iter());

        (converted, unconverted)
    }

    /// Allocate a fresh chain from ascending pieces
    fn build_list(
        &mut self,
        pieces: impl Iterator<Item = (u32, u32, u32, Option<NodeId>)>,
    ) -> Option<SegmentId> {
        let mut head = None;
        let mut prev: Option<SegmentId> = None;
        for (start, end, count, node) in pieces {
            debug_assert!(start < end);
            let id = self.alloc(AncestrySegment {
                start,
                end,
                count,
                node,
                next: None,
            });
            match prev {
                Some(p) => self.slots[p.index()].segment.next = Some(id),
                None => head = Some(id),
            }
            prev = Some(id);
        }
        head
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: u32) -> Option<NodeId> {
        Some(NodeId(id))
    }

    fn list(arena: &mut SegmentArena, pieces: &[(u32, u32, u32)]) -> Option<SegmentId> {
        arena.build_list(pieces.iter().map(|&(s, e, c)| (s, e, c, node(7))))
    }

    #[test]
    fn leaf_list_covers_everything_once() {
        let mut arena = SegmentArena::new();
        let head = arena.new_leaf_list(100, NodeId(3));
        assert_eq!(arena.count_at(Some(head), 0), 1);
        assert_eq!(arena.count_at(Some(head), 99), 1);
        assert_eq!(arena.count_at(Some(head), 100), 0);
    }

    #[test]
    fn merge_sums_overlapping_counts() {
        let mut arena = SegmentArena::new();
        let a = list(&mut arena, &[(0, 50, 1)]);
        let b = list(&mut arena, &[(25, 75, 2)]);
        let merged = arena.merge(a, b, node(9));
        assert_eq!(
            arena.collect(merged),
            vec![
                (0, 25, 1, node(9)),
                (25, 50, 3, node(9)),
                (50, 75, 2, node(9)),
            ]
        );
    }

    #[test]
    fn merge_keeps_disjoint_gaps() {
        let mut arena = SegmentArena::new();
        let a = list(&mut arena, &[(0, 10, 1)]);
        let b = list(&mut arena, &[(20, 30, 1)]);
        let merged = arena.merge(a, b, node(9));
        assert_eq!(
            arena.collect(merged),
            vec![(0, 10, 1, node(9)), (20, 30, 1, node(9))]
        );
    }

    #[test]
    fn merge_coalesces_equal_count_runs() {
        let mut arena = SegmentArena::new();
        let a = list(&mut arena, &[(0, 10, 1), (10, 20, 1)]);
        let merged = arena.merge(a, None, node(9));
        assert_eq!(arena.collect(merged), vec![(0, 20, 1, node(9))]);
    }

    #[test]
    fn split_partitions_at_crossover() {
        let mut arena = SegmentArena::new();
        let head = list(&mut arena, &[(0, 40, 2), (60, 100, 1)]);
        let left = arena.split_left(head, 70, None);
        let right = arena.split_right(head, 70, None);
        assert_eq!(
            arena.collect(left),
            vec![(0, 40, 2, node(7)), (60, 70, 1, node(7))]
        );
        assert_eq!(arena.collect(right), vec![(70, 100, 1, node(7))]);
    }

    #[test]
    fn split_right_shares_untouched_suffix() {
        let mut arena = SegmentArena::new();
        let head = list(&mut arena, &[(0, 10, 1), (20, 30, 1), (40, 50, 1)]);
        let live_before = arena.live_segments();
        let right = arena.split_right(head, 15, None);
        // The suffix starting at 20 is shared, not copied
        assert_eq!(arena.live_segments(), live_before);
        assert_eq!(
            arena.collect(right),
            vec![(20, 30, 1, node(7)), (40, 50, 1, node(7))]
        );
        // Releasing the original keeps the shared tail alive
        arena.release(head);
        assert_eq!(
            arena.collect(right),
            vec![(20, 30, 1, node(7)), (40, 50, 1, node(7))]
        );
        arena.release(right);
        assert_eq!(arena.live_segments(), 0);
    }

    #[test]
    fn split_reassigns_recorder_node_when_asked() {
        let mut arena = SegmentArena::new();
        let head = list(&mut arena, &[(0, 100, 1)]);
        let left = arena.split_left(head, 50, node(42));
        let right = arena.split_right(head, 50, node(43));
        assert_eq!(arena.collect(left), vec![(0, 50, 1, node(42))]);
        assert_eq!(arena.collect(right), vec![(50, 100, 1, node(43))]);
    }

    #[test]
    fn gene_conversion_split_is_exact_complement() {
        let mut arena = SegmentArena::new();
        let head = list(&mut arena, &[(0, 30, 1), (50, 100, 2)]);
        let (converted, unconverted) = arena.split_gene_conversion(head, 20, 60, None, None);
        assert_eq!(
            arena.collect(converted),
            vec![(20, 30, 1, node(7)), (50, 60, 2, node(7))]
        );
        assert_eq!(
            arena.collect(unconverted),
            vec![(0, 20, 1, node(7)), (60, 100, 2, node(7))]
        );
    }

    #[test]
    fn gene_conversion_tract_outside_material() {
        let mut arena = SegmentArena::new();
        let head = list(&mut arena, &[(10, 20, 1)]);
        let (converted, unconverted) = arena.split_gene_conversion(head, 30, 40, None, None);
        assert!(converted.is_none());
        assert_eq!(arena.collect(unconverted), vec![(10, 20, 1, node(7))]);
    }

    #[test]
    fn span_stats_ignore_fixed_material() {
        let mut arena = SegmentArena::new();
        let head = list(&mut arena, &[(0, 10, 4), (10, 30, 2), (40, 50, 1)]);
        let stats = arena.span_stats(head, 4);
        assert_eq!(stats.active_sites, 30);
        assert_eq!(stats.left_limit, 10);
        assert_eq!(stats.right_limit, 49);
    }

    #[test]
    fn release_frees_whole_private_chain() {
        let mut arena = SegmentArena::new();
        let head = list(&mut arena, &[(0, 10, 1), (20, 30, 1)]);
        assert_eq!(arena.live_segments(), 2);
        arena.release(head);
        assert_eq!(arena.live_segments(), 0);
    }
}
