//! Table simplification and variant extraction
//!
//! Reduces the recorded tables to the history of the sample set: nodes are
//! processed ancestors-last, mapped ancestry segments propagate upward, and
//! output nodes are allocated where lineages coalesce. With `KEEP_UNARY` a
//! node is also kept where exactly one mapped lineage passes through, which
//! preserves recombination junctions in full-ARG recordings. Returns the
//! input-to-output node id map so callers can follow their sample ids.

use crate::sim::recorder::{NodeFlags, NodeId, SimplifyOptions, TableCollection};

/// A mapped ancestry interval: `[left, right)` of the input genome currently
/// represented by `node` in the output tables
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct MapSeg {
    left: u32,
    right: u32,
    node: NodeId,
}

/// Simplify `tables` with respect to `samples`, in place
///
/// Sample nodes receive output ids `0..samples.len()` in sample order. Every
/// recorded mutation is remapped; mutations above dropped nodes are removed.
pub fn simplify(
    tables: &mut TableCollection,
    samples: &[NodeId],
    options: SimplifyOptions,
) -> Vec<Option<NodeId>> {
    let n_input = tables.nodes.len();
    let keep_unary = options.contains(SimplifyOptions::KEEP_UNARY);

    let mut idmap: Vec<Option<NodeId>> = vec![None; n_input];
    let mut ancestry: Vec<Vec<MapSeg>> = vec![Vec::new(); n_input];
    let mut out = TableCollection::new(tables.sequence_length);

    for &s in samples {
        assert!(idmap[s.index()].is_none(), "duplicate sample");
        let row = tables.nodes[s.index()];
        let mapped = out.add_node(row.time, row.population, NodeFlags::IS_SAMPLE);
        idmap[s.index()] = Some(mapped);
        ancestry[s.index()].push(MapSeg {
            left: 0,
            right: tables.sequence_length,
            node: mapped,
        });
    }

    // Visit parents in time order, grouping their edges
    let mut order: Vec<usize> = (0..tables.edges.len()).collect();
    order.sort_by(|&a, &b| {
        let (ea, eb) = (&tables.edges[a], &tables.edges[b]);
        let (ta, tb) = (
            tables.nodes[ea.parent.index()].time,
            tables.nodes[eb.parent.index()].time,
        );
        ta.partial_cmp(&tb)
            .expect("node times are finite")
            .then(ea.parent.cmp(&eb.parent))
    });

    let mut group = 0;
    while group < order.len() {
        let parent = tables.edges[order[group]].parent;
        let mut end = group;
        while end < order.len() && tables.edges[order[end]].parent == parent {
            end += 1;
        }

        let mut queue: Vec<MapSeg> = Vec::new();
        for &edge_idx in &order[group..end] {
            let edge = &tables.edges[edge_idx];
            for seg in &ancestry[edge.child.index()] {
                if seg.right > edge.left && edge.right > seg.left {
                    queue.push(MapSeg {
                        left: seg.left.max(edge.left),
                        right: seg.right.min(edge.right),
                        node: seg.node,
                    });
                }
            }
        }
        group = end;
        if queue.is_empty() {
            continue;
        }
        queue.sort_by_key(|s| s.left);

        let mut output_node: Option<NodeId> = None;
        let mut emitted: Vec<MapSeg> = Vec::new();
        let mut mapped: Vec<MapSeg> = Vec::new();
        {
            let row = tables.nodes[parent.index()];
            let mut ensure_node = |out: &mut TableCollection, idmap: &mut Vec<Option<NodeId>>| {
                *output_node.get_or_insert_with(|| {
                    let id = out.add_node(row.time, row.population, NodeFlags::empty());
                    idmap[parent.index()] = Some(id);
                    id
                })
            };

            let mut i = 0;
            let mut active: Vec<MapSeg> = Vec::new();
            let mut left = 0;
            while i < queue.len() || !active.is_empty() {
                if active.is_empty() {
                    left = queue[i].left;
                }
                while i < queue.len() && queue[i].left == left {
                    active.push(queue[i]);
                    i += 1;
                }
                let mut right = active.iter().map(|s| s.right).min().expect("nonempty");
                if i < queue.len() {
                    right = right.min(queue[i].left);
                }

                if active.len() == 1 && !keep_unary {
                    // Unary span: the descendant passes straight through
                    push_mapped(
                        &mut mapped,
                        MapSeg {
                            left,
                            right,
                            node: active[0].node,
                        },
                    );
                } else {
                    let node = ensure_node(&mut out, &mut idmap);
                    for overlap in &active {
                        emitted.push(MapSeg {
                            left,
                            right,
                            node: overlap.node,
                        });
                    }
                    push_mapped(&mut mapped, MapSeg { left, right, node });
                }

                left = right;
                active.retain(|s| s.right > left);
            }
        }

        if let Some(node) = output_node {
            // Emit this parent's edges, squashed per child
            emitted.sort_by(|a, b| (a.node, a.left).cmp(&(b.node, b.left)));
            let mut last: Option<MapSeg> = None;
            for e in emitted {
                match &mut last {
                    Some(prev) if prev.node == e.node && prev.right == e.left => {
                        prev.right = e.right;
                    }
                    _ => {
                        if let Some(prev) = last.take() {
                            out.add_edge(prev.left, prev.right, node, prev.node);
                        }
                        last = Some(e);
                    }
                }
            }
            if let Some(prev) = last {
                out.add_edge(prev.left, prev.right, node, prev.node);
            }
        }
        ancestry[parent.index()] = mapped;
    }

    // Carry over sites untouched; remap mutation nodes and drop orphans
    out.sites = std::mem::take(&mut tables.sites);
    out.mutations = tables
        .mutations
        .drain(..)
        .filter_map(|mut m| {
            idmap[m.node.index()].map(|node| {
                m.node = node;
                m
            })
        })
        .collect();

    out.sort_edges();
    *tables = out;
    idmap
}

fn push_mapped(mapped: &mut Vec<MapSeg>, seg: MapSeg) {
    match mapped.last_mut() {
        Some(prev) if prev.node == seg.node && prev.right == seg.left => prev.right = seg.right,
        _ => mapped.push(seg),
    }
}

/// Positions and 0/1 genotypes of every site, sample-major
#[derive(Clone, Debug, Default)]
pub struct Variants {
    /// Site positions in `[0, sequence_length)`, ascending
    pub positions: Vec<f64>,
    /// One row of `0`/`1` values per sample, in sample order
    pub genotypes: Vec<Vec<u8>>,
}

/// Walk the marginal trees and read off each sample's allele at every site
///
/// Sites must already be sorted by position (the mutation placer guarantees
/// this). A sample is derived at a site when any node on its path to the
/// root at that position carries one of the site's mutations.
pub fn extract_variants(tables: &TableCollection, samples: &[NodeId]) -> Variants {
    let num_nodes = tables.nodes.len();
    let mut site_nodes: Vec<Vec<NodeId>> = vec![Vec::new(); tables.sites.len()];
    for m in &tables.mutations {
        site_nodes[m.site as usize].push(m.node);
    }

    let mut insertion: Vec<usize> = (0..tables.edges.len()).collect();
    insertion.sort_by_key(|&i| tables.edges[i].left);
    let mut removal: Vec<usize> = (0..tables.edges.len()).collect();
    removal.sort_by_key(|&i| tables.edges[i].right);

    let mut parent: Vec<Option<NodeId>> = vec![None; num_nodes];
    let (mut j, mut k) = (0, 0);

    let mut variants = Variants {
        positions: Vec::with_capacity(tables.sites.len()),
        genotypes: vec![Vec::with_capacity(tables.sites.len()); samples.len()],
    };

    for (site_idx, site) in tables.sites.iter().enumerate() {
        let pos = site.position;
        while k < removal.len() && f64::from(tables.edges[removal[k]].right) <= pos {
            parent[tables.edges[removal[k]].child.index()] = None;
            k += 1;
        }
        while j < insertion.len() && f64::from(tables.edges[insertion[j]].left) <= pos {
            let e = &tables.edges[insertion[j]];
            if f64::from(e.right) > pos {
                parent[e.child.index()] = Some(e.parent);
            }
            j += 1;
        }

        variants.positions.push(pos);
        let carriers = &site_nodes[site_idx];
        for (s, &sample) in samples.iter().enumerate() {
            let mut derived = 0u8;
            let mut cursor = Some(sample);
            while let Some(node) = cursor {
                if carriers.contains(&node) {
                    derived = 1;
                    break;
                }
                cursor = parent[node.index()];
            }
            variants.genotypes[s].push(derived);
        }
    }

    variants
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::recorder::Recorder;

    /// Two samples coalescing through a recombination junction:
    ///
    /// samples 0, 1; node 2 and 3 are the recombination parents of sample 0
    /// (split at 50); node 4 coalesces 2 with 1 on `[0, 50)` and node 5
    /// coalesces 3 with 4 on `[50, 100)` and absorbs 4 on `[0, 50)`.
    fn recombinant_tables() -> (TableCollection, Vec<NodeId>) {
        let mut rec = Recorder::new(100);
        let s0 = rec.add_sample(0.0, 0);
        let s1 = rec.add_sample(0.0, 0);
        let lp = rec.add_node(0.5, 0);
        let rp = rec.add_node(0.5, 0);
        rec.record_edge(lp, s0, 0, 50);
        rec.record_edge(rp, s0, 50, 100);
        let c1 = rec.add_node(1.0, 0);
        rec.record_edge(c1, lp, 0, 50);
        rec.record_edge(c1, s1, 0, 100);
        let c2 = rec.add_node(2.0, 0);
        rec.record_edge(c2, rp, 50, 100);
        rec.record_edge(c2, c1, 0, 100);
        rec.flush_edges();
        rec.tables.sort_edges();
        (rec.tables, vec![s0, s1])
    }

    #[test]
    fn minimal_mode_drops_unary_junctions() {
        let (mut tables, samples) = recombinant_tables();
        let idmap = simplify(&mut tables, &samples, SimplifyOptions::empty());
        // Junction nodes are elided; both coalescences remain
        assert_eq!(tables.nodes.len(), 4);
        assert!(idmap[2].is_none());
        assert!(idmap[3].is_none());
        assert!(idmap[4].is_some());
        assert!(idmap[5].is_some());
        // Sample ids come first and in order
        assert_eq!(idmap[0], Some(NodeId(0)));
        assert_eq!(idmap[1], Some(NodeId(1)));
    }

    #[test]
    fn keep_unary_retains_junctions() {
        let (mut tables, samples) = recombinant_tables();
        let minimal_nodes = {
            let (mut t, s) = recombinant_tables();
            simplify(&mut t, &s, SimplifyOptions::empty());
            t.nodes.len()
        };
        simplify(&mut tables, &samples, SimplifyOptions::KEEP_UNARY);
        assert!(tables.nodes.len() > minimal_nodes);
        assert_eq!(tables.nodes.len(), 6);
    }

    #[test]
    fn simplified_edges_cover_sample_material() {
        let (mut tables, samples) = recombinant_tables();
        simplify(&mut tables, &samples, SimplifyOptions::empty());
        // Every sample is covered over the whole locus by some edge
        for s in [NodeId(0), NodeId(1)] {
            let mut covered: Vec<(u32, u32)> = tables
                .edges
                .iter()
                .filter(|e| e.child == s)
                .map(|e| (e.left, e.right))
                .collect();
            covered.sort_unstable();
            assert_eq!(covered.first().map(|c| c.0), Some(0));
            assert_eq!(covered.last().map(|c| c.1), Some(100));
            for w in covered.windows(2) {
                assert_eq!(w[0].1, w[1].0, "coverage must be contiguous");
            }
        }
    }

    #[test]
    fn simple_binary_tree_is_preserved() {
        let mut rec = Recorder::new(10);
        let a = rec.add_sample(0.0, 0);
        let b = rec.add_sample(0.0, 0);
        let c = rec.add_sample(0.0, 0);
        let p1 = rec.add_node(1.0, 0);
        rec.record_edge(p1, a, 0, 10);
        rec.record_edge(p1, b, 0, 10);
        let p2 = rec.add_node(2.0, 0);
        rec.record_edge(p2, p1, 0, 10);
        rec.record_edge(p2, c, 0, 10);
        rec.flush_edges();
        let mut tables = rec.tables;
        let idmap = simplify(&mut tables, &[a, b, c], SimplifyOptions::empty());
        assert_eq!(tables.nodes.len(), 5);
        assert_eq!(tables.edges.len(), 4);
        assert!(idmap.iter().all(Option::is_some));
    }

    #[test]
    fn variants_follow_mutation_placement() {
        let mut rec = Recorder::new(10);
        let a = rec.add_sample(0.0, 0);
        let b = rec.add_sample(0.0, 0);
        let c = rec.add_sample(0.0, 0);
        let p1 = rec.add_node(1.0, 0);
        rec.record_edge(p1, a, 0, 10);
        rec.record_edge(p1, b, 0, 10);
        let p2 = rec.add_node(2.0, 0);
        rec.record_edge(p2, p1, 0, 10);
        rec.record_edge(p2, c, 0, 10);
        rec.flush_edges();
        let mut tables = rec.tables;
        let s0 = tables.add_site(2.5, '0');
        let s1 = tables.add_site(7.5, '0');
        tables.add_mutation(s0, p1, '1'); // a and b derive
        tables.add_mutation(s1, c, '1'); // only c derives
        let variants = extract_variants(&tables, &[a, b, c]);
        assert_eq!(variants.positions, vec![2.5, 7.5]);
        assert_eq!(variants.genotypes[0], vec![1, 0]);
        assert_eq!(variants.genotypes[1], vec![1, 0]);
        assert_eq!(variants.genotypes[2], vec![0, 1]);
    }
}
