//! Append-only tree-sequence tables and the buffered edge recorder
//!
//! Nodes, edges, sites, and mutations accumulate here while the ancestry
//! simulation runs. Edges pass through a bounded buffer that squashes
//! abutting spans with the same parent/child pair before they reach the
//! table.

use bitflags::bitflags;
use serde::Serialize;
use serde_tuple::Serialize_tuple;

/// Identifier of a row in the node table
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct NodeId(pub u32);

impl NodeId {
    /// Row index as a `usize` for direct table indexing
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

bitflags! {
    /// Per-node flags stored in the node table
    #[derive(Default)]
    pub struct NodeFlags: u32 {
        /// The node is one of the sampled leaves
        const IS_SAMPLE = 1;
    }
}

bitflags! {
    /// Options controlling table simplification
    #[derive(Default)]
    pub struct SimplifyOptions: u32 {
        /// Keep unary spans (recombination and gene-conversion junctions)
        /// instead of eliding them
        const KEEP_UNARY = 1;
    }
}

/// One row of the node table
#[derive(Copy, Clone, Debug)]
pub struct NodeRow {
    /// Coalescent time of the node, in units of `2N0` generations
    pub time: f64,
    /// Population the node was created in
    pub population: i32,
    /// Node flags
    pub flags: NodeFlags,
}

/// One row of the edge table, a half-open span `[left, right)` of inheritance
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize_tuple)]
pub struct EdgeRow {
    /// Leftmost site covered (inclusive)
    pub left: u32,
    /// Rightmost site covered (exclusive)
    pub right: u32,
    /// Ancestor node
    pub parent: NodeId,
    /// Descendant node
    pub child: NodeId,
}

/// One row of the site table
#[derive(Copy, Clone, Debug, Serialize_tuple)]
pub struct SiteRow {
    /// Real-valued position in `[0, sequence_length)`
    pub position: f64,
    /// Ancestral allele
    pub ancestral_state: char,
}

/// One row of the mutation table
#[derive(Copy, Clone, Debug, Serialize_tuple)]
pub struct MutationRow {
    /// Row index into the site table
    pub site: u32,
    /// Node immediately below the mutation
    pub node: NodeId,
    /// Derived allele
    pub derived_state: char,
}

/// A collection of the four logical tables plus the sequence length
#[derive(Clone, Debug, Default)]
pub struct TableCollection {
    /// Number of discrete sites in the simulated locus
    pub sequence_length: u32,
    /// Node table
    pub nodes: Vec<NodeRow>,
    /// Edge table
    pub edges: Vec<EdgeRow>,
    /// Site table
    pub sites: Vec<SiteRow>,
    /// Mutation table
    pub mutations: Vec<MutationRow>,
}

impl TableCollection {
    /// Create an empty collection covering `sequence_length` sites
    pub fn new(sequence_length: u32) -> Self {
        Self {
            sequence_length,
            ..Self::default()
        }
    }

    /// Append a node row, returning its id
    pub fn add_node(&mut self, time: f64, population: i32, flags: NodeFlags) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(NodeRow {
            time,
            population,
            flags,
        });
        id
    }

    /// Append an edge row directly, bypassing the buffer
    pub fn add_edge(&mut self, left: u32, right: u32, parent: NodeId, child: NodeId) {
        debug_assert!(left < right);
        self.edges.push(EdgeRow {
            left,
            right,
            parent,
            child,
        });
    }

    /// Append a site row, returning its index
    pub fn add_site(&mut self, position: f64, ancestral_state: char) -> u32 {
        self.sites.push(SiteRow {
            position,
            ancestral_state,
        });
        (self.sites.len() - 1) as u32
    }

    /// Append a mutation row
    pub fn add_mutation(&mut self, site: u32, node: NodeId, derived_state: char) {
        self.mutations.push(MutationRow {
            site,
            node,
            derived_state,
        });
    }

    /// Sort edges into canonical order: ascending parent time, then parent
    /// id, child id, and left coordinate
    pub fn sort_edges(&mut self) {
        let nodes = &self.nodes;
        self.edges.sort_by(|a, b| {
            let ta = nodes[a.parent.index()].time;
            let tb = nodes[b.parent.index()].time;
            ta.partial_cmp(&tb)
                .expect("node times are finite")
                .then(a.parent.cmp(&b.parent))
                .then(a.child.cmp(&b.child))
                .then(a.left.cmp(&b.left))
        });
    }
}

/// Maximum number of edges held in the buffer before an implicit flush
const EDGE_BUFFER_CAPACITY: usize = 64 * 1024;

/// Buffered edge recorder with squash-on-flush
///
/// Squashing merges runs of buffered edges that share a parent/child pair and
/// abut exactly (`right_i == left_{i+1}`). The post-simplification tables are
/// identical with squashing on or off; the buffer only reduces table churn.
#[derive(Debug)]
pub struct EdgeBuffer {
    pending: Vec<EdgeRow>,
    squash: bool,
}

impl Default for EdgeBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl EdgeBuffer {
    /// Create an empty buffer with squashing enabled
    pub fn new() -> Self {
        Self {
            pending: Vec::new(),
            squash: true,
        }
    }

    /// Enable or disable squashing (the observable output is unaffected)
    pub fn set_squash(&mut self, squash: bool) {
        self.squash = squash;
    }

    /// Number of buffered, unflushed edges
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether the buffer is empty
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Buffer one edge
    pub fn push(&mut self, tables: &mut TableCollection, edge: EdgeRow) {
        debug_assert!(edge.left < edge.right);
        self.pending.push(edge);
        if self.pending.len() >= EDGE_BUFFER_CAPACITY {
            self.flush(tables);
        }
    }

    /// Move all buffered edges into `tables`, squashing abutting spans
    pub fn flush(&mut self, tables: &mut TableCollection) {
        if self.pending.is_empty() {
            return;
        }
        self.pending
            .sort_by(|a, b| (a.parent, a.child, a.left).cmp(&(b.parent, b.child, b.left)));
        if self.squash {
            let mut merged: Vec<EdgeRow> = Vec::with_capacity(self.pending.len());
            for edge in self.pending.drain(..) {
                match merged.last_mut() {
                    Some(prev)
                        if prev.parent == edge.parent
                            && prev.child == edge.child
                            && prev.right == edge.left =>
                    {
                        prev.right = edge.right;
                    }
                    _ => merged.push(edge),
                }
            }
            tables.edges.extend(merged);
        } else {
            tables.edges.append(&mut self.pending);
        }
    }
}

/// The recorder couples the tables, the edge buffer, and the bookkeeping the
/// driver needs at finalization time
#[derive(Debug, Default)]
pub struct Recorder {
    /// The logical tables
    pub tables: TableCollection,
    /// Buffered edges not yet in the table
    pub buffer: EdgeBuffer,
    /// Node ids of the sampled leaves, in sample order
    pub samples: Vec<NodeId>,
    /// Nodes flagged as carrying the beneficial mutation
    pub sweep_carriers: Vec<NodeId>,
}

impl Recorder {
    /// Fresh recorder for one replicate
    pub fn new(sequence_length: u32) -> Self {
        Self {
            tables: TableCollection::new(sequence_length),
            buffer: EdgeBuffer::new(),
            samples: Vec::new(),
            sweep_carriers: Vec::new(),
        }
    }

    /// Record a sampled leaf node
    pub fn add_sample(&mut self, time: f64, population: i32) -> NodeId {
        let id = self
            .tables
            .add_node(time, population, NodeFlags::IS_SAMPLE);
        self.samples.push(id);
        id
    }

    /// Record an internal node
    pub fn add_node(&mut self, time: f64, population: i32) -> NodeId {
        self.tables.add_node(time, population, NodeFlags::empty())
    }

    /// Buffer an inheritance edge
    pub fn record_edge(&mut self, parent: NodeId, child: NodeId, left: u32, right: u32) {
        self.buffer.push(
            &mut self.tables,
            EdgeRow {
                left,
                right,
                parent,
                child,
            },
        );
    }

    /// Flush buffered edges into the edge table
    pub fn flush_edges(&mut self) {
        self.buffer.flush(&mut self.tables);
    }

    /// Note a node that carries the beneficial mutation
    pub fn mark_sweep_carrier(&mut self, node: NodeId) {
        self.sweep_carriers.push(node);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_node_tables() -> TableCollection {
        let mut tables = TableCollection::new(100);
        tables.add_node(1.0, 0, NodeFlags::empty());
        tables.add_node(0.0, 0, NodeFlags::IS_SAMPLE);
        tables
    }

    #[test]
    fn squash_merges_abutting_spans() {
        let mut tables = two_node_tables();
        let mut buffer = EdgeBuffer::new();
        let (parent, child) = (NodeId(0), NodeId(1));
        for (l, r) in [(0, 10), (10, 25), (30, 40)] {
            buffer.push(
                &mut tables,
                EdgeRow {
                    left: l,
                    right: r,
                    parent,
                    child,
                },
            );
        }
        buffer.flush(&mut tables);
        assert_eq!(tables.edges.len(), 2);
        assert_eq!(tables.edges[0].left, 0);
        assert_eq!(tables.edges[0].right, 25);
        assert_eq!(tables.edges[1].left, 30);
    }

    #[test]
    fn squash_does_not_merge_across_children() {
        let mut tables = two_node_tables();
        let extra = tables.add_node(0.0, 0, NodeFlags::IS_SAMPLE);
        let mut buffer = EdgeBuffer::new();
        buffer.push(
            &mut tables,
            EdgeRow {
                left: 0,
                right: 10,
                parent: NodeId(0),
                child: NodeId(1),
            },
        );
        buffer.push(
            &mut tables,
            EdgeRow {
                left: 10,
                right: 20,
                parent: NodeId(0),
                child: extra,
            },
        );
        buffer.flush(&mut tables);
        assert_eq!(tables.edges.len(), 2);
    }

    #[test]
    fn flush_with_squash_disabled_preserves_rows() {
        let mut tables = two_node_tables();
        let mut buffer = EdgeBuffer::new();
        buffer.set_squash(false);
        for (l, r) in [(0, 10), (10, 25)] {
            buffer.push(
                &mut tables,
                EdgeRow {
                    left: l,
                    right: r,
                    parent: NodeId(0),
                    child: NodeId(1),
                },
            );
        }
        buffer.flush(&mut tables);
        assert_eq!(tables.edges.len(), 2);
    }

    #[test]
    fn sort_edges_orders_by_parent_time() {
        let mut tables = TableCollection::new(10);
        let s = tables.add_node(0.0, 0, NodeFlags::IS_SAMPLE);
        let old = tables.add_node(2.0, 0, NodeFlags::empty());
        let young = tables.add_node(1.0, 0, NodeFlags::empty());
        tables.add_edge(0, 10, old, young);
        tables.add_edge(0, 10, young, s);
        tables.sort_edges();
        assert_eq!(tables.edges[0].parent, young);
        assert_eq!(tables.edges[1].parent, old);
    }
}
