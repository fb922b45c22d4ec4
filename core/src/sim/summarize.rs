//! Summarizing operations over a finished replicate's tables

use itertools::Itertools;

use crate::sim::recorder::TableCollection;

/// Number of segregating sites
pub fn segregating_sites(tables: &TableCollection) -> usize {
    tables.sites.len()
}

/// Time of the deepest node, the age of the oldest MRCA
pub fn tmrca(tables: &TableCollection) -> f64 {
    tables
        .nodes
        .iter()
        .map(|n| n.time)
        .fold(0.0, f64::max)
}

/// Number of distinct marginal trees along the locus
///
/// Counted as one more than the number of interior breakpoints edges start
/// or end at.
pub fn marginal_tree_count(tables: &TableCollection) -> usize {
    let breakpoints = tables
        .edges
        .iter()
        .flat_map(|e| [e.left, e.right])
        .filter(|&b| b > 0 && b < tables.sequence_length)
        .unique()
        .count();
    breakpoints + 1
}

/// Total branch mass: sum over edges of branch length times span, in units
/// of `2N0` generations times sites
pub fn total_edge_mass(tables: &TableCollection) -> f64 {
    tables
        .edges
        .iter()
        .map(|e| {
            let branch =
                tables.nodes[e.parent.index()].time - tables.nodes[e.child.index()].time;
            branch * f64::from(e.right - e.left)
        })
        .sum()
}

/// Total branch length of the single marginal tree covering `site`
pub fn branch_length_at(tables: &TableCollection, site: u32) -> f64 {
    tables
        .edges
        .iter()
        .filter(|e| e.left <= site && site < e.right)
        .map(|e| tables.nodes[e.parent.index()].time - tables.nodes[e.child.index()].time)
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::recorder::Recorder;
    use approx::assert_relative_eq;

    fn two_tree_tables() -> TableCollection {
        let mut rec = Recorder::new(100);
        let a = rec.add_sample(0.0, 0);
        let b = rec.add_sample(0.0, 0);
        let p = rec.add_node(1.5, 0);
        let q = rec.add_node(2.0, 0);
        rec.record_edge(p, a, 0, 60);
        rec.record_edge(p, b, 0, 60);
        rec.record_edge(q, a, 60, 100);
        rec.record_edge(q, b, 60, 100);
        rec.flush_edges();
        rec.tables
    }

    #[test]
    fn tree_count_counts_breakpoints() {
        let tables = two_tree_tables();
        assert_eq!(marginal_tree_count(&tables), 2);
    }

    #[test]
    fn tmrca_is_deepest_node() {
        let tables = two_tree_tables();
        assert_eq!(tmrca(&tables), 2.0);
    }

    #[test]
    fn branch_masses_add_up() {
        let tables = two_tree_tables();
        assert_relative_eq!(total_edge_mass(&tables), 2.0 * 1.5 * 60.0 + 2.0 * 2.0 * 40.0);
        assert_relative_eq!(branch_length_at(&tables, 0), 3.0);
        assert_relative_eq!(branch_length_at(&tables, 99), 4.0);
    }
}
