//! Neutral mutation placement on the simplified tables
//!
//! Each edge carries branch mass `(t_parent - t_child) * (right - left)`;
//! the number of mutations on it is Poisson with mean `theta * mass /
//! n_sites`. Positions are real-valued, deduplicated by exact value, and the
//! site table ends up sorted by position. Sweep mutations go in first, at
//! the sweep site, on every recorded carrier node.

use hashbrown::HashMap;
use rand::Rng;
use rand_distr::{Distribution, Poisson};

use crate::sim::recorder::{NodeId, TableCollection};

/// Place the beneficial mutation at the sweep site on each carrier node
///
/// Carriers must already be remapped to post-simplification ids; nodes that
/// did not survive simplification are skipped by the caller.
pub fn place_sweep_mutations(tables: &mut TableCollection, carriers: &[NodeId], sweep_site: f64) {
    if carriers.is_empty() {
        return;
    }
    let position = sweep_site * f64::from(tables.sequence_length);
    let site = tables.add_site(position, '0');
    let mut seen: Vec<NodeId> = Vec::with_capacity(carriers.len());
    for &node in carriers {
        if seen.contains(&node) {
            continue;
        }
        seen.push(node);
        tables.add_mutation(site, node, '1');
    }
}

/// Drop neutral mutations over every edge of the simplified tables
pub fn drop_mutations<R: Rng>(tables: &mut TableCollection, theta: f64, rng: &mut R) {
    if theta > 0.0 {
        let n_sites = f64::from(tables.sequence_length);
        // Exact-position dedup, keyed on the bits of the position
        let mut site_index: HashMap<u64, u32> = HashMap::new();
        for s in 0..tables.sites.len() {
            site_index.insert(tables.sites[s].position.to_bits(), s as u32);
        }

        for e in 0..tables.edges.len() {
            let edge = tables.edges[e];
            let branch =
                tables.nodes[edge.parent.index()].time - tables.nodes[edge.child.index()].time;
            let mass = branch * f64::from(edge.right - edge.left);
            let mean = theta * mass / n_sites;
            if mean <= 0.0 {
                continue;
            }
            let count = Poisson::new(mean).unwrap().sample(rng) as u64;
            for _ in 0..count {
                let position = f64::from(edge.left)
                    + rng.gen::<f64>() * f64::from(edge.right - edge.left);
                let site = *site_index
                    .entry(position.to_bits())
                    .or_insert_with(|| tables.add_site(position, '0'));
                tables.add_mutation(site, edge.child, '1');
            }
        }
    }
    sort_sites(tables);
}

/// Sort the site table by position and renumber mutations accordingly
fn sort_sites(tables: &mut TableCollection) {
    let mut order: Vec<u32> = (0..tables.sites.len() as u32).collect();
    order.sort_by(|&a, &b| {
        tables.sites[a as usize]
            .position
            .partial_cmp(&tables.sites[b as usize].position)
            .expect("finite site positions")
    });
    let mut remap = vec![0u32; order.len()];
    for (new, &old) in order.iter().enumerate() {
        remap[old as usize] = new as u32;
    }
    let mut sorted = Vec::with_capacity(tables.sites.len());
    for &old in &order {
        sorted.push(tables.sites[old as usize]);
    }
    tables.sites = sorted;
    for m in &mut tables.mutations {
        m.site = remap[m.site as usize];
    }
    tables
        .mutations
        .sort_by_key(|m| (m.site, m.node));
}
