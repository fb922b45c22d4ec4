//! End-to-end scenarios run through the public simulation interface

use clap::Parser;

use coalsweep_core::cfg::SimConfig;
use coalsweep_core::sim::{summarize, ReplicateResult, SimulationHandler};

fn parse(extra: &[&str]) -> SimConfig {
    let mut args = vec!["coalsweep"];
    args.extend_from_slice(extra);
    SimConfig::parse_from(args)
}

fn run_all(cfg: SimConfig) -> Vec<ReplicateResult> {
    let mut handler = SimulationHandler::new(cfg).expect("valid config");
    let mut results = Vec::new();
    while let Some(result) = handler.next_replicate() {
        results.push(result.expect("replicate succeeds"));
    }
    results
}

fn run_one(extra: &[&str]) -> ReplicateResult {
    run_all(parse(extra)).remove(0)
}

/// Mean pairwise difference per site over a window of the genotype matrix
fn windowed_diversity(result: &ReplicateResult, lo: f64, hi: f64) -> f64 {
    let variants = result.variants();
    let n = variants.genotypes.len();
    let mut pi = 0.0;
    for (s, &pos) in variants.positions.iter().enumerate() {
        if pos < lo || pos >= hi {
            continue;
        }
        let derived = variants.genotypes.iter().filter(|g| g[s] == 1).count() as f64;
        pi += derived * (n as f64 - derived);
    }
    pi / (n as f64 * (n as f64 - 1.0) / 2.0) / (hi - lo)
}

#[test]
fn neutral_run_segregates_and_sorts_positions() {
    let result = run_one(&["10", "1", "1000", "-t", "5", "-r", "5", "-d", "42", "43"]);
    let variants = result.variants();
    assert!(!variants.positions.is_empty());
    assert_eq!(variants.genotypes.len(), 10);
    for w in variants.positions.windows(2) {
        assert!(w[0] <= w[1]);
    }
    for &p in &variants.positions {
        assert!(p >= 0.0 && p < 1000.0);
    }
    // Every site segregates: someone derived, someone ancestral
    for s in 0..variants.positions.len() {
        let derived = variants.genotypes.iter().filter(|g| g[s] == 1).count();
        assert!(derived > 0 && derived < 10, "site {s} is monomorphic");
    }
}

#[test]
fn runs_are_deterministic_under_fixed_seeds() {
    let args = ["10", "1", "1000", "-t", "5", "-r", "5", "-d", "42", "43"];
    let a = run_one(&args);
    let b = run_one(&args);
    assert_eq!(a.tables.nodes.len(), b.tables.nodes.len());
    assert_eq!(a.tables.edges.len(), b.tables.edges.len());
    let (va, vb) = (a.variants(), b.variants());
    assert_eq!(va.positions, vb.positions);
    assert_eq!(va.genotypes, vb.genotypes);
}

#[test]
fn zero_theta_yields_empty_genotypes() {
    let result = run_one(&["10", "1", "1000", "-t", "0", "-r", "10", "-d", "42", "43"]);
    let variants = result.variants();
    assert!(variants.positions.is_empty());
    assert_eq!(variants.genotypes.len(), 10);
    assert!(variants.genotypes.iter().all(Vec::is_empty));
}

#[test]
fn hard_sweep_leaves_a_diversity_trough() {
    // Strong selection with enough recombination that the flanks escape the
    // hitchhiking while the center is dragged to the sweep's ancestor
    let result = run_one(&[
        "20", "1", "10000", "-t", "20", "-r", "500", "-w", "stochastic", "--tau", "0.01", "-a",
        "1000", "-x", "0.5", "-N", "10000", "-d", "42", "43",
    ]);
    let variants = result.variants();
    assert!(!variants.positions.is_empty());
    // At least one simplified edge spans the sweep site
    assert!(result
        .tables
        .edges
        .iter()
        .any(|e| e.left <= 5000 && 5000 < e.right));
    let center = windowed_diversity(&result, 4500.0, 5500.0);
    let flank_mean =
        (windowed_diversity(&result, 0.0, 2000.0) + windowed_diversity(&result, 8000.0, 10000.0))
            / 2.0;
    assert!(
        flank_mean > 0.0,
        "flanking windows should retain diversity"
    );
    assert!(
        center < flank_mean,
        "expected reduced diversity at the sweep site: center {center}, flank mean {flank_mean}"
    );
}

#[test]
fn population_join_lets_separated_demes_finish() {
    let result = run_one(&[
        "10", "1", "1000", "-t", "5", "-r", "2", "-p", "5", "5", "-j", "0.2", "1", "0", "-M", "0",
        "-d", "42", "43",
    ]);
    // With zero migration the two demes can only find common ancestors
    // after the join, so the deepest node is older than it
    assert!(summarize::tmrca(&result.tables) > 0.2);
    let variants = result.variants();
    assert_eq!(variants.genotypes.len(), 10);
}

#[test]
fn four_leaf_coalescent_without_recombination() {
    let result = run_one(&["4", "1", "100", "-t", "0", "-r", "0", "-d", "42", "43"]);
    assert_eq!(result.tables.nodes.len(), 7);
    assert_eq!(result.tables.edges.len(), 6);
    assert!(result.tables.sites.is_empty());
    assert!(result.tables.mutations.is_empty());
    assert_eq!(summarize::marginal_tree_count(&result.tables), 1);
}

#[test]
fn full_arg_keeps_unary_recombination_nodes() {
    let minimal = run_one(&["10", "1", "1000", "-t", "5", "-r", "5", "-d", "42", "43"]);
    let full = run_one(&["10", "1", "1000", "-t", "5", "-r", "5", "-F", "-d", "42", "43"]);
    assert!(
        full.tables.nodes.len() > minimal.tables.nodes.len(),
        "full ARG must retain junction nodes: {} vs {}",
        full.tables.nodes.len(),
        minimal.tables.nodes.len()
    );
    assert_eq!(full.variants().genotypes.len(), minimal.variants().genotypes.len());
}

#[test]
fn neutral_branch_length_matches_coalescent_expectation() {
    let results = run_all(parse(&["10", "200", "100", "-t", "0", "-r", "0", "-d", "7", "9"]));
    assert_eq!(results.len(), 200);
    let mean_length: f64 = results
        .iter()
        .map(|r| summarize::total_edge_mass(&r.tables) / 100.0)
        .sum::<f64>()
        / 200.0;
    // E[L] = 2 * sum_{k=2}^{10} 1/(k-1)
    let expected: f64 = 2.0 * (1..10).map(|k| 1.0 / k as f64).sum::<f64>();
    assert!(
        (mean_length - expected).abs() < 0.6,
        "mean total branch length {mean_length}, expected {expected}"
    );
}

#[test]
fn marginal_tree_count_grows_with_recombination() {
    let mean_trees = |rho: &str, seed: &str| -> f64 {
        let results = run_all(parse(&[
            "10", "20", "1000", "-t", "0", "-r", rho, "-d", seed, "1",
        ]));
        results
            .iter()
            .map(|r| summarize::marginal_tree_count(&r.tables) as f64)
            .sum::<f64>()
            / results.len() as f64
    };
    let low = mean_trees("0", "11");
    let high = mean_trees("20", "12");
    assert_eq!(low, 1.0);
    assert!(high > 3.0, "rho=20 should fragment the locus, got {high}");
}

#[test]
fn gene_conversion_runs_to_completion() {
    let result = run_one(&[
        "8", "1", "2000", "-t", "3", "-g", "2", "100", "-d", "5", "6",
    ]);
    assert_eq!(result.variants().genotypes.len(), 8);
}

#[test]
fn ancient_samples_activate_at_their_time() {
    let result = run_one(&[
        "8", "1", "500", "-t", "2", "-A", "2", "0", "0.5", "-d", "1", "2",
    ]);
    let leaf_times: Vec<f64> = result
        .samples
        .iter()
        .map(|s| result.tables.nodes[s.index()].time)
        .collect();
    assert_eq!(leaf_times.iter().filter(|&&t| t == 0.5).count(), 2);
    assert_eq!(leaf_times.iter().filter(|&&t| t == 0.0).count(), 6);
    assert!(summarize::tmrca(&result.tables) > 0.5);
}

#[test]
fn partial_sweep_places_the_sweep_mutation() {
    let result = run_one(&[
        "10", "1", "1000", "-t", "2", "-r", "1", "-w", "stochastic", "--tau", "0.02", "-a",
        "500", "-x", "0.5", "-c", "0.6", "-N", "10000", "-d", "21", "22",
    ]);
    let variants = result.variants();
    let site = variants.positions.iter().position(|&p| p == 500.0);
    assert!(site.is_some(), "sweep mutation expected at position 500");
    let s = site.unwrap();
    let derived = variants.genotypes.iter().filter(|g| g[s] == 1).count();
    assert!(derived > 0, "some sample carries the sweep mutation");
}

#[test]
fn recurrent_sweeps_run_to_completion() {
    let result = run_one(&[
        "10", "1", "1000", "-t", "3", "-r", "2", "-w", "stochastic", "-a", "500", "-R", "2",
        "-N", "10000", "-d", "7", "8",
    ]);
    assert_eq!(result.variants().genotypes.len(), 10);
}

#[test]
fn replicates_differ_but_reruns_match() {
    let results = run_all(parse(&["6", "3", "500", "-t", "4", "-d", "3", "4"]));
    assert_eq!(results.len(), 3);
    let again = run_all(parse(&["6", "3", "500", "-t", "4", "-d", "3", "4"]));
    for (a, b) in results.iter().zip(&again) {
        assert_eq!(a.variants().positions, b.variants().positions);
    }
    // With three replicates of theta=4 at least two should differ
    let distinct = results
        .iter()
        .map(|r| r.variants().positions.len())
        .collect::<std::collections::HashSet<_>>();
    assert!(!distinct.is_empty());
}
