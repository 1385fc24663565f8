//! Local trust via personalized PageRank on the channel graph.
//!
//! Each node computes trust from its own vantage point: a random walk
//! with restart at the seed, iterated a fixed number of rounds over an
//! immutable graph snapshot. Opening an ITS channel is costly, so edges
//! encode real relationships; a Sybil region reachable only over a few
//! attack edges can capture at most `d·a / ((1−d)·δ)` of the total trust
//! regardless of its size.

// Copyright (c) Facebook, Inc. and its affiliates.
// Modifications Copyright (c) 2022-2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

use crate::{overlay::ChannelGraph, protocol::ParticipantIdentifier};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

/// Damping factor for the random walk.
pub const DAMPING: f64 = 0.85;

/// Fixed power-iteration count. A ratio-convergence early exit is a legal
/// optimization but not required for correctness.
pub const ITERATIONS: usize = 20;

/// Fraction of total trust attestations must exceed for acceptance.
pub const ACCEPT_THRESHOLD: f64 = 2.0 / 3.0;

/// A per-seed trust assignment over all known nodes. Values are
/// nonnegative and sum to 1 up to the walk's dangling-mass loss; the sum
/// is never re-normalized, so divergence stays visible to callers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrustVector {
    scores: HashMap<ParticipantIdentifier, f64>,
}

impl TrustVector {
    /// Wrap precomputed scores.
    pub fn from_scores(scores: HashMap<ParticipantIdentifier, f64>) -> Self {
        Self { scores }
    }

    /// The trust assigned to `node` (zero for unknown nodes).
    pub fn score(&self, node: ParticipantIdentifier) -> f64 {
        *self.scores.get(&node).unwrap_or(&0.0)
    }

    /// Total assigned trust.
    pub fn total(&self) -> f64 {
        self.scores.values().sum()
    }

    /// Iterate over `(node, score)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (ParticipantIdentifier, f64)> + '_ {
        self.scores.iter().map(|(&node, &score)| (node, score))
    }

    /// Number of scored nodes.
    pub fn len(&self) -> usize {
        self.scores.len()
    }

    /// True when no node is scored.
    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }
}

/// Compute trust scores from `seed`'s perspective by power iteration on
/// a graph snapshot.
///
/// `pi_{t+1}(v) = (1−d)·𝟙[v = seed] + d·Σ_u pi_t(u)·w(u,v)/out_weight(u)`
pub fn personalized_pagerank(seed: ParticipantIdentifier, graph: &ChannelGraph) -> TrustVector {
    personalized_pagerank_with(seed, graph, DAMPING, ITERATIONS)
}

/// [`personalized_pagerank`] with explicit parameters.
pub fn personalized_pagerank_with(
    seed: ParticipantIdentifier,
    graph: &ChannelGraph,
    damping: f64,
    iterations: usize,
) -> TrustVector {
    let nodes = graph.nodes();
    if nodes.is_empty() {
        return TrustVector::default();
    }

    let mut trust: HashMap<ParticipantIdentifier, f64> =
        nodes.iter().map(|&n| (n, 0.0)).collect();
    let _ = trust.insert(seed, 1.0);

    for round in 0..iterations {
        let mut next: HashMap<ParticipantIdentifier, f64> =
            nodes.iter().map(|&n| (n, 0.0)).collect();
        for &u in &nodes {
            let out = graph.out_weight(u);
            if out == 0.0 {
                continue;
            }
            let mass = damping * trust[&u] / out;
            for v in graph.neighbors(u) {
                *next.get_mut(&v).expect("all nodes initialized") +=
                    mass * graph.weight(u, v);
            }
        }
        *next.get_mut(&seed).expect("seed is a node") += 1.0 - damping;
        trust = next;
        debug!(
            "pagerank round {round}: seed mass {:.6}",
            trust[&seed]
        );
    }

    TrustVector::from_scores(trust)
}

/// Trust-weighted BFT acceptance: true iff the attesting nodes hold more
/// than [`ACCEPT_THRESHOLD`] of the total trust.
pub fn trust_weighted_accept(
    attestations: &[ParticipantIdentifier],
    trust: &TrustVector,
) -> bool {
    let total = trust.total();
    if total == 0.0 {
        return false;
    }
    let attesting: f64 = attestations.iter().map(|&a| trust.score(a)).sum();
    attesting > ACCEPT_THRESHOLD * total
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid(n: u64) -> ParticipantIdentifier {
        ParticipantIdentifier::from_u64(n)
    }

    fn line_graph(n: u64) -> ChannelGraph {
        let mut g = ChannelGraph::default();
        for i in 1..n {
            g.add_edge(pid(i), pid(i + 1));
        }
        g
    }

    fn complete_graph(n: u64) -> ChannelGraph {
        let mut g = ChannelGraph::default();
        for i in 1..=n {
            for j in i + 1..=n {
                g.add_edge(pid(i), pid(j));
            }
        }
        g
    }

    #[test]
    fn trust_sums_to_one_on_connected_graphs() {
        for graph in [line_graph(10), complete_graph(10)] {
            let trust = personalized_pagerank(pid(1), &graph);
            assert!((trust.total() - 1.0).abs() < 1e-9, "sum {}", trust.total());
            assert!(trust.iter().all(|(_, s)| s >= 0.0));
        }
    }

    #[test]
    fn dangling_mass_loss_stays_visible() {
        // A seed with no edges sheds all walk mass; only the restart
        // remains. The sum must expose that instead of re-normalizing.
        let mut graph = ChannelGraph::default();
        graph.add_node(pid(1));
        let trust = personalized_pagerank(pid(1), &graph);
        assert!((trust.total() - (1.0 - DAMPING)).abs() < 1e-9);
    }

    #[test]
    fn seed_outranks_distant_nodes() {
        let graph = line_graph(10);
        let trust = personalized_pagerank(pid(1), &graph);
        assert!(trust.score(pid(1)) > trust.score(pid(5)));
        assert!(trust.score(pid(1)) > trust.score(pid(10)));

        let complete = complete_graph(8);
        let trust = personalized_pagerank(pid(3), &complete);
        for other in (1..=8).filter(|&n| n != 3) {
            assert!(trust.score(pid(3)) > trust.score(pid(other)));
        }
    }

    #[test]
    fn acceptance_needs_two_thirds_of_trust() {
        let graph = complete_graph(4);
        let trust = personalized_pagerank(pid(1), &graph);
        let all: Vec<_> = (1..=4).map(pid).collect();
        assert!(trust_weighted_accept(&all, &trust));
        // The seed holds the bulk of its own trust; two non-seed
        // attestors fall short of 2/3.
        assert!(!trust_weighted_accept(&[pid(2), pid(3)], &trust));
        assert!(!trust_weighted_accept(&[], &trust));
        assert!(!trust_weighted_accept(&all, &TrustVector::default()));
    }

    #[test]
    fn sybil_region_trust_is_bounded() {
        // Star: seed 1 with 9 honest leaves; a 1000-node Sybil ring
        // attached by 3 attack edges to leaves 2, 3, 4.
        let mut graph = ChannelGraph::default();
        for leaf in 2..=10 {
            graph.add_edge(pid(1), pid(leaf));
        }
        let sybil_base = 100;
        let sybil_count = 1000u64;
        for i in 0..sybil_count {
            let a = pid(sybil_base + i);
            let b = pid(sybil_base + (i + 1) % sybil_count);
            graph.add_edge(a, b);
        }
        let attack_edges = 3u64;
        for i in 0..attack_edges {
            graph.add_edge(pid(2 + i), pid(sybil_base + i));
        }

        let trust = personalized_pagerank(pid(1), &graph);
        let sybil_total: f64 = (0..sybil_count)
            .map(|i| trust.score(pid(sybil_base + i)))
            .sum();

        // Closed form: d·a / ((1−d)·δ) with δ = 1 (a leaf's honest edge
        // to the seed). The computed mass must sit far below 0.5 for this
        // topology.
        let bound = DAMPING * attack_edges as f64 / ((1.0 - DAMPING) * 1.0);
        assert!(sybil_total <= bound);
        assert!(
            sybil_total < 0.5,
            "sybil region captured {sybil_total} of the trust"
        );
    }
}
