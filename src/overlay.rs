//! The ITS overlay: channel table, channel graph, and graph health.
//!
//! The [`ChannelTable`] owns this node's live [`KeyChannel`]s. The
//! [`ChannelGraph`] is the node's view of the whole overlay — local edges
//! plus facts learned from [`GossipEdge`] messages — and is the substrate
//! both for mutual-contact discovery (peer introduction) and for the trust
//! computation, which always reads an immutable snapshot.

// Copyright (c) Facebook, Inc. and its affiliates.
// Modifications Copyright (c) 2022-2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

use crate::{
    channel::{ChannelStatus, KeyChannel},
    errors::{CallerError, InternalError, Result},
    protocol::ParticipantIdentifier,
    utils::{put_u64, ParseBytes},
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::{info, warn};

/// One tracked channel plus its bookkeeping.
#[derive(Debug)]
struct ChannelEntry<C> {
    channel: C,
    opened_at: u64,
    last_used: u64,
    last_accepted_run: Option<u64>,
}

/// The set of channels this node holds, keyed by peer.
///
/// Timestamps are logical ticks local to the table; they order channel
/// ages and idleness without a wall clock.
#[derive(Debug)]
pub struct ChannelTable<C> {
    entries: HashMap<ParticipantIdentifier, ChannelEntry<C>>,
    tick: u64,
}

impl<C: KeyChannel> Default for ChannelTable<C> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            tick: 0,
        }
    }
}

impl<C: KeyChannel> ChannelTable<C> {
    fn bump(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    /// Track a freshly-opened channel.
    pub fn add(&mut self, channel: C) {
        let now = self.bump();
        let peer = channel.peer();
        let _ = self.entries.insert(
            peer,
            ChannelEntry {
                channel,
                opened_at: now,
                last_used: now,
                last_accepted_run: None,
            },
        );
    }

    /// The channel to `peer`, if tracked.
    pub fn get(&self, peer: ParticipantIdentifier) -> Option<&C> {
        self.entries.get(&peer).map(|e| &e.channel)
    }

    /// Mutable access to the channel to `peer`.
    pub fn get_mut(&mut self, peer: ParticipantIdentifier) -> Option<&mut C> {
        self.entries.get_mut(&peer).map(|e| &mut e.channel)
    }

    /// Logical age of the channel to `peer` (older channels have larger
    /// ages).
    pub fn age(&self, peer: ParticipantIdentifier) -> Option<u64> {
        self.entries.get(&peer).map(|e| self.tick - e.opened_at)
    }

    /// Record traffic on the channel to `peer`, waking it if it had gone
    /// idle.
    pub fn touch(&mut self, peer: ParticipantIdentifier) {
        let now = self.bump();
        if let Some(entry) = self.entries.get_mut(&peer) {
            entry.last_used = now;
            entry.channel.wake();
        }
    }

    /// Enforce run-index monotonicity for an incoming message.
    ///
    /// Fails with [`InternalError::RunIndexReplay`] when `run_idx` is
    /// below the last accepted run on this channel.
    pub fn check_and_record_run(
        &mut self,
        peer: ParticipantIdentifier,
        run_idx: u64,
    ) -> Result<()> {
        let entry = self
            .entries
            .get_mut(&peer)
            .ok_or(CallerError::ChannelClosed)?;
        if let Some(last) = entry.last_accepted_run {
            if run_idx < last {
                return Err(InternalError::RunIndexReplay(peer));
            }
        }
        entry.last_accepted_run = Some(run_idx);
        Ok(())
    }

    /// Close and drop the channel to `peer`.
    pub fn remove(&mut self, peer: ParticipantIdentifier) {
        if let Some(mut entry) = self.entries.remove(&peer) {
            entry.channel.close();
        }
    }

    /// Demote channels that have seen no traffic for more than
    /// `max_idle` ticks to the idle state, so `status()` reflects
    /// staleness. Returns the demoted peers; [`touch`](Self::touch)
    /// wakes them on the next message either way.
    pub fn mark_idle(&mut self, max_idle: u64) -> Vec<ParticipantIdentifier> {
        let now = self.tick;
        let mut idled: Vec<ParticipantIdentifier> = self
            .entries
            .iter_mut()
            .filter(|(_, e)| {
                e.channel.status() == ChannelStatus::Active
                    && now.saturating_sub(e.last_used) > max_idle
            })
            .map(|(peer, e)| {
                e.channel.set_idle();
                *peer
            })
            .collect();
        idled.sort();
        idled
    }

    /// Peers with an active channel.
    pub fn active_peers(&self) -> Vec<ParticipantIdentifier> {
        self.entries
            .iter()
            .filter(|(_, e)| e.channel.status() == ChannelStatus::Active)
            .map(|(peer, _)| *peer)
            .collect()
    }

    /// Number of tracked channels.
    pub fn count(&self) -> usize {
        self.entries.len()
    }

    /// Drop entries whose channel turned out closed, restoring the
    /// invariant that tracked entries are usable. Returns the affected
    /// peers so the overlay can schedule reintroduction.
    pub fn reconcile(&mut self) -> Vec<ParticipantIdentifier> {
        let dead: Vec<ParticipantIdentifier> = self
            .entries
            .iter()
            .filter(|(_, e)| e.channel.status() == ChannelStatus::Closed)
            .map(|(peer, _)| *peer)
            .collect();
        for peer in &dead {
            let _ = self.entries.remove(peer);
        }
        dead
    }
}

/// An edge change gossiped across the overlay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GossipEdge {
    /// One endpoint.
    pub a: ParticipantIdentifier,
    /// The other endpoint.
    pub b: ParticipantIdentifier,
    /// True for a new edge, false for a removal.
    pub added: bool,
}

impl GossipEdge {
    /// Wire-encode: two coordinates and a flag word.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(24);
        put_u64(&mut out, self.a.as_coordinate());
        put_u64(&mut out, self.b.as_coordinate());
        put_u64(&mut out, self.added as u64);
        out
    }

    /// Decode from wire bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut parser = ParseBytes::new(bytes.to_vec());
        let a = ParticipantIdentifier::new(parser.take_u64()?)
            .map_err(|_| CallerError::DeserializationFailed)?;
        let b = ParticipantIdentifier::new(parser.take_u64()?)
            .map_err(|_| CallerError::DeserializationFailed)?;
        let added = match parser.take_u64()? {
            0 => false,
            1 => true,
            _ => Err(CallerError::DeserializationFailed)?,
        };
        Ok(Self { a, b, added })
    }
}

/// Sparse undirected weighted adjacency over known node identifiers.
///
/// Cloning yields the immutable snapshot the trust computation iterates
/// over.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelGraph {
    adj: HashMap<ParticipantIdentifier, HashSet<ParticipantIdentifier>>,
    weights: HashMap<(ParticipantIdentifier, ParticipantIdentifier), f64>,
}

impl ChannelGraph {
    /// Ensure a node exists.
    pub fn add_node(&mut self, node: ParticipantIdentifier) {
        let _ = self.adj.entry(node).or_default();
    }

    /// Insert an undirected edge with weight 1.
    pub fn add_edge(&mut self, a: ParticipantIdentifier, b: ParticipantIdentifier) {
        self.add_edge_weighted(a, b, 1.0);
    }

    /// Insert an undirected weighted edge.
    pub fn add_edge_weighted(
        &mut self,
        a: ParticipantIdentifier,
        b: ParticipantIdentifier,
        weight: f64,
    ) {
        if a == b {
            return;
        }
        let _ = self.adj.entry(a).or_default().insert(b);
        let _ = self.adj.entry(b).or_default().insert(a);
        let _ = self.weights.insert((a, b), weight);
        let _ = self.weights.insert((b, a), weight);
    }

    /// Remove an undirected edge.
    pub fn remove_edge(&mut self, a: ParticipantIdentifier, b: ParticipantIdentifier) {
        if let Some(ns) = self.adj.get_mut(&a) {
            let _ = ns.remove(&b);
        }
        if let Some(ns) = self.adj.get_mut(&b) {
            let _ = ns.remove(&a);
        }
        let _ = self.weights.remove(&(a, b));
        let _ = self.weights.remove(&(b, a));
    }

    /// True when the edge is present.
    pub fn has_edge(&self, a: ParticipantIdentifier, b: ParticipantIdentifier) -> bool {
        self.adj.get(&a).is_some_and(|ns| ns.contains(&b))
    }

    /// Neighbors of a node.
    pub fn neighbors(&self, node: ParticipantIdentifier) -> HashSet<ParticipantIdentifier> {
        self.adj.get(&node).cloned().unwrap_or_default()
    }

    /// Degree of a node.
    pub fn degree(&self, node: ParticipantIdentifier) -> usize {
        self.adj.get(&node).map_or(0, HashSet::len)
    }

    /// Edge weight, defaulting to 1 for present-but-unweighted edges.
    pub fn weight(&self, a: ParticipantIdentifier, b: ParticipantIdentifier) -> f64 {
        *self.weights.get(&(a, b)).unwrap_or(&1.0)
    }

    /// Sum of weights of edges out of `node`.
    pub fn out_weight(&self, node: ParticipantIdentifier) -> f64 {
        self.neighbors(node)
            .iter()
            .map(|&n| self.weight(node, n))
            .sum()
    }

    /// All known nodes.
    pub fn nodes(&self) -> Vec<ParticipantIdentifier> {
        self.adj.keys().copied().collect()
    }

    /// Node count.
    pub fn node_count(&self) -> usize {
        self.adj.len()
    }

    /// Edge count.
    pub fn edge_count(&self) -> usize {
        self.adj.values().map(HashSet::len).sum::<usize>() / 2
    }

    /// The edge set, normalized to `(min, max)` endpoint order.
    fn edge_set(&self) -> HashSet<(ParticipantIdentifier, ParticipantIdentifier)> {
        let mut edges = HashSet::new();
        for (&a, ns) in &self.adj {
            for &b in ns {
                let _ = edges.insert((a.min(b), a.max(b)));
            }
        }
        edges
    }

    /// True when every node reaches every other.
    pub fn is_connected(&self) -> bool {
        let Some(&start) = self.adj.keys().next() else {
            return true;
        };
        let mut visited = HashSet::new();
        let mut stack = vec![start];
        while let Some(node) = stack.pop() {
            if !visited.insert(node) {
                continue;
            }
            stack.extend(
                self.neighbors(node)
                    .into_iter()
                    .filter(|n| !visited.contains(n)),
            );
        }
        visited.len() == self.adj.len()
    }
}

/// A health report from the graph monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphHealth {
    /// Whether the known overlay is a single component.
    pub connected: bool,
    /// The smallest degree over known nodes.
    pub min_degree: usize,
    /// Baseline degree target: max(3, ⌈log2 n⌉ + 1). DKG-dense overlays
    /// need ≥ 2n/3 instead.
    pub target_degree: usize,
    /// Nodes below the baseline target.
    pub underconnected: Vec<ParticipantIdentifier>,
    /// Edges that disappeared since the previous check.
    pub removed_edges: Vec<(ParticipantIdentifier, ParticipantIdentifier)>,
}

/// Watches a [`ChannelGraph`] for disconnection, underconnected nodes,
/// and edge churn between checks.
#[derive(Debug, Default)]
pub struct GraphMonitor {
    last_edges: HashSet<(ParticipantIdentifier, ParticipantIdentifier)>,
}

impl GraphMonitor {
    /// Baseline degree target for an overlay of `n` nodes.
    pub fn target_degree(n: usize) -> usize {
        if n <= 1 {
            return 0;
        }
        let log = (n as f64).log2().ceil() as usize;
        (log + 1).max(3)
    }

    /// Inspect the graph, diffing its edge set against the last check.
    pub fn check(&mut self, graph: &ChannelGraph) -> GraphHealth {
        let nodes = graph.nodes();
        let target_degree = Self::target_degree(nodes.len());
        let mut underconnected: Vec<ParticipantIdentifier> = nodes
            .iter()
            .copied()
            .filter(|&n| graph.degree(n) < target_degree)
            .collect();
        underconnected.sort();
        let min_degree = nodes.iter().map(|&n| graph.degree(n)).min().unwrap_or(0);

        let edges = graph.edge_set();
        let mut removed_edges: Vec<_> = self.last_edges.difference(&edges).copied().collect();
        removed_edges.sort();
        self.last_edges = edges;

        let health = GraphHealth {
            connected: graph.is_connected(),
            min_degree,
            target_degree,
            underconnected,
            removed_edges,
        };
        if !health.connected || !health.removed_edges.is_empty() {
            warn!("overlay health degraded: {health:?}");
        }
        health
    }
}

/// This node's overlay state: its channels, its view of the channel
/// graph, and the graph monitor.
#[derive(Debug)]
pub struct Overlay<C: KeyChannel> {
    local: ParticipantIdentifier,
    table: ChannelTable<C>,
    graph: ChannelGraph,
    monitor: GraphMonitor,
    reintroduce: Vec<ParticipantIdentifier>,
}

impl<C: KeyChannel> Overlay<C> {
    /// A fresh overlay for one node.
    pub fn new(local: ParticipantIdentifier) -> Self {
        let mut graph = ChannelGraph::default();
        graph.add_node(local);
        Self {
            local,
            table: ChannelTable::default(),
            graph,
            monitor: GraphMonitor::default(),
            reintroduce: Vec::new(),
        }
    }

    /// The owning node.
    pub fn local(&self) -> ParticipantIdentifier {
        self.local
    }

    /// Open a channel to `peer` and record the edge.
    pub fn open_channel(&mut self, peer: ParticipantIdentifier, psk: &[u8]) -> Result<()> {
        let channel = C::open(self.local, peer, psk)?;
        self.table.add(channel);
        self.graph.add_edge(self.local, peer);
        info!("{}: opened channel to {}", self.local, peer);
        Ok(())
    }

    /// Close the channel to `peer` and drop the edge.
    pub fn close_channel(&mut self, peer: ParticipantIdentifier) {
        self.table.remove(peer);
        self.graph.remove_edge(self.local, peer);
        info!("{}: closed channel to {}", self.local, peer);
    }

    /// The channel to `peer`, failing with
    /// [`CallerError::ChannelClosed`] when none is live.
    pub fn channel(&self, peer: ParticipantIdentifier) -> Result<&C> {
        self.table
            .get(peer)
            .ok_or_else(|| CallerError::ChannelClosed.into())
    }

    /// Mutable channel access.
    pub fn channel_mut(&mut self, peer: ParticipantIdentifier) -> Result<&mut C> {
        self.table
            .get_mut(peer)
            .ok_or_else(|| CallerError::ChannelClosed.into())
    }

    /// The channel table.
    pub fn table(&self) -> &ChannelTable<C> {
        &self.table
    }

    /// Mutable channel table access.
    pub fn table_mut(&mut self) -> &mut ChannelTable<C> {
        &mut self.table
    }

    /// This node's graph view.
    pub fn graph(&self) -> &ChannelGraph {
        &self.graph
    }

    /// An immutable snapshot for the trust computation.
    pub fn snapshot(&self) -> ChannelGraph {
        self.graph.clone()
    }

    /// Peers with live channels.
    pub fn live_peers(&self) -> Vec<ParticipantIdentifier> {
        self.table.active_peers()
    }

    /// Mutual contacts with `target`: the intersection of our
    /// neighborhood and the target's, sorted by descending channel age
    /// with graph degree as the tiebreak.
    ///
    /// Fails with [`CallerError::InsufficientMutualContacts`] below
    /// `min_count`.
    pub fn find_mutual_contacts(
        &self,
        target: ParticipantIdentifier,
        min_count: usize,
    ) -> Result<Vec<ParticipantIdentifier>> {
        let ours = self.graph.neighbors(self.local);
        let theirs = self.graph.neighbors(target);
        let mut mutual: Vec<ParticipantIdentifier> = ours
            .intersection(&theirs)
            .copied()
            .filter(|&n| n != self.local && n != target)
            .collect();
        if mutual.len() < min_count {
            Err(CallerError::InsufficientMutualContacts)?;
        }
        mutual.sort_by(|&a, &b| {
            let age = |p| self.table.age(p).unwrap_or(0);
            age(b)
                .cmp(&age(a))
                .then_with(|| self.graph.degree(b).cmp(&self.graph.degree(a)))
                .then(a.cmp(&b))
        });
        Ok(mutual)
    }

    /// Apply a gossiped edge change. Returns true when the fact was new,
    /// in which case the caller re-forwards it to its own peers.
    pub fn apply_gossip(&mut self, edge: GossipEdge) -> bool {
        let known = self.graph.has_edge(edge.a, edge.b);
        if edge.added {
            if known {
                return false;
            }
            self.graph.add_edge(edge.a, edge.b);
            true
        } else {
            if !known {
                return false;
            }
            self.graph.remove_edge(edge.a, edge.b);
            true
        }
    }

    /// Drop dead channels, queue their peers for reintroduction, and
    /// update the graph.
    pub fn reconcile(&mut self) {
        for peer in self.table.reconcile() {
            self.graph.remove_edge(self.local, peer);
            self.reintroduce.push(peer);
        }
    }

    /// Degrade the channel to `peer` after Byzantine evidence (MAC
    /// failure or replay) and queue reintroduction.
    pub fn degrade_channel(&mut self, peer: ParticipantIdentifier) {
        warn!("{}: degrading channel to {} after bad MAC/replay", self.local, peer);
        self.close_channel(peer);
        self.reintroduce.push(peer);
    }

    /// Queue a peer for reintroduction without touching channel state —
    /// used when restoring from a checkpoint, where peers are known but
    /// channels must be re-established.
    pub fn schedule_reintroduction(&mut self, peer: ParticipantIdentifier) {
        self.reintroduce.push(peer);
    }

    /// Peers awaiting reintroduction, drained.
    pub fn take_reintroduction_queue(&mut self) -> Vec<ParticipantIdentifier> {
        std::mem::take(&mut self.reintroduce)
    }

    /// Run the graph monitor.
    pub fn check_health(&mut self) -> GraphHealth {
        self.monitor.check(&self.graph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::SimulatedChannel;
    use crate::psk;
    use crate::utils::testing::init_testing;
    use rand::Rng;

    fn pid(n: u64) -> ParticipantIdentifier {
        ParticipantIdentifier::from_u64(n)
    }

    fn psk_bytes(rng: &mut impl Rng) -> Vec<u8> {
        (0..psk::DEFAULT_PSK_LEN).map(|_| rng.gen()).collect()
    }

    fn overlay_with_peers(
        local: u64,
        peers: &[u64],
        rng: &mut rand::rngs::StdRng,
    ) -> Overlay<SimulatedChannel> {
        let mut overlay = Overlay::new(pid(local));
        for &peer in peers {
            overlay.open_channel(pid(peer), &psk_bytes(rng)).unwrap();
        }
        overlay
    }

    #[test]
    fn open_channel_tracks_table_and_graph() {
        let mut rng = init_testing();
        let overlay = overlay_with_peers(1, &[2, 3], &mut rng);
        assert_eq!(overlay.table().count(), 2);
        assert!(overlay.graph().has_edge(pid(1), pid(2)));
        assert!(overlay.channel(pid(2)).is_ok());
        assert!(overlay.channel(pid(9)).is_err());
    }

    #[test]
    fn run_index_replays_are_rejected() {
        let mut rng = init_testing();
        let mut overlay = overlay_with_peers(1, &[2], &mut rng);
        overlay.table_mut().check_and_record_run(pid(2), 3).unwrap();
        overlay.table_mut().check_and_record_run(pid(2), 3).unwrap();
        overlay.table_mut().check_and_record_run(pid(2), 4).unwrap();
        let err = overlay
            .table_mut()
            .check_and_record_run(pid(2), 2)
            .unwrap_err();
        assert_eq!(err, InternalError::RunIndexReplay(pid(2)));
    }

    #[test]
    fn mutual_contacts_sorted_by_channel_age() {
        let mut rng = init_testing();
        // Channels opened in order 2, 3, 4: 2 is oldest.
        let mut overlay = overlay_with_peers(1, &[2, 3, 4], &mut rng);
        let target = pid(9);
        for introducer in [2, 3, 4] {
            overlay.graph.add_edge(pid(introducer), target);
        }
        let mutual = overlay.find_mutual_contacts(target, 3).unwrap();
        assert_eq!(mutual, vec![pid(2), pid(3), pid(4)]);

        let err = overlay.find_mutual_contacts(target, 4).unwrap_err();
        assert_eq!(
            err.caller_error(),
            Some(CallerError::InsufficientMutualContacts)
        );
    }

    #[test]
    fn untouched_channels_turn_idle_and_traffic_wakes_them() {
        let mut rng = init_testing();
        let mut overlay = overlay_with_peers(1, &[2, 3], &mut rng);
        // Traffic on 3 only; 2 goes idle.
        for _ in 0..8 {
            overlay.table_mut().touch(pid(3));
        }
        let idled = overlay.table_mut().mark_idle(4);
        assert_eq!(idled, vec![pid(2)]);
        assert_eq!(
            overlay.channel(pid(2)).unwrap().status(),
            ChannelStatus::Idle
        );
        assert_eq!(
            overlay.channel(pid(3)).unwrap().status(),
            ChannelStatus::Active
        );

        // Fresh traffic promotes the channel back.
        overlay.table_mut().touch(pid(2));
        assert_eq!(
            overlay.channel(pid(2)).unwrap().status(),
            ChannelStatus::Active
        );
        assert!(overlay.table_mut().mark_idle(4).is_empty());
    }

    #[test]
    fn gossip_application_reports_novelty() {
        let mut rng = init_testing();
        let mut overlay = overlay_with_peers(1, &[2], &mut rng);
        let edge = GossipEdge {
            a: pid(7),
            b: pid(8),
            added: true,
        };
        assert!(overlay.apply_gossip(edge));
        assert!(!overlay.apply_gossip(edge));
        assert!(overlay.graph().has_edge(pid(7), pid(8)));

        let removal = GossipEdge {
            a: pid(7),
            b: pid(8),
            added: false,
        };
        assert!(overlay.apply_gossip(removal));
        assert!(!overlay.graph().has_edge(pid(7), pid(8)));
    }

    #[test]
    fn gossip_edges_round_trip_the_wire() {
        let edge = GossipEdge {
            a: pid(3),
            b: pid(11),
            added: true,
        };
        assert_eq!(GossipEdge::decode(&edge.encode()).unwrap(), edge);
    }

    #[test]
    fn reconcile_queues_dead_peers_for_reintroduction() {
        let mut rng = init_testing();
        let mut overlay = overlay_with_peers(1, &[2, 3], &mut rng);
        overlay.channel_mut(pid(2)).unwrap().close();
        overlay.reconcile();
        assert!(overlay.channel(pid(2)).is_err());
        assert!(!overlay.graph().has_edge(pid(1), pid(2)));
        assert_eq!(overlay.take_reintroduction_queue(), vec![pid(2)]);
        assert!(overlay.take_reintroduction_queue().is_empty());
    }

    #[test]
    fn monitor_detects_disconnection_and_removals() {
        let mut graph = ChannelGraph::default();
        graph.add_edge(pid(1), pid(2));
        graph.add_edge(pid(2), pid(3));
        let mut monitor = GraphMonitor::default();

        let health = monitor.check(&graph);
        assert!(health.connected);
        assert!(health.removed_edges.is_empty());
        assert_eq!(health.min_degree, 1);

        graph.remove_edge(pid(2), pid(3));
        let health = monitor.check(&graph);
        assert!(!health.connected);
        assert_eq!(health.removed_edges, vec![(pid(2), pid(3))]);
    }

    #[test]
    fn target_degree_grows_logarithmically() {
        assert_eq!(GraphMonitor::target_degree(1), 0);
        assert_eq!(GraphMonitor::target_degree(2), 3);
        assert_eq!(GraphMonitor::target_degree(16), 5);
        assert_eq!(GraphMonitor::target_degree(1024), 11);
    }
}
