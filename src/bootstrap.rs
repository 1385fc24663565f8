//! Multi-path bootstrap for a node with no existing channels.
//!
//! The only phase where network topology matters. A joiner picks a
//! route-diverse candidate set, generates one 256-bit secret per target,
//! and ships each secret across `k` distinct routes as Shamir shares with
//! threshold `tau = k − ⌊k/3⌋`. The receiving side discards corrupt
//! shares by consistency check, reconstructs, and both ends expand the
//! secret into the channel PSK. One unobserved route per peer pair keeps
//! that PSK perfectly secret; up to ⌊k/3⌋ corrupting relays are survived.

// Copyright (c) Facebook, Inc. and its affiliates.
// Modifications Copyright (c) 2022-2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

use crate::{
    errors::{CallerError, Result},
    protocol::ParticipantIdentifier,
    psk::{expand_psk, DEFAULT_PSK_LEN, SECRET_LEN},
    shamir::{self, ShamirShare},
};
use rand::{CryptoRng, Rng, RngCore};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{info, warn};
use zeroize::Zeroizing;

/// Bytes carried per Shamir chunk: 7 bytes keeps every chunk a field
/// element and the encoding injective.
const CHUNK_BYTES: usize = 7;

/// Chunks needed to carry one 256-bit secret.
const CHUNKS: usize = SECRET_LEN.div_ceil(CHUNK_BYTES);

/// Public metadata about a bootstrap candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    /// The candidate's identity.
    pub id: ParticipantIdentifier,
    /// Coarse route/jurisdiction label used by diversity selection.
    pub region: String,
}

/// The default share threshold for `k` routes: `k − ⌊k/3⌋`.
pub fn default_threshold(k: usize) -> usize {
    k - k / 3
}

/// Pick `k` candidates maximizing region diversity, round-robin across
/// regions in first-seen order.
pub fn select_diverse(candidates: &[PeerInfo], k: usize) -> Result<Vec<PeerInfo>> {
    if candidates.len() < k || k == 0 {
        Err(CallerError::InvalidInput)?;
    }
    let mut by_region: Vec<(String, Vec<&PeerInfo>)> = Vec::new();
    for candidate in candidates {
        match by_region.iter_mut().find(|(r, _)| *r == candidate.region) {
            Some((_, list)) => list.push(candidate),
            None => by_region.push((candidate.region.clone(), vec![candidate])),
        }
    }
    let mut selected = Vec::with_capacity(k);
    let mut round = 0;
    while selected.len() < k {
        let mut advanced = false;
        for (_, list) in &by_region {
            if selected.len() == k {
                break;
            }
            if let Some(candidate) = list.get(round) {
                selected.push((*candidate).clone());
                advanced = true;
            }
        }
        if !advanced {
            // Fewer distinct peers than requested; cannot happen given the
            // length check above.
            Err(CallerError::InvalidInput)?;
        }
        round += 1;
    }
    Ok(selected)
}

/// The shares of one secret traveling over one route: the same share
/// coordinate across every chunk of the secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteShare {
    /// The route's share coordinate (1-based route number).
    pub route: u64,
    /// One share per secret chunk, all at coordinate `route`.
    pub chunks: Vec<ShamirShare>,
}

/// Encodes bootstrap secrets into per-route Shamir shares and decodes
/// them back, excluding corrupt relays.
#[derive(Debug, Clone, Copy)]
pub struct ShamirEncoder {
    routes: usize,
    threshold: usize,
}

impl ShamirEncoder {
    /// An encoder for `routes` routes with reconstruction threshold
    /// `threshold`.
    pub fn new(routes: usize, threshold: usize) -> Result<Self> {
        if threshold < 1 || routes < threshold {
            Err(CallerError::InvalidParams)?;
        }
        Ok(Self { routes, threshold })
    }

    /// Split a 256-bit secret into one [`RouteShare`] per route.
    pub fn encode<R: RngCore + CryptoRng>(
        &self,
        secret: &[u8; SECRET_LEN],
        rng: &mut R,
    ) -> Result<Vec<RouteShare>> {
        let mut per_chunk: Vec<Vec<ShamirShare>> = Vec::with_capacity(CHUNKS);
        for chunk in secret.chunks(CHUNK_BYTES) {
            let mut word = [0u8; 8];
            word[..chunk.len()].copy_from_slice(chunk);
            per_chunk.push(shamir::split(
                u64::from_le_bytes(word),
                self.threshold,
                self.routes,
                rng,
            )?);
        }

        Ok((0..self.routes)
            .map(|route_idx| RouteShare {
                route: route_idx as u64 + 1,
                chunks: per_chunk.iter().map(|shares| shares[route_idx]).collect(),
            })
            .collect())
    }

    /// Identify corrupt routes by per-chunk consistency checks.
    pub fn detect_corrupt(&self, shares: &[RouteShare]) -> Result<Vec<u64>> {
        let mut corrupt = Vec::new();
        for chunk_idx in 0..CHUNKS {
            let chunk_shares: Vec<ShamirShare> = shares
                .iter()
                .map(|route| {
                    route
                        .chunks
                        .get(chunk_idx)
                        .copied()
                        .ok_or(CallerError::InvalidInput.into())
                })
                .collect::<Result<_>>()?;
            let (_, bad) = shamir::consistency_check(&chunk_shares, self.threshold)?;
            for share in bad {
                if !corrupt.contains(&share.x) {
                    corrupt.push(share.x);
                }
            }
        }
        corrupt.sort_unstable();
        Ok(corrupt)
    }

    /// Reconstruct the secret from route shares, discarding corrupt
    /// routes first.
    pub fn decode(&self, shares: &[RouteShare]) -> Result<[u8; SECRET_LEN]> {
        let corrupt = self.detect_corrupt(shares)?;
        if !corrupt.is_empty() {
            warn!("bootstrap: excluding corrupt relays on routes {corrupt:?}");
        }
        let clean: Vec<&RouteShare> = shares
            .iter()
            .filter(|route| !corrupt.contains(&route.route))
            .collect();
        if clean.len() < self.threshold {
            Err(CallerError::InsufficientShares)?;
        }

        let mut secret = [0u8; SECRET_LEN];
        for (chunk_idx, out) in secret.chunks_mut(CHUNK_BYTES).enumerate() {
            let chunk_shares: Vec<ShamirShare> =
                clean.iter().map(|route| route.chunks[chunk_idx]).collect();
            let value = shamir::reconstruct_with_threshold(&chunk_shares, self.threshold)?;
            let bytes = value.to_le_bytes();
            out.copy_from_slice(&bytes[..out.len()]);
        }
        Ok(secret)
    }
}

/// Adversary model for bootstrap routes: passive observation and active
/// share corruption, per (target, route).
pub trait RouteAdversary {
    /// Whether the adversary observes this route's share in transit.
    fn observes(&mut self, target: ParticipantIdentifier, route: u64) -> bool;

    /// Optionally corrupt the share in transit. Returns true when the
    /// share was modified.
    fn corrupt(&mut self, target: ParticipantIdentifier, share: &mut RouteShare) -> bool;
}

/// The benign network: sees nothing, changes nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassiveNetwork;

impl RouteAdversary for PassiveNetwork {
    fn observes(&mut self, _target: ParticipantIdentifier, _route: u64) -> bool {
        false
    }

    fn corrupt(&mut self, _target: ParticipantIdentifier, _share: &mut RouteShare) -> bool {
        false
    }
}

/// Outcome of one bootstrap attempt.
#[derive(Debug)]
pub struct BootstrapReport {
    /// Derived PSK per successfully-bootstrapped target.
    pub psks: HashMap<ParticipantIdentifier, Zeroizing<Vec<u8>>>,
    /// Targets whose secret the adversary could reconstruct.
    pub observed: usize,
    /// Shares modified in transit (and caught by the receivers).
    pub corrupted: usize,
    /// Targets with an adversary-free reconstruction.
    pub clean: usize,
}

/// Coordinates k-route secret establishment towards a set of targets.
#[derive(Debug, Clone, Copy)]
pub struct MultiPathBootstrap {
    routes: usize,
    threshold: usize,
}

impl MultiPathBootstrap {
    /// A bootstrap using `routes` routes per target and the default
    /// threshold.
    pub fn new(routes: usize) -> Result<Self> {
        Self::with_threshold(routes, default_threshold(routes))
    }

    /// A bootstrap with an explicit share threshold.
    pub fn with_threshold(routes: usize, threshold: usize) -> Result<Self> {
        let _ = ShamirEncoder::new(routes, threshold)?;
        Ok(Self { routes, threshold })
    }

    /// Run the protocol against every target, under the given route
    /// adversary.
    ///
    /// Fails with [`CallerError::NoCleanPath`] when no target ends up
    /// with an adversary-free PSK; the caller should retry from a
    /// different network context.
    pub fn bootstrap<R: RngCore + CryptoRng>(
        &self,
        targets: &[PeerInfo],
        adversary: &mut dyn RouteAdversary,
        rng: &mut R,
    ) -> Result<BootstrapReport> {
        let encoder = ShamirEncoder::new(self.routes, self.threshold)?;
        let mut report = BootstrapReport {
            psks: HashMap::new(),
            observed: 0,
            corrupted: 0,
            clean: 0,
        };

        for target in targets {
            let secret = {
                let mut secret = Zeroizing::new([0u8; SECRET_LEN]);
                rng.fill(secret.as_mut_slice());
                secret
            };
            let mut routes = encoder.encode(&secret, rng)?;

            let mut observed_routes = 0;
            for share in &mut routes {
                if adversary.observes(target.id, share.route) {
                    observed_routes += 1;
                }
                if adversary.corrupt(target.id, share) {
                    report.corrupted += 1;
                }
            }

            // Receiver side: exclude corrupt relays, reconstruct, expand.
            match encoder.decode(&routes) {
                Ok(reconstructed) => {
                    if reconstructed != *secret {
                        // Detection failed under heavier corruption than
                        // the relay bound admits; drop the target.
                        warn!("bootstrap: reconstruction mismatch for {}", target.id);
                        continue;
                    }
                    let compromised = observed_routes >= self.threshold;
                    if compromised {
                        report.observed += 1;
                    } else {
                        report.clean += 1;
                    }
                    let _ = report.psks.insert(
                        target.id,
                        Zeroizing::new(expand_psk(secret.as_slice(), DEFAULT_PSK_LEN)),
                    );
                }
                Err(_) => {
                    warn!("bootstrap: could not reconstruct secret for {}", target.id);
                }
            }
        }

        if report.clean == 0 {
            Err(CallerError::NoCleanPath)?;
        }
        info!(
            "bootstrap: {} PSKs derived, {} clean, {} observed",
            report.psks.len(),
            report.clean,
            report.observed
        );
        Ok(report)
    }
}

/// Bootstrap spread over several sessions from different network
/// contexts; each session adds channels, and temporal diversity makes a
/// persistent global observer ever less likely.
#[derive(Debug)]
pub struct TemporalBootstrap {
    per_session: MultiPathBootstrap,
    sessions: usize,
    psks: HashMap<ParticipantIdentifier, Zeroizing<Vec<u8>>>,
}

impl TemporalBootstrap {
    /// A temporal bootstrap using `routes` routes per target per session.
    pub fn new(routes: usize) -> Result<Self> {
        Ok(Self {
            per_session: MultiPathBootstrap::new(routes)?,
            sessions: 0,
            psks: HashMap::new(),
        })
    }

    /// Run one session, accumulating PSKs.
    pub fn run_session<R: RngCore + CryptoRng>(
        &mut self,
        targets: &[PeerInfo],
        adversary: &mut dyn RouteAdversary,
        rng: &mut R,
    ) -> Result<BootstrapReport> {
        let report = self.per_session.bootstrap(targets, adversary, rng)?;
        for (target, psk) in &report.psks {
            let _ = self.psks.insert(*target, psk.clone());
        }
        self.sessions += 1;
        Ok(report)
    }

    /// Sessions run so far.
    pub fn sessions(&self) -> usize {
        self.sessions
    }

    /// All PSKs accumulated across sessions.
    pub fn psks(&self) -> &HashMap<ParticipantIdentifier, Zeroizing<Vec<u8>>> {
        &self.psks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{KeyChannel, SimulatedChannel};
    use crate::utils::testing::init_testing;

    fn pid(n: u64) -> ParticipantIdentifier {
        ParticipantIdentifier::from_u64(n)
    }

    fn peers(ids: &[u64], region: &str) -> Vec<PeerInfo> {
        ids.iter()
            .map(|&id| PeerInfo {
                id: pid(id),
                region: region.into(),
            })
            .collect()
    }

    #[test]
    fn route_shares_round_trip() {
        let mut rng = init_testing();
        let encoder = ShamirEncoder::new(6, 4).unwrap();
        let mut secret = [0u8; SECRET_LEN];
        rng.fill(&mut secret[..]);

        let routes = encoder.encode(&secret, &mut rng).unwrap();
        assert_eq!(routes.len(), 6);
        assert_eq!(encoder.decode(&routes).unwrap(), secret);
        // Any threshold-sized subset reconstructs too.
        assert_eq!(encoder.decode(&routes[..4]).unwrap(), secret);
    }

    #[test]
    fn corrupt_relay_is_excluded() {
        let mut rng = init_testing();
        let encoder = ShamirEncoder::new(6, 4).unwrap();
        let mut secret = [0u8; SECRET_LEN];
        rng.fill(&mut secret[..]);

        let mut routes = encoder.encode(&secret, &mut rng).unwrap();
        routes[2].chunks[0].y ^= 1;
        routes[2].chunks[3].y ^= 1;

        assert_eq!(encoder.detect_corrupt(&routes).unwrap(), vec![3]);
        assert_eq!(encoder.decode(&routes).unwrap(), secret);
    }

    #[test]
    fn both_ends_derive_the_same_working_psk() {
        let mut rng = init_testing();
        let targets = peers(&[7], "eu");
        let report = MultiPathBootstrap::new(6)
            .unwrap()
            .bootstrap(&targets, &mut PassiveNetwork, &mut rng)
            .unwrap();
        assert_eq!(report.clean, 1);

        // Open a channel pair from the shared PSK, MAC both ways.
        let psk = &report.psks[&pid(7)];
        let a = SimulatedChannel::open(pid(1), pid(7), psk).unwrap();
        let b = SimulatedChannel::open(pid(7), pid(1), psk).unwrap();
        let tag = a.mac(b"hello", 0).unwrap();
        assert!(b.verify_mac(b"hello", tag, 0).unwrap());
    }

    struct CorruptingRelay {
        route: u64,
    }
    impl RouteAdversary for CorruptingRelay {
        fn observes(&mut self, _t: ParticipantIdentifier, _r: u64) -> bool {
            false
        }
        fn corrupt(&mut self, _t: ParticipantIdentifier, share: &mut RouteShare) -> bool {
            if share.route == self.route {
                share.chunks[0].y ^= 0xff;
                return true;
            }
            false
        }
    }

    #[test]
    fn active_relay_corruption_is_survived() {
        let mut rng = init_testing();
        let targets = peers(&[3, 4], "us");
        let mut adversary = CorruptingRelay { route: 2 };
        let report = MultiPathBootstrap::new(6)
            .unwrap()
            .bootstrap(&targets, &mut adversary, &mut rng)
            .unwrap();
        assert_eq!(report.corrupted, 2);
        assert_eq!(report.psks.len(), 2);
        assert_eq!(report.clean, 2);
    }

    struct GlobalObserver;
    impl RouteAdversary for GlobalObserver {
        fn observes(&mut self, _t: ParticipantIdentifier, _r: u64) -> bool {
            true
        }
        fn corrupt(&mut self, _t: ParticipantIdentifier, _s: &mut RouteShare) -> bool {
            false
        }
    }

    #[test]
    fn global_observation_yields_no_clean_path() {
        let mut rng = init_testing();
        let targets = peers(&[3], "us");
        let err = MultiPathBootstrap::new(6)
            .unwrap()
            .bootstrap(&targets, &mut GlobalObserver, &mut rng)
            .unwrap_err();
        assert_eq!(err.caller_error(), Some(CallerError::NoCleanPath));
    }

    #[test]
    fn temporal_sessions_accumulate_channels() {
        let mut rng = init_testing();
        let mut temporal = TemporalBootstrap::new(5).unwrap();
        temporal
            .run_session(&peers(&[2, 3], "eu"), &mut PassiveNetwork, &mut rng)
            .unwrap();
        temporal
            .run_session(&peers(&[4], "ap"), &mut PassiveNetwork, &mut rng)
            .unwrap();
        assert_eq!(temporal.sessions(), 2);
        assert_eq!(temporal.psks().len(), 3);
    }

    #[test]
    fn diversity_selection_spreads_regions() {
        let mut candidates = peers(&[1, 2, 3], "us");
        candidates.extend(peers(&[4, 5], "eu"));
        candidates.extend(peers(&[6], "ap"));

        let selected = select_diverse(&candidates, 3).unwrap();
        let regions: Vec<&str> = selected.iter().map(|p| p.region.as_str()).collect();
        assert_eq!(regions, vec!["us", "eu", "ap"]);

        let selected = select_diverse(&candidates, 5).unwrap();
        assert_eq!(selected.len(), 5);
        // Round two pulls the second peer of each populated region.
        assert_eq!(selected[3].id, pid(2));
        assert_eq!(selected[4].id, pid(5));

        assert!(select_diverse(&candidates, 7).is_err());
    }
}
