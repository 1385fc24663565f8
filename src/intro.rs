//! Peer introduction: channel synthesis without topology.
//!
//! To open a channel between A and C, m ≥ 3 mutual contacts each sample a
//! uniform 256-bit component and send it — over their existing
//! MAC-authenticated channels — to both endpoints. A and C XOR all
//! components and expand the result into the new channel's PSK. A single
//! honest introducer keeps the PSK uniform from the adversary's view; no
//! component ever travels in the clear.

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
    utils::{put_id_list, put_prefixed, put_u64, take_id_list, ParseBytes},
};
use rand::{CryptoRng, Rng, RngCore};
use std::collections::{BTreeSet, HashMap};
use tracing::info;
use zeroize::Zeroizing;

/// Minimum number of introducers for a synthesized channel.
pub const MIN_INTRODUCERS: usize = 3;

/// XOR-combine introducer components into the shared seed.
///
/// Fails with [`CallerError::InvalidInput`] on an empty set or
/// mismatched component lengths.
pub fn combine_components(components: &[Zeroizing<Vec<u8>>]) -> Result<Zeroizing<Vec<u8>>> {
    let first = components.first().ok_or(CallerError::InvalidInput)?;
    let mut combined = Zeroizing::new(vec![0u8; first.len()]);
    for component in components {
        if component.len() != combined.len() {
            Err(CallerError::InvalidInput)?;
        }
        for (out, byte) in combined.iter_mut().zip(component.iter()) {
            *out ^= byte;
        }
    }
    Ok(combined)
}

/// Sample one introducer's uniform component.
pub fn sample_component<R: RngCore + CryptoRng>(rng: &mut R) -> Zeroizing<Vec<u8>> {
    let mut component = Zeroizing::new(vec![0u8; SECRET_LEN]);
    rng.fill(component.as_mut_slice());
    component
}

/// Ask an introducer to contribute a component for a channel to
/// `target`, naming the full introducer set so both endpoints can tell
/// when their sessions complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RequestPayload {
    pub target: ParticipantIdentifier,
    pub introducers: Vec<ParticipantIdentifier>,
}

impl RequestPayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16 + 8 * self.introducers.len());
        put_u64(&mut out, self.target.as_coordinate());
        put_id_list(&mut out, &self.introducers);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut parser = ParseBytes::new(bytes.to_vec());
        let target = ParticipantIdentifier::new(parser.take_u64()?)
            .map_err(|_| CallerError::DeserializationFailed)?;
        let introducers = take_id_list(&mut parser)?;
        if !parser.is_exhausted() {
            Err(CallerError::DeserializationFailed)?;
        }
        Ok(Self {
            target,
            introducers,
        })
    }
}

/// One introducer's component for the (initiator, target) pair, sent to
/// both endpoints together with the introducer set it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ComponentPayload {
    pub initiator: ParticipantIdentifier,
    pub target: ParticipantIdentifier,
    pub introducers: Vec<ParticipantIdentifier>,
    pub component: Vec<u8>,
}

impl ComponentPayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(32 + 8 * self.introducers.len() + self.component.len());
        put_u64(&mut out, self.initiator.as_coordinate());
        put_u64(&mut out, self.target.as_coordinate());
        put_id_list(&mut out, &self.introducers);
        put_prefixed(&mut out, &self.component);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut parser = ParseBytes::new(bytes.to_vec());
        let initiator = ParticipantIdentifier::new(parser.take_u64()?)
            .map_err(|_| CallerError::DeserializationFailed)?;
        let target = ParticipantIdentifier::new(parser.take_u64()?)
            .map_err(|_| CallerError::DeserializationFailed)?;
        let introducers = take_id_list(&mut parser)?;
        let component = parser.take_prefixed()?;
        if component.len() != SECRET_LEN || !parser.is_exhausted() {
            Err(CallerError::DeserializationFailed)?;
        }
        Ok(Self {
            initiator,
            target,
            introducers,
            component,
        })
    }
}

/// Confirmation that the synthesized channel opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct AckPayload {
    pub target: ParticipantIdentifier,
}

impl AckPayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8);
        put_u64(&mut out, self.target.as_coordinate());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut parser = ParseBytes::new(bytes.to_vec());
        let target = ParticipantIdentifier::new(parser.take_u64()?)
            .map_err(|_| CallerError::DeserializationFailed)?;
        if !parser.is_exhausted() {
            Err(CallerError::DeserializationFailed)?;
        }
        Ok(Self { target })
    }
}

/// One endpoint's view of an in-flight introduction: the expected
/// introducer set and the components collected so far. Dropping the
/// session discards the partial components safely.
#[derive(Debug)]
pub struct IntroSession {
    initiator: ParticipantIdentifier,
    target: ParticipantIdentifier,
    introducers: BTreeSet<ParticipantIdentifier>,
    components: HashMap<ParticipantIdentifier, Zeroizing<Vec<u8>>>,
}

impl IntroSession {
    /// Track an introduction between `initiator` and `target` through the
    /// given introducers.
    ///
    /// Fails with [`CallerError::NoIntroducers`] when fewer than
    /// [`MIN_INTRODUCERS`] distinct introducers are supplied.
    pub fn new(
        initiator: ParticipantIdentifier,
        target: ParticipantIdentifier,
        introducers: &[ParticipantIdentifier],
    ) -> Result<Self> {
        let introducers: BTreeSet<ParticipantIdentifier> = introducers.iter().copied().collect();
        if introducers.len() < MIN_INTRODUCERS {
            Err(CallerError::NoIntroducers)?;
        }
        if introducers.contains(&initiator) || introducers.contains(&target) {
            Err(CallerError::InvalidInput)?;
        }
        Ok(Self {
            initiator,
            target,
            introducers,
            components: HashMap::new(),
        })
    }

    /// The endpoint this session converges on.
    pub fn target(&self) -> ParticipantIdentifier {
        self.target
    }

    /// The initiating endpoint.
    pub fn initiator(&self) -> ParticipantIdentifier {
        self.initiator
    }

    /// The expected introducers.
    pub fn introducers(&self) -> impl Iterator<Item = ParticipantIdentifier> + '_ {
        self.introducers.iter().copied()
    }

    /// Record one introducer's component. Returns the expanded PSK once
    /// the final expected component arrives.
    ///
    /// A component from an unexpected party, or a second component from
    /// the same introducer, fails with [`CallerError::BadInput`].
    pub fn add_component(
        &mut self,
        from: ParticipantIdentifier,
        component: Vec<u8>,
    ) -> Result<Option<Zeroizing<Vec<u8>>>> {
        if !self.introducers.contains(&from) || self.components.contains_key(&from) {
            Err(CallerError::BadInput)?;
        }
        let _ = self.components.insert(from, Zeroizing::new(component));
        if self.components.len() < self.introducers.len() {
            return Ok(None);
        }

        // All components in: XOR in deterministic introducer order so both
        // endpoints agree, then expand to full PSK length.
        let ordered: Vec<Zeroizing<Vec<u8>>> = self
            .introducers
            .iter()
            .map(|introducer| self.components[introducer].clone())
            .collect();
        let seed = combine_components(&ordered)?;
        info!(
            "introduction {} ↔ {} complete with {} components",
            self.initiator,
            self.target,
            ordered.len()
        );
        Ok(Some(Zeroizing::new(expand_psk(&seed, DEFAULT_PSK_LEN))))
    }
}
