//! Participant identities, session identifiers, and shared protocol
//! context.
//!
//! A [`ParticipantIdentifier`] doubles as the node's x-coordinate in every
//! polynomial protocol: identifiers are distinct nonzero elements of
//! GF(M61), conventionally 1, 2, 3, …

// Copyright (c) Facebook, Inc. and its affiliates.
// Modifications Copyright (c) 2022-2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

use crate::{
    errors::{CallerError, Result},
    gf61,
};
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashSet,
    fmt::{Display, Formatter},
};

/// The kinds of protocols a participant can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolType {
    /// Distributed key generation (one epoch's signing polynomial).
    Dkg,
    /// Peer introduction (new channel synthesis).
    Intro,
    /// Threshold signing.
    Sign,
}

/// A unique identifier for a single protocol session.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Identifier(u64);

impl Identifier {
    /// Sample a fresh session identifier.
    pub fn random<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        Self(rng.next_u64())
    }

    /// Construct from a known value (tests, deterministic replay).
    pub fn from_u64(value: u64) -> Self {
        Self(value)
    }

    /// The raw value, for wire encoding.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Display for Identifier {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "session {:016x}", self.0)
    }
}

/// The identity of a protocol participant: a nonzero element of GF(M61)
/// that also serves as the node's polynomial x-coordinate.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct ParticipantIdentifier(u64);

impl ParticipantIdentifier {
    /// Construct an identifier from a field element.
    ///
    /// Fails with [`CallerError::InvalidParams`] when the value is zero or
    /// not a field element — zero would place the node's share at the
    /// secret itself.
    pub fn new(value: u64) -> Result<Self> {
        if value == 0 || value >= gf61::M61 {
            Err(CallerError::InvalidParams)?;
        }
        Ok(Self(value))
    }

    /// Construct from a small index, 1-based by convention.
    ///
    /// Panics on zero; intended for static committee setups and tests
    /// where the value is a literal.
    pub fn from_u64(value: u64) -> Self {
        Self::new(value).expect("participant identifier must be a nonzero field element")
    }

    /// Sample a random identifier.
    pub fn random<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        Self(gf61::rand_nonzero(rng))
    }

    /// The node's x-coordinate in GF(M61).
    pub fn as_coordinate(&self) -> u64 {
        self.0
    }
}

impl Display for ParticipantIdentifier {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "node {}", self.0)
    }
}

/// The static configuration of a protocol run: our identity plus the other
/// participants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantConfig {
    id: ParticipantIdentifier,
    other_ids: Vec<ParticipantIdentifier>,
}

impl ParticipantConfig {
    /// Build a config. All identifiers must be distinct.
    pub fn new(id: ParticipantIdentifier, other_ids: &[ParticipantIdentifier]) -> Result<Self> {
        let mut seen = HashSet::with_capacity(other_ids.len() + 1);
        seen.insert(id);
        for other in other_ids {
            if !seen.insert(*other) {
                Err(CallerError::BadInput)?;
            }
        }
        Ok(Self {
            id,
            other_ids: other_ids.to_vec(),
        })
    }

    /// Our identifier.
    pub fn id(&self) -> ParticipantIdentifier {
        self.id
    }

    /// The other participants.
    pub fn other_ids(&self) -> &[ParticipantIdentifier] {
        &self.other_ids
    }

    /// Every participant, ourselves included.
    pub fn all_participants(&self) -> Vec<ParticipantIdentifier> {
        let mut all = self.other_ids.clone();
        all.push(self.id);
        all
    }

    /// Total participant count.
    pub fn count(&self) -> usize {
        self.other_ids.len() + 1
    }

    /// Build one config per member of a fresh quorum with consecutive
    /// identifiers 1..=size. Test and simulation setup helper.
    pub fn consecutive_quorum(size: usize) -> Result<Vec<Self>> {
        let ids: Vec<ParticipantIdentifier> =
            (1..=size as u64).map(ParticipantIdentifier::from_u64).collect();
        ids.iter()
            .map(|id| {
                let others: Vec<_> = ids.iter().filter(|o| *o != id).copied().collect();
                Self::new(*id, &others)
            })
            .collect()
    }

    /// Build one config per member of a quorum with random identifiers.
    pub fn random_quorum<R: RngCore + CryptoRng>(size: usize, rng: &mut R) -> Result<Vec<Self>> {
        let mut ids = HashSet::with_capacity(size);
        while ids.len() < size {
            ids.insert(ParticipantIdentifier::random(rng));
        }
        let ids: Vec<_> = ids.into_iter().collect();
        ids.iter()
            .map(|id| {
                let others: Vec<_> = ids.iter().filter(|o| *o != id).copied().collect();
                Self::new(*id, &others)
            })
            .collect()
    }
}

/// Context shared by all participants of a protocol run. Binds the session,
/// the sorted committee, and the protocol kind; used to validate that
/// incoming protocol messages belong to the run they claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedContext {
    sid: Identifier,
    protocol: ProtocolType,
    participants: Vec<ParticipantIdentifier>,
}

impl SharedContext {
    /// Gather the context of a participant.
    pub fn collect<P: crate::participant::ProtocolParticipant>(p: &P) -> Self {
        let mut participants = p.all_participants();
        participants.sort();
        Self {
            sid: p.sid(),
            protocol: P::protocol_type(),
            participants,
        }
    }

    /// The session this context describes.
    pub fn sid(&self) -> Identifier {
        self.sid
    }

    /// True when `id` is a member of the run.
    pub fn is_participant(&self, id: ParticipantIdentifier) -> bool {
        self.participants.binary_search(&id).is_ok()
    }

    /// The sorted committee.
    pub fn participants(&self) -> &[ParticipantIdentifier] {
        &self.participants
    }
}
