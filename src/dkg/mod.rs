//! Distributed key generation for the epoch signing polynomial.
//!
//! Each committee member samples a private degree-(k−1) polynomial and
//! distributes evaluations over MAC-authenticated channels. Members
//! cross-forward the values they hold so every observer can check each
//! contributor's shares against a single low-degree polynomial; suspects
//! are aggregated by complaint broadcast, contributors with more than t
//! complaints are excluded, and each survivor's signing share is the sum
//! of the non-excluded evaluations at its coordinate. The combined
//! polynomial F = Σ f_i exists only as those shares.
//!
//! # High-level protocol description
//! The run proceeds in three message rounds after the local Ready
//! trigger:
//! - Round one (`Share`): contributor i sends node j the evaluation
//!   `f_i(j)` together with `f_i` evaluated at j's public verification
//!   arguments.
//! - Round two (`CrossVerify`): once a node holds shares from everyone,
//!   it forwards every point it holds to every other node. A node that
//!   then holds ≥ d+2 points of some contributor checks them for
//!   degree-d consistency; a contributor whose points cannot be explained
//!   by any single polynomial that also matches our directly-received
//!   share is suspected.
//! - Round three (`Complaint`): suspect sets are broadcast; a contributor
//!   with more than t = ⌊(n−1)/3⌋ complaints is excluded. Survivors sum
//!   the remaining evaluations into their signing share and their
//!   verification points.
//!
//! A timed-out peer is marked absent via
//! [`DkgParticipant::note_timeout`], which shrinks the barriers and adds
//! the absentee to the local suspect set, as if an empty complaint had
//! arrived from everyone else about them.
//!
//! Single-round cross-verification assumes honest min-degree above the
//! polynomial degree (the committee is a full mesh of channels). On a
//! sparser overlay, run the complaint round through the node layer's
//! epidemic gossip so every complaint reaches all honest members within
//! an O(n) round bound before exclusion is tallied.

// Copyright (c) Facebook, Inc. and its affiliates.
// Modifications Copyright (c) 2022-2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

mod contribution;
mod output;
mod participant;

pub use contribution::PolynomialContribution;
pub use output::Output;
pub use participant::{DkgParticipant, Input};

use crate::{
    errors::{CallerError, Result},
    gf61::M61,
    protocol::ParticipantIdentifier,
    utils::{put_u64, ParseBytes},
};

/// The public verification arguments owned by `verifier` within a
/// committee.
///
/// Arguments are deterministic from the sorted committee and disjoint
/// across verifiers: the verifier at sorted position `idx` owns the d+1
/// consecutive arguments starting at `max_id + 2 + idx·(d+1)`. The block
/// never collides with a node coordinate, so verification points are
/// never signing shares.
pub fn verification_arguments(
    committee: &[ParticipantIdentifier],
    degree: usize,
    verifier: ParticipantIdentifier,
) -> Result<Vec<u64>> {
    let mut sorted = committee.to_vec();
    sorted.sort();
    let idx = sorted
        .binary_search(&verifier)
        .map_err(|_| CallerError::InvalidCommittee)?;
    let max_id = sorted
        .last()
        .expect("committee is nonempty")
        .as_coordinate();
    let per_verifier = degree as u64 + 1;
    let base = max_id + 2 + idx as u64 * per_verifier;
    if base + per_verifier >= M61 {
        Err(CallerError::InvalidParams)?;
    }
    Ok((base..base + per_verifier).collect())
}

/// Round-one payload: the recipient's share of the sender's polynomial,
/// plus the sender's polynomial evaluated at the recipient's verification
/// arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SharePayload {
    pub share: u64,
    pub verification_evals: Vec<u64>,
}

impl SharePayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16 + 8 * self.verification_evals.len());
        put_u64(&mut out, self.share);
        put_u64(&mut out, self.verification_evals.len() as u64);
        for &eval in &self.verification_evals {
            put_u64(&mut out, eval);
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut parser = ParseBytes::new(bytes.to_vec());
        let share = parser.take_u64()?;
        let count = parser.take_len()?;
        let mut verification_evals = Vec::with_capacity(count);
        for _ in 0..count {
            verification_evals.push(parser.take_u64()?);
        }
        if !parser.is_exhausted() {
            Err(CallerError::DeserializationFailed)?;
        }
        Ok(Self {
            share,
            verification_evals,
        })
    }
}

/// Round-two payload: one forwarded evaluation,
/// `(contributor, holder, f_contributor(holder))`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CrossPayload {
    pub contributor: ParticipantIdentifier,
    pub holder: ParticipantIdentifier,
    pub value: u64,
}

impl CrossPayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(24);
        put_u64(&mut out, self.contributor.as_coordinate());
        put_u64(&mut out, self.holder.as_coordinate());
        put_u64(&mut out, self.value);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut parser = ParseBytes::new(bytes.to_vec());
        let contributor = ParticipantIdentifier::new(parser.take_u64()?)
            .map_err(|_| CallerError::DeserializationFailed)?;
        let holder = ParticipantIdentifier::new(parser.take_u64()?)
            .map_err(|_| CallerError::DeserializationFailed)?;
        let value = parser.take_u64()?;
        if !parser.is_exhausted() {
            Err(CallerError::DeserializationFailed)?;
        }
        Ok(Self {
            contributor,
            holder,
            value,
        })
    }
}

/// Round-three payload: the sender's suspect set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ComplaintPayload {
    pub suspects: Vec<ParticipantIdentifier>,
}

impl ComplaintPayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + 8 * self.suspects.len());
        put_u64(&mut out, self.suspects.len() as u64);
        for suspect in &self.suspects {
            put_u64(&mut out, suspect.as_coordinate());
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut parser = ParseBytes::new(bytes.to_vec());
        let count = parser.take_len()?;
        let mut suspects = Vec::with_capacity(count);
        for _ in 0..count {
            suspects.push(
                ParticipantIdentifier::new(parser.take_u64()?)
                    .map_err(|_| CallerError::DeserializationFailed)?,
            );
        }
        if !parser.is_exhausted() {
            Err(CallerError::DeserializationFailed)?;
        }
        Ok(Self { suspects })
    }
}
