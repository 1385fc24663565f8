// Copyright (c) Facebook, Inc. and its affiliates.
// Modifications Copyright (c) 2022-2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

use crate::{
    errors::{CallerError, Result},
    gf61::InterpolatingPoly,
    protocol::ParticipantIdentifier,
};
use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Formatter};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// This node's share of the epoch's signing polynomial: `F(node)`.
///
/// # 🔒 Storage requirement
/// The share value is the node's entire signing capability for the epoch.
/// It is zeroized on drop and must never be checkpointed in plaintext.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop, Serialize, Deserialize)]
pub struct SigningShare {
    #[zeroize(skip)]
    node: ParticipantIdentifier,
    value: u64,
}

impl SigningShare {
    /// Bind a share value to its holder.
    pub fn new(node: ParticipantIdentifier, value: u64) -> Self {
        Self { node, value }
    }

    /// The holder, which is also the evaluation coordinate.
    pub fn node(&self) -> ParticipantIdentifier {
        self.node
    }

    /// The share value `F(node)`.
    pub(crate) fn value(&self) -> u64 {
        self.value
    }
}

impl Debug for SigningShare {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningShare")
            .field("node", &self.node)
            .field("value", &"[redacted]")
            .finish()
    }
}

/// A verifier's private set of evaluation points of the signing
/// polynomial, `(v, F(v))` at this verifier's own public arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationShares {
    points: Vec<(u64, u64)>,
}

impl VerificationShares {
    /// Wrap a point set. The x-coordinates must be pairwise distinct.
    pub fn new(points: Vec<(u64, u64)>) -> Result<Self> {
        for (i, (xi, _)) in points.iter().enumerate() {
            if points[i + 1..].iter().any(|(xj, _)| xj == xi) {
                Err(CallerError::InvalidInput)?;
            }
        }
        Ok(Self { points })
    }

    /// The held points.
    pub fn points(&self) -> &[(u64, u64)] {
        &self.points
    }

    /// Number of held points.
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// True when no points are held.
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Check a claimed evaluation `(message, sigma)` of the polynomial.
    ///
    /// With more than `degree` points held, the claim is over-determined:
    /// interpolate through degree+1 points and exact-check everything
    /// else, including the claim. With `degree` or fewer points the check
    /// is vacuous; `insufficient_points` is raised and the caller must not
    /// treat the claim as verified.
    pub fn check(&self, degree: usize, message: u64, sigma: u64) -> Result<Verification> {
        if self.points.len() <= degree {
            return Ok(Verification {
                accepted: true,
                insufficient_points: true,
            });
        }

        let poly = InterpolatingPoly::new(&self.points[..degree + 1])?;
        let extras_consistent = self.points[degree + 1..]
            .iter()
            .all(|&(x, y)| poly.eval_at(x) == y);
        let accepted = extras_consistent && poly.eval_at(message) == sigma;
        Ok(Verification {
            accepted,
            insufficient_points: false,
        })
    }
}

/// The result of a signature check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verification {
    /// All consistency checks passed.
    pub accepted: bool,
    /// The verifier held too few points to over-determine the polynomial;
    /// `accepted` is vacuous and must not be treated as verified.
    pub insufficient_points: bool,
}

/// One committee member's contribution to a threshold signature:
/// `F(member) · L_member(message)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialSignature {
    /// The contributing committee member.
    pub signer: ParticipantIdentifier,
    /// The weighted share value.
    pub value: u64,
}

/// A combined threshold signature: `sigma = F(message)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    /// The signed message, as a field element.
    pub message: u64,
    /// The polynomial evaluation `F(message)`.
    pub sigma: u64,
}

impl Signature {
    /// Forge-test helper: the additively-shifted signature used by tests.
    #[cfg(test)]
    pub(crate) fn shifted(&self, delta: u64) -> Self {
        Self {
            message: self.message,
            sigma: crate::gf61::add(self.sigma, delta),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signing_share_debug_is_redacted() {
        let share = SigningShare::new(ParticipantIdentifier::from_u64(3), 12345);
        let rendered = format!("{share:?}");
        assert!(rendered.contains("redacted"));
        assert!(!rendered.contains("12345"));
    }

    #[test]
    fn verification_shares_reject_duplicate_arguments() {
        assert!(VerificationShares::new(vec![(7, 1), (7, 2)]).is_err());
        assert!(VerificationShares::new(vec![(7, 1), (8, 2)]).is_ok());
    }
}
