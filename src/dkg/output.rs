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
    uss::{SigningShare, VerificationShares},
};

/// The product of one DKG run at one participant: its combined signing
/// share, its private verification points, and the contributors the
/// committee excluded.
#[derive(Debug)]
pub struct Output {
    signing_share: SigningShare,
    verification_shares: VerificationShares,
    excluded: Vec<ParticipantIdentifier>,
    threshold: usize,
}

impl Output {
    /// Assemble an output.
    ///
    /// The verification share set must over-determine the polynomial
    /// (more than `threshold − 1` points), otherwise the holder could
    /// never reject a forgery.
    pub fn from_parts(
        signing_share: SigningShare,
        verification_shares: VerificationShares,
        excluded: Vec<ParticipantIdentifier>,
        threshold: usize,
    ) -> Result<Self> {
        if threshold < 1 || verification_shares.len() < threshold {
            Err(CallerError::InvalidParams)?;
        }
        Ok(Self {
            signing_share,
            verification_shares,
            excluded,
            threshold,
        })
    }

    /// This node's combined signing share.
    pub fn signing_share(&self) -> &SigningShare {
        &self.signing_share
    }

    /// This node's verification points.
    pub fn verification_shares(&self) -> &VerificationShares {
        &self.verification_shares
    }

    /// Contributors excluded by aggregated complaints.
    pub fn excluded(&self) -> &[ParticipantIdentifier] {
        &self.excluded
    }

    /// The signing threshold k.
    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// The combined polynomial's degree, k − 1.
    pub fn degree(&self) -> usize {
        self.threshold - 1
    }

    /// Tear the output into signer parts.
    pub fn into_parts(self) -> (SigningShare, VerificationShares, Vec<ParticipantIdentifier>) {
        (self.signing_share, self.verification_shares, self.excluded)
    }
}
