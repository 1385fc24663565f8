// Copyright (c) Facebook, Inc. and its affiliates.
// Modifications Copyright (c) 2022-2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

use crate::gf61;
use rand::{CryptoRng, RngCore};
use std::fmt::{Debug, Formatter};
use zeroize::Zeroizing;

/// One node's random polynomial contribution to an epoch's DKG.
///
/// The coefficients are this node's private randomness; they are zeroized
/// on drop and the whole contribution is discarded once shares have been
/// distributed and the combined share computed. Nobody ever assembles the
/// summed polynomial.
pub struct PolynomialContribution {
    degree: usize,
    coeffs: Zeroizing<Vec<u64>>,
}

impl PolynomialContribution {
    /// Sample a uniform degree-`degree` polynomial.
    pub fn random<R: RngCore + CryptoRng>(degree: usize, rng: &mut R) -> Self {
        Self {
            degree,
            coeffs: Zeroizing::new((0..=degree).map(|_| gf61::rand_element(rng)).collect()),
        }
    }

    /// The polynomial's degree.
    pub fn degree(&self) -> usize {
        self.degree
    }

    /// Evaluate the contribution at `x` — the share destined for the node
    /// with that coordinate.
    pub fn share_for(&self, x: u64) -> u64 {
        gf61::poly_eval_low(&self.coeffs, x)
    }

    /// Evaluate at a batch of verification arguments.
    pub fn evaluations_at(&self, xs: &[u64]) -> Vec<u64> {
        xs.iter().map(|&x| self.share_for(x)).collect()
    }
}

impl Debug for PolynomialContribution {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolynomialContribution")
            .field("degree", &self.degree)
            .field("coeffs", &"[redacted]")
            .finish()
    }
}
