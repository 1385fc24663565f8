//! Shamir secret sharing over GF(M61).
//!
//! Information-theoretically secure (k, n) sharing by polynomial
//! interpolation, with corrupt-share detection for shares carried over
//! untrusted relays. Shares live on the same field as the channel MAC and
//! the signing polynomial.

// Copyright (c) Facebook, Inc. and its affiliates.
// Modifications Copyright (c) 2022-2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

use crate::{
    errors::{CallerError, Result},
    gf61::{self, InterpolatingPoly, M61},
};
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

/// One share: a point `(x, f(x))` on the sharing polynomial, `x ≠ 0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShamirShare {
    /// Evaluation coordinate.
    pub x: u64,
    /// Polynomial value at `x`.
    pub y: u64,
}

impl ShamirShare {
    fn as_point(&self) -> (u64, u64) {
        (self.x, self.y)
    }
}

fn points_of(shares: &[ShamirShare]) -> Vec<(u64, u64)> {
    shares.iter().map(ShamirShare::as_point).collect()
}

/// Split `secret` into `n` shares with threshold `k`.
///
/// Samples a uniform degree-(k−1) polynomial with constant term `secret`
/// and evaluates it at x = 1..=n. Fails with
/// [`CallerError::InvalidParams`] when k < 1, n < k, or the secret is not
/// a field element.
pub fn split<R: RngCore + CryptoRng>(
    secret: u64,
    k: usize,
    n: usize,
    rng: &mut R,
) -> Result<Vec<ShamirShare>> {
    if secret >= M61 || k < 1 || n < k {
        Err(CallerError::InvalidParams)?;
    }

    let mut coeffs = Zeroizing::new(Vec::with_capacity(k));
    coeffs.push(secret);
    for _ in 1..k {
        coeffs.push(gf61::rand_element(rng));
    }

    Ok((1..=n as u64)
        .map(|x| ShamirShare {
            x,
            y: gf61::poly_eval_low(&coeffs, x),
        })
        .collect())
}

/// Reconstruct the secret (the polynomial at zero) from shares.
pub fn reconstruct(shares: &[ShamirShare]) -> Result<u64> {
    reconstruct_at(shares, 0)
}

/// Evaluate the sharing polynomial at an arbitrary point.
///
/// Interpolates whatever it is given: callers who require a threshold
/// should use [`reconstruct_with_threshold`].
pub fn reconstruct_at(shares: &[ShamirShare], target: u64) -> Result<u64> {
    gf61::lagrange_interpolate(&points_of(shares), target)
}

/// Reconstruct the secret, failing with
/// [`CallerError::InsufficientShares`] when fewer than `k` shares are
/// supplied.
pub fn reconstruct_with_threshold(shares: &[ShamirShare], k: usize) -> Result<u64> {
    if shares.len() < k {
        Err(CallerError::InsufficientShares)?;
    }
    reconstruct(shares)
}

/// Partition shares into `(good, bad)` by polynomial consistency.
///
/// Searches candidate degree-(k−1) interpolants (every leave-one-out basis
/// and every k-window) and keeps the one most shares agree with. The
/// candidate is accepted only when at least k+1 shares lie on it — below
/// that redundancy corruption is undetectable and everything is reported
/// good rather than risking a false accusation. With 2k shares, up to k−1
/// corruptions are identified.
pub fn consistency_check(
    shares: &[ShamirShare],
    k: usize,
) -> Result<(Vec<ShamirShare>, Vec<ShamirShare>)> {
    let n = shares.len();
    if k < 1 {
        Err(CallerError::InvalidParams)?;
    }
    if n < k + 1 {
        // Any k points define a valid polynomial; nothing to cross-check.
        return Ok((shares.to_vec(), Vec::new()));
    }

    let points = points_of(shares);

    let mut candidate_bases: Vec<Vec<(u64, u64)>> = Vec::with_capacity(2 * n);
    for skip in 0..n {
        let basis: Vec<(u64, u64)> = points
            .iter()
            .enumerate()
            .filter(|(j, _)| *j != skip)
            .map(|(_, p)| *p)
            .take(k)
            .collect();
        candidate_bases.push(basis);
    }
    for start in 0..=(n - k) {
        candidate_bases.push(points[start..start + k].to_vec());
    }

    let mut best: Option<(usize, Vec<bool>)> = None;
    for basis in &candidate_bases {
        let poly = InterpolatingPoly::new(basis)?;
        let agreement: Vec<bool> = points.iter().map(|&(x, y)| poly.eval_at(x) == y).collect();
        let count = agreement.iter().filter(|a| **a).count();
        if best.as_ref().map_or(true, |(c, _)| count > *c) {
            best = Some((count, agreement));
        }
    }

    let (count, agreement) = best.expect("at least one candidate basis exists");
    if count < k + 1 {
        // Not enough redundancy to pin a polynomial down.
        return Ok((shares.to_vec(), Vec::new()));
    }

    let mut good = Vec::new();
    let mut bad = Vec::new();
    for (share, on_curve) in shares.iter().zip(agreement) {
        if on_curve {
            good.push(*share);
        } else {
            bad.push(*share);
        }
    }
    Ok((good, bad))
}
