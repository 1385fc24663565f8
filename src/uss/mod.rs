//! Unconditionally secure threshold signatures over GF(M61).
//!
//! A signature on message `m` is `sigma = F(m)` for the epoch's secret
//! degree-d polynomial F, which exists only as distributed shares. Each
//! committee member contributes `F(j) · L_j(m)`; the Lagrange identity
//! makes the sum of any k honest partials equal `F(m)` exactly.
//! Verification checks the claim against a verifier's private evaluation
//! points; forging without d+1 evaluations succeeds with probability
//! exactly 1/M61 per attempt, regardless of the adversary's computational
//! power.

// Copyright (c) Facebook, Inc. and its affiliates.
// Modifications Copyright (c) 2022-2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

mod budget;
mod share;

pub use budget::SignatureBudget;
pub use share::{
    PartialSignature, Signature, SigningShare, Verification, VerificationShares,
};

use crate::{
    errors::{CallerError, Result},
    gf61,
    protocol::ParticipantIdentifier,
    trust::TrustVector,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{info, warn};

/// One verifier's accept/reject report in a dispute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttestationReport {
    /// The reporting verifier.
    pub verifier: ParticipantIdentifier,
    /// Whether that verifier's points accepted the signature.
    pub accepted: bool,
}

/// The outcome of dispute adjudication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisputeVerdict {
    /// Trust-weighted acceptance outweighs rejection.
    Valid,
    /// Trust-weighted rejection is at least the acceptance.
    Forged,
}

/// A node's signing state for one epoch: its share of F, its private
/// verification points, and the epoch's signature budget.
#[derive(Debug)]
pub struct Signer {
    share: SigningShare,
    verification: VerificationShares,
    budget: SignatureBudget,
    degree: usize,
}

impl Signer {
    /// Assemble a signer from DKG results.
    pub fn new(share: SigningShare, verification: VerificationShares, degree: usize) -> Self {
        Self {
            share,
            verification,
            budget: SignatureBudget::new(degree),
            degree,
        }
    }

    /// Reassemble a signer from checkpointed state, budget included, so a
    /// restart cannot reset the epoch's consumption counter.
    pub(crate) fn restore(
        share: SigningShare,
        verification: VerificationShares,
        degree: usize,
        budget: SignatureBudget,
    ) -> Self {
        Self {
            share,
            verification,
            budget,
            degree,
        }
    }

    /// The raw share value, for checkpoint masking only.
    pub(crate) fn share_value(&self) -> u64 {
        self.share.value()
    }

    /// The holding node.
    pub fn node(&self) -> ParticipantIdentifier {
        self.share.node()
    }

    /// The signing polynomial's degree.
    pub fn degree(&self) -> usize {
        self.degree
    }

    /// The epoch's budget state.
    pub fn budget(&self) -> &SignatureBudget {
        &self.budget
    }

    /// This node's verification points.
    pub fn verification_shares(&self) -> &VerificationShares {
        &self.verification
    }

    /// Produce this node's partial signature on `message` for the given
    /// committee.
    ///
    /// Fails with [`CallerError::InvalidCommittee`] when we are not a
    /// member or the committee repeats an identifier, and with
    /// [`CallerError::BudgetExhausted`] when the epoch budget is spent and
    /// the message is fresh.
    pub fn partial_sign(
        &mut self,
        message: u64,
        committee: &[ParticipantIdentifier],
    ) -> Result<PartialSignature> {
        let distinct: HashSet<_> = committee.iter().collect();
        if distinct.len() != committee.len() {
            Err(CallerError::InvalidCommittee)?;
        }
        let index = committee
            .iter()
            .position(|&id| id == self.share.node())
            .ok_or(CallerError::InvalidCommittee)?;

        self.budget.consume(message)?;

        let xs: Vec<u64> = committee.iter().map(|id| id.as_coordinate()).collect();
        let basis = gf61::lagrange_basis_at(&xs, index, message)?;
        info!(
            "{}: partial signature on message {message} ({} budget remaining)",
            self.share.node(),
            self.budget.remaining()
        );
        Ok(PartialSignature {
            signer: self.share.node(),
            value: gf61::mul(self.share.value(), basis),
        })
    }

    /// Check a claimed signature against this node's verification points.
    pub fn verify(&self, message: u64, sigma: u64) -> Result<Verification> {
        let verification = self.verification.check(self.degree, message, sigma)?;
        if verification.insufficient_points {
            warn!(
                "{}: verification vacuous, only {} points held for degree {}",
                self.share.node(),
                self.verification.len(),
                self.degree
            );
        }
        Ok(verification)
    }
}

/// Combine partial signatures into `sigma = F(message)`.
///
/// Exact when at least `threshold` honest partials over a valid committee
/// arrive. Fails with [`CallerError::InsufficientShares`] below the
/// threshold.
pub fn combine(
    message: u64,
    partials: &[PartialSignature],
    threshold: usize,
) -> Result<Signature> {
    if partials.len() < threshold {
        Err(CallerError::InsufficientShares)?;
    }
    let sigma = partials
        .iter()
        .fold(0, |acc, partial| gf61::add(acc, partial.value));
    Ok(Signature { message, sigma })
}

/// Adjudicate a contested signature by trust-weighted verifier vote.
///
/// Forged wins ties: a signature that cannot gather a strict majority of
/// trust-weighted acceptance is treated as forged.
pub fn resolve_dispute(reports: &[AttestationReport], trust: &TrustVector) -> DisputeVerdict {
    let mut accept_weight = 0.0;
    let mut reject_weight = 0.0;
    for report in reports {
        let weight = trust.score(report.verifier);
        if report.accepted {
            accept_weight += weight;
        } else {
            reject_weight += weight;
        }
    }
    if reject_weight >= accept_weight {
        DisputeVerdict::Forged
    } else {
        DisputeVerdict::Valid
    }
}


#[cfg(test)]
mod tests {
    use super::{testing::SigningPolynomial, *};
    use crate::utils::testing::init_testing;
    use std::collections::HashMap;

    fn pid(n: u64) -> ParticipantIdentifier {
        ParticipantIdentifier::from_u64(n)
    }

    fn dealer_setup(
        degree: usize,
        committee: &[u64],
        verifier_xs: &[u64],
        rng: &mut rand::rngs::StdRng,
    ) -> (SigningPolynomial, Vec<Signer>) {
        let poly = SigningPolynomial::random(degree, rng);
        let signers = committee
            .iter()
            .map(|&id| {
                Signer::new(
                    poly.signing_share(pid(id)),
                    poly.verification_shares(verifier_xs),
                    degree,
                )
            })
            .collect();
        (poly, signers)
    }

    #[test]
    fn threshold_sign_and_verify_round_trip() {
        // n = 5, k = 3, d = 2: committee {1, 3, 5} signs m = 42; a
        // verifier holding (7, F(7)), (8, F(8)), (9, F(9)) accepts, and
        // rejects sigma + 1.
        let mut rng = init_testing();
        let (poly, mut signers) = dealer_setup(2, &[1, 3, 5], &[7, 8, 9], &mut rng);
        let committee: Vec<_> = [1, 3, 5].map(pid).to_vec();

        let message = 42;
        let partials: Vec<PartialSignature> = signers
            .iter_mut()
            .map(|s| s.partial_sign(message, &committee).unwrap())
            .collect();
        let signature = combine(message, &partials, 3).unwrap();
        assert_eq!(signature.sigma, poly.eval_at(message));

        let verification = signers[0].verify(message, signature.sigma).unwrap();
        assert!(verification.accepted);
        assert!(!verification.insufficient_points);

        let forged = signature.shifted(1);
        let verification = signers[0].verify(message, forged.sigma).unwrap();
        assert!(!verification.accepted);
    }

    #[test]
    fn disjoint_committees_produce_identical_signatures() {
        let mut rng = init_testing();
        let ids = [1, 2, 3, 4, 5, 6];
        let (_, mut signers) = dealer_setup(2, &ids, &[10, 11, 12], &mut rng);
        let message = 31337;

        let first: Vec<_> = [0usize, 1, 2]
            .iter()
            .map(|&i| {
                let committee: Vec<_> = [1, 2, 3].map(pid).to_vec();
                signers[i].partial_sign(message, &committee).unwrap()
            })
            .collect();
        let second: Vec<_> = [3usize, 4, 5]
            .iter()
            .map(|&i| {
                let committee: Vec<_> = [4, 5, 6].map(pid).to_vec();
                signers[i].partial_sign(message, &committee).unwrap()
            })
            .collect();

        let sig_a = combine(message, &first, 3).unwrap();
        let sig_b = combine(message, &second, 3).unwrap();
        assert_eq!(sig_a, sig_b);
    }

    #[test]
    fn non_member_cannot_partial_sign() {
        let mut rng = init_testing();
        let (_, mut signers) = dealer_setup(2, &[1, 3, 5], &[7, 8, 9], &mut rng);
        let committee: Vec<_> = [3, 5, 7].map(pid).to_vec();
        let err = signers[0].partial_sign(9, &committee).unwrap_err();
        assert_eq!(err.caller_error(), Some(CallerError::InvalidCommittee));

        let repeated: Vec<_> = [1, 1, 3].map(pid).to_vec();
        let err = signers[0].partial_sign(9, &repeated).unwrap_err();
        assert_eq!(err.caller_error(), Some(CallerError::InvalidCommittee));
    }

    #[test]
    fn combine_requires_threshold_many_partials() {
        let mut rng = init_testing();
        let (_, mut signers) = dealer_setup(2, &[1, 3, 5], &[7, 8, 9], &mut rng);
        let committee: Vec<_> = [1, 3, 5].map(pid).to_vec();
        let partial = signers[0].partial_sign(1, &committee).unwrap();
        let err = combine(1, &[partial], 3).unwrap_err();
        assert_eq!(err.caller_error(), Some(CallerError::InsufficientShares));
    }

    #[test]
    fn underdetermined_verifier_flags_vacuous_acceptance() {
        let mut rng = init_testing();
        // Degree 2 but only 2 verification points: cannot disprove.
        let (_, signers) = dealer_setup(2, &[1, 2, 3], &[7, 8], &mut rng);
        let verification = signers[0].verify(5, 123456).unwrap();
        assert!(verification.accepted);
        assert!(verification.insufficient_points);
    }

    #[test]
    fn boundary_verifier_with_exactly_degree_plus_one_points_verifies() {
        let mut rng = init_testing();
        let (poly, signers) = dealer_setup(3, &[1, 2, 3, 4], &[9, 10, 11, 12], &mut rng);
        let message = 77;
        let verification = signers[0].verify(message, poly.eval_at(message)).unwrap();
        assert!(verification.accepted);
        assert!(!verification.insufficient_points);
    }

    #[test]
    fn random_forgeries_are_rejected() {
        let mut rng = init_testing();
        let (poly, signers) = dealer_setup(2, &[1, 2, 3], &[7, 8, 9], &mut rng);
        let message = 55;
        let genuine = poly.eval_at(message);
        for _ in 0..50 {
            let forged = gf61::rand_element(&mut rng);
            if forged == genuine {
                continue;
            }
            assert!(!signers[0].verify(message, forged).unwrap().accepted);
        }
    }

    #[test]
    fn budget_blocks_the_sixth_distinct_message() {
        let mut rng = init_testing();
        let ids: Vec<u64> = (1..=11).collect();
        let (_, mut signers) = dealer_setup(10, &ids, &[20, 21], &mut rng);
        let committee: Vec<_> = ids.iter().map(|&i| pid(i)).collect();

        for message in 1..=5 {
            signers[0].partial_sign(message, &committee).unwrap();
        }
        let err = signers[0].partial_sign(6, &committee).unwrap_err();
        assert_eq!(err.caller_error(), Some(CallerError::BudgetExhausted));
        // A duplicate of an already-signed message stays signable.
        signers[0].partial_sign(5, &committee).unwrap();
    }

    #[test]
    fn dispute_weighs_reports_by_trust() {
        let trust = TrustVector::from_scores(HashMap::from([
            (pid(1), 0.6),
            (pid(2), 0.2),
            (pid(3), 0.2),
        ]));
        let accept = |n| AttestationReport {
            verifier: pid(n),
            accepted: true,
        };
        let reject = |n| AttestationReport {
            verifier: pid(n),
            accepted: false,
        };

        // Two low-trust rejections lose to one high-trust acceptance.
        assert_eq!(
            resolve_dispute(&[accept(1), reject(2), reject(3)], &trust),
            DisputeVerdict::Valid
        );
        // A tie is resolved as forged.
        assert_eq!(
            resolve_dispute(&[reject(1), accept(2), accept(3)], &trust),
            DisputeVerdict::Forged
        );
        assert_eq!(resolve_dispute(&[], &trust), DisputeVerdict::Forged);
    }
}
