//! Epoch lifecycle: re-deal scheduling, overlap, and cutover.
//!
//! An epoch is the lifetime of one signing polynomial. Signing consumes
//! the epoch's budget; at 80% consumption the manager asks for a
//! successor deal (DKG runs under Node orchestration), and `cutover`
//! switches signing to the successor while the old epoch keeps verifying
//! through a grace period. Budgets are monotonic — an epoch's counter is
//! never reset.

// Copyright (c) Facebook, Inc. and its affiliates.
// Modifications Copyright (c) 2022-2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

use crate::{
    dkg,
    errors::{CallerError, InternalError, Result},
    protocol::ParticipantIdentifier,
    uss::{PartialSignature, SignatureBudget, Signer, Verification},
};
use tracing::{info, warn};

/// One signing epoch: an identifier and the node's USS state for it.
#[derive(Debug)]
pub struct Epoch {
    id: u64,
    signer: Signer,
    frozen: bool,
}

impl Epoch {
    fn new(id: u64, output: dkg::Output) -> Epoch {
        let degree = output.degree();
        let (share, verification, _) = output.into_parts();
        Epoch {
            id,
            signer: Signer::new(share, verification, degree),
            frozen: false,
        }
    }

    /// The epoch identifier.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The epoch's polynomial degree.
    pub fn degree(&self) -> usize {
        self.signer.degree()
    }

    /// The epoch's budget state.
    pub fn budget(&self) -> &SignatureBudget {
        self.signer.budget()
    }

    /// Whether the epoch has been frozen after its grace period.
    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// The epoch's USS state, for checkpointing.
    pub(crate) fn signer(&self) -> &Signer {
        &self.signer
    }
}

/// Drives epochs through deal → active → overlap → grace → frozen.
#[derive(Debug, Default)]
pub struct EpochManager {
    current: Option<Epoch>,
    successor: Option<Epoch>,
    retiring: Option<Epoch>,
    installed: u64,
}

impl EpochManager {
    /// A manager with no epoch yet; signing fails until the first deal
    /// installs.
    pub fn new() -> Self {
        Self::default()
    }

    /// The epoch identifier the next deal should use.
    pub fn next_epoch_id(&self) -> u64 {
        self.installed + 1
    }

    /// Completed installs so far.
    pub fn epochs_installed(&self) -> u64 {
        self.installed
    }

    /// The active epoch, if any.
    pub fn current(&self) -> Option<&Epoch> {
        self.current.as_ref()
    }

    /// Whether an overlap deal is in place awaiting cutover.
    pub fn has_successor(&self) -> bool {
        self.successor.is_some()
    }

    /// Install a completed deal. The first install activates; later
    /// installs become the successor for the next cutover. New joiners
    /// during overlap are handed the successor's deal only.
    pub fn install_epoch(&mut self, output: dkg::Output) -> u64 {
        self.installed += 1;
        let id = self.installed;
        let epoch = Epoch::new(id, output);
        match &self.current {
            None => {
                info!("epoch {id} activated");
                self.current = Some(epoch);
            }
            Some(current) => {
                info!("epoch {id} installed as successor to {}", current.id);
                self.successor = Some(epoch);
            }
        }
        id
    }

    /// Reinstate a checkpointed epoch as the active one, preserving its
    /// identifier and budget.
    pub(crate) fn restore_current(&mut self, id: u64, signer: Signer) {
        self.installed = self.installed.max(id);
        self.current = Some(Epoch {
            id,
            signer,
            frozen: false,
        });
    }

    /// True when the active epoch has consumed 80% of its budget and no
    /// successor deal is in place yet — time to start the overlap DKG.
    pub fn needs_overlap(&self) -> bool {
        if self.successor.is_some() {
            return false;
        }
        match &self.current {
            Some(epoch) => {
                let budget = epoch.budget();
                budget.consumed() * 5 >= budget.max() * 4
            }
            None => false,
        }
    }

    /// Switch signing to the successor epoch. The outgoing epoch keeps
    /// verifying through a grace period until [`freeze_retired`] is
    /// called, so there is no verification gap for in-flight signatures.
    ///
    /// [`freeze_retired`]: Self::freeze_retired
    pub fn cutover(&mut self) -> Result<u64> {
        let successor = self.successor.take().ok_or(InternalError::DkgFailed)?;
        let id = successor.id;
        if let Some(mut old) = self.current.replace(successor) {
            info!("epoch cutover: {} → {id}, {} entering grace", old.id, old.id);
            old.frozen = false;
            self.retiring = Some(old);
        }
        Ok(id)
    }

    /// End the grace period: the retired epoch stops verifying.
    pub fn freeze_retired(&mut self) {
        if let Some(mut old) = self.retiring.take() {
            info!("epoch {} frozen", old.id);
            old.frozen = true;
        }
    }

    fn current_mut(&mut self) -> Result<&mut Epoch> {
        self.current.as_mut().ok_or(InternalError::DkgFailed)
    }

    /// Produce a partial signature against the active epoch.
    ///
    /// [`CallerError::BudgetExhausted`] is the signal to accelerate
    /// cutover; signing blocks until the successor activates.
    pub fn partial_sign(
        &mut self,
        message: u64,
        committee: &[ParticipantIdentifier],
    ) -> Result<PartialSignature> {
        let outcome = self.current_mut()?.signer.partial_sign(message, committee);
        if matches!(
            outcome.as_ref().map_err(InternalError::caller_error),
            Err(Some(CallerError::BudgetExhausted))
        ) {
            warn!("signature budget exhausted, cutover required");
        }
        outcome
    }

    /// Verify a signature against the active epoch, falling back to the
    /// retiring epoch during its grace period.
    pub fn verify(&self, message: u64, sigma: u64) -> Result<Verification> {
        let current = self.current.as_ref().ok_or(InternalError::DkgFailed)?;
        let verification = current.signer.verify(message, sigma)?;
        if verification.accepted && !verification.insufficient_points {
            return Ok(verification);
        }
        if let Some(retiring) = self.retiring.as_ref().filter(|epoch| !epoch.is_frozen()) {
            let grace = retiring.signer.verify(message, sigma)?;
            if grace.accepted && !grace.insufficient_points {
                return Ok(grace);
            }
        }
        Ok(verification)
    }

    /// The active epoch's signing threshold, k = d + 1.
    pub fn threshold(&self) -> Result<usize> {
        Ok(self.current.as_ref().ok_or(InternalError::DkgFailed)?.degree() + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dkg::Output;
    use crate::uss::testing::SigningPolynomial;
    use crate::uss::{SigningShare, VerificationShares};
    use crate::utils::testing::init_testing;
    use rand::rngs::StdRng;

    fn pid(n: u64) -> ParticipantIdentifier {
        ParticipantIdentifier::from_u64(n)
    }

    /// Deal one node's output from a trusted dealer polynomial.
    fn dealt_output(
        poly: &SigningPolynomial,
        node: u64,
        degree: usize,
        verifier_xs: &[u64],
    ) -> Output {
        let shares = poly.verification_shares(verifier_xs);
        Output::from_parts(
            SigningShare::new(pid(node), poly.eval_at(node)),
            shares,
            Vec::new(),
            degree + 1,
        )
        .unwrap()
    }

    fn fresh_poly_output(
        degree: usize,
        rng: &mut StdRng,
    ) -> (SigningPolynomial, Output) {
        let poly = SigningPolynomial::random(degree, rng);
        let xs: Vec<u64> = (100..100 + degree as u64 + 1).collect();
        let output = dealt_output(&poly, 1, degree, &xs);
        (poly, output)
    }

    #[test]
    fn first_install_activates() {
        let mut rng = init_testing();
        let mut manager = EpochManager::new();
        assert!(manager.current().is_none());
        assert!(manager.partial_sign(1, &[pid(1)]).is_err());

        let (_, output) = fresh_poly_output(2, &mut rng);
        assert_eq!(manager.install_epoch(output), 1);
        assert_eq!(manager.current().unwrap().id(), 1);
        assert_eq!(manager.threshold().unwrap(), 3);
    }

    #[test]
    fn budget_exhaustion_blocks_until_cutover() {
        // Degree 10 → budget 5. Five distinct messages sign; the sixth
        // fails; after cutover the sixth signs against the new epoch and
        // old-epoch signatures still verify through the grace period.
        let mut rng = init_testing();
        let mut manager = EpochManager::new();
        let committee: Vec<_> = (1..=11).map(pid).collect();

        let degree = 10;
        let (old_poly, output) = fresh_poly_output(degree, &mut rng);
        let _ = manager.install_epoch(output);

        for message in 1..=5 {
            manager.partial_sign(message, &committee).unwrap();
        }
        let err = manager.partial_sign(6, &committee).unwrap_err();
        assert_eq!(err.caller_error(), Some(CallerError::BudgetExhausted));
        assert!(manager.needs_overlap());

        // Overlap deal installs as successor, then cutover.
        let (new_poly, successor) = fresh_poly_output(degree, &mut rng);
        let _ = manager.install_epoch(successor);
        assert!(!manager.needs_overlap());
        assert_eq!(manager.cutover().unwrap(), 2);

        // The sixth message signs against the new epoch.
        manager.partial_sign(6, &committee).unwrap();

        // Old-epoch signatures verify during grace, not after freezing.
        let old_signature = old_poly.eval_at(42);
        assert!(manager.verify(42, old_signature).unwrap().accepted);
        manager.freeze_retired();
        assert!(!manager.verify(42, old_signature).unwrap().accepted);

        // New-epoch signatures verify throughout.
        let new_signature = new_poly.eval_at(42);
        assert!(manager.verify(42, new_signature).unwrap().accepted);
    }

    #[test]
    fn overlap_begins_at_eighty_percent() {
        let mut rng = init_testing();
        let mut manager = EpochManager::new();
        let committee: Vec<_> = (1..=11).map(pid).collect();
        let (_, output) = fresh_poly_output(10, &mut rng);
        let _ = manager.install_epoch(output);

        for message in 1..=3 {
            manager.partial_sign(message, &committee).unwrap();
        }
        assert!(!manager.needs_overlap());
        manager.partial_sign(4, &committee).unwrap();
        assert!(manager.needs_overlap());
    }

    #[test]
    fn cutover_without_successor_fails() {
        let mut manager = EpochManager::new();
        assert_eq!(manager.cutover().unwrap_err(), InternalError::DkgFailed);
    }

    #[test]
    fn duplicate_messages_do_not_deplete_the_budget() {
        let mut rng = init_testing();
        let mut manager = EpochManager::new();
        let committee: Vec<_> = (1..=11).map(pid).collect();
        let (_, output) = fresh_poly_output(10, &mut rng);
        let _ = manager.install_epoch(output);

        for _ in 0..10 {
            manager.partial_sign(1, &committee).unwrap();
        }
        assert_eq!(manager.current().unwrap().budget().consumed(), 1);
    }
}
