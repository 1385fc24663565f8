// Copyright (c) Facebook, Inc. and its affiliates.
// Modifications Copyright (c) 2022-2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

use std::collections::{BTreeSet, HashMap, HashSet};

use super::{
    contribution::PolynomialContribution, output::Output, verification_arguments,
    ComplaintPayload, CrossPayload, SharePayload,
};
use crate::{
    errors::{CallerError, InternalError, Result},
    gf61::{self, InterpolatingPoly},
    local_storage::{LocalStorage, TypeTag},
    messages::{DkgMessageType, Message, MessageType},
    participant::{
        run_only_once, InnerProtocolParticipant, ProcessOutcome, ProtocolParticipant, Status,
    },
    protocol::{Identifier, ParticipantConfig, ParticipantIdentifier, ProtocolType, SharedContext},
    uss::{SigningShare, VerificationShares},
};
use rand::{CryptoRng, RngCore};
use tracing::{error, info, instrument, warn};

mod storage {
    use super::*;

    pub(super) struct Share;
    impl TypeTag for Share {
        type Value = u64;
    }
    pub(super) struct VerEvals;
    impl TypeTag for VerEvals {
        type Value = Vec<u64>;
    }
    pub(super) struct Complaint;
    impl TypeTag for Complaint {
        type Value = Vec<ParticipantIdentifier>;
    }
}

/// Input for one DKG run.
#[derive(Debug, Clone, Copy)]
pub struct Input {
    threshold: usize,
    epoch: u64,
}

impl Input {
    /// Configure a run producing a (threshold, n) sharing for the given
    /// epoch.
    pub fn new(threshold: usize, epoch: u64) -> Self {
        Self { threshold, epoch }
    }

    /// The signing threshold k.
    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// The epoch this run deals shares for.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}

/// A [`ProtocolParticipant`] that runs distributed key generation.
///
/// # Protocol input
/// The signing threshold `k` and the epoch being dealt. The committee is
/// the participant set itself; every member must hold a MAC-authenticated
/// channel to every other (the node layer seals and verifies transport).
///
/// # Protocol output
/// An [`Output`]: this node's combined [`SigningShare`], its private
/// [`VerificationShares`] at its own public arguments, and the excluded
/// contributor set.
///
/// # 🔒 Storage requirements
/// The polynomial contribution is dropped as soon as round one is
/// generated; only this node's own evaluations survive, inside
/// `LocalStorage`. The output's signing share must be stored securely by
/// the calling layer.
#[derive(Debug)]
pub struct DkgParticipant {
    sid: Identifier,
    input: Input,
    config: ParticipantConfig,
    local_storage: LocalStorage,
    stash: Vec<Message>,
    once: HashSet<&'static str>,
    status: Status,
    /// Forwarded points per contributor: `(holder coordinate, value)`.
    cross_points: HashMap<ParticipantIdentifier, Vec<(u64, u64)>>,
    /// Crosses received per holder, to detect the round-two barrier.
    cross_counts: HashMap<ParticipantIdentifier, usize>,
    suspects: BTreeSet<ParticipantIdentifier>,
    suspects_final: bool,
    absent: BTreeSet<ParticipantIdentifier>,
}

impl ProtocolParticipant for DkgParticipant {
    type Input = Input;
    type Output = Output;

    fn new(
        sid: Identifier,
        id: ParticipantIdentifier,
        other_participant_ids: Vec<ParticipantIdentifier>,
        input: Self::Input,
    ) -> Result<Self> {
        let config = ParticipantConfig::new(id, &other_participant_ids)?;
        if input.threshold < 1 || input.threshold > config.count() {
            Err(CallerError::InvalidParams)?;
        }
        Ok(Self {
            sid,
            input,
            config,
            local_storage: Default::default(),
            stash: Vec::new(),
            once: HashSet::new(),
            status: Status::NotReady,
            cross_points: HashMap::new(),
            cross_counts: HashMap::new(),
            suspects: BTreeSet::new(),
            suspects_final: false,
            absent: BTreeSet::new(),
        })
    }

    fn ready_type() -> MessageType {
        MessageType::Dkg(DkgMessageType::Ready)
    }

    fn protocol_type() -> ProtocolType {
        ProtocolType::Dkg
    }

    fn id(&self) -> ParticipantIdentifier {
        self.config.id()
    }

    fn other_ids(&self) -> &[ParticipantIdentifier] {
        self.config.other_ids()
    }

    fn sid(&self) -> Identifier {
        self.sid
    }

    #[instrument(skip_all)]
    fn process_message<R: RngCore + CryptoRng>(
        &mut self,
        rng: &mut R,
        message: &Message,
    ) -> Result<ProcessOutcome<Self::Output>> {
        info!(
            "DKG: {} received {:?} from {}",
            self.id(),
            message.message_type(),
            message.from()
        );

        if *self.status() == Status::TerminatedSuccessfully {
            Err(CallerError::ProtocolAlreadyTerminated)?;
        }

        if !self.status().is_ready() && message.message_type() != Self::ready_type() {
            self.stash_message(message)?;
            return Ok(ProcessOutcome::Incomplete);
        }

        match message.message_type() {
            MessageType::Dkg(DkgMessageType::Ready) => self.handle_ready_msg(rng, message),
            MessageType::Dkg(DkgMessageType::Share) => {
                self.check_sid(message)?;
                self.store_share(message)?;
                self.advance()
            }
            MessageType::Dkg(DkgMessageType::CrossVerify) => {
                self.check_sid(message)?;
                if !self.shares_done() {
                    self.stash_message(message)?;
                    return Ok(ProcessOutcome::Incomplete);
                }
                self.store_cross(message)?;
                self.advance()
            }
            MessageType::Dkg(DkgMessageType::Complaint) => {
                self.check_sid(message)?;
                if !self.ran("gen_complaint_msgs") {
                    self.stash_message(message)?;
                    return Ok(ProcessOutcome::Incomplete);
                }
                self.store_complaint(message)?;
                self.advance()
            }
            message_type => {
                error!("Incorrect MessageType given to DkgParticipant. Got: {message_type:?}");
                Err(InternalError::InternalInvariantFailed)
            }
        }
    }

    fn status(&self) -> &Status {
        &self.status
    }
}

impl InnerProtocolParticipant for DkgParticipant {
    type Context = SharedContext;

    fn retrieve_context(&self) -> SharedContext {
        SharedContext::collect(self)
    }

    fn local_storage(&self) -> &LocalStorage {
        &self.local_storage
    }

    fn local_storage_mut(&mut self) -> &mut LocalStorage {
        &mut self.local_storage
    }

    fn status_mut(&mut self) -> &mut Status {
        &mut self.status
    }

    fn message_stash_mut(&mut self) -> &mut Vec<Message> {
        &mut self.stash
    }

    fn once_guards_mut(&mut self) -> &mut HashSet<&'static str> {
        &mut self.once
    }
}

impl DkgParticipant {
    /// The polynomial degree d = k − 1.
    fn degree(&self) -> usize {
        self.input.threshold - 1
    }

    /// The complaint-exclusion threshold t = ⌊(n − 1)/3⌋.
    fn exclusion_threshold(&self) -> usize {
        (self.config.count() - 1) / 3
    }

    fn ran(&self, key: &'static str) -> bool {
        self.once.contains(key)
    }

    /// The peers we still expect traffic from.
    fn expected_peers(&self) -> Vec<ParticipantIdentifier> {
        self.other_ids()
            .iter()
            .copied()
            .filter(|p| !self.absent.contains(p))
            .collect()
    }

    /// The contributors whose evaluations can still enter the combined
    /// polynomial.
    fn expected_contributors(&self) -> Vec<ParticipantIdentifier> {
        self.all_participants()
            .into_iter()
            .filter(|p| !self.absent.contains(p))
            .collect()
    }

    fn shares_done(&self) -> bool {
        self.ran("gen_round_one_msgs")
            && self
                .local_storage
                .contains_for_all_ids::<storage::Share>(&self.expected_peers())
    }

    fn crosses_done(&self) -> bool {
        let expected = self.expected_contributors().len();
        self.expected_peers()
            .iter()
            .all(|holder| self.cross_counts.get(holder).copied().unwrap_or(0) >= expected)
    }

    fn complaints_done(&self) -> bool {
        self.local_storage
            .contains_for_all_ids::<storage::Complaint>(&self.expected_peers())
    }

    /// Mark a peer absent after a round timeout: they are suspected, the
    /// barriers shrink, and the protocol is re-driven as far as it can
    /// now go.
    #[instrument(skip_all, fields(peer = %peer))]
    pub fn note_timeout(
        &mut self,
        peer: ParticipantIdentifier,
    ) -> Result<ProcessOutcome<Output>> {
        if peer == self.id() || !self.other_ids().contains(&peer) {
            Err(CallerError::BadInput)?;
        }
        warn!("DKG: {} marking {} absent after timeout", self.id(), peer);
        let _ = self.absent.insert(peer);
        let _ = self.suspects.insert(peer);
        if self.status().is_ready() {
            self.advance()
        } else {
            Ok(ProcessOutcome::Incomplete)
        }
    }

    /// Handle the Ready trigger: sample the contribution and send round
    /// one.
    #[instrument(skip_all, err(Debug))]
    fn handle_ready_msg<R: RngCore + CryptoRng>(
        &mut self,
        rng: &mut R,
        message: &Message,
    ) -> Result<ProcessOutcome<Output>> {
        let ready_outcome = self.process_ready_message(rng, message)?;
        let round_one_messages = run_only_once!(self.gen_round_one_msgs(rng))?;

        // Shares may have arrived while we were not ready.
        for stashed in self.fetch_messages(MessageType::Dkg(DkgMessageType::Share))? {
            self.store_share(&stashed)?;
        }
        let outcome = self.advance()?;
        ready_outcome
            .with_messages(round_one_messages)
            .consolidate(vec![outcome])
    }

    /// Generate round one: one share message per peer, carrying their
    /// evaluation of our polynomial and our polynomial at their
    /// verification arguments.
    ///
    /// The contribution itself is dropped at the end of this function;
    /// only our own evaluations survive.
    #[instrument(skip_all, err(Debug))]
    fn gen_round_one_msgs<R: RngCore + CryptoRng>(&mut self, rng: &mut R) -> Result<Vec<Message>> {
        info!("DKG: {} generating round one messages", self.id());

        let degree = self.degree();
        let all = self.all_participants();
        let contribution = PolynomialContribution::random(degree, rng);

        let mut messages = Vec::with_capacity(self.other_ids().len());
        for &peer in self.other_ids() {
            let args = verification_arguments(&all, degree, peer)?;
            let payload = SharePayload {
                share: contribution.share_for(peer.as_coordinate()),
                verification_evals: contribution.evaluations_at(&args),
            };
            messages.push(Message::new(
                MessageType::Dkg(DkgMessageType::Share),
                self.sid(),
                self.id(),
                peer,
                payload.encode(),
            ));
        }

        let own_args = verification_arguments(&all, degree, self.id())?;
        self.local_storage.store::<storage::Share>(
            self.id(),
            contribution.share_for(self.id().as_coordinate()),
        );
        self.local_storage
            .store::<storage::VerEvals>(self.id(), contribution.evaluations_at(&own_args));

        // The private polynomial dies here.
        drop(contribution);
        Ok(messages)
    }

    /// Validate and store an incoming round-one share.
    fn store_share(&mut self, message: &Message) -> Result<()> {
        message.check_type(MessageType::Dkg(DkgMessageType::Share))?;
        self.check_for_duplicate_msg::<storage::Share>(message.from())?;

        let payload = SharePayload::decode(&message.unverified_bytes)?;
        if payload.verification_evals.len() != self.degree() + 1 {
            error!(
                "DKG: {} sent {} verification evaluations, expected {}",
                message.from(),
                payload.verification_evals.len(),
                self.degree() + 1
            );
            return Err(InternalError::ProtocolError(Some(message.from())));
        }
        self.local_storage
            .store_once::<storage::Share>(message.from(), payload.share)?;
        self.local_storage
            .store::<storage::VerEvals>(message.from(), payload.verification_evals);
        Ok(())
    }

    /// Validate and store an incoming cross-verification point.
    fn store_cross(&mut self, message: &Message) -> Result<()> {
        message.check_type(MessageType::Dkg(DkgMessageType::CrossVerify))?;
        let payload = CrossPayload::decode(&message.unverified_bytes)?;

        // The forwarder vouches only for values it holds itself.
        if payload.holder != message.from() {
            error!(
                "DKG: {} forwarded a point it claims {} holds",
                message.from(),
                payload.holder
            );
            return Err(InternalError::ProtocolError(Some(message.from())));
        }
        let context = self.retrieve_context();
        if !context.is_participant(payload.contributor) {
            return Err(InternalError::ProtocolError(Some(message.from())));
        }

        let points = self.cross_points.entry(payload.contributor).or_default();
        let holder_coord = payload.holder.as_coordinate();
        if points.iter().any(|&(x, _)| x == holder_coord) {
            // The same holder vouched twice for the same contributor.
            return Err(InternalError::ProtocolError(Some(message.from())));
        }
        points.push((holder_coord, payload.value));
        *self.cross_counts.entry(message.from()).or_default() += 1;
        Ok(())
    }

    /// Validate and store an incoming complaint set.
    fn store_complaint(&mut self, message: &Message) -> Result<()> {
        message.check_type(MessageType::Dkg(DkgMessageType::Complaint))?;
        self.check_for_duplicate_msg::<storage::Complaint>(message.from())?;

        let payload = ComplaintPayload::decode(&message.unverified_bytes)?;
        let context = self.retrieve_context();
        if payload
            .suspects
            .iter()
            .any(|s| !context.is_participant(*s))
        {
            return Err(InternalError::ProtocolError(Some(message.from())));
        }
        if !payload.suspects.is_empty() {
            warn!(
                "DKG: {} complains about {:?}",
                message.from(),
                payload.suspects
            );
        }
        self.local_storage
            .store_once::<storage::Complaint>(message.from(), payload.suspects)?;
        Ok(())
    }

    /// Drive the protocol through every barrier it can currently pass.
    fn advance(&mut self) -> Result<ProcessOutcome<Output>> {
        let mut outcomes = Vec::new();

        // Round two: once every expected share is in, forward every point
        // we hold to every peer.
        if self.shares_done() {
            let messages = run_only_once!(self.gen_cross_msgs())?;
            for stashed in self.fetch_messages(MessageType::Dkg(DkgMessageType::CrossVerify))? {
                self.store_cross(&stashed)?;
            }
            outcomes.push(ProcessOutcome::from_messages(messages));
        }

        // Round three: once the cross barrier passes, check consistency
        // and broadcast our suspect set.
        if self.ran("gen_cross_msgs") && self.crosses_done() {
            self.run_consistency_checks()?;
            let messages = run_only_once!(self.gen_complaint_msgs())?;
            for stashed in self.fetch_messages(MessageType::Dkg(DkgMessageType::Complaint))? {
                self.store_complaint(&stashed)?;
            }
            outcomes.push(ProcessOutcome::from_messages(messages));
        }

        // Completion: aggregate complaints, exclude, combine.
        if self.ran("gen_complaint_msgs") && self.complaints_done() {
            let output = self.finalize()?;
            self.status = Status::TerminatedSuccessfully;
            outcomes.push(ProcessOutcome::Terminated(output));
        }

        ProcessOutcome::Incomplete.consolidate(outcomes)
    }

    /// Forward every held point `(contributor, us, value)` to every peer.
    #[instrument(skip_all, err(Debug))]
    fn gen_cross_msgs(&mut self) -> Result<Vec<Message>> {
        info!("DKG: {} generating cross-verification messages", self.id());
        let contributors = self.expected_contributors();
        let mut messages = Vec::new();
        for &peer in &self.expected_peers() {
            for &contributor in &contributors {
                let value = *self.local_storage.retrieve::<storage::Share>(contributor)?;
                let payload = CrossPayload {
                    contributor,
                    holder: self.id(),
                    value,
                };
                messages.push(Message::new(
                    MessageType::Dkg(DkgMessageType::CrossVerify),
                    self.sid(),
                    self.id(),
                    peer,
                    payload.encode(),
                ));
            }
        }
        Ok(messages)
    }

    /// Check each contributor's forwarded points for degree-d
    /// consistency, growing the suspect set.
    fn run_consistency_checks(&mut self) -> Result<()> {
        if self.suspects_final {
            return Ok(());
        }
        let degree = self.degree();
        let own_coord = self.id().as_coordinate();

        for contributor in self.expected_contributors() {
            if contributor == self.id() {
                // We know our own polynomial; lies about it are handled by
                // the other observers' complaints.
                continue;
            }
            let mut points = self
                .cross_points
                .get(&contributor)
                .cloned()
                .unwrap_or_default();
            let own_share = *self.local_storage.retrieve::<storage::Share>(contributor)?;
            points.push((own_coord, own_share));
            points.sort();

            if points.len() < degree + 2 {
                // Underdetermined; nothing to disprove.
                continue;
            }

            match best_fit(&points, degree)? {
                Some((poly, agreement)) if poly.eval_at(own_coord) == own_share => {
                    let liars: Vec<u64> = points
                        .iter()
                        .zip(&agreement)
                        .filter(|(_, ok)| !**ok)
                        .map(|(&(x, _), _)| x)
                        .collect();
                    if !liars.is_empty() {
                        warn!(
                            "DKG: {} saw holders {liars:?} misreport {contributor}'s shares",
                            self.id()
                        );
                    }
                }
                _ => {
                    warn!(
                        "DKG: {} found {}'s shares inconsistent",
                        self.id(),
                        contributor
                    );
                    let _ = self.suspects.insert(contributor);
                }
            }
        }
        self.suspects_final = true;
        Ok(())
    }

    /// Broadcast our (possibly empty) suspect set.
    #[instrument(skip_all, err(Debug))]
    fn gen_complaint_msgs(&mut self) -> Result<Vec<Message>> {
        let payload = ComplaintPayload {
            suspects: self.suspects.iter().copied().collect(),
        };
        info!(
            "DKG: {} broadcasting complaint set {:?}",
            self.id(),
            payload.suspects
        );
        self.message_for_other_participants(
            MessageType::Dkg(DkgMessageType::Complaint),
            payload.encode(),
        )
    }

    /// Aggregate complaints, exclude contributors over the threshold, and
    /// combine the surviving evaluations.
    fn finalize(&mut self) -> Result<Output> {
        let t = self.exclusion_threshold();
        let mut counts: HashMap<ParticipantIdentifier, usize> = HashMap::new();
        for suspect in &self.suspects {
            *counts.entry(*suspect).or_default() += 1;
        }
        for peer in self.expected_peers() {
            for suspect in self.local_storage.retrieve::<storage::Complaint>(peer)? {
                *counts.entry(*suspect).or_default() += 1;
            }
        }

        let mut excluded: BTreeSet<ParticipantIdentifier> = counts
            .iter()
            .filter(|(_, &count)| count > t)
            .map(|(&id, _)| id)
            .collect();
        // An absent contributor cannot enter the sum even if too few
        // complaints accumulated against them.
        excluded.extend(self.absent.iter().copied());

        if excluded.contains(&self.id()) {
            error!("DKG: {} was excluded by the committee", self.id());
            return Err(InternalError::DkgFailed);
        }
        let survivors: Vec<ParticipantIdentifier> = self
            .all_participants()
            .into_iter()
            .filter(|id| !excluded.contains(id))
            .collect();
        if survivors.len() < self.input.threshold {
            error!(
                "DKG: only {} contributors survive, below threshold {}",
                survivors.len(),
                self.input.threshold
            );
            return Err(InternalError::DkgFailed);
        }

        let mut combined_share = 0u64;
        let degree = self.degree();
        let own_args = verification_arguments(&self.all_participants(), degree, self.id())?;
        let mut combined_evals = vec![0u64; own_args.len()];
        for &contributor in &survivors {
            let share = self.local_storage.remove::<storage::Share>(contributor)?;
            combined_share = gf61::add(combined_share, share);
            let evals = self.local_storage.remove::<storage::VerEvals>(contributor)?;
            for (sum, eval) in combined_evals.iter_mut().zip(evals) {
                *sum = gf61::add(*sum, eval);
            }
        }

        info!(
            "DKG: {} completed epoch {} deal, {} excluded",
            self.id(),
            self.input.epoch(),
            excluded.len()
        );
        Output::from_parts(
            SigningShare::new(self.id(), combined_share),
            VerificationShares::new(own_args.into_iter().zip(combined_evals).collect())?,
            excluded.into_iter().collect(),
            self.input.threshold,
        )
    }
}

/// Find the degree-`degree` polynomial most points agree with.
///
/// Candidates are the leave-one-out bases and the (degree+1)-windows.
/// Returns the best candidate and its agreement mask when at least
/// degree+2 points lie on it, `None` otherwise.
fn best_fit(
    points: &[(u64, u64)],
    degree: usize,
) -> Result<Option<(InterpolatingPoly, Vec<bool>)>> {
    let n = points.len();
    let basis_len = degree + 1;
    debug_assert!(n >= degree + 2);

    let mut candidates: Vec<Vec<(u64, u64)>> = Vec::with_capacity(2 * n);
    for skip in 0..n {
        candidates.push(
            points
                .iter()
                .enumerate()
                .filter(|(j, _)| *j != skip)
                .map(|(_, p)| *p)
                .take(basis_len)
                .collect(),
        );
    }
    for start in 0..=(n - basis_len) {
        candidates.push(points[start..start + basis_len].to_vec());
    }

    let mut best: Option<(usize, InterpolatingPoly, Vec<bool>)> = None;
    for basis in &candidates {
        let poly = InterpolatingPoly::new(basis)?;
        let agreement: Vec<bool> = points.iter().map(|&(x, y)| poly.eval_at(x) == y).collect();
        let count = agreement.iter().filter(|ok| **ok).count();
        if best.as_ref().map_or(true, |(c, _, _)| count > *c) {
            best = Some((count, poly, agreement));
        }
    }

    Ok(best.and_then(|(count, poly, agreement)| {
        (count >= degree + 2).then_some((poly, agreement))
    }))
}
