//! The node orchestrator: one identity binding channels, overlay, trust,
//! epochs, and the in-flight protocol sessions.
//!
//! A node is the addressable unit of the network. Every outgoing message
//! is sealed with the recipient channel's MAC at its current run index;
//! every incoming message is MAC- and run-index-checked before any
//! payload is decoded, and Byzantine transport evidence degrades the
//! channel and schedules reintroduction. Beyond transport, the node is a
//! dispatcher: DKG traffic drives the epoch deal, introduction traffic
//! synthesizes channels, signing traffic collects partials into combined
//! signatures, gossip keeps the graph view fresh.

// Copyright (c) Facebook, Inc. and its affiliates.
// Modifications Copyright (c) 2022-2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

use crate::{
    bootstrap::{select_diverse, MultiPathBootstrap, PeerInfo, RouteAdversary},
    channel::KeyChannel,
    dkg::{self, DkgParticipant},
    epoch::EpochManager,
    errors::{CallerError, InternalError, Result},
    intro::{
        self, AckPayload, ComponentPayload, IntroSession, RequestPayload, MIN_INTRODUCERS,
    },
    messages::{
        DisputeMessageType, GossipMessageType, IntroMessageType, Message, MessageType,
        SignMessageType, VerifyMessageType,
    },
    overlay::{GossipEdge, GraphHealth, Overlay},
    participant::ProtocolParticipant,
    protocol::{Identifier, ParticipantIdentifier},
    psk::expand_psk,
    trust::{personalized_pagerank, TrustVector},
    uss::{
        self, AttestationReport, DisputeVerdict, PartialSignature, Signature, SignatureBudget,
        Signer, SigningShare, Verification, VerificationShares,
    },
    utils::{deserialize, put_id_list, put_u64, serialize, take_id_list, ParseBytes},
};
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::{error, info, instrument, warn};
use zeroize::Zeroizing;

/// A request-or-response carrying one committee member's partial
/// signature.
#[derive(Debug, Clone, PartialEq, Eq)]
struct SignPartialPayload {
    message: u64,
    committee: Vec<ParticipantIdentifier>,
    partial: u64,
}

impl SignPartialPayload {
    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(24 + 8 * self.committee.len());
        put_u64(&mut out, self.message);
        put_id_list(&mut out, &self.committee);
        put_u64(&mut out, self.partial);
        out
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        let mut parser = ParseBytes::new(bytes.to_vec());
        let message = parser.take_u64()?;
        let committee = take_id_list(&mut parser)?;
        let partial = parser.take_u64()?;
        if !parser.is_exhausted() {
            Err(CallerError::DeserializationFailed)?;
        }
        Ok(Self {
            message,
            committee,
            partial,
        })
    }
}

/// A combined signature broadcast, and the dispute-open payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SignaturePayload {
    message: u64,
    sigma: u64,
}

impl SignaturePayload {
    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16);
        put_u64(&mut out, self.message);
        put_u64(&mut out, self.sigma);
        out
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        let mut parser = ParseBytes::new(bytes.to_vec());
        let message = parser.take_u64()?;
        let sigma = parser.take_u64()?;
        if !parser.is_exhausted() {
            Err(CallerError::DeserializationFailed)?;
        }
        Ok(Self { message, sigma })
    }
}

/// A verifier's accept/reject attestation for a contested signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct AttestationPayload {
    message: u64,
    sigma: u64,
    accepted: bool,
}

impl AttestationPayload {
    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(24);
        put_u64(&mut out, self.message);
        put_u64(&mut out, self.sigma);
        put_u64(&mut out, self.accepted as u64);
        out
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        let mut parser = ParseBytes::new(bytes.to_vec());
        let message = parser.take_u64()?;
        let sigma = parser.take_u64()?;
        let accepted = match parser.take_u64()? {
            0 => false,
            1 => true,
            _ => Err(CallerError::DeserializationFailed)?,
        };
        if !parser.is_exhausted() {
            Err(CallerError::DeserializationFailed)?;
        }
        Ok(Self {
            message,
            sigma,
            accepted,
        })
    }
}

/// Partial signatures collected for a message this node is combining.
#[derive(Debug)]
struct SigningRound {
    committee: Vec<ParticipantIdentifier>,
    threshold: usize,
    partials: Vec<PartialSignature>,
}

/// Checkpointed node state (§ persisted state). The signing share is
/// XOR-masked with key-derived bytes; nothing here is plaintext signing
/// capability without the checkpoint key.
#[derive(Serialize, Deserialize)]
struct Checkpoint {
    identity: u64,
    epoch_id: u64,
    degree: usize,
    masked_share: u64,
    verification_points: Vec<(u64, u64)>,
    budget: SignatureBudget,
    peers: Vec<u64>,
}

fn checkpoint_mask(key: &[u8]) -> u64 {
    let bytes = expand_psk(key, 8);
    u64::from_le_bytes(bytes.try_into().expect("expander returned 8 bytes"))
}

/// One Liun participant.
pub struct Node<C: KeyChannel> {
    id: ParticipantIdentifier,
    overlay: Overlay<C>,
    epochs: EpochManager,
    trust_cache: Option<TrustVector>,
    dkg: Option<DkgParticipant>,
    intro_sessions: HashMap<ParticipantIdentifier, IntroSession>,
    signing_rounds: HashMap<u64, SigningRound>,
    answered_sign_requests: HashSet<(u64, ParticipantIdentifier)>,
    signatures: HashMap<u64, Signature>,
    attestations: HashMap<(u64, u64), Vec<AttestationReport>>,
}

impl<C: KeyChannel> Node<C> {
    /// A fresh node with no channels and no epoch.
    pub fn new(id: ParticipantIdentifier) -> Self {
        Self {
            id,
            overlay: Overlay::new(id),
            epochs: EpochManager::new(),
            trust_cache: None,
            dkg: None,
            intro_sessions: HashMap::new(),
            signing_rounds: HashMap::new(),
            answered_sign_requests: HashSet::new(),
            signatures: HashMap::new(),
            attestations: HashMap::new(),
        }
    }

    /// This node's identity.
    pub fn id(&self) -> ParticipantIdentifier {
        self.id
    }

    /// The overlay state.
    pub fn overlay(&self) -> &Overlay<C> {
        &self.overlay
    }

    /// Mutable overlay access (graph maintenance, channel rotation).
    pub fn overlay_mut(&mut self) -> &mut Overlay<C> {
        &mut self.overlay
    }

    /// The epoch manager.
    pub fn epochs(&self) -> &EpochManager {
        &self.epochs
    }

    /// Open a channel from out-of-band PSK agreement (the receiving side
    /// of a bootstrap, or a test harness). Returns gossip announcements
    /// for the new edge.
    pub fn accept_channel(
        &mut self,
        peer: ParticipantIdentifier,
        psk: &[u8],
    ) -> Result<Vec<Message>> {
        self.overlay.open_channel(peer, psk)?;
        self.trust_cache = None;
        self.gossip_edge(peer, true)
    }

    /// Bootstrap channels to a diverse selection of `k` candidates.
    ///
    /// Returns the per-target PSKs (whose far ends reconstruct the same
    /// bytes from their route shares) and the gossip announcements for
    /// the opened edges. Fails with [`CallerError::NoCleanPath`] when the
    /// adversary observed every route.
    pub fn bootstrap<R: RngCore + CryptoRng>(
        &mut self,
        candidates: &[PeerInfo],
        k: usize,
        adversary: &mut dyn RouteAdversary,
        rng: &mut R,
    ) -> Result<(HashMap<ParticipantIdentifier, Zeroizing<Vec<u8>>>, Vec<Message>)> {
        let selected = select_diverse(candidates, k)?;
        let report = MultiPathBootstrap::new(k)?.bootstrap(&selected, adversary, rng)?;
        let mut announcements = Vec::new();
        for (peer, psk) in &report.psks {
            announcements.extend(self.accept_channel(*peer, psk)?);
        }
        info!(
            "{}: bootstrap opened {} channels ({} clean)",
            self.id,
            report.psks.len(),
            report.clean
        );
        Ok((report.psks, announcements))
    }

    /// Ask mutual contacts to introduce us to `target`.
    ///
    /// Fails with [`CallerError::InsufficientMutualContacts`] when the
    /// graph knows too few, and [`CallerError::NoIntroducers`] when too
    /// few of them have live channels to us.
    #[instrument(skip_all, fields(target = %target))]
    pub fn introduce_to(&mut self, target: ParticipantIdentifier) -> Result<Vec<Message>> {
        let mutual = self.overlay.find_mutual_contacts(target, MIN_INTRODUCERS)?;
        let live: Vec<ParticipantIdentifier> = mutual
            .into_iter()
            .filter(|&peer| self.overlay.channel(peer).is_ok())
            .take(2 * MIN_INTRODUCERS)
            .collect();
        if live.len() < MIN_INTRODUCERS {
            Err(CallerError::NoIntroducers)?;
        }

        let session = IntroSession::new(self.id, target, &live)?;
        let _ = self.intro_sessions.insert(target, session);
        let payload = RequestPayload {
            target,
            introducers: live.clone(),
        };
        let messages = live
            .iter()
            .map(|&introducer| {
                Message::new(
                    MessageType::Intro(IntroMessageType::Request),
                    Identifier::from_u64(target.as_coordinate()),
                    self.id,
                    introducer,
                    payload.encode(),
                )
            })
            .collect();
        self.seal_all(messages)
    }

    /// Start a DKG for the next epoch over the given committee.
    ///
    /// Every committee member runs this with the same committee and
    /// threshold; the session identifier is derived from the epoch so all
    /// participants agree on it.
    pub fn advance_epoch<R: RngCore + CryptoRng>(
        &mut self,
        committee: &[ParticipantIdentifier],
        threshold: usize,
        rng: &mut R,
    ) -> Result<Vec<Message>> {
        if self.dkg.is_some() {
            Err(CallerError::ProtocolAlreadyTerminated)?;
        }
        let others: Vec<ParticipantIdentifier> = committee
            .iter()
            .copied()
            .filter(|&id| id != self.id)
            .collect();
        if others.len() == committee.len() {
            Err(CallerError::InvalidCommittee)?;
        }
        let epoch = self.epochs.next_epoch_id();
        let sid = Identifier::from_u64(epoch);
        let mut participant =
            DkgParticipant::new(sid, self.id, others, dkg::Input::new(threshold, epoch))?;
        let ready = participant.initialize_message();
        let outcome = participant.process_message(rng, &ready)?;
        self.dkg = Some(participant);
        let (_, messages) = outcome.into_parts();
        self.seal_all(messages)
    }

    /// Initiate a threshold signature on `message` with `committee`.
    ///
    /// Our partial is computed immediately (consuming budget); the
    /// combined signature appears via [`signature_for`](Self::signature_for)
    /// once enough committee partials arrive.
    pub fn sign(
        &mut self,
        message: u64,
        committee: &[ParticipantIdentifier],
    ) -> Result<Vec<Message>> {
        let threshold = self.epochs.threshold()?;
        if committee.len() < threshold {
            Err(CallerError::InsufficientShares)?;
        }
        let partial = self.epochs.partial_sign(message, committee)?;
        let round = SigningRound {
            committee: committee.to_vec(),
            threshold,
            partials: vec![partial],
        };
        let _ = self.signing_rounds.insert(message, round);

        let payload = SignPartialPayload {
            message,
            committee: committee.to_vec(),
            partial: partial.value,
        };
        let messages = committee
            .iter()
            .filter(|&&id| id != self.id)
            .map(|&peer| {
                Message::new(
                    MessageType::Sign(SignMessageType::Partial),
                    Identifier::from_u64(message),
                    self.id,
                    peer,
                    payload.encode(),
                )
            })
            .collect();
        self.seal_all(messages)
    }

    /// A combined signature this node has produced or learned.
    pub fn signature_for(&self, message: u64) -> Option<Signature> {
        self.signatures.get(&message).copied()
    }

    /// Verify a signature against the current epoch (and the retiring
    /// epoch during its grace period).
    pub fn verify(&self, message: u64, sigma: u64) -> Result<Verification> {
        self.epochs.verify(message, sigma)
    }

    /// Broadcast a dispute over a contested signature; peers answer with
    /// attestations.
    pub fn open_dispute(&mut self, message: u64, sigma: u64) -> Result<Vec<Message>> {
        let own = self.verify(message, sigma)?;
        self.record_attestation(
            message,
            sigma,
            AttestationReport {
                verifier: self.id,
                accepted: own.accepted && !own.insufficient_points,
            },
        );
        let payload = SignaturePayload { message, sigma };
        let messages = self
            .overlay
            .live_peers()
            .into_iter()
            .map(|peer| {
                Message::new(
                    MessageType::Dispute(DisputeMessageType::Open),
                    Identifier::from_u64(message),
                    self.id,
                    peer,
                    payload.encode(),
                )
            })
            .collect();
        self.seal_all(messages)
    }

    /// Adjudicate a dispute from the attestations collected so far,
    /// weighted by this node's trust vector.
    pub fn resolve_dispute(&mut self, message: u64, sigma: u64) -> Result<DisputeVerdict> {
        let reports = self
            .attestations
            .get(&(message, sigma))
            .cloned()
            .unwrap_or_default();
        let trust = self.trust().clone();
        Ok(uss::resolve_dispute(&reports, &trust))
    }

    /// This node's trust vector over its current graph view, cached until
    /// the graph changes.
    pub fn trust(&mut self) -> &TrustVector {
        if self.trust_cache.is_none() {
            let snapshot = self.overlay.snapshot();
            self.trust_cache = Some(personalized_pagerank(self.id, &snapshot));
        }
        self.trust_cache.as_ref().expect("just computed")
    }

    /// Trust-weighted acceptance over this node's trust vector.
    pub fn accept_by_trust(&mut self, attestations: &[ParticipantIdentifier]) -> bool {
        let trust = self.trust().clone();
        crate::trust::trust_weighted_accept(attestations, &trust)
    }

    /// Switch signing to the successor epoch.
    pub fn cutover(&mut self) -> Result<u64> {
        self.epochs.cutover()
    }

    /// End the retired epoch's verification grace period.
    pub fn freeze_retired(&mut self) {
        self.epochs.freeze_retired()
    }

    /// Run the overlay's graph monitor.
    pub fn check_health(&mut self) -> GraphHealth {
        self.overlay.check_health()
    }

    /// Mark a DKG peer absent after a round timeout.
    pub fn note_dkg_timeout(&mut self, peer: ParticipantIdentifier) -> Result<Vec<Message>> {
        let participant = self.dkg.as_mut().ok_or(CallerError::BadInput)?;
        let outcome = participant.note_timeout(peer)?;
        let (output, messages) = outcome.into_parts();
        if let Some(output) = output {
            self.install_dkg_output(output);
        }
        self.seal_all(messages)
    }

    /// Process one incoming message: transport checks first, then
    /// dispatch. Returns the sealed follow-up messages.
    #[instrument(skip_all, fields(node = %self.id))]
    pub fn handle_message<R: RngCore + CryptoRng>(
        &mut self,
        message: &Message,
        rng: &mut R,
    ) -> Result<Vec<Message>> {
        if message.to() != self.id {
            Err(CallerError::BadInput)?;
        }
        let sender = message.from();

        // Transport authentication precedes any payload decoding.
        let sealed_ok = {
            let channel = self.overlay.channel(sender)?;
            message.verify_seal(channel)?
        };
        if !sealed_ok {
            error!("{}: MAC failure on message from {}", self.id, sender);
            self.overlay.degrade_channel(sender);
            self.trust_cache = None;
            return Err(InternalError::MacFailure(sender));
        }
        if let Err(replay) = self
            .overlay
            .table_mut()
            .check_and_record_run(sender, message.run_idx())
        {
            error!("{}: replayed run index from {}", self.id, sender);
            self.overlay.degrade_channel(sender);
            self.trust_cache = None;
            return Err(replay);
        }
        self.overlay.table_mut().touch(sender);

        let outgoing = match message.message_type() {
            MessageType::Dkg(_) => self.handle_dkg(message, rng)?,
            MessageType::Intro(IntroMessageType::Request) => self.handle_intro_request(message, rng)?,
            MessageType::Intro(IntroMessageType::Component) => self.handle_intro_component(message)?,
            MessageType::Intro(IntroMessageType::Ack) => {
                let ack = AckPayload::decode(&message.unverified_bytes)?;
                if ack.target != self.id {
                    Err(CallerError::BadInput)?;
                }
                info!("{}: channel to {} confirmed", self.id, sender);
                Vec::new()
            }
            MessageType::Sign(SignMessageType::Partial) => self.handle_sign_partial(message)?,
            MessageType::Sign(SignMessageType::Combined) => {
                let payload = SignaturePayload::decode(&message.unverified_bytes)?;
                let verification = self.verify(payload.message, payload.sigma)?;
                if verification.accepted && !verification.insufficient_points {
                    let _ = self.signatures.insert(
                        payload.message,
                        Signature {
                            message: payload.message,
                            sigma: payload.sigma,
                        },
                    );
                } else {
                    // Rejected outright, or vacuously accepted with too
                    // few points — neither is a verified signature.
                    warn!(
                        "{}: dropped combined signature on {} from {}",
                        self.id, payload.message, sender
                    );
                }
                Vec::new()
            }
            MessageType::Verify(VerifyMessageType::Attestation) => {
                let payload = AttestationPayload::decode(&message.unverified_bytes)?;
                self.record_attestation(
                    payload.message,
                    payload.sigma,
                    AttestationReport {
                        verifier: sender,
                        accepted: payload.accepted,
                    },
                );
                Vec::new()
            }
            MessageType::Dispute(DisputeMessageType::Open) => {
                let payload = SignaturePayload::decode(&message.unverified_bytes)?;
                let verification = self.verify(payload.message, payload.sigma)?;
                let reply = AttestationPayload {
                    message: payload.message,
                    sigma: payload.sigma,
                    accepted: verification.accepted && !verification.insufficient_points,
                };
                vec![Message::new(
                    MessageType::Verify(VerifyMessageType::Attestation),
                    message.id(),
                    self.id,
                    sender,
                    reply.encode(),
                )]
            }
            MessageType::Gossip(GossipMessageType::Edge) => {
                let edge = GossipEdge::decode(&message.unverified_bytes)?;
                if self.overlay.apply_gossip(edge) {
                    self.trust_cache = None;
                    // Epidemic forwarding: only novel facts travel on.
                    self.overlay
                        .live_peers()
                        .into_iter()
                        .filter(|&peer| peer != sender)
                        .map(|peer| {
                            Message::new(
                                MessageType::Gossip(GossipMessageType::Edge),
                                message.id(),
                                self.id,
                                peer,
                                edge.encode(),
                            )
                        })
                        .collect()
                } else {
                    Vec::new()
                }
            }
        };
        self.seal_all(outgoing)
    }

    /// Checkpoint (identity, epoch, masked signing share, verification
    /// shares, budget, peer set). The signing share is XOR-masked with
    /// bytes derived from `key` and never stored in plaintext.
    pub fn checkpoint(&self, key: &[u8]) -> Result<Vec<u8>> {
        let epoch = self
            .epochs
            .current()
            .ok_or(InternalError::DkgFailed)?;
        let signer = epoch.signer();
        let checkpoint = Checkpoint {
            identity: self.id.as_coordinate(),
            epoch_id: epoch.id(),
            degree: epoch.degree(),
            masked_share: signer.share_value() ^ checkpoint_mask(key),
            verification_points: signer.verification_shares().points().to_vec(),
            budget: signer.budget().clone(),
            peers: self
                .overlay
                .live_peers()
                .into_iter()
                .map(|p| p.as_coordinate())
                .collect(),
        };
        serialize!(&checkpoint)
    }

    /// Restore a node from checkpoint bytes. Channels are not restored —
    /// the recorded peers are queued for reintroduction.
    pub fn restore(key: &[u8], bytes: &[u8]) -> Result<Self> {
        let checkpoint: Checkpoint = deserialize!(bytes)?;
        let id = ParticipantIdentifier::new(checkpoint.identity)?;
        let mut node = Self::new(id);
        let share = SigningShare::new(id, checkpoint.masked_share ^ checkpoint_mask(key));
        let signer = Signer::restore(
            share,
            VerificationShares::new(checkpoint.verification_points)?,
            checkpoint.degree,
            checkpoint.budget,
        );
        node.epochs.restore_current(checkpoint.epoch_id, signer);
        for peer in checkpoint.peers {
            node.overlay
                .schedule_reintroduction(ParticipantIdentifier::new(peer)?);
        }
        Ok(node)
    }

    fn handle_dkg<R: RngCore + CryptoRng>(
        &mut self,
        message: &Message,
        rng: &mut R,
    ) -> Result<Vec<Message>> {
        let participant = self.dkg.as_mut().ok_or(CallerError::BadInput)?;
        match participant.process_message(rng, message) {
            Ok(outcome) => {
                let (output, messages) = outcome.into_parts();
                if let Some(output) = output {
                    self.install_dkg_output(output);
                }
                Ok(messages)
            }
            Err(InternalError::DkgFailed) => {
                // The deal failed; the previous epoch stays in force.
                error!("{}: DKG failed, keeping previous epoch", self.id);
                self.dkg = None;
                Err(InternalError::DkgFailed)
            }
            Err(other) => Err(other),
        }
    }

    fn install_dkg_output(&mut self, output: dkg::Output) {
        self.dkg = None;
        let id = self.epochs.install_epoch(output);
        info!("{}: epoch {id} installed", self.id);
        // Accelerate cutover when signing is already blocked.
        if self.epochs.has_successor() {
            let blocked = self
                .epochs
                .current()
                .map(|epoch| !epoch.budget().can_sign())
                .unwrap_or(false);
            if blocked {
                if let Ok(new_id) = self.epochs.cutover() {
                    info!("{}: accelerated cutover to epoch {new_id}", self.id);
                }
            }
        }
    }

    fn handle_intro_request<R: RngCore + CryptoRng>(
        &mut self,
        message: &Message,
        rng: &mut R,
    ) -> Result<Vec<Message>> {
        let payload = RequestPayload::decode(&message.unverified_bytes)?;
        let initiator = message.from();
        // We can only vouch for a pair we hold both channels of.
        self.overlay.channel(payload.target)?;
        let component = intro::sample_component(rng);
        info!(
            "{}: introducing {} to {}",
            self.id, initiator, payload.target
        );
        let out = ComponentPayload {
            initiator,
            target: payload.target,
            introducers: payload.introducers,
            component: component.to_vec(),
        };
        Ok(vec![
            Message::new(
                MessageType::Intro(IntroMessageType::Component),
                message.id(),
                self.id,
                initiator,
                out.encode(),
            ),
            Message::new(
                MessageType::Intro(IntroMessageType::Component),
                message.id(),
                self.id,
                payload.target,
                out.encode(),
            ),
        ])
    }

    fn handle_intro_component(&mut self, message: &Message) -> Result<Vec<Message>> {
        let payload = ComponentPayload::decode(&message.unverified_bytes)?;
        let far_end = if payload.initiator == self.id {
            payload.target
        } else if payload.target == self.id {
            payload.initiator
        } else {
            Err(CallerError::BadInput)?
        };

        // The target side learns the introducer set from the first
        // component.
        if !self.intro_sessions.contains_key(&far_end) {
            let session =
                IntroSession::new(payload.initiator, payload.target, &payload.introducers)?;
            let _ = self.intro_sessions.insert(far_end, session);
        }
        let session = self
            .intro_sessions
            .get_mut(&far_end)
            .expect("session present");

        let Some(psk) = session.add_component(message.from(), payload.component)? else {
            return Ok(Vec::new());
        };
        let _ = self.intro_sessions.remove(&far_end);
        self.overlay.open_channel(far_end, &psk)?;
        self.trust_cache = None;

        let mut messages = vec![Message::new(
            MessageType::Intro(IntroMessageType::Ack),
            message.id(),
            self.id,
            far_end,
            AckPayload { target: far_end }.encode(),
        )];
        messages.extend(self.gossip_edge(far_end, true)?);
        Ok(messages)
    }

    fn handle_sign_partial(&mut self, message: &Message) -> Result<Vec<Message>> {
        let payload = SignPartialPayload::decode(&message.unverified_bytes)?;
        let sender = message.from();
        if !payload.committee.contains(&sender) {
            return Err(InternalError::ProtocolError(Some(sender)));
        }

        if let Some(round) = self.signing_rounds.get_mut(&payload.message) {
            // We are combining: ingest the sender's partial.
            if !round.committee.contains(&sender) {
                return Err(InternalError::ProtocolError(Some(sender)));
            }
            if round.partials.iter().any(|p| p.signer == sender) {
                return Ok(Vec::new());
            }
            round.partials.push(PartialSignature {
                signer: sender,
                value: payload.partial,
            });
            if round.partials.len() >= round.threshold {
                let signature =
                    uss::combine(payload.message, &round.partials, round.threshold)?;
                let verification = self.verify(signature.message, signature.sigma)?;
                if !verification.accepted {
                    // A committee member contributed garbage; surface it.
                    warn!(
                        "{}: combined signature on {} failed self-verification",
                        self.id, signature.message
                    );
                    return Err(InternalError::ProtocolError(None));
                }
                let _ = self.signing_rounds.remove(&payload.message);
                let _ = self.signatures.insert(payload.message, signature);
                let broadcast = SignaturePayload {
                    message: signature.message,
                    sigma: signature.sigma,
                };
                return Ok(self
                    .overlay
                    .live_peers()
                    .into_iter()
                    .map(|peer| {
                        Message::new(
                            MessageType::Sign(SignMessageType::Combined),
                            message.id(),
                            self.id,
                            peer,
                            broadcast.encode(),
                        )
                    })
                    .collect());
            }
            return Ok(Vec::new());
        }

        // A request: contribute our partial back to the collector, once.
        if !payload.committee.contains(&self.id) {
            Err(CallerError::InvalidCommittee)?;
        }
        if !self
            .answered_sign_requests
            .insert((payload.message, sender))
        {
            return Ok(Vec::new());
        }
        let partial = self.epochs.partial_sign(payload.message, &payload.committee)?;
        let reply = SignPartialPayload {
            message: payload.message,
            committee: payload.committee,
            partial: partial.value,
        };
        Ok(vec![Message::new(
            MessageType::Sign(SignMessageType::Partial),
            message.id(),
            self.id,
            sender,
            reply.encode(),
        )])
    }

    fn record_attestation(&mut self, message: u64, sigma: u64, report: AttestationReport) {
        let reports = self.attestations.entry((message, sigma)).or_default();
        if reports.iter().all(|r| r.verifier != report.verifier) {
            reports.push(report);
        }
    }

    fn gossip_edge(&mut self, peer: ParticipantIdentifier, added: bool) -> Result<Vec<Message>> {
        let edge = GossipEdge {
            a: self.id,
            b: peer,
            added,
        };
        let messages = self
            .overlay
            .live_peers()
            .into_iter()
            .filter(|&other| other != peer)
            .map(|other| {
                Message::new(
                    MessageType::Gossip(GossipMessageType::Edge),
                    Identifier::from_u64(peer.as_coordinate()),
                    self.id,
                    other,
                    edge.encode(),
                )
            })
            .collect();
        self.seal_all(messages)
    }

    /// Seal outgoing messages with their recipients' channel MACs.
    fn seal_all(&mut self, messages: Vec<Message>) -> Result<Vec<Message>> {
        let mut sealed = Vec::with_capacity(messages.len());
        for mut message in messages {
            let channel = self.overlay.channel(message.to())?;
            message.seal(channel)?;
            self.overlay.table_mut().touch(message.to());
            sealed.push(message);
        }
        Ok(sealed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelStatus, SimulatedChannel};
    use crate::psk::DEFAULT_PSK_LEN;
    use crate::utils::testing::init_testing;
    use itertools::Itertools;
    use rand::{rngs::StdRng, Rng};
    use std::collections::VecDeque;

    type TestNode = Node<SimulatedChannel>;

    fn pid(n: u64) -> ParticipantIdentifier {
        ParticipantIdentifier::from_u64(n)
    }

    fn connect(
        nodes: &mut HashMap<u64, TestNode>,
        a: u64,
        b: u64,
        rng: &mut StdRng,
    ) -> Vec<Message> {
        let psk: Vec<u8> = (0..DEFAULT_PSK_LEN).map(|_| rng.gen()).collect();
        let mut out = nodes
            .get_mut(&a)
            .unwrap()
            .accept_channel(pid(b), &psk)
            .unwrap();
        out.extend(
            nodes
                .get_mut(&b)
                .unwrap()
                .accept_channel(pid(a), &psk)
                .unwrap(),
        );
        out
    }

    /// Deliver messages until quiescence. Messages that hit a
    /// not-yet-open channel are retried a few times (an introduction Ack
    /// can race the last component); everything else must succeed.
    fn drive(
        nodes: &mut HashMap<u64, TestNode>,
        initial: Vec<Message>,
        rng: &mut StdRng,
    ) {
        let mut queue: VecDeque<(Message, usize)> =
            initial.into_iter().map(|m| (m, 0)).collect();
        while let Some((message, attempts)) = queue.pop_front() {
            let node = nodes
                .get_mut(&message.to().as_coordinate())
                .expect("recipient exists");
            match node.handle_message(&message, rng) {
                Ok(outgoing) => queue.extend(outgoing.into_iter().map(|m| (m, 0))),
                Err(err)
                    if err.caller_error() == Some(CallerError::ChannelClosed)
                        && attempts < 64 =>
                {
                    queue.push_back((message, attempts + 1));
                }
                Err(err) => panic!("delivery failed: {err:?}"),
            }
        }
    }

    /// A full mesh of `n` nodes with pairwise channels.
    fn mesh(n: u64, rng: &mut StdRng) -> HashMap<u64, TestNode> {
        let mut nodes: HashMap<u64, TestNode> =
            (1..=n).map(|i| (i, TestNode::new(pid(i)))).collect();
        let mut announcements = Vec::new();
        for (a, b) in (1..=n).tuple_combinations::<(u64, u64)>() {
            announcements.extend(connect(&mut nodes, a, b, rng));
        }
        drive(&mut nodes, announcements, rng);
        nodes
    }

    fn run_dkg(nodes: &mut HashMap<u64, TestNode>, threshold: usize, rng: &mut StdRng) {
        let committee: Vec<ParticipantIdentifier> =
            nodes.keys().copied().map(pid).collect();
        let mut initial = Vec::new();
        for node in nodes.values_mut() {
            initial.extend(node.advance_epoch(&committee, threshold, rng).unwrap());
        }
        drive(nodes, initial, rng);
        for node in nodes.values() {
            assert!(node.epochs().current().is_some());
        }
    }

    #[test]
    fn lifecycle_dkg_sign_verify_across_nodes() {
        let mut rng = init_testing();
        let mut nodes = mesh(5, &mut rng);
        run_dkg(&mut nodes, 3, &mut rng);

        // Committee {1, 3, 5} signs message 42; everyone learns and
        // verifies the combined signature.
        let committee: Vec<_> = [1, 3, 5].map(pid).to_vec();
        let initial = nodes
            .get_mut(&1)
            .unwrap()
            .sign(42, &committee)
            .unwrap();
        drive(&mut nodes, initial, &mut rng);

        // Trust-weighted acceptance over the mesh: everyone suffices, a
        // single non-seed attestor does not.
        let everyone: Vec<_> = (1..=5).map(pid).collect();
        assert!(nodes.get_mut(&1).unwrap().accept_by_trust(&everyone));
        assert!(!nodes.get_mut(&1).unwrap().accept_by_trust(&[pid(2)]));

        let signature = nodes[&1].signature_for(42).expect("combined");
        for node in nodes.values() {
            // The broadcast reached everyone.
            assert_eq!(node.signature_for(42), Some(signature));
            let verification = node.verify(42, signature.sigma).unwrap();
            assert!(verification.accepted);
            assert!(!verification.insufficient_points);
            // A shifted sigma is a forgery.
            let forged = crate::gf61::add(signature.sigma, 1);
            assert!(!node.verify(42, forged).unwrap().accepted);
        }
    }

    #[test]
    fn mac_failure_degrades_the_channel() {
        let mut rng = init_testing();
        let mut nodes = mesh(2, &mut rng);

        let mut message = Message::new(
            MessageType::Gossip(GossipMessageType::Edge),
            Identifier::from_u64(1),
            pid(1),
            pid(2),
            GossipEdge {
                a: pid(1),
                b: pid(2),
                added: true,
            }
            .encode(),
        );
        {
            let sender = nodes.get_mut(&1).unwrap();
            let channel = sender.overlay().channel(pid(2)).unwrap();
            message.seal(channel).unwrap();
        }
        // Tamper after sealing.
        message.unverified_bytes[0] ^= 0x01;

        let receiver = nodes.get_mut(&2).unwrap();
        let err = receiver.handle_message(&message, &mut rng).unwrap_err();
        assert_eq!(err, InternalError::MacFailure(pid(1)));
        assert!(receiver.overlay().channel(pid(1)).is_err());
        assert_eq!(
            receiver.overlay_mut().take_reintroduction_queue(),
            vec![pid(1)]
        );
    }

    #[test]
    fn replayed_run_index_is_rejected() {
        let mut rng = init_testing();
        let mut nodes = mesh(2, &mut rng);

        let build = |nodes: &HashMap<u64, TestNode>| {
            let mut message = Message::new(
                MessageType::Gossip(GossipMessageType::Edge),
                Identifier::from_u64(1),
                pid(1),
                pid(2),
                GossipEdge {
                    a: pid(1),
                    b: pid(9),
                    added: true,
                }
                .encode(),
            );
            let channel = nodes[&1].overlay().channel(pid(2)).unwrap();
            message.seal(channel).unwrap();
            message
        };

        let old = build(&nodes);
        // Sender advances its run; messages now carry run 1.
        nodes
            .get_mut(&1)
            .unwrap()
            .overlay_mut()
            .channel_mut(pid(2))
            .unwrap()
            .advance_run()
            .unwrap();
        let fresh = build(&nodes);

        let receiver = nodes.get_mut(&2).unwrap();
        let _ = receiver.handle_message(&fresh, &mut rng).unwrap();
        let err = receiver.handle_message(&old, &mut rng).unwrap_err();
        assert_eq!(err, InternalError::RunIndexReplay(pid(1)));
        assert!(receiver.overlay().channel(pid(1)).is_err());
    }

    #[test]
    fn gossip_floods_to_distant_nodes() {
        let mut rng = init_testing();
        let mut nodes: HashMap<u64, TestNode> =
            (1..=4).map(|i| (i, TestNode::new(pid(i)))).collect();
        // Line topology 1 — 2 — 3.
        let mut announcements = connect(&mut nodes, 1, 2, &mut rng);
        announcements.extend(connect(&mut nodes, 2, 3, &mut rng));
        drive(&mut nodes, announcements, &mut rng);

        // Node 3 opens a channel to 4; the fact reaches node 1 by
        // epidemic forwarding.
        let announcements = connect(&mut nodes, 3, 4, &mut rng);
        drive(&mut nodes, announcements, &mut rng);
        assert!(nodes[&1].overlay().graph().has_edge(pid(3), pid(4)));
    }

    #[test]
    fn introduction_synthesizes_a_working_channel() {
        let mut rng = init_testing();
        let mut nodes: HashMap<u64, TestNode> =
            (1..=5).map(|i| (i, TestNode::new(pid(i)))).collect();
        // A = 1, C = 5, introducers 2, 3, 4.
        let mut announcements = Vec::new();
        for introducer in 2..=4 {
            announcements.extend(connect(&mut nodes, 1, introducer, &mut rng));
            announcements.extend(connect(&mut nodes, introducer, 5, &mut rng));
        }
        drive(&mut nodes, announcements, &mut rng);

        let initial = nodes.get_mut(&1).unwrap().introduce_to(pid(5)).unwrap();
        drive(&mut nodes, initial, &mut rng);

        // Both endpoints hold a live channel and can MAC to each other.
        assert!(nodes[&1].overlay().channel(pid(5)).is_ok());
        assert!(nodes[&5].overlay().channel(pid(1)).is_ok());
        let tag = {
            let channel = nodes[&1].overlay().channel(pid(5)).unwrap();
            assert_eq!(channel.status(), ChannelStatus::Active);
            channel.mac(b"synthesized", 0).unwrap()
        };
        assert!(nodes[&5]
            .overlay()
            .channel(pid(1))
            .unwrap()
            .verify_mac(b"synthesized", tag, 0)
            .unwrap());
        // The new edge was gossiped outwards.
        assert!(nodes[&2].overlay().graph().has_edge(pid(1), pid(5)));
    }

    #[test]
    fn introduction_needs_mutual_contacts() {
        let mut rng = init_testing();
        let mut nodes: HashMap<u64, TestNode> =
            (1..=3).map(|i| (i, TestNode::new(pid(i)))).collect();
        let announcements = connect(&mut nodes, 1, 2, &mut rng);
        drive(&mut nodes, announcements, &mut rng);

        let err = nodes.get_mut(&1).unwrap().introduce_to(pid(3)).unwrap_err();
        assert_eq!(
            err.caller_error(),
            Some(CallerError::InsufficientMutualContacts)
        );
    }

    #[test]
    fn dispute_resolution_is_trust_weighted() {
        let mut rng = init_testing();
        let mut nodes = mesh(5, &mut rng);
        run_dkg(&mut nodes, 3, &mut rng);

        let committee: Vec<_> = [1, 2, 3].map(pid).to_vec();
        let initial = nodes.get_mut(&1).unwrap().sign(99, &committee).unwrap();
        drive(&mut nodes, initial, &mut rng);
        let signature = nodes[&1].signature_for(99).unwrap();

        // Genuine signature: everyone attests acceptance.
        let initial = nodes
            .get_mut(&2)
            .unwrap()
            .open_dispute(99, signature.sigma)
            .unwrap();
        drive(&mut nodes, initial, &mut rng);
        assert_eq!(
            nodes
                .get_mut(&2)
                .unwrap()
                .resolve_dispute(99, signature.sigma)
                .unwrap(),
            DisputeVerdict::Valid
        );

        // A forged sigma: unanimous weighted rejection.
        let forged = crate::gf61::add(signature.sigma, 7);
        let initial = nodes.get_mut(&2).unwrap().open_dispute(99, forged).unwrap();
        drive(&mut nodes, initial, &mut rng);
        assert_eq!(
            nodes.get_mut(&2).unwrap().resolve_dispute(99, forged).unwrap(),
            DisputeVerdict::Forged
        );
    }

    #[test]
    fn budget_rotation_across_epochs() {
        // Threshold 11 on an 11-node mesh gives degree 10 and budget 5.
        let mut rng = init_testing();
        let mut nodes = mesh(11, &mut rng);
        run_dkg(&mut nodes, 11, &mut rng);
        let committee: Vec<_> = (1..=11).map(pid).collect();

        for message in 1..=5 {
            let initial = nodes
                .get_mut(&1)
                .unwrap()
                .sign(message, &committee)
                .unwrap();
            drive(&mut nodes, initial, &mut rng);
            assert!(nodes[&1].signature_for(message).is_some());
        }
        let old_signature = nodes[&1].signature_for(5).unwrap();

        let err = nodes.get_mut(&1).unwrap().sign(6, &committee).unwrap_err();
        assert_eq!(err.caller_error(), Some(CallerError::BudgetExhausted));

        // Overlap deal: everyone advances; with budgets spent, installs
        // trigger accelerated cutovers; any stragglers cut over
        // explicitly.
        run_dkg(&mut nodes, 11, &mut rng);
        for node in nodes.values_mut() {
            if node.epochs().has_successor() {
                let _ = node.cutover().unwrap();
            }
        }

        let initial = nodes.get_mut(&1).unwrap().sign(6, &committee).unwrap();
        drive(&mut nodes, initial, &mut rng);
        let new_signature = nodes[&1].signature_for(6).unwrap();
        for node in nodes.values() {
            assert!(node.verify(6, new_signature.sigma).unwrap().accepted);
            // Grace period: the old epoch's signatures still verify.
            assert!(node.verify(5, old_signature.sigma).unwrap().accepted);
        }

        // After freezing, the old epoch stops verifying.
        nodes.get_mut(&1).unwrap().freeze_retired();
        assert!(!nodes[&1].verify(5, old_signature.sigma).unwrap().accepted);
    }

    #[test]
    fn checkpoint_round_trips_without_leaking_the_share() {
        let mut rng = init_testing();
        let mut nodes = mesh(4, &mut rng);
        run_dkg(&mut nodes, 3, &mut rng);

        let key = b"checkpoint encryption key";
        let bytes = nodes[&2].checkpoint(key).unwrap();

        // The plaintext share value must not appear in the checkpoint.
        let share_value = nodes[&2]
            .epochs()
            .current()
            .unwrap()
            .signer()
            .share_value();
        assert!(!bytes
            .windows(8)
            .any(|w| w == share_value.to_le_bytes()));

        let mut restored: TestNode = Node::restore(key, &bytes).unwrap();
        assert_eq!(restored.id(), pid(2));
        assert_eq!(
            restored.epochs().current().unwrap().id(),
            nodes[&2].epochs().current().unwrap().id()
        );
        // The restored node still produces correct partials: a committee
        // of restored-2 plus live 1 and 3 signs, and node 4 verifies.
        let committee: Vec<_> = [1, 2, 3].map(pid).to_vec();
        let p2 = restored.epochs.partial_sign(123, &committee).unwrap();
        let p1 = nodes
            .get_mut(&1)
            .unwrap()
            .epochs
            .partial_sign(123, &committee)
            .unwrap();
        let p3 = nodes
            .get_mut(&3)
            .unwrap()
            .epochs
            .partial_sign(123, &committee)
            .unwrap();
        let signature = uss::combine(123, &[p1, p2, p3], 3).unwrap();
        assert!(nodes[&4].verify(123, signature.sigma).unwrap().accepted);
        // Restored peers await reintroduction.
        assert_eq!(
            restored.overlay_mut().take_reintroduction_queue().len(),
            3
        );
    }

    #[test]
    fn bootstrap_opens_channels_to_diverse_candidates() {
        use crate::bootstrap::PassiveNetwork;

        let mut rng = init_testing();
        let mut joiner = TestNode::new(pid(20));
        let candidates: Vec<PeerInfo> = (1..=6)
            .map(|i| PeerInfo {
                id: pid(i),
                region: ["us", "eu", "ap"][(i % 3) as usize].into(),
            })
            .collect();

        let (psks, _announcements) = joiner
            .bootstrap(&candidates, 4, &mut PassiveNetwork, &mut rng)
            .unwrap();
        assert_eq!(psks.len(), 4);
        assert_eq!(joiner.overlay().table().count(), 4);

        // The far end reconstructs the same secret and lands on the same
        // channel keys.
        let (&peer, psk) = psks.iter().next().unwrap();
        let mut far = TestNode::new(peer);
        let _ = far.accept_channel(pid(20), psk).unwrap();
        let tag = joiner
            .overlay()
            .channel(peer)
            .unwrap()
            .mac(b"bootstrapped", 0)
            .unwrap();
        assert!(far
            .overlay()
            .channel(pid(20))
            .unwrap()
            .verify_mac(b"bootstrapped", tag, 0)
            .unwrap());
    }

    #[test]
    fn wrong_checkpoint_key_yields_a_wrong_share() {
        let mut rng = init_testing();
        let mut nodes = mesh(4, &mut rng);
        run_dkg(&mut nodes, 3, &mut rng);

        let bytes = nodes[&2].checkpoint(b"right key").unwrap();
        let restored: TestNode = Node::restore(b"wrong key", &bytes).unwrap();
        let genuine = nodes[&2]
            .epochs()
            .current()
            .unwrap()
            .signer()
            .share_value();
        assert_ne!(
            restored.epochs().current().unwrap().signer().share_value(),
            genuine
        );
    }
}
