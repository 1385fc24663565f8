//! Message envelope and wire format for inter-node protocol traffic.
//!
//! Every message between cores is the tuple
//! `(sender, recipient, channel_run_idx, message_type, payload, mac_tag)`.
//! Field elements are encoded as 8-byte little-endian words and byte
//! strings are length-prefixed. The MAC tag is computed over the payload
//! bytes by the sender↔recipient channel at the message's run index;
//! recipients reject bad MACs and non-monotone run indices before any
//! payload decoding happens.

// Copyright (c) Facebook, Inc. and its affiliates.
// Modifications Copyright (c) 2022-2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

use crate::{
    channel::KeyChannel,
    errors::{CallerError, InternalError, Result},
    protocol::{Identifier, ParticipantIdentifier},
    utils::{put_prefixed, put_u64, ParseBytes},
};
use serde::{Deserialize, Serialize};

/// DKG protocol message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DkgMessageType {
    /// Local trigger to begin the protocol. Never sent on the wire.
    Ready,
    /// A polynomial share plus verification-argument evaluations.
    Share,
    /// A cross-verification forward: `(contributor, holder, value)`.
    CrossVerify,
    /// A broadcast suspect set.
    Complaint,
}

/// Peer-introduction message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntroMessageType {
    /// Ask an introducer to contribute a PSK component for a target.
    Request,
    /// One introducer's uniform PSK component.
    Component,
    /// Confirmation that the synthesized channel opened.
    Ack,
}

/// Threshold-signing message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignMessageType {
    /// A partial signature from one committee member.
    Partial,
    /// A combined signature broadcast.
    Combined,
}

/// Verification and dispute message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VerifyMessageType {
    /// A verifier's accept/reject attestation for a signature.
    Attestation,
}

/// Dispute-resolution message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisputeMessageType {
    /// Open a dispute over a contested signature.
    Open,
}

/// Overlay gossip message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GossipMessageType {
    /// An edge change in the channel graph.
    Edge,
}

/// Every kind of message the core sends or receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    /// Distributed key generation.
    Dkg(DkgMessageType),
    /// Peer introduction.
    Intro(IntroMessageType),
    /// Threshold signing.
    Sign(SignMessageType),
    /// Signature verification attestations.
    Verify(VerifyMessageType),
    /// Dispute resolution.
    Dispute(DisputeMessageType),
    /// Channel-graph gossip.
    Gossip(GossipMessageType),
}

impl MessageType {
    /// Two-byte wire code `(category, kind)`.
    fn wire_code(&self) -> Result<(u8, u8)> {
        let code = match self {
            // The Ready trigger is process-local and has no wire code.
            MessageType::Dkg(DkgMessageType::Ready) => Err(CallerError::BadInput)?,
            MessageType::Dkg(DkgMessageType::Share) => (1, 1),
            MessageType::Dkg(DkgMessageType::CrossVerify) => (1, 2),
            MessageType::Dkg(DkgMessageType::Complaint) => (1, 3),
            MessageType::Intro(IntroMessageType::Request) => (2, 1),
            MessageType::Intro(IntroMessageType::Component) => (2, 2),
            MessageType::Intro(IntroMessageType::Ack) => (2, 3),
            MessageType::Sign(SignMessageType::Partial) => (3, 1),
            MessageType::Sign(SignMessageType::Combined) => (3, 2),
            MessageType::Verify(VerifyMessageType::Attestation) => (4, 1),
            MessageType::Dispute(DisputeMessageType::Open) => (5, 1),
            MessageType::Gossip(GossipMessageType::Edge) => (6, 1),
        };
        Ok(code)
    }

    fn from_wire_code(category: u8, kind: u8) -> Result<Self> {
        let message_type = match (category, kind) {
            (1, 1) => MessageType::Dkg(DkgMessageType::Share),
            (1, 2) => MessageType::Dkg(DkgMessageType::CrossVerify),
            (1, 3) => MessageType::Dkg(DkgMessageType::Complaint),
            (2, 1) => MessageType::Intro(IntroMessageType::Request),
            (2, 2) => MessageType::Intro(IntroMessageType::Component),
            (2, 3) => MessageType::Intro(IntroMessageType::Ack),
            (3, 1) => MessageType::Sign(SignMessageType::Partial),
            (3, 2) => MessageType::Sign(SignMessageType::Combined),
            (4, 1) => MessageType::Verify(VerifyMessageType::Attestation),
            (5, 1) => MessageType::Dispute(DisputeMessageType::Open),
            (6, 1) => MessageType::Gossip(GossipMessageType::Edge),
            _ => Err(CallerError::DeserializationFailed)?,
        };
        Ok(message_type)
    }
}

/// A single protocol message.
///
/// Payload bytes stay unverified until the receiving node has checked the
/// channel MAC; protocol participants only ever see messages that passed
/// that check (or were produced locally).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    message_type: MessageType,
    sid: Identifier,
    from: ParticipantIdentifier,
    to: ParticipantIdentifier,
    run_idx: u64,
    /// The payload bytes, MAC-checked by the node layer but not yet
    /// decoded.
    pub(crate) unverified_bytes: Vec<u8>,
    mac_tag: Option<u64>,
}

impl Message {
    /// Create an unsealed message. The node layer seals it with the peer
    /// channel's MAC before it leaves the process.
    pub fn new(
        message_type: MessageType,
        sid: Identifier,
        from: ParticipantIdentifier,
        to: ParticipantIdentifier,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            message_type,
            sid,
            from,
            to,
            run_idx: 0,
            unverified_bytes: payload,
            mac_tag: None,
        }
    }

    /// The message's type.
    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    /// The session this message belongs to.
    pub fn id(&self) -> Identifier {
        self.sid
    }

    /// The sender.
    pub fn from(&self) -> ParticipantIdentifier {
        self.from
    }

    /// The recipient.
    pub fn to(&self) -> ParticipantIdentifier {
        self.to
    }

    /// The channel run index the MAC was computed at.
    pub fn run_idx(&self) -> u64 {
        self.run_idx
    }

    /// The MAC tag, when sealed.
    pub fn mac_tag(&self) -> Option<u64> {
        self.mac_tag
    }

    /// Error out unless the message has the expected type.
    pub fn check_type(&self, expected: MessageType) -> Result<()> {
        if self.message_type != expected {
            tracing::error!(
                "A message was misrouted. Expected {:?}, got {:?}",
                expected,
                self.message_type
            );
            return Err(InternalError::InternalInvariantFailed);
        }
        Ok(())
    }

    /// MAC the payload with the channel to the recipient at its current
    /// run index.
    pub fn seal<C: KeyChannel>(&mut self, channel: &C) -> Result<()> {
        self.run_idx = channel.run_idx();
        self.mac_tag = Some(channel.mac(&self.unverified_bytes, self.run_idx)?);
        Ok(())
    }

    /// Check the seal against the channel to the sender. An unsealed
    /// message never verifies.
    pub fn verify_seal<C: KeyChannel>(&self, channel: &C) -> Result<bool> {
        match self.mac_tag {
            Some(tag) => channel.verify_mac(&self.unverified_bytes, tag, self.run_idx),
            None => Ok(false),
        }
    }

    /// Encode into the wire tuple. Only sealed messages can be wired.
    pub fn to_wire_bytes(&self) -> Result<Vec<u8>> {
        let tag = self.mac_tag.ok_or(CallerError::BadInput)?;
        let (category, kind) = self.message_type.wire_code()?;
        let mut out = Vec::with_capacity(self.unverified_bytes.len() + 50);
        put_u64(&mut out, self.from.as_coordinate());
        put_u64(&mut out, self.to.as_coordinate());
        put_u64(&mut out, self.run_idx);
        out.push(category);
        out.push(kind);
        put_u64(&mut out, self.sid.as_u64());
        put_prefixed(&mut out, &self.unverified_bytes);
        put_u64(&mut out, tag);
        Ok(out)
    }

    /// Decode from wire bytes. The seal is carried but not yet verified.
    pub fn from_wire_bytes(bytes: Vec<u8>) -> Result<Self> {
        let mut parser = ParseBytes::new(bytes);
        let from = ParticipantIdentifier::new(parser.take_u64()?)
            .map_err(|_| CallerError::DeserializationFailed)?;
        let to = ParticipantIdentifier::new(parser.take_u64()?)
            .map_err(|_| CallerError::DeserializationFailed)?;
        let run_idx = parser.take_u64()?;
        let category = parser.take_bytes(1)?[0];
        let kind = parser.take_bytes(1)?[0];
        let message_type = MessageType::from_wire_code(category, kind)?;
        let sid = Identifier::from_u64(parser.take_u64()?);
        let unverified_bytes = parser.take_prefixed()?;
        let mac_tag = Some(parser.take_u64()?);
        if !parser.is_exhausted() {
            Err(CallerError::DeserializationFailed)?;
        }
        Ok(Self {
            message_type,
            sid,
            from,
            to,
            run_idx,
            unverified_bytes,
            mac_tag,
        })
    }
}
