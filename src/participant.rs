//! The message-driven protocol participant framework.
//!
//! Every multi-party protocol in the crate (DKG, introduction, signing) is
//! an actor implementing [`ProtocolParticipant`]: a `process_message` entry
//! point that consumes one message and returns a [`ProcessOutcome`] —
//! possibly new outgoing messages, possibly the protocol's output. The
//! framework supplies message stashing for early arrivals, run-once guards
//! for idempotent round generation, and typed local storage.

// Copyright (c) Facebook, Inc. and its affiliates.
// Modifications Copyright (c) 2022-2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

use crate::{
    errors::{CallerError, InternalError, Result},
    local_storage::{LocalStorage, TypeTag},
    messages::{Message, MessageType},
    protocol::{Identifier, ParticipantIdentifier, ProtocolType},
};
use rand::{CryptoRng, RngCore};
use std::collections::HashSet;
use tracing::info;

/// Progress of a protocol run at one participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    /// Created but not yet triggered by a Ready message.
    NotReady,
    /// Processing protocol rounds.
    Running,
    /// Finished and produced an output.
    TerminatedSuccessfully,
}

impl Status {
    /// True once the participant has been triggered.
    pub fn is_ready(&self) -> bool {
        !matches!(self, Status::NotReady)
    }
}

/// The result of processing one message.
#[derive(Debug)]
pub enum ProcessOutcome<O> {
    /// The message was consumed; nothing new to report.
    Incomplete,
    /// New messages to deliver.
    Processed(Vec<Message>),
    /// The protocol finished for this participant.
    Terminated(O),
    /// The protocol finished for this participant and produced messages
    /// other participants still need.
    TerminatedForThisParticipant(O, Vec<Message>),
}

impl<O> ProcessOutcome<O> {
    /// Wrap a batch of outgoing messages.
    pub fn from_messages(messages: Vec<Message>) -> Self {
        if messages.is_empty() {
            Self::Incomplete
        } else {
            Self::Processed(messages)
        }
    }

    /// Split into the optional output and the outgoing messages.
    pub fn into_parts(self) -> (Option<O>, Vec<Message>) {
        match self {
            Self::Incomplete => (None, Vec::new()),
            Self::Processed(messages) => (None, messages),
            Self::Terminated(output) => (Some(output), Vec::new()),
            Self::TerminatedForThisParticipant(output, messages) => (Some(output), messages),
        }
    }

    /// Add messages to this outcome.
    pub fn with_messages(self, messages: Vec<Message>) -> Self {
        let (output, mut all) = self.into_parts();
        all.extend(messages);
        match output {
            Some(output) if all.is_empty() => Self::Terminated(output),
            Some(output) => Self::TerminatedForThisParticipant(output, all),
            None => Self::from_messages(all),
        }
    }

    /// Merge this outcome with a set of others. At most one of them may
    /// carry an output.
    pub fn consolidate(self, others: Vec<Self>) -> Result<Self> {
        let mut merged_output = None;
        let mut merged_messages = Vec::new();
        for outcome in std::iter::once(self).chain(others) {
            let (output, messages) = outcome.into_parts();
            if output.is_some() {
                if merged_output.is_some() {
                    return Err(InternalError::InternalInvariantFailed);
                }
                merged_output = output;
            }
            merged_messages.extend(messages);
        }
        Ok(match (merged_output, merged_messages.is_empty()) {
            (Some(output), true) => Self::Terminated(output),
            (Some(output), false) => {
                Self::TerminatedForThisParticipant(output, merged_messages)
            }
            (None, _) => Self::from_messages(merged_messages),
        })
    }

    /// Merge a set of outcomes and a batch of additional messages.
    pub fn collect_with_messages(outcomes: Vec<Self>, messages: Vec<Message>) -> Result<Self> {
        Self::from_messages(messages).consolidate(outcomes)
    }
}

/// A participant in one run of a multi-party protocol.
pub trait ProtocolParticipant {
    /// Protocol-specific input handed to the constructor.
    type Input;
    /// The output the protocol produces at this participant.
    type Output;

    /// Create a participant for the session `sid`.
    fn new(
        sid: Identifier,
        id: ParticipantIdentifier,
        other_participant_ids: Vec<ParticipantIdentifier>,
        input: Self::Input,
    ) -> Result<Self>
    where
        Self: Sized;

    /// The message type that triggers this protocol at this participant.
    fn ready_type() -> MessageType;

    /// Which protocol this is.
    fn protocol_type() -> ProtocolType;

    /// Our identifier.
    fn id(&self) -> ParticipantIdentifier;

    /// The other participants.
    fn other_ids(&self) -> &[ParticipantIdentifier];

    /// The session identifier.
    fn sid(&self) -> Identifier;

    /// Every participant, ourselves included.
    fn all_participants(&self) -> Vec<ParticipantIdentifier> {
        let mut all = self.other_ids().to_vec();
        all.push(self.id());
        all
    }

    /// Consume one message, returning any output and follow-up messages.
    fn process_message<R: RngCore + CryptoRng>(
        &mut self,
        rng: &mut R,
        message: &Message,
    ) -> Result<ProcessOutcome<Self::Output>>;

    /// Progress of this run.
    fn status(&self) -> &Status;

    /// The Ready message a caller enqueues to itself to start the run.
    fn initialize_message(&self) -> Message {
        Message::new(Self::ready_type(), self.sid(), self.id(), self.id(), Vec::new())
    }
}

/// Internal plumbing shared by participant implementations.
pub(crate) trait InnerProtocolParticipant: ProtocolParticipant {
    /// Context shared across the run, for validating message membership.
    type Context;

    /// Gather the shared context of the run.
    fn retrieve_context(&self) -> Self::Context;

    fn local_storage(&self) -> &LocalStorage;
    fn local_storage_mut(&mut self) -> &mut LocalStorage;
    fn status_mut(&mut self) -> &mut Status;

    /// Messages that arrived before we could handle them.
    fn message_stash_mut(&mut self) -> &mut Vec<Message>;

    /// Keys of round-generation functions that already ran.
    fn once_guards_mut(&mut self) -> &mut HashSet<&'static str>;

    /// Record that the keyed generation ran; true when it had already run.
    fn run_guard(&mut self, key: &'static str) -> bool {
        !self.once_guards_mut().insert(key)
    }

    /// Handle the Ready trigger: mark the participant running.
    fn process_ready_message<R: RngCore + CryptoRng>(
        &mut self,
        _rng: &mut R,
        message: &Message,
    ) -> Result<ProcessOutcome<Self::Output>> {
        message.check_type(Self::ready_type())?;
        if self.status().is_ready() {
            // A duplicate trigger is harmless.
            return Ok(ProcessOutcome::Incomplete);
        }
        info!("{}: ready, starting {:?}", self.id(), Self::protocol_type());
        *self.status_mut() = Status::Running;
        Ok(ProcessOutcome::Incomplete)
    }

    /// Park a message that arrived ahead of its round.
    fn stash_message(&mut self, message: &Message) -> Result<()> {
        self.message_stash_mut().push(message.clone());
        Ok(())
    }

    /// Drain stashed messages of the given type.
    fn fetch_messages(&mut self, message_type: MessageType) -> Result<Vec<Message>> {
        let stash = self.message_stash_mut();
        let mut fetched = Vec::new();
        let mut kept = Vec::new();
        for message in stash.drain(..) {
            if message.message_type() == message_type {
                fetched.push(message);
            } else {
                kept.push(message);
            }
        }
        *stash = kept;
        Ok(fetched)
    }

    /// Fail with a culprit-naming error if a value of type `T` was already
    /// stored for the sender — i.e. the sender sent the same round twice.
    fn check_for_duplicate_msg<T: TypeTag>(&self, sender: ParticipantIdentifier) -> Result<()> {
        if self.local_storage().contains::<T>(sender) {
            return Err(InternalError::ProtocolError(Some(sender)));
        }
        Ok(())
    }

    /// Build one identical message per other participant.
    fn message_for_other_participants(
        &self,
        message_type: MessageType,
        payload: Vec<u8>,
    ) -> Result<Vec<Message>> {
        Ok(self
            .other_ids()
            .iter()
            .map(|&other| {
                Message::new(message_type, self.sid(), self.id(), other, payload.clone())
            })
            .collect())
    }

    /// Fail when a message claims a session other than ours.
    fn check_sid(&self, message: &Message) -> Result<()> {
        if message.id() != self.sid() {
            Err(CallerError::BadInput)?;
        }
        Ok(())
    }
}

/// Run a round-generation method at most once per protocol execution.
///
/// Re-entrant calls (e.g. when two different message arrivals both
/// complete a round) return an empty message batch instead of regenerating
/// and double-sending.
macro_rules! run_only_once {
    ($self:ident . $func:ident ($($arg:expr),* $(,)?)) => {{
        if $self.run_guard(stringify!($func)) {
            Ok(Vec::new())
        } else {
            $self.$func($($arg),*)
        }
    }};
}
pub(crate) use run_only_once;
