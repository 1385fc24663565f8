//! Error taxonomy for the crate.
//!
//! Errors are split into two levels. [`CallerError`] covers mistakes and
//! recoverable conditions surfaced to the calling application: invalid
//! parameters, exhausted signature budgets, missing introducers, and so on.
//! [`InternalError`] covers invariant violations and Byzantine evidence
//! observed during protocol execution. `CallerError` converts into
//! `InternalError` so handlers can write `Err(CallerError::X)?` and let the
//! orchestrator sort out which failures are retryable.

// Copyright (c) Facebook, Inc. and its affiliates.
// Modifications Copyright (c) 2022-2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

use crate::protocol::ParticipantIdentifier;
use thiserror::Error;

/// The default `Result` type for the crate.
pub type Result<T> = std::result::Result<T, InternalError>;

/// Errors caused by the calling application: bad inputs, protocol misuse,
/// or recoverable protocol-level failures the caller is expected to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CallerError {
    /// Attempted to invert zero in GF(M61).
    #[error("cannot invert zero in GF(M61)")]
    DivisionByZero,
    /// A structurally invalid input (duplicate x-coordinates, empty share
    /// set, malformed peer metadata).
    #[error("invalid input")]
    InvalidInput,
    /// Parameters outside their documented domain (k < 1, n < k, secret
    /// outside the field).
    #[error("invalid parameters")]
    InvalidParams,
    /// Fewer shares or partial signatures than the threshold requires.
    #[error("insufficient shares for the requested threshold")]
    InsufficientShares,
    /// The local node is not a member of the supplied signing committee, or
    /// the committee contains repeated identifiers.
    #[error("invalid signing committee")]
    InvalidCommittee,
    /// The epoch's signature budget is spent; signing must wait for the
    /// successor epoch.
    #[error("signature budget exhausted for this epoch")]
    BudgetExhausted,
    /// Not enough mutual contacts to run a peer introduction.
    #[error("insufficient mutual contacts")]
    InsufficientMutualContacts,
    /// No live introducer channel remains for the requested introduction.
    #[error("no introducers available")]
    NoIntroducers,
    /// Bootstrap could not obtain a single clean PSK across all candidates.
    #[error("no clean bootstrap path")]
    NoCleanPath,
    /// Operation on a channel that has been closed.
    #[error("channel is closed")]
    ChannelClosed,
    /// A message was passed to a protocol that already terminated.
    #[error("protocol already terminated")]
    ProtocolAlreadyTerminated,
    /// Wire bytes did not decode to the expected payload.
    #[error("deserialization failed")]
    DeserializationFailed,
    /// Catch-all for malformed protocol inputs.
    #[error("bad input")]
    BadInput,
}

/// Errors internal to protocol execution: broken invariants and Byzantine
/// evidence. These degrade the operation, never the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum InternalError {
    /// An invariant the implementation relies on did not hold.
    #[error("internal invariant failed")]
    InternalInvariantFailed,
    /// A participant misbehaved during a protocol run. Carries the culprit
    /// when it can be identified.
    #[error("protocol error, culprit {0:?}")]
    ProtocolError(Option<ParticipantIdentifier>),
    /// A message failed MAC verification on the channel to the given peer.
    #[error("MAC verification failed on channel to {0}")]
    MacFailure(ParticipantIdentifier),
    /// A message arrived with a run index older than the last accepted one.
    #[error("replayed run index on channel to {0}")]
    RunIndexReplay(ParticipantIdentifier),
    /// DKG did not produce a combined polynomial for the requested epoch.
    #[error("distributed key generation failed")]
    DkgFailed,
    /// Serialization of checkpoint or wire state failed.
    #[error("serialization failure")]
    Serialization,
    /// Wrapper for caller mistakes detected mid-protocol.
    #[error("calling application mistake: {0}")]
    CallingApplicationMistake(#[from] CallerError),
}

impl InternalError {
    /// Returns the underlying [`CallerError`], if this error wraps one.
    pub fn caller_error(&self) -> Option<CallerError> {
        match self {
            InternalError::CallingApplicationMistake(e) => Some(*e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caller_errors_convert_with_question_mark() {
        fn fails() -> Result<()> {
            Err(CallerError::BudgetExhausted)?
        }
        let err = fails().unwrap_err();
        assert_eq!(err.caller_error(), Some(CallerError::BudgetExhausted));
    }

    #[test]
    fn internal_errors_carry_no_caller_error() {
        assert_eq!(InternalError::DkgFailed.caller_error(), None);
    }
}
