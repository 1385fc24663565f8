//! The ITS key-channel seam.
//!
//! The core consumes the underlying key primitive through the
//! [`KeyChannel`] capability trait: key-byte generation, a Wegman-Carter
//! polynomial MAC over GF(M61), and a monotone run index. Two backends are
//! known — the physics-backed Liu primitive (external) and the
//! deterministic [`SimulatedChannel`] used by tests and simulation. Both
//! endpoints of a channel derive identical bytes and identical MACs from
//! the same PSK, run index, and input.

// Copyright (c) Facebook, Inc. and its affiliates.
// Modifications Copyright (c) 2022-2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

use crate::{
    errors::{CallerError, Result},
    gf61,
    protocol::ParticipantIdentifier,
    psk,
};
use sha3::{Digest, Sha3_256};
use std::fmt::{Debug, Formatter};
use zeroize::Zeroizing;

/// Lifecycle state of a channel. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    /// Key material flows; MACs verify.
    Active,
    /// No recent traffic; still usable.
    Idle,
    /// Torn down. Every subsequent operation fails.
    Closed,
}

/// Capability interface over an ITS key channel.
///
/// Implementations must guarantee: (i) both endpoints produce identical
/// key bytes and MAC outputs for identical (PSK, run index, input);
/// (ii) `advance_run` is strictly monotonic; (iii) all methods fail with
/// [`CallerError::ChannelClosed`] after `close`.
pub trait KeyChannel {
    /// Open a channel to `peer` seeded by `psk_bytes`.
    fn open(
        local: ParticipantIdentifier,
        peer: ParticipantIdentifier,
        psk_bytes: &[u8],
    ) -> Result<Self>
    where
        Self: Sized;

    /// The peer at the far end.
    fn peer(&self) -> ParticipantIdentifier;

    /// Draw `n` fresh pseudo-one-time-pad bytes for the current run.
    fn generate_key_bytes(&mut self, n: usize) -> Result<Vec<u8>>;

    /// Wegman-Carter MAC over `data` at `run_idx`. Forgery probability is
    /// at most L/M61 per tag, L the data length in field elements.
    fn mac(&self, data: &[u8], run_idx: u64) -> Result<u64>;

    /// Check a MAC tag.
    fn verify_mac(&self, data: &[u8], tag: u64, run_idx: u64) -> Result<bool> {
        Ok(self.mac(data, run_idx)? == tag)
    }

    /// Advance to the next run, retiring the previous run's key material.
    /// Returns the new run index.
    fn advance_run(&mut self) -> Result<u64>;

    /// The current run index.
    fn run_idx(&self) -> u64;

    /// Current lifecycle state.
    fn status(&self) -> ChannelStatus;

    /// Demote an active channel to idle after a quiet period. Idle
    /// channels still generate key material and MAC; [`wake`](Self::wake)
    /// or fresh traffic promotes them back. No-op on a closed channel.
    fn set_idle(&mut self);

    /// Promote an idle channel back to active. No-op on a closed channel.
    fn wake(&mut self);

    /// Tear the channel down. Terminal.
    fn close(&mut self);

    /// Draw a fresh PSK-sized block of key material, for seeding a
    /// replacement channel without a new bootstrap.
    fn recycle_psk(&mut self) -> Result<Vec<u8>> {
        self.generate_key_bytes(psk::DEFAULT_PSK_LEN)
    }
}

/// Extract the per-run MAC keys `(r, s)` from a PSK.
///
/// Mirrors the Liu PSK layout: bytes `[32 + run_idx·18 + 2 ..)` hold two
/// big-endian 8-byte words, reduced into the field.
fn psk_mac_keys(psk: &[u8], run_idx: u64) -> Result<(u64, u64)> {
    let off = 32 + run_idx as usize * 18 + 2;
    if off + 16 > psk.len() {
        Err(CallerError::InvalidInput)?;
    }
    let r = u64::from_be_bytes(psk[off..off + 8].try_into().expect("slice is 8 bytes"))
        % gf61::M61;
    let s = u64::from_be_bytes(psk[off + 8..off + 16].try_into().expect("slice is 8 bytes"))
        % gf61::M61;
    Ok((r, s))
}

/// Chunk data bytes into field coefficients, 7 bytes per element so the
/// encoding is injective, with the byte length appended as the final
/// coefficient to separate prefixes.
fn data_coefficients(data: &[u8]) -> Vec<u64> {
    let mut coeffs: Vec<u64> = data
        .chunks(7)
        .map(|chunk| {
            let mut word = [0u8; 8];
            word[..chunk.len()].copy_from_slice(chunk);
            u64::from_le_bytes(word)
        })
        .collect();
    coeffs.push(data.len() as u64);
    coeffs
}

/// Wegman-Carter tag: evaluate the data polynomial at `r`, one-time-pad
/// with `s`.
fn mac_tag(coeffs: &[u64], r: u64, s: u64) -> u64 {
    gf61::add(gf61::poly_eval(coeffs, r), s)
}

/// Deterministic channel backend for tests and simulation.
///
/// Key bytes come from a SHA3-256 chain over a counter seeded by the first
/// 32 PSK bytes, so the two endpoints of a channel (same PSK, lockstep
/// consumption) observe the same stream. The MAC is the real GF(M61)
/// computation, identical to the physics-backed channel's.
pub struct SimulatedChannel {
    local: ParticipantIdentifier,
    peer: ParticipantIdentifier,
    psk: Zeroizing<Vec<u8>>,
    status: ChannelStatus,
    run_idx: u64,
    stream_counter: u64,
    total_bytes: u64,
}

impl Debug for SimulatedChannel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedChannel")
            .field("local", &self.local)
            .field("peer", &self.peer)
            .field("psk", &"[redacted]")
            .field("status", &self.status)
            .field("run_idx", &self.run_idx)
            .finish()
    }
}

impl SimulatedChannel {
    fn check_active(&self) -> Result<()> {
        if self.status == ChannelStatus::Closed {
            Err(CallerError::ChannelClosed)?;
        }
        Ok(())
    }

    /// Total key bytes drawn so far.
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }
}

impl KeyChannel for SimulatedChannel {
    fn open(
        local: ParticipantIdentifier,
        peer: ParticipantIdentifier,
        psk_bytes: &[u8],
    ) -> Result<Self> {
        if psk_bytes.len() < psk::min_psk_len(0) {
            Err(CallerError::InvalidInput)?;
        }
        Ok(Self {
            local,
            peer,
            psk: Zeroizing::new(psk_bytes.to_vec()),
            status: ChannelStatus::Active,
            run_idx: 0,
            stream_counter: 0,
            total_bytes: 0,
        })
    }

    fn peer(&self) -> ParticipantIdentifier {
        self.peer
    }

    fn generate_key_bytes(&mut self, n: usize) -> Result<Vec<u8>> {
        self.check_active()?;
        let mut out = Vec::with_capacity(n + 32);
        while out.len() < n {
            self.stream_counter += 1;
            let mut hasher = Sha3_256::new();
            hasher.update(&self.psk[..32]);
            hasher.update(self.stream_counter.to_le_bytes());
            out.extend_from_slice(&hasher.finalize());
        }
        out.truncate(n);
        self.total_bytes += n as u64;
        Ok(out)
    }

    fn mac(&self, data: &[u8], run_idx: u64) -> Result<u64> {
        self.check_active()?;
        let (r, s) = psk_mac_keys(&self.psk, run_idx)?;
        Ok(mac_tag(&data_coefficients(data), r, s))
    }

    fn advance_run(&mut self) -> Result<u64> {
        self.check_active()?;
        self.run_idx += 1;
        Ok(self.run_idx)
    }

    fn run_idx(&self) -> u64 {
        self.run_idx
    }

    fn status(&self) -> ChannelStatus {
        self.status
    }

    fn set_idle(&mut self) {
        if self.status == ChannelStatus::Active {
            self.status = ChannelStatus::Idle;
        }
    }

    fn wake(&mut self) {
        if self.status == ChannelStatus::Idle {
            self.status = ChannelStatus::Active;
        }
    }

    fn close(&mut self) {
        self.status = ChannelStatus::Closed;
    }
}
