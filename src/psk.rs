//! PSK derivation and length expansion.
//!
//! `expand_psk` is the named seam for the Toeplitz-style ITS expander: it
//! stretches a short shared secret to full channel-PSK length while
//! preserving min-entropy up to a small slack. SHAKE-256 stands in for the
//! Toeplitz matrix multiply; swapping in the true primitive changes no
//! caller.

// Copyright (c) Facebook, Inc. and its affiliates.
// Modifications Copyright (c) 2022-2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

use sha3::{
    digest::{ExtendableOutput, Update, XofReader},
    Shake256,
};

/// Default PSK length in bytes: 32 bytes of stream seed plus MAC-key
/// material for a dozen channel runs.
pub const DEFAULT_PSK_LEN: usize = 256;

/// Byte length of one introduction/bootstrap secret before expansion.
pub const SECRET_LEN: usize = 32;

/// Minimum PSK length able to serve MAC runs `0..=run_idx`.
///
/// Matches the Liu PSK layout: a 32-byte stream seed followed by an
/// 18-byte block per run, of which bytes 2..18 hold the two MAC keys.
pub fn min_psk_len(run_idx: u64) -> usize {
    32 + (run_idx as usize + 1) * 18
}

/// Expand seed bytes to `target_len` bytes of PSK material.
pub fn expand_psk(seed: &[u8], target_len: usize) -> Vec<u8> {
    let mut hasher = Shake256::default();
    hasher.update(seed);
    let mut reader = hasher.finalize_xof();
    let mut out = vec![0u8; target_len];
    reader.read(&mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expansion_is_deterministic_and_length_preserving() {
        let a = expand_psk(b"shared secret", DEFAULT_PSK_LEN);
        let b = expand_psk(b"shared secret", DEFAULT_PSK_LEN);
        assert_eq!(a, b);
        assert_eq!(a.len(), DEFAULT_PSK_LEN);
    }

    #[test]
    fn distinct_seeds_expand_distinctly() {
        let a = expand_psk(b"seed one", 64);
        let b = expand_psk(b"seed two", 64);
        assert_ne!(a, b);
    }

    #[test]
    fn default_psk_serves_several_runs() {
        assert!(min_psk_len(0) <= DEFAULT_PSK_LEN);
        assert!(min_psk_len(11) <= DEFAULT_PSK_LEN);
        assert!(min_psk_len(13) > DEFAULT_PSK_LEN);
    }
}
