// Copyright (c) Facebook, Inc. and its affiliates.
// Modifications Copyright (c) 2022-2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

use crate::errors::{CallerError, InternalError, Result};
use zeroize::Zeroize;

/// Serialize a checkpoint-grade value with bincode.
macro_rules! serialize {
    ($x:expr) => {{
        bincode::serialize($x).map_err(|_| crate::errors::InternalError::Serialization)
    }};
}

/// Deserialize a checkpoint-grade value with bincode.
macro_rules! deserialize {
    ($x:expr) => {{
        bincode::deserialize($x).map_err(|_| {
            crate::errors::InternalError::CallingApplicationMistake(
                crate::errors::CallerError::DeserializationFailed,
            )
        })
    }};
}

pub(crate) use deserialize;
pub(crate) use serialize;

/// Helper type for parsing wire bytes into slices and integers.
///
/// This type implements [`Zeroize`]. When parsing secret payloads, call
/// `zeroize()` once parsing is complete.
#[derive(Zeroize)]
pub(crate) struct ParseBytes {
    bytes: Vec<u8>,
    offset: usize,
}

impl ParseBytes {
    /// Consume bytes for parsing.
    pub(crate) fn new(bytes: Vec<u8>) -> ParseBytes {
        ParseBytes { bytes, offset: 0 }
    }

    /// Take the next `n` bytes from the array.
    pub(crate) fn take_bytes(&mut self, n: usize) -> Result<&[u8]> {
        let slice = self
            .bytes
            .get(self.offset..self.offset + n)
            .ok_or(CallerError::DeserializationFailed)?;
        self.offset += n;
        Ok(slice)
    }

    /// Parse the next 8 bytes as a little-endian `u64` — the wire encoding
    /// of a field element or run index.
    pub(crate) fn take_u64(&mut self) -> Result<u64> {
        const WORD_BYTES: usize = 8;
        let slice = self.take_bytes(WORD_BYTES)?;
        let bytes: [u8; WORD_BYTES] = slice
            .try_into()
            .map_err(|_| InternalError::InternalInvariantFailed)?;
        Ok(u64::from_le_bytes(bytes))
    }

    /// Parse the next 8 bytes as a little-endian length prefix.
    pub(crate) fn take_len(&mut self) -> Result<usize> {
        let len = self.take_u64()?;
        usize::try_from(len).map_err(|_| CallerError::DeserializationFailed.into())
    }

    /// Take a length-prefixed byte string.
    pub(crate) fn take_prefixed(&mut self) -> Result<Vec<u8>> {
        let len = self.take_len()?;
        Ok(self.take_bytes(len)?.to_vec())
    }

    /// True when every byte has been consumed.
    pub(crate) fn is_exhausted(&self) -> bool {
        self.offset == self.bytes.len()
    }
}

/// Append a `u64` in the 8-byte little-endian wire encoding.
pub(crate) fn put_u64(out: &mut Vec<u8>, value: u64) {
    out.extend_from_slice(&value.to_le_bytes());
}

/// Append a length-prefixed byte string.
pub(crate) fn put_prefixed(out: &mut Vec<u8>, bytes: &[u8]) {
    put_u64(out, bytes.len() as u64);
    out.extend_from_slice(bytes);
}

/// Append a counted list of participant identifiers.
pub(crate) fn put_id_list(out: &mut Vec<u8>, ids: &[crate::protocol::ParticipantIdentifier]) {
    put_u64(out, ids.len() as u64);
    for id in ids {
        put_u64(out, id.as_coordinate());
    }
}

/// Parse a counted list of participant identifiers.
pub(crate) fn take_id_list(
    parser: &mut ParseBytes,
) -> Result<Vec<crate::protocol::ParticipantIdentifier>> {
    let count = parser.take_len()?;
    let mut ids = Vec::with_capacity(count);
    for _ in 0..count {
        ids.push(
            crate::protocol::ParticipantIdentifier::new(parser.take_u64()?)
                .map_err(|_| CallerError::DeserializationFailed)?,
        );
    }
    Ok(ids)
}

////////////////////////////
// Test Utility Functions //
////////////////////////////

#[cfg(test)]
pub(crate) mod testing {
    use rand::{
        rngs::{OsRng, StdRng},
        Rng, SeedableRng,
    };

    /// Returns an rng to be used for testing. This will print the rng seed
    /// to stderr so that if a test fails, the failing seed can be recovered
    /// and used for debugging.
    pub(crate) fn init_testing() -> StdRng {
        let mut seeder = OsRng;
        let seed = seeder.gen();
        eprintln!(
            "To re-run test with the same randomness, use init_testing_with_seed() with the following seed:"
        );
        eprintln!("\t{seed:?}");
        StdRng::from_seed(seed)
    }

    /// A seeded version of [`init_testing`], for reproducing a failed run.
    ///
    /// **Additionally, turns on logging by default.** Only call while
    /// debugging; leaving it in a committed test turns on logging for the
    /// whole test binary.
    #[allow(unused)]
    pub(crate) fn init_testing_with_seed(seed: [u8; 32]) -> StdRng {
        use tracing_subscriber::{
            filter::Targets, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer,
        };

        let logging_level = EnvFilter::from_default_env()
            .max_level_hint()
            .and_then(|h| h.into_level())
            .unwrap_or(tracing::Level::DEBUG);

        // Only capture logging events from this crate.
        let targets = Targets::new().with_target("liun", logging_level);
        let stdout_layer = tracing_subscriber::fmt::layer()
            .pretty()
            .with_filter(targets);

        // It's okay if this fails. It just means logging has already been
        // set up for this thread.
        let _ = tracing_subscriber::registry().with(stdout_layer).try_init();

        StdRng::from_seed(seed)
    }
}
