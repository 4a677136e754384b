//! SHA256 double-hashing and byte-order helpers.

use sha2::{Digest, Sha256};
use thiserror::Error;

/// Bitcoin's double SHA256: SHA256(SHA256(data)).
///
/// This is used for block header hashing, transaction IDs, and merkle trees.
#[inline]
pub fn double_sha256(data: &[u8]) -> [u8; 32] {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    let mut result = [0u8; 32];
    result.copy_from_slice(&second);
    result
}

/// Double SHA256 of `left || right`, the parent of two merkle nodes.
#[inline]
pub fn hash_pair(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    let mut combined = [0u8; 64];
    combined[..32].copy_from_slice(left);
    combined[32..].copy_from_slice(right);
    double_sha256(&combined)
}

/// SHA256 state after absorbing the first 64 bytes of a block header.
///
/// The first compression block covers the version, the previous block hash
/// and the first 28 bytes of the merkle root. None of those change while the
/// nonce or the timestamp roll, so the state is computed once per header and
/// cloned for every attempt.
#[derive(Clone)]
pub struct Midstate {
    state: Sha256,
}

impl Midstate {
    /// Absorb the time- and nonce-independent prefix of `header`.
    pub fn new(header: &[u8; 80]) -> Self {
        let mut state = Sha256::new();
        state.update(&header[..64]);
        Midstate { state }
    }

    /// Finish the double hash given the last 16 header bytes
    /// (merkle root tail, time, bits, nonce).
    #[inline]
    pub fn header_hash(&self, tail: &[u8]) -> [u8; 32] {
        let mut first = self.state.clone();
        first.update(tail);
        let second = Sha256::digest(first.finalize());
        let mut result = [0u8; 32];
        result.copy_from_slice(&second);
        result
    }
}

/// Error parsing a hash from its hex display form.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseHashError {
    #[error("invalid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),

    #[error("hash must be 32 bytes, got {0}")]
    InvalidLength(usize),
}

/// Parse a hash shown in display order (as RPC returns it) into internal byte order.
pub fn hash_from_display_hex(display: &str) -> Result<[u8; 32], ParseHashError> {
    let bytes = hex::decode(display.trim())?;
    if bytes.len() != 32 {
        return Err(ParseHashError::InvalidLength(bytes.len()));
    }
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&bytes);
    Ok(reverse_bytes(&hash))
}

/// Reverse the byte order of a 32-byte array.
///
/// Bitcoin often displays hashes in reverse byte order (little-endian display).
#[inline]
pub fn reverse_bytes(bytes: &[u8; 32]) -> [u8; 32] {
    let mut reversed = *bytes;
    reversed.reverse();
    reversed
}

/// Convert a hash to its display format (reversed hex).
pub fn hash_to_display_hex(hash: &[u8; 32]) -> String {
    hex::encode(reverse_bytes(hash))
}

/// Count leading zero bits in the DISPLAYED hash format.
///
/// Bitcoin hashes are displayed in reversed byte order, so the "leading zeros"
/// you see in a block hash like "00000000000..." correspond to the TRAILING
/// bytes of the internal hash representation.
pub fn count_leading_zeros(hash: &[u8; 32]) -> u32 {
    let mut zeros = 0u32;
    for byte in hash.iter().rev() {
        if *byte == 0 {
            zeros += 8;
        } else {
            zeros += byte.leading_zeros();
            break;
        }
    }
    zeros
}
