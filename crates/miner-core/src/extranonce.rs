//! Extranonce values embedded in the coinbase scriptSig.
//!
//! Extranonce1 is fixed for a job and shared by every worker. Extranonce2 is
//! what separates one worker's coinbase (and therefore Merkle root) from
//! another's, so each concurrently running worker must hold a distinct value.

use std::fmt;

use thiserror::Error;

/// Largest extranonce2 width we support.
pub const MAX_EXTRANONCE2_SIZE: u8 = 8;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum Extranonce2Error {
    #[error("invalid extranonce2 size: {0} (must be 1-8 bytes)")]
    InvalidSize(u8),

    #[error("value {0:#x} exceeds maximum for size {1} bytes")]
    ValueTooLarge(u64, u8),

    #[error("invalid extranonce hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),

    #[error("{workers} workers do not fit in a {size}-byte extranonce2")]
    SpaceExhausted { workers: usize, size: u8 },
}

/// Session-assigned extranonce1 bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Extranonce1(Vec<u8>);

impl Extranonce1 {
    pub fn from_hex(s: &str) -> Result<Self, Extranonce2Error> {
        Ok(Extranonce1(hex::decode(s.trim())?))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Extranonce1 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0))
    }
}

/// A specific extranonce2 value with fixed size.
///
/// The value serializes big-endian at exactly `size` bytes, so the hex form
/// shown in logs is the byte sequence placed in the scriptSig.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Extranonce2 {
    value: u64,
    size: u8,
}

impl Extranonce2 {
    /// Returns an error if the size is not 1-8 bytes or the value does not fit.
    pub fn new(value: u64, size: u8) -> Result<Self, Extranonce2Error> {
        validate_size(size)?;

        if value > max_for_size(size) {
            return Err(Extranonce2Error::ValueTooLarge(value, size));
        }

        Ok(Self { value, size })
    }

    /// Parse a hex string of exactly `size` bytes.
    pub fn from_hex(s: &str, size: u8) -> Result<Self, Extranonce2Error> {
        validate_size(size)?;

        let bytes = hex::decode(s.trim())?;
        if bytes.len() > size as usize {
            let value = bytes.iter().fold(0u128, |acc, b| (acc << 8) | *b as u128);
            return Err(Extranonce2Error::ValueTooLarge(
                value.min(u64::MAX as u128) as u64,
                size,
            ));
        }

        let value = bytes.iter().fold(0u64, |acc, b| (acc << 8) | *b as u64);
        Self::new(value, size)
    }

    pub fn value(&self) -> u64 {
        self.value
    }

    pub fn size(&self) -> u8 {
        self.size
    }

    /// Serialized bytes, big-endian at the configured width.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.value.to_be_bytes()[8 - self.size as usize..].to_vec()
    }
}

impl fmt::Display for Extranonce2 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:0width$x}", self.value, width = self.size as usize * 2)
    }
}

/// Hands out one extranonce2 per worker for a job.
///
/// Worker `i` receives `base + i` modulo the value space of the configured
/// width. As long as the worker count does not exceed that space the values
/// are pairwise distinct.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtranonceAllocator {
    base: Extranonce2,
}

impl ExtranonceAllocator {
    pub fn new(base: Extranonce2) -> Self {
        ExtranonceAllocator { base }
    }

    pub fn from_hex(base: &str, size: u8) -> Result<Self, Extranonce2Error> {
        Ok(Self::new(Extranonce2::from_hex(base, size)?))
    }

    pub fn base(&self) -> Extranonce2 {
        self.base
    }

    pub fn size(&self) -> u8 {
        self.base.size
    }

    /// Number of distinct values the configured width can hold.
    pub fn capacity(&self) -> u128 {
        max_for_size(self.base.size) as u128 + 1
    }

    /// Extranonce2 for a single worker index.
    pub fn for_worker(&self, index: usize) -> Extranonce2 {
        let modulus = self.capacity();
        let value = (self.base.value as u128 + index as u128) % modulus;
        Extranonce2 {
            value: value as u64,
            size: self.base.size,
        }
    }

    /// Assign extranonce2 values to `workers` workers.
    pub fn allocate(&self, workers: usize) -> Result<Vec<Extranonce2>, Extranonce2Error> {
        if workers as u128 > self.capacity() {
            return Err(Extranonce2Error::SpaceExhausted {
                workers,
                size: self.base.size,
            });
        }

        Ok((0..workers).map(|i| self.for_worker(i)).collect())
    }
}

fn validate_size(size: u8) -> Result<(), Extranonce2Error> {
    if size == 0 || size > MAX_EXTRANONCE2_SIZE {
        return Err(Extranonce2Error::InvalidSize(size));
    }
    Ok(())
}

fn max_for_size(size: u8) -> u64 {
    if size >= 8 {
        u64::MAX
    } else {
        (1u64 << (size * 8)) - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_extranonce2_bytes_are_big_endian() {
        let ext = Extranonce2::from_hex("12341234", 4).unwrap();
        assert_eq!(ext.value(), 0x12341234);
        assert_eq!(ext.to_bytes(), vec![0x12, 0x34, 0x12, 0x34]);
        assert_eq!(ext.to_string(), "12341234");
    }

    #[test]
    fn test_extranonce2_pads_to_width() {
        let ext = Extranonce2::new(1, 4).unwrap();
        assert_eq!(ext.to_bytes(), vec![0, 0, 0, 1]);
        assert_eq!(ext.to_string(), "00000001");

        let short = Extranonce2::from_hex("01", 3).unwrap();
        assert_eq!(short.to_bytes(), vec![0, 0, 1]);
    }

    #[test]
    fn test_extranonce2_validation() {
        assert_eq!(Extranonce2::new(0, 0), Err(Extranonce2Error::InvalidSize(0)));
        assert_eq!(Extranonce2::new(0, 9), Err(Extranonce2Error::InvalidSize(9)));
        assert_eq!(
            Extranonce2::new(0x100, 1),
            Err(Extranonce2Error::ValueTooLarge(0x100, 1))
        );
        assert!(Extranonce2::new(u64::MAX, 8).is_ok());
        assert!(matches!(
            Extranonce2::from_hex("0102", 1),
            Err(Extranonce2Error::ValueTooLarge(_, 1))
        ));
        assert!(matches!(
            Extranonce2::from_hex("zz", 1),
            Err(Extranonce2Error::InvalidHex(_))
        ));
    }

    #[test]
    fn test_allocation_is_disjoint() {
        let allocator = ExtranonceAllocator::from_hex("12341234", 4).unwrap();
        let assigned = allocator.allocate(64).unwrap();

        assert_eq!(assigned.len(), 64);
        assert_eq!(assigned[0].to_string(), "12341234");
        assert_eq!(assigned[1].to_string(), "12341235");

        let unique: HashSet<_> = assigned.iter().map(|e| e.to_bytes()).collect();
        assert_eq!(unique.len(), assigned.len());
        assert!(assigned.iter().all(|e| e.size() == 4));
    }

    #[test]
    fn test_allocation_wraps_at_width() {
        let allocator = ExtranonceAllocator::new(Extranonce2::new(0xFE, 1).unwrap());
        let assigned = allocator.allocate(4).unwrap();

        let values: Vec<u64> = assigned.iter().map(|e| e.value()).collect();
        assert_eq!(values, vec![0xFE, 0xFF, 0x00, 0x01]);
    }

    #[test]
    fn test_allocation_fills_whole_space() {
        let allocator = ExtranonceAllocator::new(Extranonce2::new(0x80, 1).unwrap());

        let assigned = allocator.allocate(256).unwrap();
        let unique: HashSet<_> = assigned.iter().map(|e| e.value()).collect();
        assert_eq!(unique.len(), 256);

        assert_eq!(
            allocator.allocate(257),
            Err(Extranonce2Error::SpaceExhausted { workers: 257, size: 1 })
        );
    }

    #[test]
    fn test_extranonce1_hex() {
        let ext1 = Extranonce1::from_hex("1234567890abcdef").unwrap();
        assert_eq!(ext1.len(), 8);
        assert_eq!(ext1.to_string(), "1234567890abcdef");
        assert!(Extranonce1::from_hex("123").is_err());
    }
}
