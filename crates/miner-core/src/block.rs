//! Bitcoin block header construction and full block serialization.

use thiserror::Error;

use crate::coinbase::{encode_varint, CoinbaseTransaction};
use crate::difficulty::bits_to_target;
use crate::hash::{double_sha256, hash_to_display_hex};
use crate::merkle::compute_merkle_root;
use crate::network::BLOCK_HEADER_SIZE;
use crate::template::TemplateTransaction;

/// A Bitcoin block header (80 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    /// Block version with BIP9 versionbits.
    pub version: i32,
    /// Hash of the previous block (internal byte order).
    pub prev_block_hash: [u8; 32],
    /// Merkle root of all transactions (internal byte order).
    pub merkle_root: [u8; 32],
    /// Block timestamp (Unix time).
    pub timestamp: u32,
    /// Difficulty target in compact "bits" format.
    pub bits: u32,
    /// Nonce for proof of work.
    pub nonce: u32,
}

impl BlockHeader {
    /// Create a new block header with a zero nonce.
    pub fn new(
        version: i32,
        prev_block_hash: [u8; 32],
        merkle_root: [u8; 32],
        timestamp: u32,
        bits: u32,
    ) -> Self {
        BlockHeader {
            version,
            prev_block_hash,
            merkle_root,
            timestamp,
            bits,
            nonce: 0,
        }
    }

    /// Serialize the block header to 80 bytes.
    pub fn serialize(&self) -> [u8; BLOCK_HEADER_SIZE] {
        let mut header = [0u8; BLOCK_HEADER_SIZE];

        // Version (4 bytes, little-endian)
        header[0..4].copy_from_slice(&self.version.to_le_bytes());

        // Previous block hash (32 bytes, internal byte order)
        header[4..36].copy_from_slice(&self.prev_block_hash);

        // Merkle root (32 bytes)
        header[36..68].copy_from_slice(&self.merkle_root);

        // Timestamp (4 bytes, little-endian)
        header[68..72].copy_from_slice(&self.timestamp.to_le_bytes());

        // Bits (4 bytes, little-endian)
        header[72..76].copy_from_slice(&self.bits.to_le_bytes());

        // Nonce (4 bytes, little-endian)
        header[76..80].copy_from_slice(&self.nonce.to_le_bytes());

        header
    }

    /// Parse a serialized header.
    pub fn deserialize(bytes: &[u8; BLOCK_HEADER_SIZE]) -> Self {
        let word = |at: usize| [bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]];

        let mut prev_block_hash = [0u8; 32];
        prev_block_hash.copy_from_slice(&bytes[4..36]);
        let mut merkle_root = [0u8; 32];
        merkle_root.copy_from_slice(&bytes[36..68]);

        BlockHeader {
            version: i32::from_le_bytes(word(0)),
            prev_block_hash,
            merkle_root,
            timestamp: u32::from_le_bytes(word(68)),
            bits: u32::from_le_bytes(word(72)),
            nonce: u32::from_le_bytes(word(76)),
        }
    }

    /// Compute the block hash (double SHA256).
    pub fn hash(&self) -> [u8; 32] {
        double_sha256(&self.serialize())
    }

    /// Get the target as a 256-bit number.
    pub fn target(&self) -> [u8; 32] {
        bits_to_target(self.bits)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BlockError {
    /// The header commits to a different transaction set than the one being
    /// serialized, typically a coinbase from an older extranonce2 or template.
    #[error("header commits to merkle root {committed}, coinbase {coinbase_txid} gives {actual}")]
    StaleCoinbase {
        committed: String,
        actual: String,
        coinbase_txid: String,
    },
}

/// Serialize a solved block for `submitblock`.
///
/// Layout: header, transaction count, coinbase, then the template's
/// transactions in Merkle order. The Merkle root is recomputed from the
/// coinbase and transactions and must equal the one in `header`.
pub fn serialize_block(
    header: &[u8; BLOCK_HEADER_SIZE],
    coinbase: &CoinbaseTransaction,
    transactions: &[TemplateTransaction],
) -> Result<Vec<u8>, BlockError> {
    let mut txids = Vec::with_capacity(transactions.len() + 1);
    txids.push(coinbase.txid());
    txids.extend(transactions.iter().map(|tx| tx.txid));

    let actual = compute_merkle_root(&txids);
    if header[36..68] != actual {
        let committed = BlockHeader::deserialize(header).merkle_root;
        return Err(BlockError::StaleCoinbase {
            committed: hash_to_display_hex(&committed),
            actual: hash_to_display_hex(&actual),
            coinbase_txid: coinbase.txid_display(),
        });
    }

    let body_len: usize = transactions.iter().map(|tx| tx.data.len()).sum();
    let mut block =
        Vec::with_capacity(BLOCK_HEADER_SIZE + 9 + coinbase.block_bytes().len() + body_len);

    block.extend_from_slice(header);
    encode_varint(txids.len() as u64, &mut block);
    block.extend_from_slice(coinbase.block_bytes());
    for tx in transactions {
        block.extend_from_slice(&tx.data);
    }

    Ok(block)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coinbase::CoinbaseBuilder;
    use crate::extranonce::{Extranonce1, Extranonce2};
    use crate::hash::hash_from_display_hex;

    fn coinbase(extranonce2: u64) -> CoinbaseTransaction {
        CoinbaseBuilder::new(100, 5_000_000_000, vec![0x51])
            .with_extranonce(
                &Extranonce1::from_hex("aabbccdd").unwrap(),
                &Extranonce2::new(extranonce2, 4).unwrap(),
            )
            .build()
            .unwrap()
    }

    fn transactions() -> Vec<TemplateTransaction> {
        (1..=3u8)
            .map(|i| TemplateTransaction {
                data: vec![i; 10 * i as usize],
                txid: [i; 32],
            })
            .collect()
    }

    #[test]
    fn test_block_header_serialization() {
        let prev_hash = [0x12u8; 32];
        let merkle_root = [0x34u8; 32];

        let mut header =
            BlockHeader::new(0x20000000, prev_hash, merkle_root, 1700000000, 0x17034219);
        header.nonce = 0xDEADBEEF;

        let serialized = header.serialize();

        assert_eq!(serialized.len(), 80);
        assert_eq!(&serialized[0..4], &[0x00, 0x00, 0x00, 0x20]);
        assert_eq!(&serialized[4..36], &prev_hash[..]);
        assert_eq!(&serialized[36..68], &merkle_root[..]);
        assert_eq!(&serialized[68..72], &1700000000u32.to_le_bytes());
        assert_eq!(&serialized[72..76], &[0x19, 0x42, 0x03, 0x17]);
        assert_eq!(&serialized[76..80], &[0xEF, 0xBE, 0xAD, 0xDE]);

        assert_eq!(BlockHeader::deserialize(&serialized), header);
    }

    #[test]
    fn test_genesis_header() {
        let merkle_root = hash_from_display_hex(
            "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b",
        )
        .unwrap();

        let mut header = BlockHeader::new(1, [0u8; 32], merkle_root, 1231006505, 0x1d00ffff);
        header.nonce = 2083236893;

        assert_eq!(
            hash_to_display_hex(&header.hash()),
            "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f"
        );
    }

    #[test]
    fn test_serialize_block_layout() {
        let coinbase = coinbase(1);
        let txs = transactions();

        let mut txids = vec![coinbase.txid()];
        txids.extend(txs.iter().map(|tx| tx.txid));
        let header =
            BlockHeader::new(0x20000000, [0; 32], compute_merkle_root(&txids), 0, 0x207fffff)
                .serialize();

        let block = serialize_block(&header, &coinbase, &txs).unwrap();

        assert_eq!(&block[..80], &header[..]);
        assert_eq!(block[80], 4);

        let coinbase_end = 81 + coinbase.raw_tx().len();
        assert_eq!(&block[81..coinbase_end], coinbase.raw_tx());
        assert_eq!(&block[coinbase_end..coinbase_end + 10], &[1u8; 10][..]);
        assert_eq!(block.len(), coinbase_end + 10 + 20 + 30);
    }

    #[test]
    fn test_coinbase_only_block() {
        let coinbase = coinbase(7);
        let header =
            BlockHeader::new(0x20000000, [0; 32], coinbase.txid(), 0, 0x207fffff).serialize();

        let block = serialize_block(&header, &coinbase, &[]).unwrap();

        let mut expected = header.to_vec();
        expected.push(0x01);
        expected.extend_from_slice(coinbase.raw_tx());
        assert_eq!(block, expected);
    }

    #[test]
    fn test_stale_coinbase_rejected() {
        let committed = coinbase(1);
        let header =
            BlockHeader::new(0x20000000, [0; 32], committed.txid(), 0, 0x207fffff).serialize();

        // Same job, different extranonce2
        let result = serialize_block(&header, &coinbase(2), &[]);
        assert!(matches!(result, Err(BlockError::StaleCoinbase { .. })));

        // Transactions that were not committed
        let result = serialize_block(&header, &committed, &transactions());
        assert!(matches!(result, Err(BlockError::StaleCoinbase { .. })));
    }
}
