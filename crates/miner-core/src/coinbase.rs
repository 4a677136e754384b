//! Coinbase transaction construction for Bitcoin mining.
//!
//! The coinbase transaction is the first transaction in a block that creates
//! new coins (the block reward) and collects transaction fees. Its scriptSig
//! carries the BIP34 height followed by the extranonce span, which lets the
//! serialized transaction be split into `coinb1` and `coinb2` around it.

use thiserror::Error;

use crate::extranonce::{Extranonce1, Extranonce2};
use crate::hash::{double_sha256, hash_to_display_hex};
use crate::merkle::witness_commitment_script;
use crate::network::{COINBASE_TX_VERSION, MAX_COINBASE_SCRIPTSIG_SIZE, MIN_COINBASE_SCRIPTSIG_SIZE};

/// Tag byte introducing the optional coinbase message (OP_RETURN).
const MESSAGE_TAG: u8 = 0x6a;

/// Byte offset of the scriptSig length within a legacy coinbase:
/// version (4) + input count (1) + null outpoint (36).
const SCRIPT_SIG_LEN_OFFSET: usize = 41;

/// Coinbase construction errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoinbaseError {
    #[error("coinbase scriptSig is {0} bytes, maximum is 100")]
    ScriptSigTooLarge(usize),

    #[error("coinbase scriptSig is {0} bytes, minimum is 2")]
    ScriptSigTooSmall(usize),

    #[error("extranonce span is not contiguous at offset {offset} of the coinbase")]
    NonContiguousExtranonce { offset: usize },

    #[error("coinbase message of {0} bytes cannot be pushed")]
    MessageTooLong(usize),

    #[error("missing payout script")]
    MissingPayoutScript,
}

/// Builder for constructing coinbase transactions.
#[derive(Debug, Clone)]
pub struct CoinbaseBuilder {
    /// The block height (required by BIP34).
    height: u32,
    /// Block reward plus fees, in satoshis.
    value: u64,
    payout_script: Vec<u8>,
    message: Vec<u8>,
    witness_commitment: Option<[u8; 32]>,
    extranonce1: Vec<u8>,
    extranonce2: Vec<u8>,
}

impl CoinbaseBuilder {
    pub fn new(height: u32, value: u64, payout_script: impl Into<Vec<u8>>) -> Self {
        CoinbaseBuilder {
            height,
            value,
            payout_script: payout_script.into(),
            message: Vec::new(),
            witness_commitment: None,
            extranonce1: Vec::new(),
            extranonce2: Vec::new(),
        }
    }

    /// Append a message push after the extranonce span.
    pub fn with_message(mut self, message: impl Into<Vec<u8>>) -> Self {
        self.message = message.into();
        self
    }

    /// Add the zero-value witness commitment output.
    pub fn with_witness_commitment(mut self, commitment: Option<[u8; 32]>) -> Self {
        self.witness_commitment = commitment;
        self
    }

    pub fn with_extranonce(mut self, extranonce1: &Extranonce1, extranonce2: &Extranonce2) -> Self {
        self.extranonce1 = extranonce1.as_bytes().to_vec();
        self.extranonce2 = extranonce2.to_bytes();
        self
    }

    /// Build the coinbase transaction.
    pub fn build(&self) -> Result<CoinbaseTransaction, CoinbaseError> {
        if self.payout_script.is_empty() {
            return Err(CoinbaseError::MissingPayoutScript);
        }

        let (script_sig, extranonce_in_script) = self.build_script_sig()?;
        let outputs = self.build_outputs();

        let raw_tx = serialize(&script_sig, &outputs, None);
        let witness_tx = self
            .witness_commitment
            .map(|_| serialize(&script_sig, &outputs, Some(&[0u8; 32])));

        let extranonce_len = self.extranonce1.len() + self.extranonce2.len();
        let extranonce_offset =
            SCRIPT_SIG_LEN_OFFSET + varint_len(script_sig.len() as u64) + extranonce_in_script;

        // The split only holds if the span sits where we say it does
        let span = raw_tx.get(extranonce_offset..extranonce_offset + extranonce_len);
        let expected = [self.extranonce1.as_slice(), self.extranonce2.as_slice()].concat();
        if span != Some(expected.as_slice()) {
            return Err(CoinbaseError::NonContiguousExtranonce {
                offset: extranonce_offset,
            });
        }

        let txid = double_sha256(&raw_tx);

        Ok(CoinbaseTransaction {
            raw_tx,
            witness_tx,
            txid,
            extranonce_offset,
            extranonce_len,
        })
    }

    /// Build the scriptSig: height push, extranonce1, extranonce2, message push.
    ///
    /// Returns the script and the offset of extranonce1 within it.
    fn build_script_sig(&self) -> Result<(Vec<u8>, usize), CoinbaseError> {
        let mut script_sig = encode_height_push(self.height);
        let extranonce_offset = script_sig.len();

        script_sig.extend_from_slice(&self.extranonce1);
        script_sig.extend_from_slice(&self.extranonce2);

        if !self.message.is_empty() {
            let len = u8::try_from(self.message.len())
                .map_err(|_| CoinbaseError::MessageTooLong(self.message.len()))?;
            script_sig.push(MESSAGE_TAG);
            script_sig.push(len);
            script_sig.extend_from_slice(&self.message);
        }

        if script_sig.len() > MAX_COINBASE_SCRIPTSIG_SIZE {
            return Err(CoinbaseError::ScriptSigTooLarge(script_sig.len()));
        }
        if script_sig.len() < MIN_COINBASE_SCRIPTSIG_SIZE {
            return Err(CoinbaseError::ScriptSigTooSmall(script_sig.len()));
        }

        Ok((script_sig, extranonce_offset))
    }

    fn build_outputs(&self) -> Vec<TxOutput> {
        let mut outputs = Vec::with_capacity(2);

        outputs.push(TxOutput {
            value: self.value,
            script_pubkey: self.payout_script.clone(),
        });

        if let Some(commitment) = &self.witness_commitment {
            outputs.push(TxOutput {
                value: 0,
                script_pubkey: witness_commitment_script(commitment),
            });
        }

        outputs
    }
}

/// Serialize the coinbase. With `witness_reserved` the BIP144 marker, flag
/// and a single-item witness stack are included.
fn serialize(
    script_sig: &[u8],
    outputs: &[TxOutput],
    witness_reserved: Option<&[u8; 32]>,
) -> Vec<u8> {
    let mut tx = Vec::with_capacity(128 + script_sig.len());

    tx.extend_from_slice(&COINBASE_TX_VERSION.to_le_bytes());

    if witness_reserved.is_some() {
        tx.push(0x00); // Marker
        tx.push(0x01); // Flag
    }

    // One input spending the null outpoint
    tx.push(0x01);
    tx.extend_from_slice(&[0u8; 32]);
    tx.extend_from_slice(&0xFFFFFFFFu32.to_le_bytes());

    encode_varint(script_sig.len() as u64, &mut tx);
    tx.extend_from_slice(script_sig);

    tx.extend_from_slice(&0xFFFFFFFFu32.to_le_bytes());

    encode_varint(outputs.len() as u64, &mut tx);
    for output in outputs {
        tx.extend_from_slice(&output.value.to_le_bytes());
        encode_varint(output.script_pubkey.len() as u64, &mut tx);
        tx.extend_from_slice(&output.script_pubkey);
    }

    if let Some(reserved) = witness_reserved {
        tx.push(0x01); // Number of witness stack items
        tx.push(0x20); // Length of item (32 bytes)
        tx.extend_from_slice(reserved);
    }

    // Locktime
    tx.extend_from_slice(&0u32.to_le_bytes());

    tx
}

/// A constructed coinbase transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoinbaseTransaction {
    /// Legacy serialization, hashed for the txid and split into coinb1/coinb2.
    raw_tx: Vec<u8>,
    /// Witness serialization, present when the block carries a witness commitment.
    witness_tx: Option<Vec<u8>>,
    txid: [u8; 32],
    extranonce_offset: usize,
    extranonce_len: usize,
}

impl CoinbaseTransaction {
    /// Legacy (non-witness) serialization.
    pub fn raw_tx(&self) -> &[u8] {
        &self.raw_tx
    }

    pub fn witness_tx(&self) -> Option<&[u8]> {
        self.witness_tx.as_deref()
    }

    /// The serialization that goes into a submitted block.
    pub fn block_bytes(&self) -> &[u8] {
        self.witness_tx.as_deref().unwrap_or(&self.raw_tx)
    }

    /// Transaction ID in internal byte order.
    pub fn txid(&self) -> [u8; 32] {
        self.txid
    }

    pub fn txid_display(&self) -> String {
        hash_to_display_hex(&self.txid)
    }

    /// Everything before extranonce1, including the scriptSig length prefix.
    pub fn coinb1(&self) -> &[u8] {
        &self.raw_tx[..self.extranonce_offset]
    }

    /// The extranonce1 || extranonce2 span.
    pub fn extranonce(&self) -> &[u8] {
        &self.raw_tx[self.extranonce_offset..self.extranonce_offset + self.extranonce_len]
    }

    /// Everything after extranonce2, through the locktime.
    pub fn coinb2(&self) -> &[u8] {
        &self.raw_tx[self.extranonce_offset + self.extranonce_len..]
    }

    pub fn extranonce_offset(&self) -> usize {
        self.extranonce_offset
    }
}

/// A transaction output.
#[derive(Debug, Clone)]
struct TxOutput {
    value: u64,
    script_pubkey: Vec<u8>,
}

/// Encode the BIP34 height push.
///
/// The height is minimally encoded as a little-endian integer with a padding
/// byte when the high bit would read as a sign, and prefixed by its length.
/// Height 0 is the single byte OP_0.
pub fn encode_height_push(height: u32) -> Vec<u8> {
    if height == 0 {
        return vec![0x00];
    }

    let mut bytes = Vec::with_capacity(5);
    bytes.push(0);

    let mut n = height;
    while n > 0 {
        bytes.push((n & 0xFF) as u8);
        n >>= 8;
    }

    if let Some(&last) = bytes.last() {
        if last & 0x80 != 0 {
            bytes.push(0x00);
        }
    }

    bytes[0] = (bytes.len() - 1) as u8;
    bytes
}

/// Encode a variable-length integer (Bitcoin varint).
pub fn encode_varint(value: u64, output: &mut Vec<u8>) {
    if value < 0xfd {
        output.push(value as u8);
    } else if value <= 0xffff {
        output.push(0xfd);
        output.extend_from_slice(&(value as u16).to_le_bytes());
    } else if value <= 0xffffffff {
        output.push(0xfe);
        output.extend_from_slice(&(value as u32).to_le_bytes());
    } else {
        output.push(0xff);
        output.extend_from_slice(&value.to_le_bytes());
    }
}

fn varint_len(value: u64) -> usize {
    match value {
        0..=0xfc => 1,
        0xfd..=0xffff => 3,
        0x10000..=0xffffffff => 5,
        _ => 9,
    }
}
