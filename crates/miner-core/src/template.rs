//! Block templates as returned by `getblocktemplate`.
//!
//! `GetBlockTemplateResponse` mirrors the node's JSON. `BlockTemplate` is the
//! validated form every other module works with: hashes in internal byte
//! order, raw transaction bytes decoded, bits parsed.

use serde::Deserialize;
use thiserror::Error;

use crate::hash::{double_sha256, hash_from_display_hex, hash_to_display_hex, ParseHashError};
use crate::merkle::WITNESS_COMMITMENT_HEADER;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TemplateError {
    #[error("invalid previousblockhash: {0}")]
    InvalidPrevHash(ParseHashError),

    #[error("invalid bits {0:?}")]
    InvalidBits(String),

    #[error("version {0} does not fit in 32 bits")]
    InvalidVersion(i64),

    #[error("{field} {value} does not fit in 32 bits")]
    OutOfRange { field: &'static str, value: u64 },

    #[error("transaction {index}: invalid data hex: {source}")]
    InvalidTransactionData {
        index: usize,
        source: hex::FromHexError,
    },

    #[error("transaction {index}: invalid txid: {source}")]
    InvalidTxid { index: usize, source: ParseHashError },

    #[error("transaction {index}: txid {expected} does not match its data")]
    TxidMismatch { index: usize, expected: String },

    #[error("invalid default_witness_commitment {0:?}")]
    InvalidWitnessCommitment(String),

    #[error("template has witness transactions but no default_witness_commitment")]
    MissingWitnessCommitment,
}

/// One entry of `transactions` in the node's response.
#[derive(Debug, Clone, Deserialize)]
pub struct TemplateTransactionJson {
    pub data: String,
    #[serde(alias = "id")]
    pub txid: String,
}

/// The subset of `getblocktemplate` we consume.
#[derive(Debug, Clone, Deserialize)]
pub struct GetBlockTemplateResponse {
    pub height: u64,
    pub previousblockhash: String,
    pub version: i64,
    pub curtime: u64,
    pub bits: String,
    pub coinbasevalue: u64,
    #[serde(default)]
    pub transactions: Vec<TemplateTransactionJson>,
    #[serde(default)]
    pub default_witness_commitment: Option<String>,
}

/// A non-coinbase transaction carried by the template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateTransaction {
    /// Raw serialization, witness included when present.
    pub data: Vec<u8>,
    /// Transaction ID in internal byte order.
    pub txid: [u8; 32],
}

impl TemplateTransaction {
    /// Whether `data` uses the BIP144 witness serialization.
    pub fn has_witness(&self) -> bool {
        self.data.len() > 5 && self.data[4] == 0x00 && self.data[5] == 0x01
    }
}

/// A validated block template. Never modified once built; a new template
/// replaces the old one wholesale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockTemplate {
    pub height: u32,
    /// Previous block hash in internal byte order.
    pub prev_hash: [u8; 32],
    pub version: i32,
    pub bits: u32,
    pub curtime: u32,
    /// Subsidy plus fees, in satoshis.
    pub coinbase_value: u64,
    pub transactions: Vec<TemplateTransaction>,
    /// Witness commitment root, without the output script prefix.
    pub witness_commitment: Option<[u8; 32]>,
}

impl BlockTemplate {
    pub fn txids(&self) -> Vec<[u8; 32]> {
        self.transactions.iter().map(|tx| tx.txid).collect()
    }

    pub fn prev_hash_display(&self) -> String {
        hash_to_display_hex(&self.prev_hash)
    }

    pub fn has_witness_transactions(&self) -> bool {
        self.transactions.iter().any(TemplateTransaction::has_witness)
    }
}

impl TryFrom<GetBlockTemplateResponse> for BlockTemplate {
    type Error = TemplateError;

    fn try_from(response: GetBlockTemplateResponse) -> Result<Self, Self::Error> {
        let prev_hash = hash_from_display_hex(&response.previousblockhash)
            .map_err(TemplateError::InvalidPrevHash)?;

        let bits = u32::from_str_radix(response.bits.trim(), 16)
            .map_err(|_| TemplateError::InvalidBits(response.bits.clone()))?;

        // Versions with the top bit set arrive as large positive integers
        let version = i32::try_from(response.version)
            .or_else(|_| u32::try_from(response.version).map(|v| v as i32))
            .map_err(|_| TemplateError::InvalidVersion(response.version))?;

        let height = u32::try_from(response.height).map_err(|_| TemplateError::OutOfRange {
            field: "height",
            value: response.height,
        })?;
        let curtime = u32::try_from(response.curtime).map_err(|_| TemplateError::OutOfRange {
            field: "curtime",
            value: response.curtime,
        })?;

        let transactions = response
            .transactions
            .iter()
            .enumerate()
            .map(|(index, tx)| parse_transaction(index, tx))
            .collect::<Result<Vec<_>, _>>()?;

        let witness_commitment = response
            .default_witness_commitment
            .as_deref()
            .map(parse_witness_commitment)
            .transpose()?;

        let template = BlockTemplate {
            height,
            prev_hash,
            version,
            bits,
            curtime,
            coinbase_value: response.coinbasevalue,
            transactions,
            witness_commitment,
        };

        if template.witness_commitment.is_none() && template.has_witness_transactions() {
            return Err(TemplateError::MissingWitnessCommitment);
        }

        Ok(template)
    }
}

fn parse_transaction(
    index: usize,
    tx: &TemplateTransactionJson,
) -> Result<TemplateTransaction, TemplateError> {
    let data = hex::decode(tx.data.trim())
        .map_err(|source| TemplateError::InvalidTransactionData { index, source })?;
    let txid = hash_from_display_hex(&tx.txid)
        .map_err(|source| TemplateError::InvalidTxid { index, source })?;

    let parsed = TemplateTransaction { data, txid };

    // Legacy transactions hash their own bytes; witness ones need stripping first
    if !parsed.has_witness() && double_sha256(&parsed.data) != txid {
        return Err(TemplateError::TxidMismatch {
            index,
            expected: tx.txid.clone(),
        });
    }

    Ok(parsed)
}

/// Accept either the bare 32-byte root or the full `6a24aa21a9ed...` script.
fn parse_witness_commitment(value: &str) -> Result<[u8; 32], TemplateError> {
    let invalid = || TemplateError::InvalidWitnessCommitment(value.to_string());
    let bytes = hex::decode(value.trim()).map_err(|_| invalid())?;

    let root = match bytes.len() {
        32 => &bytes[..],
        38 if bytes[..2] == [0x6a, 0x24] && bytes[2..6] == WITNESS_COMMITMENT_HEADER => &bytes[6..],
        _ => return Err(invalid()),
    };

    let mut commitment = [0u8; 32];
    commitment.copy_from_slice(root);
    Ok(commitment)
}
