//! Block assembly and proof-of-work search for a `getblocktemplate` miner.
//!
//! This crate provides:
//! - Payout address decoding (P2PKH, P2SH, P2WPKH, P2WSH, P2TR)
//! - Extranonce allocation across workers
//! - Coinbase construction with BIP34 height and a coinb1/coinb2 split
//! - Merkle roots and branches
//! - Block header construction and block serialization
//! - A cancellable, multi-strategy proof-of-work search
//! - Difficulty target conversion and comparison

pub mod address;
pub mod block;
pub mod coinbase;
pub mod difficulty;
pub mod extranonce;
pub mod hash;
pub mod job;
pub mod merkle;
pub mod network;
pub mod search;
pub mod template;

pub use address::{parse_payout_address, AddressError, AddressType, PayoutAddress};
pub use block::{serialize_block, BlockError, BlockHeader};
pub use coinbase::{CoinbaseBuilder, CoinbaseError, CoinbaseTransaction};
pub use difficulty::{bits_to_target, effective_target, hash_meets_target};
pub use extranonce::{Extranonce1, Extranonce2, Extranonce2Error, ExtranonceAllocator};
pub use hash::{double_sha256, hash_to_display_hex};
pub use job::{Job, JobError, JobParams, Work};
pub use merkle::{compute_merkle_root, MerkleBranch};
pub use network::Network;
pub use search::{
    CancellationToken, Clock, NonceStrategy, SearchOutcome, SearchState, SearchTask, Solution,
    SystemClock,
};
pub use template::{BlockTemplate, GetBlockTemplateResponse, TemplateError, TemplateTransaction};
