//! Payout address decoding.
//!
//! Turns the configured destination address into the scriptPubKey paid by the
//! coinbase. Supports:
//! - P2PKH and P2SH (Base58Check)
//! - P2WPKH and P2WSH (SegWit v0, Bech32)
//! - P2TR (SegWit v1, Bech32m)
//!
//! The address must belong to the network the node reports.

use thiserror::Error;

use crate::hash::double_sha256;
use crate::network::Network;

/// Address decoding errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("invalid address format")]
    InvalidFormat,

    #[error("invalid Base58 character: {0}")]
    InvalidBase58Char(char),

    #[error("invalid checksum")]
    InvalidChecksum,

    #[error("invalid Bech32 encoding: {0}")]
    InvalidBech32(String),

    #[error("invalid witness version: {0}")]
    InvalidWitnessVersion(u8),

    #[error("invalid witness program length: {0}")]
    InvalidWitnessProgramLength(usize),

    #[error("address is for a different network than {expected}")]
    NetworkMismatch { expected: Network },

    #[error("unsupported address type")]
    UnsupportedType,
}

/// Bitcoin address type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressType {
    /// Legacy P2PKH: OP_DUP OP_HASH160 <20-byte-hash> OP_EQUALVERIFY OP_CHECKSIG
    P2PKH,
    /// P2SH: OP_HASH160 <20-byte-hash> OP_EQUAL
    P2SH,
    /// Native SegWit v0 P2WPKH: OP_0 <20-byte-hash>
    P2WPKH,
    /// Native SegWit v0 P2WSH: OP_0 <32-byte-hash>
    P2WSH,
    /// Taproot P2TR: OP_1 <32-byte-x-only-pubkey>
    P2TR,
}

impl AddressType {
    pub fn name(&self) -> &'static str {
        match self {
            AddressType::P2PKH => "P2PKH",
            AddressType::P2SH => "P2SH",
            AddressType::P2WPKH => "P2WPKH",
            AddressType::P2WSH => "P2WSH",
            AddressType::P2TR => "P2TR",
        }
    }
}

/// A decoded payout address with its scriptPubKey.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayoutAddress {
    pub address_type: AddressType,
    pub network: Network,
    /// The scriptPubKey the coinbase pays to.
    pub script_pubkey: Vec<u8>,
    /// The address as configured.
    pub display: String,
}

/// Decode `address` for `network`.
pub fn parse_payout_address(
    address: &str,
    network: Network,
) -> Result<PayoutAddress, AddressError> {
    let trimmed = address.trim();
    let lower = trimmed.to_lowercase();

    // Bech32 addresses carry the network HRP before the last '1'
    let looks_bech32 = ["bc1", "tb1", "bcrt1"]
        .iter()
        .any(|prefix| lower.starts_with(prefix));

    if looks_bech32 {
        parse_bech32_address(trimmed, network)
    } else {
        parse_base58_address(trimmed, network)
    }
}

/// Decode a Base58Check address (P2PKH or P2SH).
fn parse_base58_address(address: &str, network: Network) -> Result<PayoutAddress, AddressError> {
    let decoded = base58_decode(address)?;

    if decoded.len() < 5 {
        return Err(AddressError::InvalidFormat);
    }

    // Last 4 bytes are the checksum
    let (payload, checksum) = decoded.split_at(decoded.len() - 4);
    if checksum != &double_sha256(payload)[..4] {
        return Err(AddressError::InvalidChecksum);
    }

    let version = payload[0];
    let hash = &payload[1..];

    if hash.len() != 20 {
        return Err(AddressError::InvalidFormat);
    }

    let (address_type, script_pubkey) = if version == network.p2pkh_version() {
        // OP_DUP OP_HASH160 <20-byte-hash> OP_EQUALVERIFY OP_CHECKSIG
        let mut script = Vec::with_capacity(25);
        script.extend_from_slice(&[0x76, 0xa9, 0x14]);
        script.extend_from_slice(hash);
        script.extend_from_slice(&[0x88, 0xac]);
        (AddressType::P2PKH, script)
    } else if version == network.p2sh_version() {
        // OP_HASH160 <20-byte-hash> OP_EQUAL
        let mut script = Vec::with_capacity(23);
        script.extend_from_slice(&[0xa9, 0x14]);
        script.extend_from_slice(hash);
        script.push(0x87);
        (AddressType::P2SH, script)
    } else if matches!(version, 0x00 | 0x05 | 0x6f | 0xc4) {
        return Err(AddressError::NetworkMismatch { expected: network });
    } else {
        return Err(AddressError::InvalidFormat);
    };

    Ok(PayoutAddress {
        address_type,
        network,
        script_pubkey,
        display: address.to_string(),
    })
}

/// Decode a Bech32/Bech32m address (P2WPKH, P2WSH, or P2TR).
fn parse_bech32_address(address: &str, network: Network) -> Result<PayoutAddress, AddressError> {
    let (hrp, data, variant) = bech32_decode(address)?;

    if hrp != network.bech32_hrp() {
        return Err(AddressError::NetworkMismatch { expected: network });
    }

    let (&witness_version, program_5bit) = data.split_first().ok_or(AddressError::InvalidFormat)?;
    let program = convert_bits(program_5bit, 5, 8)?;

    match (witness_version, variant) {
        (0, Bech32Variant::Bech32) | (1..=16, Bech32Variant::Bech32m) => {}
        (0, _) => return Err(AddressError::InvalidBech32("SegWit v0 must use Bech32".into())),
        (1..=16, _) => {
            return Err(AddressError::InvalidBech32("SegWit v1+ must use Bech32m".into()))
        }
        _ => return Err(AddressError::InvalidWitnessVersion(witness_version)),
    }

    let address_type = match (witness_version, program.len()) {
        (0, 20) => AddressType::P2WPKH,
        (0, 32) => AddressType::P2WSH,
        (1, 32) => AddressType::P2TR,
        (v, len) if v > 1 && (2..=40).contains(&len) => return Err(AddressError::UnsupportedType),
        (_, len) => return Err(AddressError::InvalidWitnessProgramLength(len)),
    };

    // OP_0 = 0x00, OP_1 = 0x51
    let version_opcode = if witness_version == 0 { 0x00 } else { 0x50 + witness_version };
    let mut script_pubkey = Vec::with_capacity(2 + program.len());
    script_pubkey.push(version_opcode);
    script_pubkey.push(program.len() as u8);
    script_pubkey.extend_from_slice(&program);

    Ok(PayoutAddress {
        address_type,
        network,
        script_pubkey,
        display: address.to_string(),
    })
}

// ============================================================================
// Base58
// ============================================================================

const BASE58_ALPHABET: &[u8; 58] = b"123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";

fn base58_decode(input: &str) -> Result<Vec<u8>, AddressError> {
    let mut result: Vec<u8> = Vec::new();

    // Leading '1's become leading zero bytes
    let leading_zeros = input.chars().take_while(|&c| c == '1').count();

    for c in input.chars() {
        let value = BASE58_ALPHABET
            .iter()
            .position(|&x| x as char == c)
            .ok_or(AddressError::InvalidBase58Char(c))? as u32;

        // result = result * 58 + value
        let mut carry = value;
        for byte in result.iter_mut().rev() {
            let temp = (*byte as u32) * 58 + carry;
            *byte = (temp & 0xFF) as u8;
            carry = temp >> 8;
        }

        while carry > 0 {
            result.insert(0, (carry & 0xFF) as u8);
            carry >>= 8;
        }
    }

    let mut final_result = vec![0u8; leading_zeros];
    final_result.extend(result);

    Ok(final_result)
}

// ============================================================================
// Bech32/Bech32m
// ============================================================================

const BECH32_CHARSET: &str = "qpzry9x8gf2tvdw0s3jn54khce6mua7l";

const BECH32M_CONST: u32 = 0x2bc830a3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Bech32Variant {
    Bech32,
    Bech32m,
}

fn bech32_decode(input: &str) -> Result<(String, Vec<u8>, Bech32Variant), AddressError> {
    if input.chars().any(|c| c.is_lowercase()) && input.chars().any(|c| c.is_uppercase()) {
        return Err(AddressError::InvalidBech32("mixed case".into()));
    }
    let input_lower = input.to_lowercase();

    let sep_pos = input_lower
        .rfind('1')
        .ok_or_else(|| AddressError::InvalidBech32("no separator found".into()))?;

    if sep_pos == 0 || sep_pos + 7 > input_lower.len() {
        return Err(AddressError::InvalidBech32("invalid separator position".into()));
    }

    let hrp = &input_lower[..sep_pos];
    let data_part = &input_lower[sep_pos + 1..];

    let mut data = Vec::with_capacity(data_part.len());
    for c in data_part.chars() {
        let idx = BECH32_CHARSET
            .find(c)
            .ok_or_else(|| AddressError::InvalidBech32(format!("invalid character: {}", c)))?;
        data.push(idx as u8);
    }

    let variant = match bech32_polymod(&hrp_expand(hrp), &data) {
        1 => Bech32Variant::Bech32,
        BECH32M_CONST => Bech32Variant::Bech32m,
        _ => return Err(AddressError::InvalidChecksum),
    };

    // Drop the 6 checksum characters
    data.truncate(data.len() - 6);

    Ok((hrp.to_string(), data, variant))
}

fn hrp_expand(hrp: &str) -> Vec<u8> {
    let mut result = Vec::with_capacity(hrp.len() * 2 + 1);
    result.extend(hrp.bytes().map(|b| b >> 5));
    result.push(0);
    result.extend(hrp.bytes().map(|b| b & 31));
    result
}

fn bech32_polymod(hrp: &[u8], data: &[u8]) -> u32 {
    const GEN: [u32; 5] = [0x3b6a57b2, 0x26508e6d, 0x1ea119fa, 0x3d4233dd, 0x2a1462b3];

    let mut chk: u32 = 1;

    for &value in hrp.iter().chain(data.iter()) {
        let top = chk >> 25;
        chk = ((chk & 0x1ffffff) << 5) ^ (value as u32);
        for (i, &g) in GEN.iter().enumerate() {
            if (top >> i) & 1 == 1 {
                chk ^= g;
            }
        }
    }

    chk
}

/// Regroup bits without padding, as required when decoding a witness program.
fn convert_bits(data: &[u8], from_bits: u8, to_bits: u8) -> Result<Vec<u8>, AddressError> {
    let mut acc: u32 = 0;
    let mut bits: u8 = 0;
    let mut result = Vec::new();
    let max_value = (1u32 << to_bits) - 1;

    for &value in data {
        if value >> from_bits != 0 {
            return Err(AddressError::InvalidBech32("invalid value in data".into()));
        }
        acc = (acc << from_bits) | (value as u32);
        bits += from_bits;

        while bits >= to_bits {
            bits -= to_bits;
            result.push(((acc >> bits) & max_value) as u8);
        }
    }

    if bits >= from_bits || ((acc << (to_bits - bits)) & max_value) != 0 {
        return Err(AddressError::InvalidBech32("invalid padding".into()));
    }

    Ok(result)
}
