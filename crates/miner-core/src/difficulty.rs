//! Bitcoin difficulty target conversion and utilities.

use crate::network::Network;

/// Compact bits of the difficulty-1 target (the genesis block's target).
pub const DIFF1_BITS: u32 = 0x1d00ffff;

/// Convert compact "bits" representation to a 256-bit target.
///
/// The bits format is: [exponent (1 byte)][mantissa (3 bytes)]
/// Target = mantissa * 256^(exponent - 3)
///
/// The result is a 32-byte big-endian representation of the target.
/// Negative or overflowing encodings yield a zero target, which no hash meets.
pub fn bits_to_target(bits: u32) -> [u8; 32] {
    let exponent = ((bits >> 24) & 0xFF) as usize;
    let mantissa = bits & 0x007FFFFF;

    let mut target = [0u8; 32];

    // Negative flag (bit 23 of mantissa)
    if bits & 0x00800000 != 0 || exponent == 0 || exponent > 32 {
        return target;
    }

    if exponent <= 3 {
        // Mantissa fits in fewer bytes than specified
        let value = mantissa >> (8 * (3 - exponent));

        // Place at the end (least significant position)
        target[31] = (value & 0xFF) as u8;
        target[30] = ((value >> 8) & 0xFF) as u8;
        target[29] = ((value >> 16) & 0xFF) as u8;
    } else {
        // Normal case: mantissa goes at position (32 - exponent)
        let pos = 32 - exponent;

        target[pos] = ((mantissa >> 16) & 0xFF) as u8;
        if pos + 1 < 32 { target[pos + 1] = ((mantissa >> 8) & 0xFF) as u8; }
        if pos + 2 < 32 { target[pos + 2] = (mantissa & 0xFF) as u8; }
    }

    target
}

/// Convert a 256-bit target back to compact "bits" representation.
///
/// This is the inverse of `bits_to_target`, truncating to a 3-byte mantissa.
pub fn target_to_bits(target: &[u8; 32]) -> u32 {
    let first_nonzero = match target.iter().position(|&b| b != 0) {
        Some(pos) => pos,
        None => return 0,
    };

    // Calculate exponent (number of bytes from the right)
    let exponent = (32 - first_nonzero) as u32;

    // Extract mantissa (up to 3 bytes starting at first non-zero)
    let mut mantissa: u32 = 0;
    for offset in 0..3 {
        mantissa <<= 8;
        if let Some(&byte) = target.get(first_nonzero + offset) {
            mantissa |= byte as u32;
        }
    }
    // Fewer than 3 significant bytes: shift back to the right-aligned value
    if exponent < 3 {
        mantissa >>= 8 * (3 - exponent);
    }

    // If the high bit of mantissa is set, we need to shift right
    // to avoid the negative flag
    let (exp_adj, mant_adj) = if mantissa & 0x00800000 != 0 {
        (exponent + 1, mantissa >> 8)
    } else {
        (exponent, mantissa)
    };

    (exp_adj << 24) | (mant_adj & 0x007FFFFF)
}

/// Check if a header hash meets the difficulty target.
///
/// `hash` is in internal byte order (as SHA256 produced it) and is read as a
/// little-endian 256-bit integer; `target` is big-endian. Returns true only if
/// hash < target.
#[inline]
pub fn hash_meets_target(hash: &[u8; 32], target: &[u8; 32]) -> bool {
    for i in 0..32 {
        let h = hash[31 - i];
        if h < target[i] {
            return true;
        }
        if h > target[i] {
            return false;
        }
    }
    // Equal - not below
    false
}

/// Divide a big-endian target by `factor`, making it harder.
///
/// Factors at or below 1 (and non-finite ones) leave the target unchanged,
/// so the result is never easier than `target`. Whole factors divide exactly;
/// fractional ones go through f64 and are clamped to `target`.
pub fn scale_target(target: &[u8; 32], factor: f64) -> [u8; 32] {
    if !(factor.is_finite() && factor > 1.0) {
        return *target;
    }
    if factor.fract() == 0.0 && factor <= u64::MAX as f64 {
        return divide_target(target, factor as u64);
    }

    target_from_f64(target_to_f64(target) / factor).min(*target)
}

/// Long division of a big-endian 256-bit value.
fn divide_target(target: &[u8; 32], divisor: u64) -> [u8; 32] {
    let divisor = divisor as u128;
    let mut quotient = [0u8; 32];
    let mut remainder: u128 = 0;

    for (q, &byte) in quotient.iter_mut().zip(target) {
        let acc = (remainder << 8) | byte as u128;
        *q = (acc / divisor) as u8;
        remainder = acc % divisor;
    }

    quotient
}

/// Big-endian target closest to `value`, saturating at 2^256 - 1.
fn target_from_f64(value: f64) -> [u8; 32] {
    if value.is_nan() || value < 1.0 {
        return [0u8; 32];
    }

    // Below 2^53 the conversion to u64 is exact
    const HIGH: f64 = 9_007_199_254_740_992.0;
    let mut mantissa = value;
    let mut shift: i32 = 0;
    while mantissa >= HIGH && shift <= 256 {
        mantissa /= 2.0;
        shift += 1;
    }

    let value = mantissa as u64;
    let significant_bits = 64 - value.leading_zeros() as i32;
    if shift + significant_bits > 256 {
        return [0xFF; 32];
    }

    shifted_target(value, shift as u32)
}

/// Place `value << shift` into a big-endian 256-bit buffer.
fn shifted_target(value: u64, shift: u32) -> [u8; 32] {
    let mut target = [0u8; 32];
    let byte_shift = (shift / 8) as usize;
    let wide = (value as u128) << (shift % 8);

    for i in 0..16 {
        let pos = byte_shift + i;
        if pos < 32 {
            target[31 - pos] = ((wide >> (8 * i)) & 0xFF) as u8;
        }
    }

    target
}

/// Mining target after applying an optional difficulty override.
///
/// The override divides the template's own target and is honoured only on
/// networks that allow it. A factor of 1 or less changes nothing, so the
/// target is never easier than the template's bits.
pub fn effective_target(bits: u32, difficulty_factor: Option<f64>, network: Network) -> [u8; 32] {
    let template_target = bits_to_target(bits);
    match difficulty_factor {
        Some(factor) if network.allows_difficulty_override() => {
            scale_target(&template_target, factor)
        }
        _ => template_target,
    }
}

/// Calculate approximate difficulty from bits.
///
/// Difficulty = max_target / current_target
/// Where max_target is the genesis block target (bits = 0x1d00ffff)
pub fn bits_to_difficulty(bits: u32) -> f64 {
    target_to_difficulty(&bits_to_target(bits))
}

/// Calculate approximate difficulty of a 256-bit target.
pub fn target_to_difficulty(target: &[u8; 32]) -> f64 {
    let current_f64 = target_to_f64(target);
    if current_f64 == 0.0 {
        return f64::INFINITY;
    }

    target_to_f64(&bits_to_target(DIFF1_BITS)) / current_f64
}

/// Convert a 256-bit target to an approximate f64 value.
fn target_to_f64(target: &[u8; 32]) -> f64 {
    let first_nonzero = match target.iter().position(|&b| b != 0) {
        Some(pos) => pos,
        None => return 0.0,
    };

    // Take up to 8 bytes for precision
    let mut value: u64 = 0;
    for i in 0..8 {
        value <<= 8;
        if let Some(&byte) = target.get(first_nonzero + i) {
            value |= byte as u64;
        }
    }

    // Scale by position
    let shift = (31 - first_nonzero) * 8;
    let exponent = (shift as i32) - 56;
    (value as f64) * 2f64.powi(exponent)
}

/// Format difficulty for display (e.g., "1.23T" for trillion).
pub fn format_difficulty(difficulty: f64) -> String {
    if difficulty >= 1e15 {
        format!("{:.2}P", difficulty / 1e15)
    } else if difficulty >= 1e12 {
        format!("{:.2}T", difficulty / 1e12)
    } else if difficulty >= 1e9 {
        format!("{:.2}G", difficulty / 1e9)
    } else if difficulty >= 1e6 {
        format!("{:.2}M", difficulty / 1e6)
    } else if difficulty >= 1e3 {
        format!("{:.2}K", difficulty / 1e3)
    } else {
        format!("{:.2}", difficulty)
    }
}

/// Estimate average hashes needed to find a block at given difficulty.
pub fn expected_hashes(difficulty: f64) -> f64 {
    // On average, need difficulty * 2^32 hashes
    difficulty * 4_294_967_296.0
}
