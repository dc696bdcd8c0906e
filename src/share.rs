//! Share validation: difficulty to target conversion and hash comparison.
//!
//! A share is accepted when its hash, read as a 256-bit big-endian unsigned
//! integer, is strictly below the target derived from the session
//! difficulty. Higher difficulty means a numerically smaller target.

use std::fmt;

use thiserror::Error;

use crate::u256::{div_limbs, U256};

/// Length in bytes of a hash and of a target.
pub const HASH_LEN: usize = 32;

/// Target for pool difficulty 1: `0x00000000FFFF0000...0000`.
pub const DIFF1_TARGET: Target = Target(U256::from_limbs([0x0000_0000_FFFF_0000, 0, 0, 0]));

/// `DIFF1_TARGET` is `0xFFFF << DIFF1_SHIFT`.
const DIFF1_SHIFT: i32 = 208;

/// Bit pattern of 2^-32. Below it `DIFF1_TARGET / d` no longer fits in
/// 256 bits.
const EXACT_MIN_BITS: u64 = (1023 - 32) << 52;

/// Bit pattern of 2^160. From here on the quotient drops below 2^64 and
/// neighbouring difficulties would floor to the same value.
const EXACT_END_BITS: u64 = (1023 + 160) << 52;

const MANTISSA_BITS: u32 = 52;
const MANTISSA_MASK: u64 = (1 << MANTISSA_BITS) - 1;
/// Exponent bias plus mantissa width: `d = mantissa * 2^(exponent - 1075)`.
const EXPONENT_OFFSET: i32 = 1023 + MANTISSA_BITS as i32;

/// Errors building a target from raw bytes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TargetError {
    #[error("target must be {HASH_LEN} bytes, got {0}")]
    InvalidLength(usize),
}

/// A 256-bit share target.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Target(U256);

impl Target {
    pub const MAX: Target = Target(U256::MAX);

    pub fn from_be_bytes(bytes: [u8; HASH_LEN]) -> Self {
        Target(U256::from_be_bytes(bytes))
    }

    /// Build from a slice, rejecting anything that is not exactly 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, TargetError> {
        let array: [u8; HASH_LEN] = bytes
            .try_into()
            .map_err(|_| TargetError::InvalidLength(bytes.len()))?;
        Ok(Self::from_be_bytes(array))
    }

    pub fn to_be_bytes(self) -> [u8; HASH_LEN] {
        self.0.to_be_bytes()
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.to_be_bytes())
    }

    /// True when `hash` is strictly below this target.
    pub fn is_met_by(&self, hash: &[u8]) -> bool {
        validate_hash(hash, &self.to_be_bytes())
    }
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Target({})", self.to_hex())
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Convert a difficulty into a share target.
///
/// For difficulties in `[2^-32, 2^160)` the target is exactly
/// `floor(DIFF1_TARGET / difficulty)`: the float is split into its 53-bit
/// integer mantissa and binary exponent and the division is done in 384-bit
/// integer arithmetic, so every distinct difficulty in that range gets a
/// distinct target.
///
/// Outside that range the quotient either overflows 256 bits or collapses
/// under flooring. There the target is taken from the difficulty's bit
/// pattern instead, packed into the top 2^63 values (tiny difficulties) or
/// the bottom 2^63 values (huge ones) of the target space. Both bands sit
/// beyond anything the exact range produces, so ordering stays strict over
/// every positive finite difficulty.
///
/// Non-positive and NaN difficulties are treated as 1 and `+inf` as
/// `f64::MAX`. The result is never zero.
pub fn difficulty_to_target(difficulty: f64) -> Target {
    let difficulty = if difficulty.is_nan() || difficulty <= 0.0 {
        1.0
    } else {
        difficulty.min(f64::MAX)
    };

    // Positive floats order the same way as their bit patterns.
    let bits = difficulty.to_bits();
    let value = if bits < EXACT_MIN_BITS {
        U256::from_limbs([u64::MAX, u64::MAX, u64::MAX, u64::MAX - bits])
    } else if bits >= EXACT_END_BITS {
        U256::from(f64::MAX.to_bits() - bits + 1)
    } else {
        exact_quotient(bits)
    };
    Target(value)
}

/// `floor(0xFFFF * 2^208 / d)` for a normal `d` in the exact range.
fn exact_quotient(bits: u64) -> U256 {
    let mantissa = (bits & MANTISSA_MASK) | (1 << MANTISSA_BITS);
    let exponent = (bits >> MANTISSA_BITS) as i32 - EXPONENT_OFFSET;

    // 0xFFFF << shift, with shift in [100, 292], as six big-endian limbs.
    let shift = (DIFF1_SHIFT - exponent) as u32;
    let limb = 5 - (shift / 64) as usize;
    let bit = shift % 64;
    let mut numerator = [0u64; 6];
    numerator[limb] = 0xFFFF << bit;
    if bit > 48 {
        numerator[limb - 1] = 0xFFFF >> (64 - bit);
    }

    // The mantissa is never zero and the quotient fits the low four limbs.
    let quotient = div_limbs(numerator, mantissa).unwrap_or_default();
    U256::from_limbs([quotient[2], quotient[3], quotient[4], quotient[5]])
}

/// Check a hash against a target.
///
/// Both are read as 256-bit big-endian unsigned integers; the hash must be
/// strictly smaller. Any buffer that is not exactly 32 bytes fails.
pub fn validate_hash(hash: &[u8], target: &[u8]) -> bool {
    let (Ok(hash), Ok(target)) = (
        <[u8; HASH_LEN]>::try_from(hash),
        <[u8; HASH_LEN]>::try_from(target),
    ) else {
        return false;
    };
    U256::from_be_bytes(hash) < U256::from_be_bytes(target)
}
