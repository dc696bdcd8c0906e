//! 256-bit unsigned integer for difficulty and target arithmetic.
//!
//! Only the operations the share validator needs: byte conversion, ordering,
//! shifts and division by a 64-bit divisor.

use std::cmp::Ordering;
use std::ops::{Shl, Shr};

/// A 256-bit unsigned integer stored as four 64-bit limbs.
///
/// Layout: `limbs[0]` is the most significant limb.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct U256 {
    limbs: [u64; 4],
}

impl U256 {
    pub const ZERO: Self = Self { limbs: [0; 4] };
    pub const ONE: Self = Self { limbs: [0, 0, 0, 1] };
    pub const MAX: Self = Self {
        limbs: [u64::MAX; 4],
    };

    /// Build from limbs, most significant first.
    pub const fn from_limbs(limbs: [u64; 4]) -> Self {
        Self { limbs }
    }

    /// Create from big-endian bytes
    pub fn from_be_bytes(bytes: [u8; 32]) -> Self {
        let mut limbs = [0u64; 4];
        for (limb, chunk) in limbs.iter_mut().zip(bytes.chunks_exact(8)) {
            let mut word = [0u8; 8];
            word.copy_from_slice(chunk);
            *limb = u64::from_be_bytes(word);
        }
        Self { limbs }
    }

    /// Convert to big-endian bytes
    pub fn to_be_bytes(self) -> [u8; 32] {
        let mut bytes = [0u8; 32];
        for (chunk, limb) in bytes.chunks_exact_mut(8).zip(self.limbs) {
            chunk.copy_from_slice(&limb.to_be_bytes());
        }
        bytes
    }

    pub fn is_zero(&self) -> bool {
        self.limbs.iter().all(|&l| l == 0)
    }

    /// Divide by a u64 value. Returns `None` for a zero divisor.
    pub fn checked_div_u64(self, divisor: u64) -> Option<Self> {
        div_limbs(self.limbs, divisor).map(|limbs| Self { limbs })
    }
}

/// Long division of a big-endian limb array by a u64, most significant limb
/// first. Returns `None` for a zero divisor.
pub(crate) fn div_limbs<const N: usize>(limbs: [u64; N], divisor: u64) -> Option<[u64; N]> {
    if divisor == 0 {
        return None;
    }

    let divisor = divisor as u128;
    let mut remainder: u128 = 0;
    let mut quotient = [0u64; N];

    for (out, &limb) in quotient.iter_mut().zip(limbs.iter()) {
        remainder = (remainder << 64) | limb as u128;
        *out = (remainder / divisor) as u64;
        remainder %= divisor;
    }

    Some(quotient)
}

impl Ord for U256 {
    fn cmp(&self, other: &Self) -> Ordering {
        // Limbs are stored most significant first, so lexicographic order is
        // numeric order.
        self.limbs.cmp(&other.limbs)
    }
}

impl PartialOrd for U256 {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl From<u64> for U256 {
    fn from(value: u64) -> Self {
        Self {
            limbs: [0, 0, 0, value],
        }
    }
}

impl Shr<u32> for U256 {
    type Output = Self;

    fn shr(self, shift: u32) -> Self::Output {
        if shift >= 256 {
            return Self::ZERO;
        }
        let limb_shift = (shift / 64) as usize;
        let bit_shift = shift % 64;
        let mut limbs = [0u64; 4];

        for i in limb_shift..4 {
            let src = i - limb_shift;
            limbs[i] = self.limbs[src] >> bit_shift;
            if bit_shift > 0 && src > 0 {
                limbs[i] |= self.limbs[src - 1] << (64 - bit_shift);
            }
        }
        Self { limbs }
    }
}

impl Shl<u32> for U256 {
    type Output = Self;

    /// Bits shifted past the top are discarded.
    fn shl(self, shift: u32) -> Self::Output {
        if shift >= 256 {
            return Self::ZERO;
        }
        let limb_shift = (shift / 64) as usize;
        let bit_shift = shift % 64;
        let mut limbs = [0u64; 4];

        for i in 0..(4 - limb_shift) {
            let src = i + limb_shift;
            limbs[i] = self.limbs[src] << bit_shift;
            if bit_shift > 0 && src < 3 {
                limbs[i] |= self.limbs[src + 1] >> (64 - bit_shift);
            }
        }
        Self { limbs }
    }
}
