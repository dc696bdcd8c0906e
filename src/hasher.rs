//! Proof-of-work hash oracle.
//!
//! The proxy never implements the mining hash itself. Anything that maps
//! header bytes to a 32-byte digest can be plugged in; a production build
//! would bind an external memory-hard PoW library behind this trait.

use sha2::{Digest, Sha256};

use crate::share::HASH_LEN;

/// Hashes canonical header bytes for share validation.
///
/// Calls may block for a long time, so callers run them off the async
/// executor.
pub trait HashOracle: Send + Sync + 'static {
    fn hash(&self, header: &[u8]) -> [u8; HASH_LEN];

    /// Short name for logs.
    fn name(&self) -> &'static str;
}

/// Number of extra SHA-256 rounds applied by [`Sha256Rounds`].
const EXTRA_ROUNDS: u64 = 8;

/// Placeholder oracle: SHA-256 of the header, then eight more rounds each
/// mixing in the little-endian round number.
#[derive(Debug, Default, Clone, Copy)]
pub struct Sha256Rounds;

impl HashOracle for Sha256Rounds {
    fn hash(&self, header: &[u8]) -> [u8; HASH_LEN] {
        let mut digest: [u8; HASH_LEN] = Sha256::digest(header).into();
        for round in 0..EXTRA_ROUNDS {
            let mut hasher = Sha256::new();
            hasher.update(digest);
            hasher.update(round.to_le_bytes());
            digest = hasher.finalize().into();
        }
        digest
    }

    fn name(&self) -> &'static str {
        "sha256-rounds"
    }
}

/// Double SHA-256, used for coinbase and merkle hashing.
pub fn sha256d(data: &[u8]) -> [u8; HASH_LEN] {
    Sha256::digest(Sha256::digest(data)).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_deterministic() {
        let oracle = Sha256Rounds;
        let a = oracle.hash(b"test data");
        let b = oracle.hash(b"test data");
        assert_eq!(a, b);
        assert_ne!(a, oracle.hash(b"different data"));
    }

    #[test]
    fn test_rounds_differ_from_plain_sha256() {
        let plain: [u8; 32] = Sha256::digest(b"header").into();
        assert_ne!(Sha256Rounds.hash(b"header"), plain);
    }

    #[test]
    fn test_sha256d_known_vector() {
        // sha256d("") = 5df6e0e2761359d30a8275058e299fcc0381534545f55cf43e41983f5d4c9456
        assert_eq!(
            hex::encode(sha256d(b"")),
            "5df6e0e2761359d30a8275058e299fcc0381534545f55cf43e41983f5d4c9456"
        );
    }
}
