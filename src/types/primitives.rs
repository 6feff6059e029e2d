// Primitives - Fundamental fixed-width types shared by every module
use serde::{Deserialize, Serialize};
use std::fmt;

/// Universal hash (Blake3)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Hash([u8; 32]);

impl Hash {
    pub const ZERO: Hash = Hash([0u8; 32]);

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Hash(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Hash arbitrary data with Blake3
    pub fn hash(data: &[u8]) -> Self {
        let hash = blake3::hash(data);
        Hash(*hash.as_bytes())
    }

    /// Hash a sequence of byte slices as one preimage
    pub fn hash_parts(parts: &[&[u8]]) -> Self {
        let mut hasher = blake3::Hasher::new();
        for part in parts {
            hasher.update(part);
        }
        Hash(*hasher.finalize().as_bytes())
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

impl From<[u8; 32]> for Hash {
    fn from(bytes: [u8; 32]) -> Self {
        Hash(bytes)
    }
}

/// Block height
pub type BlockNumber = u64;

/// Unix timestamp in seconds
pub type Timestamp = u64;

/// Balance in base units
pub type Balance = u128;

/// Replay-protection counter
pub type Nonce = u64;

/// Base units per coin
pub const COIN: Balance = 1_000_000_000;

/// Fixed reward credited to the coinbase of every block
pub const DEFAULT_BLOCK_REWARD: Balance = 10 * COIN;

/// Current wall-clock time in seconds
pub fn now_secs() -> Timestamp {
    chrono::Utc::now().timestamp().max(0) as Timestamp
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_deterministic() {
        let data = b"keel";
        assert_eq!(Hash::hash(data), Hash::hash(data));
    }

    #[test]
    fn test_hash_parts_matches_concatenation() {
        let joined = Hash::hash(b"parent|child");
        let parts = Hash::hash_parts(&[b"parent", b"|", b"child"]);
        assert_eq!(joined, parts);
    }

    #[test]
    fn test_zero_hash() {
        assert!(Hash::ZERO.is_zero());
        assert!(!Hash::hash(b"x").is_zero());
    }
}
