// Signature wrapper for serialization
use serde::{Deserialize, Deserializer, Serialize, Serializer};

// =============================================================================
// Domain separation constants for signatures
// =============================================================================
//
// Each signature type uses a unique prefix that is prepended to the message
// before signing/verification, so a block signature can never be replayed as
// a transaction signature and vice versa.
// =============================================================================

/// Domain separator for block header signatures (coinbase over header hash)
pub const DOMAIN_BLOCK_HEADER: &[u8] = b"KEEL_BLOCK_HEADER_V1:";

/// Domain separator for transaction signatures (sender over tx hash)
pub const DOMAIN_TRANSACTION: &[u8] = b"KEEL_TRANSACTION_V1:";

/// Create a domain-separated message for signing
#[inline]
pub fn domain_separate(domain: &[u8], message: &[u8]) -> Vec<u8> {
    let mut separated = Vec::with_capacity(domain.len() + message.len());
    separated.extend_from_slice(domain);
    separated.extend_from_slice(message);
    separated
}

/// Ed25519 signature (64 bytes) with serialization
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signature64(pub [u8; 64]);

impl Signature64 {
    pub fn from_bytes(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }

    pub fn zero() -> Self {
        Self([0; 64])
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

impl Default for Signature64 {
    fn default() -> Self {
        Self::zero()
    }
}

impl From<[u8; 64]> for Signature64 {
    fn from(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Signature64 {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

// serde only derives arrays up to 32 bytes
impl Serialize for Signature64 {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for Signature64 {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let bytes = <Vec<u8>>::deserialize(deserializer)?;
        if bytes.len() != 64 {
            return Err(serde::de::Error::custom("Signature must be 64 bytes"));
        }
        let mut arr = [0u8; 64];
        arr.copy_from_slice(&bytes);
        Ok(Signature64(arr))
    }
}
