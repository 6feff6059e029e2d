// Wallet - Key custody and signing for local producers
use crate::types::{Address, Hash, Signature64};
use ed25519_dalek::{Signer, SigningKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

pub const KEY_SCHEME: &str = "ed25519";

/// Signs digests on behalf of the addresses it holds keys for
pub trait Wallet: Send + Sync {
    fn sign_hash(&self, address: &Address, hash: &Hash) -> Result<Signature64, WalletError>;
}

/// In-memory keystore
#[derive(Default)]
pub struct KeyStore {
    keys: RwLock<HashMap<Address, SigningKey>>,
}

impl KeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a key, returns its address
    pub fn insert(&self, key: SigningKey) -> Result<Address, WalletError> {
        let address = Address::from_public_key(&key.verifying_key());
        self.keys
            .write()
            .map_err(|_| WalletError::LockPoisoned)?
            .insert(address, key);
        Ok(address)
    }

    pub fn generate(&self) -> Result<Address, WalletError> {
        self.insert(SigningKey::generate(&mut OsRng))
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.keys
            .read()
            .map(|keys| keys.contains_key(address))
            .unwrap_or(false)
    }

    /// Loads a key file and adds its key
    pub fn import_file<P: AsRef<Path>>(&self, path: P) -> Result<Address, WalletError> {
        let key = KeyFile::from_file(path)?.signing_key()?;
        self.insert(key)
    }
}

impl Wallet for KeyStore {
    fn sign_hash(&self, address: &Address, hash: &Hash) -> Result<Signature64, WalletError> {
        let keys = self.keys.read().map_err(|_| WalletError::LockPoisoned)?;
        let key = keys
            .get(address)
            .ok_or(WalletError::UnknownAddress(*address))?;
        Ok(Signature64::from(key.sign(hash.as_bytes()).to_bytes()))
    }
}

// =============================================================================
// KEY FILES
// =============================================================================

/// JSON key file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyFile {
    pub scheme: String,
    pub secret_key: String,
    pub public_key: String,
    pub address: String,
}

impl KeyFile {
    pub fn from_signing_key(key: &SigningKey) -> Self {
        let verifying_key = key.verifying_key();
        Self {
            scheme: KEY_SCHEME.to_string(),
            secret_key: format!("0x{}", hex::encode(key.to_bytes())),
            public_key: format!("0x{}", hex::encode(verifying_key.to_bytes())),
            address: Address::from_public_key(&verifying_key).to_hex(),
        }
    }

    pub fn signing_key(&self) -> Result<SigningKey, WalletError> {
        if self.scheme != KEY_SCHEME {
            return Err(WalletError::InvalidKey(format!("unsupported scheme {}", self.scheme)));
        }
        let secret = parse_secret(&self.secret_key)?;
        let key = SigningKey::from_bytes(&secret);

        let expected = Address::from_public_key(&key.verifying_key()).to_hex();
        if expected != self.address {
            return Err(WalletError::InvalidKey("address does not match secret key".to_string()));
        }
        Ok(key)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, WalletError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| WalletError::Io(format!("{}: {}", path.as_ref().display(), e)))?;
        serde_json::from_str(&content).map_err(|e| WalletError::InvalidKey(e.to_string()))
    }

    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), WalletError> {
        let content =
            serde_json::to_string_pretty(self).map_err(|e| WalletError::InvalidKey(e.to_string()))?;
        std::fs::write(path.as_ref(), content)
            .map_err(|e| WalletError::Io(format!("{}: {}", path.as_ref().display(), e)))
    }
}

/// Parses a 32-byte hex secret, `0x` prefix optional
pub fn parse_secret(secret: &str) -> Result<[u8; 32], WalletError> {
    let bytes = hex::decode(secret.strip_prefix("0x").unwrap_or(secret))
        .map_err(|e| WalletError::InvalidKey(e.to_string()))?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| WalletError::InvalidKey(format!("expected 32 bytes, got {}", bytes.len())))
}

/// Wallet errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WalletError {
    #[error("No key for address {0}")]
    UnknownAddress(Address),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Key file I/O error: {0}")]
    Io(String),

    #[error("Keystore lock poisoned")]
    LockPoisoned,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sign_hash_verifies_against_address() {
        let store = KeyStore::new();
        let address = store.generate().unwrap();
        let hash = Hash::hash(b"header");

        let signature = store.sign_hash(&address, &hash).unwrap();
        assert!(address.verify(hash.as_bytes(), signature.as_bytes()));
    }

    #[test]
    fn test_unknown_address_rejected() {
        let store = KeyStore::new();
        let stranger = Address::from_public_key_bytes([7; 32]);
        assert_eq!(
            store.sign_hash(&stranger, &Hash::ZERO),
            Err(WalletError::UnknownAddress(stranger))
        );
    }

    #[test]
    fn test_key_file_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("miner.json");
        let key = SigningKey::from_bytes(&[9; 32]);

        KeyFile::from_signing_key(&key).to_file(&path).unwrap();

        let store = KeyStore::new();
        let address = store.import_file(&path).unwrap();
        assert_eq!(address, Address::from_public_key(&key.verifying_key()));
        assert!(store.contains(&address));
    }

    #[test]
    fn test_key_file_address_mismatch() {
        let mut file = KeyFile::from_signing_key(&SigningKey::from_bytes(&[1; 32]));
        file.address = Address::from_public_key_bytes([2; 32]).to_hex();
        assert!(matches!(file.signing_key(), Err(WalletError::InvalidKey(_))));
    }
}
