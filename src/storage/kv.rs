// KV - Byte-key to byte-value store contract
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Write operation for batches
#[derive(Debug, Clone)]
pub enum WriteOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

/// Backing store for tries and chain metadata
///
/// `NotFound` is the only distinguished error; everything else is a backend
/// failure.
pub trait Storage: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Vec<u8>, StorageError>;

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError>;

    fn delete(&self, key: &[u8]) -> Result<(), StorageError>;

    fn write_batch(&self, ops: Vec<WriteOp>) -> Result<(), StorageError> {
        for op in ops {
            match op {
                WriteOp::Put { key, value } => self.put(&key, &value)?,
                WriteOp::Delete { key } => self.delete(&key)?,
            }
        }
        Ok(())
    }

    fn exists(&self, key: &[u8]) -> Result<bool, StorageError> {
        match self.get(key) {
            Ok(_) => Ok(true),
            Err(StorageError::NotFound) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

pub type SharedStorage = Arc<dyn Storage>;

/// In-memory store (tests, throwaway devnets)
#[derive(Debug, Default)]
pub struct MemoryStorage {
    data: RwLock<HashMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedStorage {
        Arc::new(Self::new())
    }

    pub fn len(&self) -> usize {
        self.data.read().map(|d| d.len()).unwrap_or(0)
    }

    /// Total key and value bytes held
    pub fn size_bytes(&self) -> usize {
        self.data
            .read()
            .map(|d| d.iter().map(|(k, v)| k.len() + v.len()).sum())
            .unwrap_or(0)
    }
}

impl Storage for MemoryStorage {
    fn get(&self, key: &[u8]) -> Result<Vec<u8>, StorageError> {
        let data = self
            .data
            .read()
            .map_err(|_| StorageError::Backend("memory store lock poisoned".to_string()))?;
        data.get(key).cloned().ok_or(StorageError::NotFound)
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        let mut data = self
            .data
            .write()
            .map_err(|_| StorageError::Backend("memory store lock poisoned".to_string()))?;
        data.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), StorageError> {
        let mut data = self
            .data
            .write()
            .map_err(|_| StorageError::Backend("memory store lock poisoned".to_string()))?;
        data.remove(key);
        Ok(())
    }
}

/// Storage errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    #[error("Key not found")]
    NotFound,

    #[error("Storage backend failure: {0}")]
    Backend(String),
}
