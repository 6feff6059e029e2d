// State - Per-block state views and chain metadata persistence
use super::kv::{SharedStorage, StorageError, WriteOp};
use super::trie::{Trie, TrieError};
use crate::consensus::ConsensusState;
use crate::types::{Account, Address, Block, BlockNumber, Hash, Transaction};
use serde::{Deserialize, Serialize};

/// Storage key prefixes
const PREFIX_BLOCK_BY_HASH: &[u8] = b"block_by_hash:";
const PREFIX_BLOCK_BY_NUMBER: &[u8] = b"block_by_num:";
const KEY_GENESIS_HASH: &[u8] = b"genesis_hash";
const KEY_TAIL: &[u8] = b"tail";
const KEY_LIB: &[u8] = b"lib";

// =============================================================================
// ACCOUNT STATE
// =============================================================================

/// Address -> Account
#[derive(Debug, Clone)]
pub struct AccountState {
    trie: Trie,
}

impl AccountState {
    pub fn new(storage: SharedStorage) -> Self {
        Self {
            trie: Trie::new(storage),
        }
    }

    pub fn from_root(storage: SharedStorage, root: Hash) -> Result<Self, TrieError> {
        Ok(Self {
            trie: Trie::from_root(storage, root)?,
        })
    }

    pub fn get_account(&self, address: &Address) -> Result<Account, TrieError> {
        self.trie.get_value(&address.to_bytes())
    }

    /// Existing account, or a fresh zero-balance one
    pub fn get_or_create(&self, address: &Address) -> Result<Account, TrieError> {
        match self.get_account(address) {
            Ok(account) => Ok(account),
            Err(TrieError::NotFound) => Ok(Account::new(*address)),
            Err(e) => Err(e),
        }
    }

    pub fn put_account(&mut self, account: &Account) -> Result<(), TrieError> {
        self.trie.put_value(&account.address.to_bytes(), account)
    }

    pub fn exists(&self, address: &Address) -> Result<bool, TrieError> {
        self.trie.contains(&address.to_bytes())
    }

    pub fn len(&self) -> usize {
        self.trie.len()
    }

    /// Accounts in address order
    pub fn accounts(&self) -> impl Iterator<Item = Result<Account, TrieError>> + '_ {
        self.trie.iterate().map(|entry| {
            let (_, value) = entry?;
            bincode::deserialize(value).map_err(|e| TrieError::Codec(e.to_string()))
        })
    }

    pub fn root_hash(&self) -> Hash {
        self.trie.root_hash()
    }

    pub fn commit(&self) -> Result<Hash, TrieError> {
        self.trie.commit()
    }
}

// =============================================================================
// TRANSACTION STATE
// =============================================================================

/// Inclusion record; `transaction.height` carries the including block
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncludedTransaction {
    pub transaction: Transaction,
    pub index: u32,
}

/// Transaction hash -> inclusion record, for every transaction on this branch
#[derive(Debug, Clone)]
pub struct TransactionState {
    trie: Trie,
}

impl TransactionState {
    pub fn new(storage: SharedStorage) -> Self {
        Self {
            trie: Trie::new(storage),
        }
    }

    pub fn from_root(storage: SharedStorage, root: Hash) -> Result<Self, TrieError> {
        Ok(Self {
            trie: Trie::from_root(storage, root)?,
        })
    }

    pub fn put_transaction(&mut self, transaction: &Transaction, index: u32) -> Result<(), TrieError> {
        let record = IncludedTransaction {
            transaction: transaction.clone(),
            index,
        };
        self.trie.put_value(transaction.hash().as_bytes(), &record)
    }

    pub fn get_transaction(&self, hash: &Hash) -> Result<IncludedTransaction, TrieError> {
        self.trie.get_value(hash.as_bytes())
    }

    pub fn contains(&self, hash: &Hash) -> Result<bool, TrieError> {
        self.trie.contains(hash.as_bytes())
    }

    pub fn len(&self) -> usize {
        self.trie.len()
    }

    pub fn root_hash(&self) -> Hash {
        self.trie.root_hash()
    }

    pub fn commit(&self) -> Result<Hash, TrieError> {
        self.trie.commit()
    }
}

// =============================================================================
// BLOCK STATES
// =============================================================================

/// The three views rooted at one block
#[derive(Debug, Clone)]
pub struct BlockStates {
    pub account_state: AccountState,
    pub transaction_state: TransactionState,
    pub consensus_state: ConsensusState,
}

impl BlockStates {
    /// Persists account and transaction views (engines persist their own)
    pub fn commit(&self) -> Result<(), TrieError> {
        self.account_state.commit()?;
        self.transaction_state.commit()?;
        Ok(())
    }
}

// =============================================================================
// CHAIN STORE
// =============================================================================

/// Blocks plus the genesis/tail/LIB pointers and the canonical height index
#[derive(Clone)]
pub struct ChainStore {
    storage: SharedStorage,
}

impl ChainStore {
    pub fn new(storage: SharedStorage) -> Self {
        Self { storage }
    }

    pub fn storage(&self) -> &SharedStorage {
        &self.storage
    }

    /// Stores a block body (states are never persisted with it)
    pub fn store_block(&self, block: &Block) -> Result<(), ChainStoreError> {
        let bytes =
            bincode::serialize(&block.detached()).map_err(|e| ChainStoreError::Codec(e.to_string()))?;
        self.storage.put(&block_key(&block.hash()), &bytes)?;
        Ok(())
    }

    pub fn load_block(&self, hash: &Hash) -> Result<Block, ChainStoreError> {
        let bytes = self.storage.get(&block_key(hash))?;
        bincode::deserialize(&bytes).map_err(|e| ChainStoreError::Codec(e.to_string()))
    }

    /// Rewrites the canonical index for the given heights in one batch
    pub fn set_canonical(&self, entries: &[(BlockNumber, Hash)]) -> Result<(), ChainStoreError> {
        let ops = entries
            .iter()
            .map(|(height, hash)| WriteOp::Put {
                key: number_key(*height),
                value: hash.as_bytes().to_vec(),
            })
            .collect();
        self.storage.write_batch(ops)?;
        Ok(())
    }

    pub fn canonical_hash(&self, height: BlockNumber) -> Result<Hash, ChainStoreError> {
        let bytes = self.storage.get(&number_key(height))?;
        decode_hash(&bytes)
    }

    pub fn set_genesis(&self, hash: &Hash) -> Result<(), ChainStoreError> {
        Ok(self.storage.put(KEY_GENESIS_HASH, hash.as_bytes())?)
    }

    pub fn genesis(&self) -> Result<Option<Hash>, ChainStoreError> {
        self.get_pointer(KEY_GENESIS_HASH)
    }

    pub fn set_tail(&self, hash: &Hash) -> Result<(), ChainStoreError> {
        Ok(self.storage.put(KEY_TAIL, hash.as_bytes())?)
    }

    pub fn tail(&self) -> Result<Option<Hash>, ChainStoreError> {
        self.get_pointer(KEY_TAIL)
    }

    pub fn set_lib(&self, hash: &Hash) -> Result<(), ChainStoreError> {
        Ok(self.storage.put(KEY_LIB, hash.as_bytes())?)
    }

    pub fn lib(&self) -> Result<Option<Hash>, ChainStoreError> {
        self.get_pointer(KEY_LIB)
    }

    fn get_pointer(&self, key: &[u8]) -> Result<Option<Hash>, ChainStoreError> {
        match self.storage.get(key) {
            Ok(bytes) => Ok(Some(decode_hash(&bytes)?)),
            Err(StorageError::NotFound) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

fn block_key(hash: &Hash) -> Vec<u8> {
    let mut key = PREFIX_BLOCK_BY_HASH.to_vec();
    key.extend_from_slice(hash.as_bytes());
    key
}

fn number_key(height: BlockNumber) -> Vec<u8> {
    let mut key = PREFIX_BLOCK_BY_NUMBER.to_vec();
    key.extend_from_slice(&height.to_be_bytes());
    key
}

fn decode_hash(bytes: &[u8]) -> Result<Hash, ChainStoreError> {
    let array: [u8; 32] = bytes
        .try_into()
        .map_err(|_| ChainStoreError::Codec(format!("expected 32-byte hash, got {}", bytes.len())))?;
    Ok(Hash::from_bytes(array))
}

/// Chain store errors
#[derive(Debug, thiserror::Error)]
pub enum ChainStoreError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Encoding error: {0}")]
    Codec(String),
}
