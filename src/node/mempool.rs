// Mempool - FIFO transaction pool
//
// Arrival order is execution order; nonce gaps are resolved by the block
// builder, not here.

use crate::types::{Hash, Transaction};
use std::collections::{HashSet, VecDeque};
use tracing::debug;

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Mempool configuration
#[derive(Debug, Clone)]
pub struct MempoolConfig {
    /// Maximum number of transactions in pool
    pub max_size: usize,

    /// Check signatures on entry
    pub verify_signatures: bool,
}

impl Default for MempoolConfig {
    fn default() -> Self {
        Self {
            max_size: 10_000,
            verify_signatures: true,
        }
    }
}

/// Counters since startup
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub total_added: u64,
    pub total_popped: u64,
    pub total_removed: u64,
    pub total_rejected: u64,
}

// =============================================================================
// POOL
// =============================================================================

pub struct TransactionPool {
    queue: VecDeque<Transaction>,
    hashes: HashSet<Hash>,
    config: MempoolConfig,
    stats: PoolStats,
}

impl TransactionPool {
    pub fn new(max_size: usize) -> Self {
        Self::with_config(MempoolConfig {
            max_size,
            ..Default::default()
        })
    }

    pub fn with_config(config: MempoolConfig) -> Self {
        Self {
            queue: VecDeque::new(),
            hashes: HashSet::new(),
            config,
            stats: PoolStats::default(),
        }
    }

    /// Appends to the back; a hash already queued is rejected
    pub fn push(&mut self, tx: Transaction) -> Result<(), PoolError> {
        let hash = tx.hash();
        if self.hashes.contains(&hash) {
            self.stats.total_rejected += 1;
            return Err(PoolError::AlreadyExists(hash));
        }
        if self.queue.len() >= self.config.max_size {
            self.stats.total_rejected += 1;
            return Err(PoolError::PoolFull);
        }
        if self.config.verify_signatures && tx.verify().is_err() {
            self.stats.total_rejected += 1;
            return Err(PoolError::InvalidSignature(hash));
        }

        self.hashes.insert(hash);
        self.queue.push_back(tx);
        self.stats.total_added += 1;
        Ok(())
    }

    /// Removes and returns the oldest transaction
    pub fn pop(&mut self) -> Option<Transaction> {
        let tx = self.queue.pop_front()?;
        self.hashes.remove(&tx.hash());
        self.stats.total_popped += 1;
        Some(tx)
    }

    pub fn peek(&self) -> Option<&Transaction> {
        self.queue.front()
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.hashes.contains(hash)
    }

    /// Drops transactions a newly accepted block already executed
    pub fn remove_included(&mut self, block_txs: &[Transaction]) {
        let included: HashSet<Hash> = block_txs
            .iter()
            .map(|tx| tx.hash())
            .filter(|hash| self.hashes.contains(hash))
            .collect();
        if included.is_empty() {
            return;
        }

        self.queue.retain(|tx| !included.contains(&tx.hash()));
        for hash in &included {
            self.hashes.remove(hash);
        }
        self.stats.total_removed += included.len() as u64;
        debug!("Removed {} included transactions from pool", included.len());
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }

    pub fn config(&self) -> &MempoolConfig {
        &self.config
    }
}

impl Default for TransactionPool {
    fn default() -> Self {
        Self::with_config(MempoolConfig::default())
    }
}

/// Pool errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("Transaction {0} already in pool")]
    AlreadyExists(Hash),

    #[error("Pool is full")]
    PoolFull,

    #[error("Invalid signature on transaction {0}")]
    InvalidSignature(Hash),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Address;
    use ed25519_dalek::SigningKey;

    fn signed_tx(seed: u8, nonce: u64) -> Transaction {
        let key = SigningKey::from_bytes(&[seed; 32]);
        let from = Address::from_public_key(&key.verifying_key());
        let mut tx = Transaction::transfer(from, Address::from_public_key_bytes([0xEE; 32]), 1, nonce);
        tx.sign(&key).unwrap();
        tx
    }

    #[test]
    fn test_fifo_order() {
        let mut pool = TransactionPool::default();
        let txs: Vec<_> = (1..=3).map(|n| signed_tx(1, n)).collect();
        for tx in &txs {
            pool.push(tx.clone()).unwrap();
        }

        assert_eq!(pool.peek().map(|t| t.hash()), Some(txs[0].hash()));
        for tx in &txs {
            assert_eq!(pool.pop().unwrap().hash(), tx.hash());
        }
        assert!(pool.pop().is_none());
    }

    #[test]
    fn test_duplicate_transaction() {
        let mut pool = TransactionPool::default();
        let tx = signed_tx(1, 1);
        pool.push(tx.clone()).unwrap();
        assert_eq!(pool.push(tx.clone()), Err(PoolError::AlreadyExists(tx.hash())));
        assert_eq!(pool.len(), 1);

        // Once popped it may come back
        pool.pop();
        assert!(pool.push(tx).is_ok());
    }

    #[test]
    fn test_pool_full() {
        let mut pool = TransactionPool::new(2);
        pool.push(signed_tx(1, 1)).unwrap();
        pool.push(signed_tx(1, 2)).unwrap();
        assert_eq!(pool.push(signed_tx(1, 3)), Err(PoolError::PoolFull));
    }

    #[test]
    fn test_unsigned_rejected() {
        let mut pool = TransactionPool::default();
        let tx = Transaction::transfer(
            Address::from_public_key_bytes([1; 32]),
            Address::from_public_key_bytes([2; 32]),
            1,
            1,
        );
        assert_eq!(pool.push(tx.clone()), Err(PoolError::InvalidSignature(tx.hash())));
        assert_eq!(pool.stats().total_rejected, 1);
    }

    #[test]
    fn test_remove_included() {
        let mut pool = TransactionPool::default();
        let txs: Vec<_> = (1..=4).map(|n| signed_tx(2, n)).collect();
        for tx in &txs {
            pool.push(tx.clone()).unwrap();
        }

        pool.remove_included(&[txs[1].clone(), txs[3].clone()]);
        assert_eq!(pool.len(), 2);
        assert!(!pool.contains(&txs[1].hash()));
        assert_eq!(pool.pop().unwrap().hash(), txs[0].hash());
        assert_eq!(pool.pop().unwrap().hash(), txs[2].hash());
        assert_eq!(pool.stats().total_removed, 2);
    }
}
