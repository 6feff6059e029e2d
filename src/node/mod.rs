// Node - Chain core, transaction pool and the service loop around them
pub mod blockchain;
pub mod mempool;
pub mod service;

pub use blockchain::{Ancestors, BlockChain, ChainError, ExecutionError, TipHeight};
pub use mempool::{MempoolConfig, PoolError, PoolStats, TransactionPool};
pub use service::{ImportOutcome, Node, NodeError, NodeIntervals};
