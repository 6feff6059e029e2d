// Runner - Devnet startup, status reporting and graceful shutdown
use crate::cli::config::NodeConfig;
use crate::consensus::{build_engine, Miner};
use crate::genesis::ConsensusConfig;
use crate::network::{Inbox, LocalHub, NetworkError};
use crate::node::{BlockChain, ChainError, Node};
use crate::storage::{Database, DatabaseError, MemoryStorage, SharedStorage};
use crate::wallet::{KeyStore, WalletError};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::info;

const STATUS_INTERVAL: Duration = Duration::from_secs(30);

/// Starts every node on one local hub and runs until Ctrl+C
pub async fn run_node(config: NodeConfig) -> Result<(), RunnerError> {
    info!(
        "🚀 Starting keel devnet: {} ({} nodes, {} engine)",
        config.chain.chain_name,
        config.producer_keys.len(),
        engine_name(&config.chain.consensus)
    );
    if config.in_memory {
        info!("💾 Storage: in memory");
    } else {
        std::fs::create_dir_all(&config.base_path)
            .map_err(|e| RunnerError::Io(format!("Failed to create data dir: {}", e)))?;
        info!("📁 Data path: {}", config.base_path.display());
    }

    let hub = LocalHub::new();
    let mut nodes = Vec::with_capacity(config.producer_keys.len());
    let mut handles = Vec::new();

    for index in 0..config.producer_keys.len() {
        let (node, inbox) = build_node(&config, &hub, index)?;
        let node = Arc::new(node);
        handles.extend(node.clone().spawn(inbox, config.intervals.clone()));
        nodes.push(node);
    }

    info!("✅ {} nodes running", nodes.len());

    let mut status_interval = tokio::time::interval(STATUS_INTERVAL);
    status_interval.tick().await;

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("⚠️  Ctrl+C received, shutting down...");
                break;
            }
            _ = status_interval.tick() => {
                for node in &nodes {
                    let chain = node.chain();
                    let chain = chain.lock().await;
                    info!(
                        "📊 {}: tail #{} ({}), lib #{}, pool {}",
                        node.peer_id(),
                        chain.tail().height(),
                        chain.tail().hash(),
                        chain.lib().height(),
                        chain.tx_pool().len()
                    );
                }
            }
        }
    }

    for handle in handles {
        handle.abort();
    }
    info!("👋 Devnet stopped cleanly");
    Ok(())
}

/// Storage, wallet, engine and chain for node `index`, joined to the hub
fn build_node(config: &NodeConfig, hub: &LocalHub, index: usize) -> Result<(Node, Inbox), RunnerError> {
    let storage: SharedStorage = if config.in_memory {
        MemoryStorage::shared()
    } else {
        Arc::new(Database::open(config.node_path(index))?)
    };

    let wallet = KeyStore::new();
    let address = wallet.insert(config.producer_keys[index].clone())?;
    let miner = Miner::new(address, Arc::new(wallet));
    let engine = build_engine(&config.chain.consensus, storage.clone(), Some(miner));

    let chain = BlockChain::open(config.chain.clone(), storage, engine)?
        .with_mempool(config.mempool.clone());
    info!(
        "🔗 node-{}: producer {}, genesis {}, tail #{}",
        index,
        address,
        chain.genesis().hash(),
        chain.tail().height()
    );

    let (network, inbox) = hub.join(format!("node-{}", index))?;
    Ok((Node::new(chain, Arc::new(network)), inbox))
}

fn engine_name(consensus: &ConsensusConfig) -> &'static str {
    match consensus {
        ConsensusConfig::Poa(_) => "poa",
        ConsensusConfig::Dpos(_) => "dpos",
        ConsensusConfig::Pow(_) => "pow",
    }
}

/// Runner errors
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("Wallet error: {0}")]
    Wallet(#[from] WalletError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),
}
