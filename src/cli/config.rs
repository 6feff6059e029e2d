// CLI Configuration - Convert CLI args to devnet config
use crate::cli::{default_base_path, RunCmd};
use crate::genesis::{dev_key, ChainConfig, ConfigError as ChainConfigError};
use crate::node::{MempoolConfig, NodeIntervals};
use crate::wallet::KeyFile;
use ed25519_dalek::SigningKey;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Everything the runner needs, resolved from CLI arguments
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub chain: ChainConfig,

    /// Data root; node `i` lives under `node-{i}`
    pub base_path: PathBuf,

    /// In-memory storage instead of RocksDB
    pub in_memory: bool,

    /// One producer key per node
    pub producer_keys: Vec<SigningKey>,

    pub intervals: NodeIntervals,

    pub mempool: MempoolConfig,
}

impl NodeConfig {
    pub fn from_run_cmd(cmd: &RunCmd) -> Result<Self, ConfigError> {
        if cmd.nodes == 0 {
            return Err(ConfigError::InvalidNodeCount);
        }

        let chain = match ChainConfig::preset(&cmd.chain) {
            Some(chain) => chain,
            None => Self::load_chain_config(Path::new(&cmd.chain))?,
        };
        chain.validate()?;

        let producer_keys = if cmd.keys.is_empty() {
            (0..cmd.nodes).map(dev_key).collect()
        } else {
            if cmd.keys.len() != cmd.nodes as usize {
                return Err(ConfigError::KeyCountMismatch {
                    nodes: cmd.nodes,
                    keys: cmd.keys.len(),
                });
            }
            cmd.keys
                .iter()
                .map(|path| Self::load_producer_key(path))
                .collect::<Result<Vec<_>, _>>()?
        };

        let base_path = cmd
            .base_path
            .clone()
            .unwrap_or_else(|| default_base_path(&chain.chain_name));

        info!("⛓️  Chain: {} ({} accounts)", chain.chain_name, chain.accounts.len());

        Ok(Self {
            chain,
            base_path,
            in_memory: cmd.dev,
            producer_keys,
            intervals: NodeIntervals {
                mine: Duration::from_millis(cmd.mine_interval_ms.max(1)),
                sync: Duration::from_secs(cmd.sync_interval_secs.max(1)),
            },
            mempool: MempoolConfig {
                max_size: cmd.max_pool,
                ..Default::default()
            },
        })
    }

    fn load_chain_config(path: &Path) -> Result<ChainConfig, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::ChainSpecNotFound(path.display().to_string()));
        }
        Ok(ChainConfig::from_file(path)?)
    }

    fn load_producer_key(path: &Path) -> Result<SigningKey, ConfigError> {
        KeyFile::from_file(path)
            .and_then(|file| file.signing_key())
            .map_err(|e| ConfigError::KeyLoadError(format!("{}: {}", path.display(), e)))
    }

    /// Data directory of node `index`
    pub fn node_path(&self, index: usize) -> PathBuf {
        self.base_path.join(format!("node-{}", index))
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Chain spec not found: {0}")]
    ChainSpecNotFound(String),

    #[error("Chain config error: {0}")]
    Chain(#[from] ChainConfigError),

    #[error("Failed to load key: {0}")]
    KeyLoadError(String),

    #[error("{keys} key files given for {nodes} nodes")]
    KeyCountMismatch { nodes: u32, keys: usize },

    #[error("At least one node is required")]
    InvalidNodeCount,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::{Cli, Commands};
    use clap::Parser;
    use tempfile::TempDir;

    fn run_cmd(args: &[&str]) -> RunCmd {
        let mut argv = vec!["keel-node", "run"];
        argv.extend_from_slice(args);
        match Cli::try_parse_from(argv).unwrap().command {
            Commands::Run(cmd) => cmd,
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_preset_with_dev_keys() {
        let config = NodeConfig::from_run_cmd(&run_cmd(&["--chain", "dpos", "--nodes", "2"])).unwrap();
        assert_eq!(config.chain.chain_name, "keel-devnet-dpos");
        assert_eq!(config.producer_keys.len(), 2);
        assert_eq!(config.producer_keys[1].to_bytes(), dev_key(1).to_bytes());
        assert!(config.node_path(1).ends_with("node-1"));
    }

    #[test]
    fn test_chain_file_and_key_files() {
        let temp_dir = TempDir::new().unwrap();
        let chain_path = temp_dir.path().join("chain.json");
        ChainConfig::devnet_pow().to_file(&chain_path).unwrap();

        let key_path = temp_dir.path().join("k.json");
        let key = SigningKey::from_bytes(&[5; 32]);
        KeyFile::from_signing_key(&key).to_file(&key_path).unwrap();

        let config = NodeConfig::from_run_cmd(&run_cmd(&[
            "--chain",
            chain_path.to_str().unwrap(),
            "--nodes",
            "1",
            "--key",
            key_path.to_str().unwrap(),
        ]))
        .unwrap();
        assert_eq!(config.chain.chain_name, "keel-devnet-pow");
        assert_eq!(config.producer_keys[0].to_bytes(), key.to_bytes());
    }

    #[test]
    fn test_key_count_mismatch() {
        let result = NodeConfig::from_run_cmd(&run_cmd(&["--nodes", "2", "--key", "a.json"]));
        assert!(matches!(result, Err(ConfigError::KeyCountMismatch { nodes: 2, keys: 1 })));
    }

    #[test]
    fn test_missing_chain_file() {
        let result = NodeConfig::from_run_cmd(&run_cmd(&["--chain", "/nonexistent/chain.json"]));
        assert!(matches!(result, Err(ConfigError::ChainSpecNotFound(_))));
    }
}
