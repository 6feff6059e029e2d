// Chain configuration - Genesis parameters and engine selection
use crate::consensus::{DposConfig, PoaConfig, PowConfig};
use crate::types::{Address, Balance, Timestamp, COIN, DEFAULT_BLOCK_REWARD};
use ed25519_dalek::SigningKey;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Fixed genesis timestamp for deterministic genesis hash across nodes
/// 2025-01-01 00:00:00 UTC
pub const GENESIS_TIMESTAMP: Timestamp = 1735689600;

/// Accepted clock skew for incoming blocks, in seconds
pub const DEFAULT_MAX_FUTURE_DRIFT: u64 = 15;

/// Number of funded accounts in the devnet presets
pub const DEV_ACCOUNT_COUNT: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainConfig {
    pub chain_name: String,

    pub genesis_time: Timestamp,

    /// Credited to every block's coinbase
    pub block_reward: Balance,

    #[serde(default = "default_max_future_drift")]
    pub max_future_drift: u64,

    pub consensus: ConsensusConfig,

    /// Seeded into the genesis account state
    pub accounts: Vec<GenesisAccount>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "engine", rename_all = "lowercase")]
pub enum ConsensusConfig {
    Poa(PoaConfig),
    Dpos(DposConfig),
    Pow(PowConfig),
}

/// Genesis ledger entry
///
/// `signer` marks PoA authorities; `stake` is pegged candidate stake for DPoS.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenesisAccount {
    pub address: Address,

    pub balance: Balance,

    #[serde(default)]
    pub stake: Balance,

    #[serde(default)]
    pub signer: bool,
}

fn default_max_future_drift() -> u64 {
    DEFAULT_MAX_FUTURE_DRIFT
}

/// Deterministic development key `index`
pub fn dev_key(index: u32) -> SigningKey {
    let seed = blake3::hash(format!("keel-dev-key:{}", index).as_bytes());
    SigningKey::from_bytes(seed.as_bytes())
}

pub fn dev_address(index: u32) -> Address {
    Address::from_public_key(&dev_key(index).verifying_key())
}

impl ChainConfig {
    fn devnet(name: &str, consensus: ConsensusConfig, stake: Balance, signer: bool) -> Self {
        let accounts = (0..DEV_ACCOUNT_COUNT)
            .map(|i| GenesisAccount {
                address: dev_address(i),
                balance: 1_000_000 * COIN,
                stake,
                signer,
            })
            .collect();

        Self {
            chain_name: name.to_string(),
            genesis_time: GENESIS_TIMESTAMP,
            block_reward: DEFAULT_BLOCK_REWARD,
            max_future_drift: DEFAULT_MAX_FUTURE_DRIFT,
            consensus,
            accounts,
        }
    }

    /// Three dev signers rotating every 3 seconds
    pub fn devnet_poa() -> Self {
        Self::devnet("keel-devnet-poa", ConsensusConfig::Poa(PoaConfig::default()), 0, true)
    }

    /// Three dev candidates, each with pegged stake
    pub fn devnet_dpos() -> Self {
        Self::devnet(
            "keel-devnet-dpos",
            ConsensusConfig::Dpos(DposConfig::default()),
            100_000 * COIN,
            false,
        )
    }

    pub fn devnet_pow() -> Self {
        Self::devnet("keel-devnet-pow", ConsensusConfig::Pow(PowConfig::default()), 0, false)
    }

    pub fn preset(name: &str) -> Option<Self> {
        match name {
            "poa" | "devnet-poa" => Some(Self::devnet_poa()),
            "dpos" | "devnet-dpos" => Some(Self::devnet_dpos()),
            "pow" | "devnet-pow" => Some(Self::devnet_pow()),
            _ => None,
        }
    }

    /// Structural checks that would otherwise surface as genesis failures
    pub fn validate(&self) -> Result<(), ConfigError> {
        for account in &self.accounts {
            if account.stake > account.balance {
                return Err(ConfigError::Invalid(format!(
                    "stake of {} exceeds its balance",
                    account.address
                )));
            }
        }

        match &self.consensus {
            ConsensusConfig::Poa(c) => {
                if c.period == 0 {
                    return Err(ConfigError::Invalid("poa period must be positive".to_string()));
                }
                if !self.accounts.iter().any(|a| a.signer) {
                    return Err(ConfigError::Invalid("poa needs at least one signer".to_string()));
                }
            }
            ConsensusConfig::Dpos(c) => {
                if c.period == 0 || c.round == 0 || c.total_miners == 0 {
                    return Err(ConfigError::Invalid(
                        "dpos period, round and total_miners must be positive".to_string(),
                    ));
                }
                let candidates = self.accounts.iter().filter(|a| a.stake > 0).count();
                if candidates < c.total_miners {
                    return Err(ConfigError::Invalid(format!(
                        "dpos needs {} staked candidates, genesis has {}",
                        c.total_miners, candidates
                    )));
                }
            }
            ConsensusConfig::Pow(c) => {
                if c.minimum_difficulty == 0 || c.genesis_difficulty < c.minimum_difficulty {
                    return Err(ConfigError::Invalid(
                        "pow difficulties must satisfy 0 < minimum <= genesis".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Loads from a JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(format!("{}: {}", path.as_ref().display(), e)))?;
        serde_json::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Saves to a JSON file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content =
            serde_json::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))?;
        std::fs::write(path.as_ref(), content)
            .map_err(|e| ConfigError::Io(format!("{}: {}", path.as_ref().display(), e)))
    }
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self::devnet_poa()
    }
}

/// Chain configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Config I/O error: {0}")]
    Io(String),

    #[error("Config parse error: {0}")]
    Parse(String),

    #[error("Invalid chain config: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_presets_validate() {
        for name in ["poa", "dpos", "pow"] {
            let config = ChainConfig::preset(name).unwrap();
            assert!(config.validate().is_ok(), "{} preset invalid", name);
            assert_eq!(config.accounts.len(), DEV_ACCOUNT_COUNT as usize);
        }
        assert!(ChainConfig::preset("mainnet").is_none());
    }

    #[test]
    fn test_dev_keys_are_deterministic_and_distinct() {
        assert_eq!(dev_address(0), dev_address(0));
        assert_ne!(dev_address(0), dev_address(1));
    }

    #[test]
    fn test_dpos_without_enough_candidates_rejected() {
        let mut config = ChainConfig::devnet_dpos();
        config.accounts[0].stake = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_json_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("chain.json");

        let config = ChainConfig::devnet_dpos();
        config.to_file(&path).unwrap();
        let loaded = ChainConfig::from_file(&path).unwrap();
        assert_eq!(loaded, config);

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"engine\": \"dpos\""));
    }
}
