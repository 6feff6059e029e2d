// Genesis - Chain configuration and seed ledger
pub mod config;

pub use config::{
    dev_address, dev_key, ChainConfig, ConfigError, ConsensusConfig, GenesisAccount,
    GENESIS_TIMESTAMP,
};
