// CLI - Command line interface for the keel node
// Principle: Simple, clear, composable commands

pub mod config;
pub mod runner;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Keel node - permissioned chain with pluggable PoA, DPoS and PoW engines
#[derive(Parser, Debug)]
#[command(name = "keel-node")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Keel blockchain node")]
#[command(long_about = r#"
Keel runs a chain whose block production and finality come from a
pluggable consensus engine (poa, dpos or pow).

Start a three-node PoA devnet in memory:
  keel-node run --chain poa --dev

Persist each node under a data directory:
  keel-node run --chain dpos --base-path ./data

Write a chain config to edit by hand:
  keel-node chain-spec --preset pow --output chain.json
"#)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true, default_value = "false")]
    pub verbose: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info", env = "KEEL_LOG")]
    pub log_level: String,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a local devnet
    Run(RunCmd),

    /// Key management
    Key(KeyCmd),

    /// Print or save a chain config preset
    ChainSpec(ChainSpecCmd),

    /// Purge chain data
    Purge(PurgeCmd),
}

/// Run a local devnet
#[derive(Parser, Debug)]
pub struct RunCmd {
    /// Chain preset (poa, dpos, pow) or path to a chain config file
    #[arg(long, default_value = "poa")]
    pub chain: String,

    /// Base path for chain data
    #[arg(short = 'd', long, env = "KEEL_BASE_PATH")]
    pub base_path: Option<PathBuf>,

    /// Keep all state in memory
    #[arg(long)]
    pub dev: bool,

    /// Number of nodes on the local hub
    #[arg(long, default_value = "3")]
    pub nodes: u32,

    /// Producer key files, one per node (dev keys otherwise)
    #[arg(long = "key", value_name = "FILE")]
    pub keys: Vec<PathBuf>,

    /// Block production attempt interval in milliseconds
    #[arg(long, default_value = "1000")]
    pub mine_interval_ms: u64,

    /// Stalled-tail check interval in seconds
    #[arg(long, default_value = "5")]
    pub sync_interval_secs: u64,

    /// Transaction pool capacity per node
    #[arg(long, default_value = "10000")]
    pub max_pool: usize,
}

/// Key management commands
#[derive(Parser, Debug)]
pub struct KeyCmd {
    #[command(subcommand)]
    pub subcommand: KeySubcommand,
}

#[derive(Subcommand, Debug)]
pub enum KeySubcommand {
    /// Generate a new keypair
    Generate {
        /// Output file (stdout if not specified)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Inspect a key file or hex secret
    Inspect {
        /// Key file path or 0x-prefixed secret
        key: String,
    },
}

/// Print or save a chain config preset
#[derive(Parser, Debug)]
pub struct ChainSpecCmd {
    /// Preset name (poa, dpos, pow)
    #[arg(long, default_value = "poa")]
    pub preset: String,

    /// Output file (stdout if not specified)
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

/// Purge chain data
#[derive(Parser, Debug)]
pub struct PurgeCmd {
    /// Base path for chain data
    #[arg(short = 'd', long)]
    pub base_path: Option<PathBuf>,

    /// Chain to purge (chain name)
    #[arg(long, default_value = "keel-devnet-poa")]
    pub chain: String,

    /// Skip confirmation prompt
    #[arg(short = 'y', long)]
    pub yes: bool,
}

/// Platform data directory for a chain
pub fn default_base_path(chain_name: &str) -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("keel")
        .join("chains")
        .join(chain_name)
}

impl PurgeCmd {
    pub fn get_base_path(&self) -> PathBuf {
        self.base_path
            .clone()
            .unwrap_or_else(|| default_base_path(&self.chain))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_run_defaults() {
        let cli = Cli::try_parse_from(["keel-node", "run"]).unwrap();
        match cli.command {
            Commands::Run(cmd) => {
                assert_eq!(cmd.chain, "poa");
                assert_eq!(cmd.nodes, 3);
                assert!(!cmd.dev);
                assert!(cmd.keys.is_empty());
            }
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_cli_parse_run_with_keys() {
        let cli = Cli::try_parse_from([
            "keel-node",
            "run",
            "--chain",
            "dpos",
            "--key",
            "a.json",
            "--key",
            "b.json",
            "--dev",
        ])
        .unwrap();
        match cli.command {
            Commands::Run(cmd) => {
                assert_eq!(cmd.chain, "dpos");
                assert_eq!(cmd.keys.len(), 2);
                assert!(cmd.dev);
            }
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_cli_parse_key_generate() {
        let cli = Cli::try_parse_from(["keel-node", "key", "generate", "-o", "k.json"]).unwrap();
        match cli.command {
            Commands::Key(cmd) => match cmd.subcommand {
                KeySubcommand::Generate { output } => {
                    assert_eq!(output, Some(PathBuf::from("k.json")));
                }
                _ => panic!("Expected Generate subcommand"),
            },
            _ => panic!("Expected Key command"),
        }
    }

    #[test]
    fn test_cli_parse_chain_spec() {
        let cli = Cli::try_parse_from(["keel-node", "chain-spec", "--preset", "pow"]).unwrap();
        match cli.command {
            Commands::ChainSpec(cmd) => assert_eq!(cmd.preset, "pow"),
            _ => panic!("Expected ChainSpec command"),
        }
    }

    #[test]
    fn test_purge_base_path() {
        let cli = Cli::try_parse_from(["keel-node", "purge", "-y"]).unwrap();
        match cli.command {
            Commands::Purge(cmd) => {
                assert!(cmd.yes);
                assert!(cmd.get_base_path().ends_with("keel-devnet-poa"));
            }
            _ => panic!("Expected Purge command"),
        }
    }
}
