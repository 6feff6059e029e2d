// Keel Node - Entry point
// Principle: the chain core is engine-agnostic; the engine is chosen by config

#![allow(dead_code)]

mod cli;
mod consensus;
mod genesis;
mod network;
mod node;
mod storage;
mod types;
mod wallet;

#[cfg(test)]
mod tests;

use clap::Parser;
use cli::config::NodeConfig;
use cli::runner::run_node;
use cli::{Cli, Commands, KeySubcommand};
use ed25519_dalek::SigningKey;
use genesis::ChainConfig;
use rand::rngs::OsRng;
use std::path::{Path, PathBuf};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use wallet::{parse_secret, KeyFile};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_filter = if cli.verbose {
        "debug"
    } else {
        &cli.log_level
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_filter)),
        )
        .init();

    match cli.command {
        Commands::Run(cmd) => {
            let config = NodeConfig::from_run_cmd(&cmd).map_err(|e| {
                error!("Configuration error: {}", e);
                anyhow::anyhow!("Configuration error: {}", e)
            })?;

            if let Err(e) = run_node(config).await {
                error!("Node error: {}", e);
                return Err(anyhow::anyhow!("Node error: {}", e));
            }
        }

        Commands::Key(cmd) => match cmd.subcommand {
            KeySubcommand::Generate { output } => generate_key(output.as_ref())?,
            KeySubcommand::Inspect { key } => inspect_key(&key)?,
        },

        Commands::ChainSpec(cmd) => {
            let config = ChainConfig::preset(&cmd.preset)
                .ok_or_else(|| anyhow::anyhow!("Unknown preset: {}", cmd.preset))?;
            match cmd.output {
                Some(path) => {
                    config.to_file(&path)?;
                    info!("Chain config saved to: {}", path.display());
                }
                None => println!("{}", serde_json::to_string_pretty(&config)?),
            }
        }

        Commands::Purge(cmd) => {
            let path = cmd.get_base_path();

            if !cmd.yes {
                println!("This will delete all chain data at: {}", path.display());
                println!("Are you sure? [y/N]");

                let mut input = String::new();
                std::io::stdin().read_line(&mut input)?;

                if !input.trim().eq_ignore_ascii_case("y") {
                    println!("Aborted.");
                    return Ok(());
                }
            }

            if path.exists() {
                std::fs::remove_dir_all(&path)?;
                info!("Purged chain data at: {}", path.display());
            } else {
                info!("No data to purge at: {}", path.display());
            }
        }
    }

    Ok(())
}

/// Generate a new ed25519 keypair
fn generate_key(output: Option<&PathBuf>) -> anyhow::Result<()> {
    let key_file = KeyFile::from_signing_key(&SigningKey::generate(&mut OsRng));

    match output {
        Some(path) => {
            key_file.to_file(path)?;
            info!("Key saved to: {}", path.display());
            println!("Address: {}", key_file.address);
        }
        None => println!("{}", serde_json::to_string_pretty(&key_file)?),
    }
    Ok(())
}

/// Inspect a key file or a hex secret
fn inspect_key(key: &str) -> anyhow::Result<()> {
    let signing_key = if Path::new(key).exists() {
        KeyFile::from_file(key)?.signing_key()?
    } else {
        SigningKey::from_bytes(&parse_secret(key)?)
    };

    let key_file = KeyFile::from_signing_key(&signing_key);
    println!("Scheme:     {}", key_file.scheme);
    println!("Public Key: {}", key_file.public_key);
    println!("Address:    {}", key_file.address);
    Ok(())
}
