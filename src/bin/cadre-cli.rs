//! Cadre CLI - Command-line interface for file-backed agents
//!
//! Runs a key/value agent per key on top of file storage: every `send`
//! thaws the agent, delivers one signal, and hibernates it again.

use anyhow::{Context, Result, bail};
use cadre::runtime::builtin;
use cadre::runtime::storage::{load_config, write_config};
use cadre::runtime::{
    AgentDefinition, DispatchAdapter, DispatchConfig, InstanceManager, ManagerConfig, Signal,
    Storage, StorageConfig,
};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "cadre")]
#[command(about = "Supervised agent runtime", long_about = None)]
struct Cli {
    /// Config file written by `init`
    #[arg(short, long, default_value = ".cadre/config.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a config file
    Init {
        /// Directory for hibernated agents
        #[arg(long, default_value = ".cadre/agents")]
        storage_root: PathBuf,

        /// Storage namespace
        #[arg(long, default_value = "agent")]
        entity_kind: String,

        /// Signal queue capacity per agent
        #[arg(long, default_value = "1000")]
        max_queue_size: usize,
    },

    /// Deliver a signal to an agent and hibernate it
    Send {
        /// Agent key
        key: String,

        /// Signal type (kv.set, kv.replace, kv.delete, kv.set_path, kv.delete_path, kv.emit, kv.noop)
        #[arg(long = "type")]
        signal_type: String,

        /// JSON payload
        #[arg(long, default_value = "{}")]
        data: String,
    },

    /// Print a hibernated agent
    Show {
        /// Agent key
        key: String,
    },

    /// List hibernated agents
    Keys,
}

fn kv_module() -> AgentDefinition {
    AgentDefinition::new("kv")
        .route("kv.set", builtin::SET_STATE)
        .route("kv.replace", builtin::REPLACE_STATE)
        .route("kv.delete", builtin::DELETE_KEYS)
        .route("kv.set_path", builtin::SET_PATH)
        .route("kv.delete_path", builtin::DELETE_PATH)
        .route("kv.emit", builtin::EMIT_SIGNAL)
        .route("kv.noop", builtin::NOOP)
}

fn open_storage(config: &ManagerConfig) -> Result<Arc<dyn Storage>> {
    match config.storage.open()? {
        Some(storage) => Ok(storage),
        None => bail!("config has no storage configured"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init {
            storage_root,
            entity_kind,
            max_queue_size,
        } => {
            let mut config = ManagerConfig {
                entity_kind,
                storage: StorageConfig::File { root: storage_root },
                ..ManagerConfig::default()
            };
            config.worker.max_queue_size = max_queue_size;
            config.worker.default_dispatch = DispatchConfig::new(DispatchAdapter::Console).into();

            write_config(&cli.config, &config)?;
            println!("Initialized cadre config at {:?}", cli.config);
        }

        Commands::Send {
            key,
            signal_type,
            data,
        } => {
            let config = load_config(&cli.config)?;
            let data: Value = serde_json::from_str(&data).context("--data must be JSON")?;
            let manager = InstanceManager::builder(Arc::new(kv_module()))
                .config(config)
                .build()?;

            let result = manager.call(&key, Signal::new(signal_type, data)).await;
            manager.stop(&key).await?;
            let result = result?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }

        Commands::Show { key } => {
            let config = load_config(&cli.config)?;
            let storage = open_storage(&config)?;
            match storage.thaw(&config.entity_kind, &key)? {
                Some(agent) => println!("{}", serde_json::to_string_pretty(&agent)?),
                None => bail!("no agent stored under '{key}'"),
            }
        }

        Commands::Keys => {
            let config = load_config(&cli.config)?;
            let storage = open_storage(&config)?;
            for key in storage.list(&config.entity_kind)? {
                println!("{key}");
            }
        }
    }

    Ok(())
}
