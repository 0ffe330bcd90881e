//! `csfle` CLI: master key generation, data key provisioning and the
//! encryption demo.

#![warn(clippy::pedantic, clippy::nursery)]

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use csfle::client::ClientFactory;
use csfle::config::{CsfleConfig, KmsProviderConfig};
use csfle::data_key::DataKeyId;
use csfle::demo::{resolve_data_key, run_demo, DemoSettings};
use csfle::key_vault::{KeyVaultManager, KeyVaultStore};
use csfle::master_key::{MasterKey, MasterKeyProvider};
use csfle::memory::MemoryBackend;
use csfle::schema::build_schema_for_key;
use csfle_key_file::{generate_master_key_with, LocalKeyFile};
use csfle_mongodb::MongoBackend;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "csfle", version)]
#[command(about = "Client-side field-level encryption toolkit", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Overrides the configured connection string
    #[arg(long, global = true)]
    connection_string: Option<String>,

    /// Overrides the configured master key file
    #[arg(long, global = true)]
    master_key_file: Option<PathBuf>,

    /// Backing store
    #[arg(long, global = true, value_enum, default_value_t = Backend::Mongodb)]
    backend: Backend,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Backend {
    /// In-process store; state lasts for one invocation
    Memory,
    /// MongoDB server reached through the connection string
    Mongodb,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate the local master key file
    MakeMasterKey {
        /// Replace an existing key file, orphaning every data key wrapped under it
        #[arg(long)]
        force: bool,
    },
    /// Find or create the data key under the configured alias and print its id
    CreateDataKey,
    /// Upsert the sample patient and read it back through both clients
    Demo,
    /// Print the encryption schema map as JSON
    Schema {
        /// Base64 data key id; looked up by alias when omitted
        #[arg(long)]
        key_id: Option<DataKeyId>,
    },
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    let registry = tracing_subscriber::registry().with(filter);

    if cli.json_logs {
        let layer = fmt::layer()
            .json()
            .with_target(true)
            .with_writer(std::io::stderr);
        registry.with(layer).init();
    } else {
        let layer = fmt::layer()
            .with_target(false)
            .with_ansi(true)
            .with_writer(std::io::stderr);
        registry.with(layer).init();
    }
}

fn load_config(cli: &Cli) -> Result<CsfleConfig> {
    let mut config = match &cli.config {
        Some(path) => CsfleConfig::load(path)
            .with_context(|| format!("failed to load configuration from {}", path.display()))?,
        None => CsfleConfig::default(),
    };
    if let Some(connection_string) = &cli.connection_string {
        config.connection_string.clone_from(connection_string);
    }
    if let Some(key_file) = &cli.master_key_file {
        config.kms = KmsProviderConfig::Local {
            key_file: key_file.clone(),
        };
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_telemetry(&cli);
    info!(version = env!("CARGO_PKG_VERSION"), backend = ?cli.backend, "csfle starting");

    let config = load_config(&cli)?;
    let key_file = config.kms.key_file().to_path_buf();

    if let Commands::MakeMasterKey { force } = cli.command {
        generate_master_key_with(&key_file, force)
            .with_context(|| format!("failed to write master key to {}", key_file.display()))?;
        println!("{}", key_file.display());
        return Ok(());
    }

    // Read before any store is contacted so a missing key fails fast.
    let provider = LocalKeyFile::new(&key_file);
    let master_key = provider
        .master_key()
        .with_context(|| format!("failed to read master key from {}", key_file.display()))?;
    info!(provider = provider.provider_name(), path = %key_file.display(), "master key loaded");

    if let Commands::Schema {
        key_id: Some(key_id),
    } = cli.command
    {
        return print_schema(key_id, &config);
    }

    match cli.backend {
        Backend::Memory => {
            let backend = MemoryBackend::new();
            let store = backend.key_vault(master_key.clone());
            execute(&cli.command, &backend, store, &config, master_key).await
        }
        Backend::Mongodb => {
            let backend = MongoBackend::from_config(&config);
            let store = backend
                .key_vault(&config.connection_string, master_key.clone())
                .await
                .context("failed to connect to the key vault")?;
            execute(&cli.command, &backend, store, &config, master_key).await
        }
    }
}

async fn execute<F: ClientFactory, S: KeyVaultStore>(
    command: &Commands,
    factory: &F,
    store: S,
    config: &CsfleConfig,
    master_key: MasterKey,
) -> Result<()> {
    let manager = KeyVaultManager::new(store, config.key_vault_namespace.clone())
        .with_conflict_policy(config.conflict_policy)
        .with_timeout(config.operation_timeout());
    let key_id = resolve_data_key(&manager, config).await.context("data key provisioning failed")?;

    match command {
        Commands::CreateDataKey => println!("{key_id}"),
        Commands::Schema { .. } => print_schema(key_id, config)?,
        Commands::Demo => {
            let namespace = config.encrypted_namespace.clone();
            let schema = build_schema_for_key(key_id, namespace, &config.fields)?;
            let settings = DemoSettings::from_config(config, master_key, schema);
            let report = run_demo(factory, settings).await.context("demo failed")?;
            println!("Encryption-aware client, find by ssn:");
            println!("{}", serde_json::to_string_pretty(&report.encrypted_view)?);
            println!("Plain client, find by name:");
            println!("{}", serde_json::to_string_pretty(&report.plain_view)?);
        }
        Commands::MakeMasterKey { .. } => {}
    }
    Ok(())
}

fn print_schema(key_id: DataKeyId, config: &CsfleConfig) -> Result<()> {
    let schema = build_schema_for_key(key_id, config.encrypted_namespace.clone(), &config.fields)
        .context("failed to build encryption schema")?;
    println!("{}", serde_json::to_string_pretty(&schema.to_schema_map())?);
    Ok(())
}
