//! pvaultd: peer vault daemon
//!
//! Usage:
//!   pvaultd [--config /etc/pvault/config.toml] <command>
//!
//! Commands:
//!   run                          serve pairing + sync and run the scheduler
//!   create-vault <name>          create a vault on this node
//!   pair <vault> <address>       join a vault by pairing with a node serving it
//!   list                         show local vaults and the nodes they trust

mod console;
mod daemon;
mod metrics;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use pvault_core::config::PvaultConfig;
use pvault_core::JsonStore;
use pvault_model::{KeyGenerator, Model, ModelSettings, SharedModel};
use pvault_sync::scheduler::Connector;
use pvault_sync::TlsDialer;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "pvaultd", version, about = "Peer vault daemon")]
struct Cli {
    /// Path to the pvault TOML configuration file
    #[arg(
        long,
        short = 'c',
        env = "PVAULT_CONFIG",
        default_value = "/etc/pvault/config.toml"
    )]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(long, env = "PVAULT_LOG")]
    log: Option<String>,

    /// Log format; overrides the config file
    #[arg(long, env = "PVAULT_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve pairing and sync, and sync with neighbors in the background
    Run,

    /// Create a new vault with this node as its first member
    CreateVault {
        name: String,
    },

    /// Pair with a node serving `vault`, joining the vault locally if needed
    Pair {
        vault: Uuid,
        /// host:port of the responder
        address: String,
        /// Name announced to the responder (default: daemon.name)
        #[arg(long)]
        name: Option<String>,
    },

    /// List local vaults
    List,
}

#[derive(Clone, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = PvaultConfig::load(&cli.config)
        .with_context(|| format!("loading config {}", cli.config.display()))?;

    let level = cli.log.clone().unwrap_or_else(|| config.daemon.log_level.clone());
    let format = cli.log_format.clone().unwrap_or(match config.daemon.log_format.as_str() {
        "text" => LogFormat::Text,
        _ => LogFormat::Json,
    });
    init_logging(&level, &format);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        "pvaultd starting"
    );

    match cli.command {
        Command::Run => daemon::run(config).await,
        Command::CreateVault { name } => create_vault(&config, &name).await,
        Command::Pair {
            vault,
            address,
            name,
        } => pair(&config, vault, &address, name).await,
        Command::List => list(&config),
    }
}

fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // Logs go to stderr so prompts and command output own stdout
    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}

/// Expand `~/` to the user's home directory
pub(crate) fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    match s.strip_prefix("~/") {
        Some(rest) => {
            let home = std::env::var("HOME").unwrap_or_default();
            PathBuf::from(home).join(rest)
        }
        None => path.to_path_buf(),
    }
}

/// Open the configured document store and the model on top of it.
pub(crate) fn open_model(config: &PvaultConfig) -> Result<Model> {
    let path = expand_tilde(&config.store.path);
    let store = JsonStore::open(&path).with_context(|| format!("opening store {}", path.display()))?;
    Model::open(Box::new(store), ModelSettings::from_config(config)).context("loading vaults")
}

fn keygen(config: &PvaultConfig) -> KeyGenerator {
    KeyGenerator::new(config.crypto.keygen_workers, config.crypto.rsa_bits)
}

async fn create_vault(config: &PvaultConfig, name: &str) -> Result<()> {
    let mut model = open_model(config)?;
    let password = console::new_password(&format!("Password for vault {name}: ")).await?;

    info!(bits = config.crypto.rsa_bits, "generating node keys");
    let keys = keygen(config).node_keys().await?;
    let vault = model.create_vault_with_keys(name, &password, keys)?;
    let node = model.node_id(&vault)?;
    model.flush()?;

    println!("vault {vault} created ({name})");
    println!("this node: {node}");
    Ok(())
}

async fn pair(config: &PvaultConfig, vault: Uuid, address: &str, name: Option<String>) -> Result<()> {
    let mut model = open_model(config)?;
    match model.get_vault(&vault) {
        Ok(info) => {
            let password = console::password(&format!("Password for vault {}: ", info.name)).await?;
            model.unlock_vault(&vault, &password)?;
        }
        Err(_) => {
            let password = console::new_password(&format!("Password for new replica of {vault}: ")).await?;
            info!(bits = config.crypto.rsa_bits, "generating node keys");
            let keys = keygen(config).node_keys().await?;
            model.join_vault_with_keys(vault, &vault.to_string(), &password, keys)?;
        }
    }
    let model: SharedModel = model.into_shared();
    let name = name.unwrap_or_else(|| config.daemon.name.clone());

    let dialer = TlsDialer::new(
        Duration::from_secs(config.sync.connect_timeout_secs),
        config.sync.max_body_bytes,
    )?;
    let mut client = dialer.connect(address).await?;
    let peer = client.pair(&model, &vault, &name, &console::ConsolePin).await?;
    println!("paired with {} ({})", peer.name, peer.node);

    let report = client.sync_vault(&model, &vault).await?;
    println!("initial sync: {} pulled, {} pushed", report.pulled, report.pushed);
    model.lock().await.flush()?;
    Ok(())
}

fn list(config: &PvaultConfig) -> Result<()> {
    let model = open_model(config)?;
    let vaults = model.get_vaults();
    if vaults.is_empty() {
        println!("no vaults");
        return Ok(());
    }
    for info in vaults {
        println!("{}  {}  node {}", info.id, info.name, info.node);
        for cert in model.get_certificates(&info.id)? {
            let marker = if cert.node == info.node { "*" } else { " " };
            let role = if cert.synconly() { " (sync only)" } else { "" };
            println!("  {marker} {} {}{role}", cert.node, cert.name);
        }
    }
    Ok(())
}
