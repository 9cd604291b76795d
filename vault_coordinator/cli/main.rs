//! vaultctl: drives the signing nodes from the command line.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use vault_coordinator::chain::{ChainClient, FeeParams};
use vault_coordinator::logging::init_logging;
use vault_coordinator::simulated::SimulatedNetwork;
use vault_coordinator::{
    ChannelFactory, ClientCredential, CoordinatorConfig, DerivationPath, MasterKeyHandle,
    MessageDigest, NodePool, ThresholdCoordinator,
};

#[derive(Parser)]
#[command(name = "vaultctl", version = "0.1", about = "Threshold ECDSA coordinator CLI")]
struct Cli {
    #[arg(long, help = "JSON configuration file; the sandbox deployment when omitted")]
    config: Option<PathBuf>,

    #[arg(long, default_value = "logs")]
    log_dir: String,

    #[arg(long, help = "Write the log file as JSON")]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a new distributed master key on all nodes
    GenerateKey,

    /// Print the public key derived from a master key
    PublicKey {
        #[arg(long)]
        key_id: String,

        #[arg(long, default_value = "m/44/60/0/0")]
        path: String,

        #[arg(long, help = "Ask every node and require identical answers")]
        all_nodes: bool,
    },

    /// Sign a 32-byte digest with a derived key
    Sign {
        #[arg(long)]
        key_id: String,

        #[arg(long, default_value = "m/44/60/0/0")]
        path: String,

        #[arg(long, help = "Hex-encoded 32-byte digest")]
        digest: String,
    },

    /// Confirmed balance of an address
    Balance {
        #[arg(long)]
        address: String,
    },

    /// Have the blockchain service build an unsigned transfer
    CraftTx {
        #[arg(long)]
        from: String,

        #[arg(long)]
        to: String,

        #[arg(long)]
        amount: String,

        #[arg(long, requires = "max_priority_fee")]
        max_fee: Option<u64>,

        #[arg(long, requires = "max_fee")]
        max_priority_fee: Option<u64>,
    },

    /// Broadcast a signed raw transaction
    Broadcast {
        #[arg(long, help = "Hex-encoded signed transaction")]
        signed_tx: String,
    },

    /// Run key generation, derivation and signing against in-memory nodes
    Demo,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // keep the guard alive so the file writer flushes on exit
    let _guard = init_logging(&cli.log_dir, cli.json_logs);

    let config = match &cli.config {
        Some(path) => CoordinatorConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => CoordinatorConfig::sandbox(),
    };

    match cli.command {
        Commands::GenerateKey => {
            let coordinator = connect(&config).await?;
            let key = coordinator.generate_key().await?;
            println!("{}", json!({ "key_id": key.as_str() }));
        }

        Commands::PublicKey {
            key_id,
            path,
            all_nodes,
        } => {
            let coordinator = connect(&config).await?;
            let key = MasterKeyHandle::new(key_id);
            let path: DerivationPath = path.parse()?;
            let derived = if all_nodes {
                coordinator.public_key_agreed(&key, &path).await?
            } else {
                coordinator.public_key(&key, &path).await?
            };
            println!(
                "{}",
                json!({
                    "path": path.to_string(),
                    "compressed": hex::encode(derived.compressed()),
                    "uncompressed": hex::encode(derived.uncompressed()),
                })
            );
        }

        Commands::Sign {
            key_id,
            path,
            digest,
        } => {
            let digest = MessageDigest::from_hex(&digest)?;
            let path: DerivationPath = path.parse()?;
            let coordinator = connect(&config).await?;
            let signature = coordinator
                .sign(&MasterKeyHandle::new(key_id), &path, &digest)
                .await?;
            println!(
                "{}",
                json!({
                    "r": hex::encode(signature.r),
                    "s": hex::encode(signature.s),
                    "v": signature.recovery_id,
                    "rsv": signature.to_hex(),
                })
            );
        }

        Commands::Balance { address } => {
            let chain = ChainClient::from_env(&config.chain)?;
            let balance = chain.balance(&address).await?;
            println!("{}", json!({ "address": address, "confirmed_balance": balance }));
        }

        Commands::CraftTx {
            from,
            to,
            amount,
            max_fee,
            max_priority_fee,
        } => {
            let chain = ChainClient::from_env(&config.chain)?;
            let fees = max_fee.zip(max_priority_fee).map(|(max, priority)| FeeParams {
                max_fee_per_gas: max,
                max_priority_fee_per_gas: priority,
            });
            let unsigned = chain.create_transaction(&from, &to, &amount, fees).await?;
            println!("{}", json!({ "unsigned_tx": unsigned }));
        }

        Commands::Broadcast { signed_tx } => {
            let signed_tx = signed_tx.trim().trim_start_matches("0x");
            hex::decode(signed_tx).context("signed transaction is not hex")?;
            let chain = ChainClient::from_env(&config.chain)?;
            let id = chain.broadcast(signed_tx).await?;
            println!("{}", json!({ "id": id }));
        }

        Commands::Demo => demo(&config).await?,
    }

    Ok(())
}

/// Reads the client credential and opens a channel to every configured node.
async fn connect(config: &CoordinatorConfig) -> Result<ThresholdCoordinator> {
    let credential = &config.client_credential;
    let cert = std::fs::read(&credential.cert_path)
        .with_context(|| format!("reading {}", credential.cert_path.display()))?;
    let key = Zeroizing::new(
        std::fs::read(&credential.key_path)
            .with_context(|| format!("reading {}", credential.key_path.display()))?,
    );
    let credential = ClientCredential::from_pem(&cert, &key).map_err(anyhow::Error::msg)?;

    let pool = ChannelFactory::new(config.node_identities(), credential)
        .connect_all()
        .await?;
    Ok(ThresholdCoordinator::from_config(config, pool)?)
}

async fn demo(config: &CoordinatorConfig) -> Result<()> {
    let network = SimulatedNetwork::random(config.node_count());
    let pool = NodePool::new(network.nodes())?;
    let coordinator = ThresholdCoordinator::from_config(config, pool)?;

    let key = coordinator.generate_key().await?;
    let path: DerivationPath = "m/44/60/0/0".parse()?;
    let derived = coordinator.public_key_agreed(&key, &path).await?;

    let digest = MessageDigest::new(Sha256::digest(b"vaultctl demo").into());
    let signature = coordinator.sign(&key, &path, &digest).await?;
    let recovered = signature.recover_public_key(&digest)?;
    anyhow::ensure!(
        &recovered == derived.public_key(),
        "recovered key does not match the derived key"
    );

    println!(
        "{}",
        json!({
            "key_id": key.as_str(),
            "path": path.to_string(),
            "public_key": hex::encode(derived.compressed()),
            "digest": digest.to_string(),
            "signature": signature.to_hex(),
        })
    );
    for record in coordinator.audit().recent(10).iter().rev() {
        tracing::info!(event = record.event_type_label(), session_id = %record.session_id, "{}", record.message);
    }
    Ok(())
}
