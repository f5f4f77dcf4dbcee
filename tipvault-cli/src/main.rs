use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tipvault_escrow::{
    EngineSettings, EscrowNode,
    gateway::{HttpBlockchainGateway, InMemoryBlockchainGateway, LoggingNotifier, balance_within},
    models::Balance,
    store::InMemoryEscrowStore,
    task_manager::PostTaskRequest,
    telemetry,
    vault::VaultManager,
};
use tracing::info;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "tipvault")]
#[command(about = "Tipvault - escrow for crypto-funded gig tasks", long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verbosity level (can be repeated)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Query the balance of a burner wallet
    Balance {
        /// Kaspa address
        address: String,
    },

    /// Seal a seed phrase into a vault blob
    Seal {
        #[arg(long)]
        task_id: Uuid,

        #[arg(long)]
        pera_key: String,

        /// Seed phrase; read from stdin when omitted
        #[arg(long)]
        seed: Option<String>,
    },

    /// Open a vault blob
    Open {
        #[arg(long)]
        task_id: Uuid,

        #[arg(long)]
        pera_key: String,

        /// Blob produced by `seal`
        blob: String,
    },

    /// Run a post/approve/claim round against an in-memory ledger
    Simulate {
        /// Tip in KAS
        #[arg(long, default_value = "10")]
        tip: Decimal,

        /// Burner wallet balance in KAS at approval time
        #[arg(long, default_value = "10")]
        funded: Decimal,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings =
        EngineSettings::load(cli.config.as_deref()).context("Failed to load settings")?;
    telemetry::init_tracing(&settings.log_filter, cli.verbose)
        .context("Failed to initialize logging")?;

    match cli.command {
        Commands::Balance { address } => balance(settings, &address).await,
        Commands::Seal {
            task_id,
            pera_key,
            seed,
        } => {
            let seed = match seed {
                Some(seed) => seed,
                None => read_stdin()?,
            };
            let vault = VaultManager::new(settings.vault)?;
            println!("{}", vault.encode(&seed, &pera_key, task_id)?);
            Ok(())
        }
        Commands::Open {
            task_id,
            pera_key,
            blob,
        } => {
            let vault = VaultManager::new(settings.vault)?;
            println!("{}", vault.decode(blob.trim(), &pera_key, task_id)?);
            Ok(())
        }
        Commands::Simulate { tip, funded } => simulate(settings, tip, funded).await,
    }
}

async fn balance(settings: EngineSettings, address: &str) -> Result<()> {
    let gateway = HttpBlockchainGateway::new(settings.gateway)?;
    let limit = Duration::from_secs(settings.task.balance_timeout_secs);

    let balance = balance_within(&gateway, address, limit)
        .await
        .with_context(|| format!("Balance query for {} failed", address))?;

    println!("{} KAS ({} sompi)", balance.to_kas(), balance.sompi);
    Ok(())
}

async fn simulate(mut settings: EngineSettings, tip: Decimal, funded: Decimal) -> Result<()> {
    if funded < Decimal::ZERO {
        bail!("Funded balance cannot be negative");
    }
    if settings.vault.master_key.trim().is_empty() {
        settings.vault.master_key = Uuid::new_v4().to_string();
        info!("No vault master key configured, using a throwaway key");
    }

    let address = format!("kaspa:qsim{}", Uuid::new_v4().simple());
    let gateway = InMemoryBlockchainGateway::new();
    gateway.set_balance(&address, Balance::from_kas(funded)).await;

    let node = EscrowNode::new(
        settings,
        Arc::new(InMemoryEscrowStore::new()),
        Arc::new(gateway),
        Arc::new(LoggingNotifier),
    )?;

    let task = node
        .post_task(PostTaskRequest {
            employer_id: "sim-employer".to_string(),
            worker_id: "sim-worker".to_string(),
            tip_amount: tip,
            burner_wallet_address: address,
            seed_phrase: "simulated seed phrase for a burner wallet".to_string(),
            pera_secret_key: Uuid::new_v4().to_string(),
        })
        .await?;
    node.submit_for_approval(task.id, "sim-worker").await?;

    let approval = node.approve(task.id, "sim-employer").await;
    println!("approve: {}", serde_json::to_string_pretty(&approval)?);

    if let Some(approved) = &approval.data {
        let claim = node.claim(task.id, "sim-worker", &approved.mzkey).await;
        println!("claim: {}", serde_json::to_string_pretty(&claim)?);
    }

    let info = node.get_task_info(task.id).await?;
    println!(
        "task {} is {}, vault {}; employer {:.1}, worker {:.1}",
        info.task.id,
        info.task.status,
        info.vault_status,
        info.employer_reputation.reputation_score,
        info.worker_reputation.reputation_score
    );

    node.shutdown().await;
    Ok(())
}

fn read_stdin() -> Result<String> {
    let mut input = String::new();
    std::io::stdin()
        .read_to_string(&mut input)
        .context("Failed to read seed phrase from stdin")?;
    Ok(input.trim_end_matches(['\r', '\n']).to_string())
}
