//! ledgerd - rate-limited currency and honor ledger
//!
//! Runs the transaction queues against the SQLite store, or applies a single
//! transaction through the same queue path and exits.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use ledger_common::{CurrencyType, SubjectId};
use ledgerd::config::Config;
use ledgerd::progression::NoPresence;
use ledgerd::store::SqliteGateway;
use ledgerd::{CurrencyLedger, HonorLedger, ProgressionService, QueueSettings};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::info;

#[derive(Parser)]
#[command(name = "ledgerd")]
#[command(about = "Rate-limited currency and honor ledger", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file (overrides /etc/ledgerd/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run both ledgers until interrupted
    Run,

    /// Apply a currency delta
    Credit {
        #[arg(long)]
        subject: SubjectId,
        #[arg(long, allow_hyphen_values = true)]
        amount: i64,
        #[arg(long)]
        source: String,
        #[arg(long, default_value = "coins")]
        currency: CurrencyType,
    },

    /// Apply an honor delta
    Honor {
        #[arg(long)]
        subject: SubjectId,
        #[arg(long, allow_hyphen_values = true)]
        amount: i64,
        #[arg(long)]
        source: String,
    },

    /// Show balances and progression for a subject
    Status {
        #[arg(long)]
        subject: SubjectId,
        #[arg(long)]
        json: bool,
    },

    /// Evaluate the level table for an honor value
    Level {
        honor: u64,
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Config::load_from_path(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => Config::load(),
    };

    match cli.command {
        Commands::Run => run(config).await,
        Commands::Credit {
            subject,
            amount,
            source,
            currency,
        } => {
            let store = Arc::new(SqliteGateway::open(&config.store.path)?);
            let ledger = CurrencyLedger::new(store, QueueSettings::from(&config.queue), Handle::current());
            let receipt = ledger.submit_with_receipt(subject, amount, source, currency);
            ledger.flush().await;
            report(receipt.outcome().await)
        }
        Commands::Honor {
            subject,
            amount,
            source,
        } => {
            let store = Arc::new(SqliteGateway::open(&config.store.path)?);
            let ledger = HonorLedger::new(store, QueueSettings::from(&config.queue), Handle::current());
            let receipt = ledger.submit_with_receipt(subject, amount, source);
            ledger.flush().await;
            report(receipt.outcome().await)
        }
        Commands::Status { subject, json } => status(&config, subject, json),
        Commands::Level { honor, json } => {
            let progression = load_progression(&config)?;
            let view = progression.view(honor);
            if json {
                println!("{}", serde_json::to_string_pretty(&view)?);
            } else {
                print_view(&view);
            }
            Ok(())
        }
    }
}

async fn run(config: Config) -> Result<()> {
    info!("ledgerd v{} starting", env!("CARGO_PKG_VERSION"));

    let store = Arc::new(SqliteGateway::open(&config.store.path)?);
    let settings = QueueSettings::from(&config.queue);
    let currency = CurrencyLedger::new(store.clone(), settings.clone(), Handle::current());
    let honor = HonorLedger::new(store, settings, Handle::current());
    let progression = load_progression(&config)?;

    currency.start();
    honor.start();
    info!("ledgerd ready (max level {})", progression.max_level());

    tokio::signal::ctrl_c().await?;
    info!("Shutting down gracefully");

    currency.stop();
    honor.stop();
    currency.flush().await;
    honor.flush().await;

    info!("Currency queue: {}", serde_json::to_string(&currency.stats())?);
    info!("Honor queue: {}", serde_json::to_string(&honor.stats())?);
    Ok(())
}

fn load_progression(config: &Config) -> Result<ProgressionService> {
    let progression = ProgressionService::new(Arc::new(NoPresence));
    progression
        .reload_mappings(&config.levels)
        .context("Invalid level mappings in config")?;
    Ok(progression)
}

fn report(outcome: ledger_common::Outcome) -> Result<()> {
    match outcome {
        Ok(()) => {
            println!("Transaction applied.");
            Ok(())
        }
        Err(e) => bail!("{}", e),
    }
}

fn status(config: &Config, subject: SubjectId, json: bool) -> Result<()> {
    let store = SqliteGateway::open(&config.store.path)?;
    let progression = load_progression(config)?;
    let balances = store.balances(&subject)?;
    let view = progression.view(store.honor(&subject)?);

    if json {
        let balances: serde_json::Map<String, serde_json::Value> = balances
            .iter()
            .map(|(currency, amount)| (currency.to_string(), serde_json::json!(amount)))
            .collect();
        let out = serde_json::json!({
            "subject": subject,
            "balances": balances,
            "progression": view,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!("Subject {}", subject);
    for (currency, amount) in &balances {
        println!("  {:<8} {}", currency.to_string(), amount);
    }
    print_view(&view);
    Ok(())
}

fn print_view(view: &ledgerd::ProgressionView) {
    println!("  honor    {}", view.honor);
    println!("  level    {} (+{} xp)", view.level, view.xp);
    match view.next_level {
        Some(next) => println!(
            "  next     level {} at {} ({:.0}%)",
            next.level,
            next.threshold,
            view.progress * 100.0
        ),
        None => println!("  next     max level reached"),
    }
}
