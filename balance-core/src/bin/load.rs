//! Concurrent load driver for the balance engine
//!
//! Creates one account, fires `--requests` concurrent mutations at it and
//! checks the invariants on the result.

use anyhow::{bail, Context};
use balance_core::{
    AccountId, BalanceService, Config, Error, IdempotencyKey, TransactionType,
};
use clap::Parser;
use rust_decimal::Decimal;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// TOML configuration file (defaults plus BALANCE_* env vars otherwise)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Account to create and hammer
    #[arg(long, default_value = "A")]
    account: String,

    /// Initial balance
    #[arg(long, default_value = "500")]
    initial: Decimal,

    /// Number of concurrent requests
    #[arg(long, default_value_t = 100)]
    requests: usize,

    /// Amount per request
    #[arg(long, default_value = "5")]
    amount: Decimal,

    /// deposit or withdraw
    #[arg(long, default_value = "withdraw")]
    kind: TransactionType,

    /// Send every request with this idempotency key
    #[arg(long)]
    shared_key: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => Config::from_env()?,
    };

    let service = Arc::new(BalanceService::open(&config)?);
    let account_id = AccountId::new(cli.account.clone());
    let account = service
        .create_account(Some(account_id.clone()), cli.initial)
        .await?;
    let shared_key = cli
        .shared_key
        .as_deref()
        .map(IdempotencyKey::parse)
        .transpose()?;

    tracing::info!(
        account_id = %account.account_id,
        requests = cli.requests,
        amount = %cli.amount,
        kind = %cli.kind,
        "Starting load"
    );

    let started = Instant::now();
    let mut handles = Vec::with_capacity(cli.requests);
    for _ in 0..cli.requests {
        let service = Arc::clone(&service);
        let account_id = account_id.clone();
        let key = shared_key.clone();
        let (amount, kind) = (cli.amount, cli.kind);
        handles.push(tokio::spawn(async move {
            service.apply_delta(&account_id, amount, kind, key).await
        }));
    }

    let (mut succeeded, mut retried, mut insufficient, mut contended, mut failed) = (0, 0, 0, 0, 0);
    for handle in handles {
        match handle.await? {
            Ok(outcome) => {
                succeeded += 1;
                if outcome.was_retried {
                    retried += 1;
                }
            }
            Err(Error::InsufficientFunds { .. }) => insufficient += 1,
            Err(Error::ExhaustedRetries { .. }) => contended += 1,
            Err(e) => {
                tracing::error!(reason = e.reason(), "Request failed: {}", e);
                failed += 1;
            }
        }
    }
    let elapsed = started.elapsed();

    let balance = service.read_balance(&account_id).await?;
    let history = service.list_transactions(&account_id).await?;
    let metrics = service.metrics();

    println!("requests:            {}", cli.requests);
    println!("succeeded:           {} ({} retried)", succeeded, retried);
    println!("insufficient funds:  {}", insufficient);
    println!("exhausted retries:   {}", contended);
    println!("other failures:      {}", failed);
    println!("version conflicts:   {}", metrics.conflicts_total.get());
    println!("transaction rows:    {}", history.len());
    println!("final balance:       {}", balance);
    println!("elapsed:             {:?}", elapsed);

    let net: Decimal = history
        .iter()
        .map(|record| record.balance_after - record.balance_before)
        .sum();
    if net != balance - cli.initial {
        bail!(
            "conservation violated: net {} != {} - {}",
            net,
            balance,
            cli.initial
        );
    }

    let mut versions: Vec<u64> = history.iter().map(|record| record.version).collect();
    versions.reverse();
    if versions.iter().zip(2u64..).any(|(version, expected)| *version != expected) {
        bail!("version sequence has gaps: {:?}", versions);
    }

    println!("invariants:          ok");
    Ok(())
}
