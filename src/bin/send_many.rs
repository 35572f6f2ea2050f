//! Operator tool: push a burst of token transfers through a live dispatch queue.
//!
//! Usage: `send_many <recipient> <amount-wei> [count]`
//! Reads `RPC_URL`, `RELAYER_PRIVATE_KEY` and `CONTRACT_ADDRESS` from the environment.

use std::env;
use std::str::FromStr;
use std::sync::Arc;

use alloy::primitives::{Address, U256};
use anyhow::{Context, Result, bail};
use dotenvy::dotenv;
use secrecy::SecretString;
use tracing_subscriber::EnvFilter;

use meta_tx_relayer::app::{DispatchConfig, DispatchQueue};
use meta_tx_relayer::domain::{LedgerClient, TransactionSigner, TxRequest};
use meta_tx_relayer::infra::blockchain::encode_transfer;
use meta_tx_relayer::infra::{EvmLedgerClient, LocalSigner};

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")))
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 3 {
        bail!("usage: {} <recipient> <amount-wei> [count]", args[0]);
    }
    let recipient = Address::from_str(&args[1]).context("invalid recipient address")?;
    let amount = U256::from_str(&args[2]).context("invalid amount")?;
    let count: usize = args.get(3).map(|c| c.parse()).transpose()?.unwrap_or(3);

    let rpc_url = env::var("RPC_URL").context("RPC_URL not set")?;
    let token = env::var("CONTRACT_ADDRESS").context("CONTRACT_ADDRESS not set")?;
    let token = Address::from_str(&token).context("invalid CONTRACT_ADDRESS")?;
    let key = SecretString::from(env::var("RELAYER_PRIVATE_KEY").context("RELAYER_PRIVATE_KEY not set")?);

    let ledger: Arc<dyn LedgerClient> = Arc::new(EvmLedgerClient::with_defaults(&rpc_url)?);
    let signer: Arc<dyn TransactionSigner> = Arc::new(LocalSigner::from_secret(&key)?);
    let queue = DispatchQueue::new(ledger, signer, DispatchConfig::from_env());

    queue.start().await?;
    println!("started sender on {}", queue.address());

    let request = TxRequest::call(token, encode_transfer(recipient, amount));

    println!("\n--- sequential ---");
    for _ in 0..count {
        match queue.submit(request.clone())?.await {
            Ok(receipt) => println!("tx={} nonce={}", receipt.tx_hash, receipt.nonce),
            Err(e) => eprintln!("failed: {}", e),
        }
    }

    println!("\n--- concurrent ---");
    let handles = (0..count)
        .map(|_| queue.submit(request.clone()))
        .collect::<Result<Vec<_>, _>>()?;
    for handle in handles {
        match handle.await {
            Ok(receipt) => println!("tx={} nonce={}", receipt.tx_hash, receipt.nonce),
            Err(e) => eprintln!("failed: {}", e),
        }
    }

    queue.stop().await;
    println!("\nstopped, queue size {}", queue.queue_size());
    Ok(())
}
