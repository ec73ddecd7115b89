// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//
// Worker agent: registers (or reuses an API key), then polls the broker,
// executes accepted jobs natively and reports outcomes until interrupted.

use anyhow::Result;
use gridmarket::agent::{AgentRuntime, MarketplaceClient, NativeExecutor, NativeSpawner};
use gridmarket::config::AgentConfig;
use gridmarket::payments::{PaymentBackend, RpcPaymentBackend, Wallet};
use std::env;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    if env::var("RUST_LOG").is_err() {
        env::set_var("RUST_LOG", "info");
    }
    tracing_subscriber::fmt::init();

    let config = AgentConfig::from_env();
    info!("starting gridmarket agent against {}", config.marketplace_url);
    info!(
        "capability: {} ({:.1}GB GPU, {} slots)",
        config.capability.gpu_model,
        config.capability.gpu_memory as f64 / 1e9,
        config.capability.max_concurrent_jobs
    );

    let wallet = Arc::new(Wallet::load_or_create(&config.wallet_path)?);
    let wallet_address = wallet.address();
    info!("wallet: {}", wallet_address);
    let rpc = RpcPaymentBackend::new(config.rpc_url.clone(), wallet);
    match rpc.get_balance(&wallet_address).await {
        Ok(balance) => info!("balance: {} lamports", balance),
        Err(e) => warn!("could not read wallet balance: {}", e),
    }

    let client = MarketplaceClient::new(config.marketplace_url.clone());
    let api_key = match &config.api_key {
        Some(key) => key.clone(),
        None => {
            info!("no API_KEY configured, registering with the marketplace");
            let credentials = client.register(&wallet_address, &config.capability).await?;
            info!(
                "registered as {}; set API_KEY={} to reuse this identity",
                credentials.agent_id, credentials.api_key
            );
            credentials.api_key
        }
    };
    let client = MarketplaceClient::new(config.marketplace_url.clone()).with_api_key(api_key);

    let executor = NativeExecutor::new(
        config.workdir.clone(),
        Arc::new(NativeSpawner),
        config.memory_limit_bytes,
    );
    let runtime = Arc::new(AgentRuntime::new(
        client,
        executor,
        config.capability.clone(),
        wallet_address,
    ));

    let run_handle = {
        let runtime = runtime.clone();
        tokio::spawn(async move { runtime.run().await })
    };

    signal::ctrl_c().await?;
    info!("shutting down");
    runtime.shutdown();
    let _ = run_handle.await;

    let status = runtime.status().await;
    info!(
        "session summary: {} completed, {} failed, {} lamports earned",
        status.completed_jobs, status.failed_jobs, status.total_earned_lamports
    );
    Ok(())
}
