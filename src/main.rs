// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//
// Broker: the authenticated REST surface plus its two background workers
// (maintenance watchdog and payment settlement).

use anyhow::Result;
use gridmarket::balancer::{LoadBalancer, LoadBalancerConfig};
use gridmarket::broker::{
    router, run_maintenance, settlement_channel, Runtime, SettlementWorker,
};
use gridmarket::clock::SystemClock;
use gridmarket::config::BrokerConfig;
use gridmarket::payments::{PaymentBackend, RpcPaymentBackend, Wallet};
use gridmarket::store::MemoryStore;
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    if env::var("RUST_LOG").is_err() {
        env::set_var("RUST_LOG", "info");
    }
    tracing_subscriber::fmt::init();

    let config = BrokerConfig::from_env();
    info!("starting gridmarket broker on {}", config.bind_addr);

    let wallet = Arc::new(Wallet::load_or_create(&config.wallet_path)?);
    let payer_wallet = wallet.address();
    let payments = Arc::new(RpcPaymentBackend::new(config.rpc_url.clone(), wallet));
    match payments.get_balance(&payer_wallet).await {
        Ok(balance) => info!(
            "marketplace wallet {} holds {} lamports",
            payer_wallet, balance
        ),
        Err(e) => warn!("could not read marketplace wallet balance: {}", e),
    }

    let store = Arc::new(MemoryStore::new());
    let balancer = Arc::new(LoadBalancer::new(LoadBalancerConfig {
        heartbeat_timeout: chrono::Duration::seconds(config.heartbeat_timeout_s),
        ..Default::default()
    }));
    let (settlement_tx, settlement_rx) = settlement_channel();

    let runtime = Arc::new(Runtime {
        store: store.clone(),
        balancer,
        payments: payments.clone(),
        clock: Arc::new(SystemClock),
        settlement_tx: settlement_tx.clone(),
        admin_api_key: config.admin_api_key.clone(),
        payer_wallet,
    });
    runtime.rebuild_balancer().await?;

    let shutdown = CancellationToken::new();

    let settlement_worker = SettlementWorker::new(store.clone(), payments.clone());
    settlement_worker.reconcile(&settlement_tx).await;
    let settlement_handle =
        tokio::spawn(settlement_worker.run(settlement_rx, shutdown.child_token()));

    let maintenance_handle = tokio::spawn(run_maintenance(
        runtime.clone(),
        Duration::from_secs(config.maintenance_interval_s),
        shutdown.child_token(),
    ));

    let app = router(runtime);
    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    info!("broker listening on {}", config.bind_addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;

    // Give settlement up to 30s to drain; PENDING rows survive for the
    // next start's reconciliation either way.
    shutdown.cancel();
    if tokio::time::timeout(Duration::from_secs(30), settlement_handle)
        .await
        .is_err()
    {
        warn!("settlement worker did not drain in time");
    }
    maintenance_handle.abort();
    info!("broker stopped");
    Ok(())
}
