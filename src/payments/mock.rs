// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;

use super::{PaymentBackend, PaymentError, TransferStatus};

/// Scriptable backend for tests and local runs without an RPC node.
/// Transfers succeed and confirm immediately unless told otherwise.
pub struct MockPaymentBackend {
    counter: AtomicU64,
    transfers: Mutex<Vec<MockTransfer>>,
    confirm_results: Mutex<HashMap<String, TransferStatus>>,
    send_failures: Mutex<Vec<PaymentError>>,
    balance: AtomicU64,
}

#[derive(Debug, Clone)]
pub struct MockTransfer {
    pub to_wallet: String,
    pub amount_lamports: u64,
    pub memo: String,
    pub signature: String,
}

impl MockPaymentBackend {
    pub fn new() -> Self {
        Self {
            counter: AtomicU64::new(0),
            transfers: Mutex::new(Vec::new()),
            confirm_results: Mutex::new(HashMap::new()),
            send_failures: Mutex::new(Vec::new()),
            balance: AtomicU64::new(1_000_000_000),
        }
    }

    pub fn with_balance(self, lamports: u64) -> Self {
        self.balance.store(lamports, Ordering::SeqCst);
        self
    }

    /// Queue errors to be returned by the next `send_transfer` calls, in
    /// order, before sends start succeeding again.
    pub async fn fail_next_sends(&self, errors: Vec<PaymentError>) {
        let mut failures = self.send_failures.lock().await;
        *failures = errors;
    }

    /// Pin the status reported for a signature; unpinned signatures report
    /// Confirmed.
    pub async fn set_confirmation(&self, signature: &str, status: TransferStatus) {
        self.confirm_results
            .lock()
            .await
            .insert(signature.to_string(), status);
    }

    pub async fn sent(&self) -> Vec<MockTransfer> {
        self.transfers.lock().await.clone()
    }
}

impl Default for MockPaymentBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PaymentBackend for MockPaymentBackend {
    async fn send_transfer(
        &self,
        to_wallet: &str,
        amount_lamports: u64,
        memo: &str,
    ) -> Result<String, PaymentError> {
        {
            let mut failures = self.send_failures.lock().await;
            if !failures.is_empty() {
                return Err(failures.remove(0));
            }
        }
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let signature = format!("mock-signature-{n}");
        self.transfers.lock().await.push(MockTransfer {
            to_wallet: to_wallet.to_string(),
            amount_lamports,
            memo: memo.to_string(),
            signature: signature.clone(),
        });
        Ok(signature)
    }

    async fn confirm_signature(&self, signature: &str) -> Result<TransferStatus, PaymentError> {
        Ok(self
            .confirm_results
            .lock()
            .await
            .get(signature)
            .copied()
            .unwrap_or(TransferStatus::Confirmed))
    }

    async fn get_balance(&self, _wallet: &str) -> Result<u64, PaymentError> {
        Ok(self.balance.load(Ordering::SeqCst))
    }
}
