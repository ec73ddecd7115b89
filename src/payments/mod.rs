// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//
// On-chain payment seam. The settlement worker owns retry policy, so
// implementations must not retry internally and must be safe to call
// concurrently.

use async_trait::async_trait;

mod mock;
mod rpc;
mod wallet;

pub use mock::{MockPaymentBackend, MockTransfer};
pub use rpc::RpcPaymentBackend;
pub use wallet::Wallet;

#[derive(Debug, thiserror::Error)]
pub enum PaymentError {
    /// Worth retrying: network hiccups, node congestion, stale blockhash.
    #[error("transient payment failure: {0}")]
    Transient(String),

    /// Not worth retrying: malformed request, insufficient funds, rejection.
    #[error("permanent payment failure: {0}")]
    Permanent(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Pending,
    Confirmed,
    Failed,
}

#[async_trait]
pub trait PaymentBackend: Send + Sync {
    /// Submit a signed transfer and return its signature. The memo is the
    /// job id, so a transfer can always be traced back to the work it paid
    /// for.
    async fn send_transfer(
        &self,
        to_wallet: &str,
        amount_lamports: u64,
        memo: &str,
    ) -> Result<String, PaymentError>;

    /// Look up the confirmation state of a previously submitted transfer.
    async fn confirm_signature(&self, signature: &str) -> Result<TransferStatus, PaymentError>;

    async fn get_balance(&self, wallet: &str) -> Result<u64, PaymentError>;
}
