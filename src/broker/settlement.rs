// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//
// Background settlement: turns COMPLETED jobs into CONFIRMED payments,
// at most once. The handler side only ever enqueues a job id; everything
// durable lives in the store, so a crash at any point is recoverable by
// `reconcile`.

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::models::{Payment, PaymentState};
use crate::payments::{PaymentBackend, PaymentError, TransferStatus};
use crate::store::Store;

/// Sized for a burst of completions without blocking a request handler.
pub const SETTLEMENT_CHANNEL_CAPACITY: usize = 1024;

const MAX_SUBMIT_ATTEMPTS: usize = 5;
const SUBMIT_BACKOFF_BASE: Duration = Duration::from_secs(2);
// 2 + 4 + 8 + 16 + 30 = 60s of confirmation patience per transfer.
const CONFIRM_DELAYS: [u64; 5] = [2, 4, 8, 16, 30];

pub fn settlement_channel() -> (mpsc::Sender<Uuid>, mpsc::Receiver<Uuid>) {
    mpsc::channel(SETTLEMENT_CHANNEL_CAPACITY)
}

pub struct SettlementWorker {
    store: Arc<dyn Store>,
    payments: Arc<dyn PaymentBackend>,
}

impl SettlementWorker {
    pub fn new(store: Arc<dyn Store>, payments: Arc<dyn PaymentBackend>) -> Self {
        Self { store, payments }
    }

    /// Re-enqueue every PENDING payment row. Run once at startup so rows
    /// stranded by a crash or a full channel get picked up again.
    pub async fn reconcile(&self, tx: &mpsc::Sender<Uuid>) -> usize {
        let pending = match self.store.pending_payments().await {
            Ok(pending) => pending,
            Err(e) => {
                error!("reconciliation scan failed: {}", e);
                return 0;
            }
        };
        let mut requeued = 0;
        for payment in pending {
            match tx.try_send(payment.job_id) {
                Ok(()) => requeued += 1,
                Err(e) => {
                    warn!("could not requeue payment for job {}: {}", payment.job_id, e);
                }
            }
        }
        if requeued > 0 {
            info!("reconciliation requeued {} pending payments", requeued);
        }
        requeued
    }

    pub async fn run(self, mut rx: mpsc::Receiver<Uuid>, shutdown: CancellationToken) {
        info!("settlement worker started");
        loop {
            tokio::select! {
                maybe_job = rx.recv() => {
                    match maybe_job {
                        Some(job_id) => self.settle(job_id).await,
                        None => break,
                    }
                }
                _ = shutdown.cancelled() => {
                    // Drain whatever is already queued, then stop. Rows we
                    // never reach stay PENDING and are reconciled on the
                    // next start.
                    while let Ok(job_id) = rx.try_recv() {
                        self.settle(job_id).await;
                    }
                    break;
                }
            }
        }
        info!("settlement worker stopped");
    }

    async fn settle(&self, job_id: Uuid) {
        let payment = match self.store.get_payment(job_id).await {
            Ok(payment) => payment,
            Err(e) => {
                error!("no payment row for job {}: {}", job_id, e);
                return;
            }
        };
        if payment.status != PaymentState::Pending {
            return;
        }

        // A recorded signature means the transfer already left this process;
        // resending would risk paying twice.
        let signature = match &payment.signature {
            Some(signature) => signature.clone(),
            None => match self.submit(&payment).await {
                Some(signature) => signature,
                None => return,
            },
        };

        match self.confirm_with_backoff(&signature).await {
            TransferStatus::Confirmed => {
                if let Err(e) = self
                    .store
                    .update_payment_status(job_id, Some(&signature), PaymentState::Confirmed)
                    .await
                {
                    error!("failed to record confirmed payment for {}: {}", job_id, e);
                    return;
                }
                info!(
                    "payment for job {} confirmed ({} lamports to {})",
                    job_id, payment.amount_lamports, payment.agent_wallet
                );
            }
            TransferStatus::Failed => {
                warn!("transfer {} for job {} failed on chain", signature, job_id);
                if let Err(e) = self
                    .store
                    .update_payment_status(job_id, Some(&signature), PaymentState::Failed)
                    .await
                {
                    error!("failed to record failed payment for {}: {}", job_id, e);
                }
            }
            TransferStatus::Pending => {
                // Out of confirmation budget; the reconciler resumes from
                // the recorded signature.
                warn!(
                    "transfer {} for job {} still unconfirmed, leaving PENDING",
                    signature, job_id
                );
            }
        }
    }

    /// Submit the transfer, retrying transient errors a bounded number of
    /// times. The signature is recorded against the PENDING row before any
    /// confirmation wait so a crash cannot cause a double send.
    async fn submit(&self, payment: &Payment) -> Option<String> {
        let memo = payment.job_id.to_string();
        let mut backoff = SUBMIT_BACKOFF_BASE;
        for attempt in 1..=MAX_SUBMIT_ATTEMPTS {
            match self
                .payments
                .send_transfer(&payment.agent_wallet, payment.amount_lamports, &memo)
                .await
            {
                Ok(signature) => {
                    if let Err(e) = self
                        .store
                        .update_payment_status(
                            payment.job_id,
                            Some(&signature),
                            PaymentState::Pending,
                        )
                        .await
                    {
                        error!(
                            "failed to record signature for job {}: {}",
                            payment.job_id, e
                        );
                    }
                    return Some(signature);
                }
                Err(PaymentError::Permanent(reason)) => {
                    warn!(
                        "payment for job {} permanently rejected: {}",
                        payment.job_id, reason
                    );
                    if let Err(e) = self
                        .store
                        .update_payment_status(payment.job_id, None, PaymentState::Failed)
                        .await
                    {
                        error!(
                            "failed to record rejected payment for {}: {}",
                            payment.job_id, e
                        );
                    }
                    return None;
                }
                Err(PaymentError::Transient(reason)) => {
                    warn!(
                        "transient payment failure for job {} (attempt {}/{}): {}",
                        payment.job_id, attempt, MAX_SUBMIT_ATTEMPTS, reason
                    );
                    if attempt < MAX_SUBMIT_ATTEMPTS {
                        sleep(backoff).await;
                        backoff *= 2;
                    }
                }
            }
        }
        // Still PENDING; an out-of-band reconciler owns it from here.
        warn!(
            "payment for job {} left PENDING after {} attempts",
            payment.job_id, MAX_SUBMIT_ATTEMPTS
        );
        None
    }

    async fn confirm_with_backoff(&self, signature: &str) -> TransferStatus {
        match self.payments.confirm_signature(signature).await {
            Ok(TransferStatus::Pending) => {}
            Ok(status) => return status,
            Err(e) => warn!("confirmation check for {} failed: {}", signature, e),
        }
        for delay in CONFIRM_DELAYS {
            sleep(Duration::from_secs(delay)).await;
            match self.payments.confirm_signature(signature).await {
                Ok(TransferStatus::Pending) => {}
                Ok(status) => return status,
                Err(e) => warn!("confirmation check for {} failed: {}", signature, e),
            }
        }
        TransferStatus::Pending
    }
}
