// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;
use uuid::Uuid;

use crate::balancer::{LoadBalancer, QueuedJob};
use crate::clock::Clock;
use crate::models::JobStatus;
use crate::payments::PaymentBackend;
use crate::store::{Store, StoreError};

/// Jobs served per poll.
pub const AVAILABLE_BATCH: usize = 10;

/// Everything the request handlers and background workers share. Built once
/// at startup and threaded through explicitly; there is no other process
/// state.
pub struct Runtime {
    pub store: Arc<dyn Store>,
    pub balancer: Arc<LoadBalancer>,
    pub payments: Arc<dyn PaymentBackend>,
    pub clock: Arc<dyn Clock>,
    pub settlement_tx: mpsc::Sender<Uuid>,
    pub admin_api_key: String,
    pub payer_wallet: String,
}

impl Runtime {
    /// Rebuild the balancer cache from the store after a restart: every
    /// known agent, every AVAILABLE row back on the queue, every
    /// ASSIGNED/RUNNING row re-reserved so the watchdog keeps covering it.
    pub async fn rebuild_balancer(&self) -> Result<(), StoreError> {
        let now = self.clock.now();
        let agents = self.store.list_agents().await?;
        for agent in &agents {
            self.balancer.restore_agent(agent).await;
        }

        let jobs = self.store.jobs_in_flight().await?;
        let mut queued = 0usize;
        let mut reserved = 0usize;
        for job in &jobs {
            match job.status {
                JobStatus::Available => {
                    if self.balancer.enqueue(QueuedJob::from(job)).await {
                        queued += 1;
                    }
                }
                JobStatus::Assigned | JobStatus::Running => {
                    let assigned_at = job.accepted_at.unwrap_or(now);
                    self.balancer.reserve(job, assigned_at).await;
                    reserved += 1;
                }
                _ => {}
            }
        }
        info!(
            "balancer rebuilt from store: {} agents, {} queued, {} reserved",
            agents.len(),
            queued,
            reserved
        );
        Ok(())
    }
}
