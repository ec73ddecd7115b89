// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//
// The worker loop: poll for jobs, accept them, execute each in parallel up
// to the slot limit, report the terminal outcome. Three independently
// cancellable loops (poll, heartbeat, per-job execution) hang off one
// cancellation token.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{RwLock, Semaphore};
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::client::{CompletionReport, MarketplaceClient};
use super::executor::NativeExecutor;
use super::staging;
use crate::models::{Capability, JobSpec};

pub const POLL_INTERVAL: Duration = Duration::from_secs(10);
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const HISTORY_CAP: usize = 50;
const REPORT_ATTEMPTS: usize = 3;
const REPORT_BACKOFF: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct JobHistoryEntry {
    pub job_id: Uuid,
    pub job_type: String,
    pub success: bool,
    pub duration_s: f64,
    pub reward_lamports: u64,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct AgentStatus {
    pub wallet_address: String,
    pub active_jobs: usize,
    pub completed_jobs: usize,
    pub failed_jobs: usize,
    pub total_earned_lamports: u64,
}

pub struct AgentRuntime {
    client: Arc<MarketplaceClient>,
    executor: Arc<NativeExecutor>,
    http: reqwest::Client,
    capability: Capability,
    wallet_address: String,
    active: Arc<RwLock<HashMap<Uuid, JobSpec>>>,
    history: Arc<RwLock<VecDeque<JobHistoryEntry>>>,
    slots: Arc<Semaphore>,
    shutdown: CancellationToken,
}

impl AgentRuntime {
    pub fn new(
        client: MarketplaceClient,
        executor: NativeExecutor,
        capability: Capability,
        wallet_address: String,
    ) -> Self {
        let slots = Arc::new(Semaphore::new(capability.max_concurrent_jobs.max(1) as usize));
        Self {
            client: Arc::new(client),
            executor: Arc::new(executor),
            http: reqwest::Client::new(),
            capability,
            wallet_address,
            active: Arc::new(RwLock::new(HashMap::new())),
            history: Arc::new(RwLock::new(VecDeque::new())),
            slots,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Run the poll and heartbeat loops until shutdown.
    pub async fn run(self: &Arc<Self>) {
        info!("agent runtime started (wallet {})", self.wallet_address);
        let heartbeat = {
            let runtime = self.clone();
            tokio::spawn(async move { runtime.heartbeat_loop().await })
        };
        let poll = {
            let runtime = self.clone();
            tokio::spawn(async move { runtime.poll_loop().await })
        };
        let _ = futures::future::join(heartbeat, poll).await;
        info!("agent runtime stopped");
    }

    async fn heartbeat_loop(&self) {
        let mut ticker = interval(HEARTBEAT_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.client.heartbeat().await {
                        Ok(()) => debug!("heartbeat sent"),
                        Err(e) => warn!("heartbeat failed: {}", e),
                    }
                }
                _ = self.shutdown.cancelled() => break,
            }
        }
    }

    async fn poll_loop(self: &Arc<Self>) {
        let mut ticker = interval(POLL_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.poll_once().await;
                }
                _ = self.shutdown.cancelled() => break,
            }
        }
    }

    /// One poll/accept pass. Public so tests can drive the loop by hand.
    pub async fn poll_once(self: &Arc<Self>) -> usize {
        let jobs = match self.client.poll_available(&self.capability).await {
            Ok(jobs) => jobs,
            Err(e) => {
                warn!("poll failed: {}", e);
                return 0;
            }
        };
        let mut accepted = 0;
        for spec in jobs {
            if self.active.read().await.contains_key(&spec.job_id) {
                continue;
            }
            match self.client.accept_job(spec.job_id, &self.wallet_address).await {
                Ok(acceptance) => {
                    info!(
                        "accepted job {} ({}, {} lamports)",
                        spec.job_id, spec.job_type, acceptance.reward_lamports
                    );
                    self.active.write().await.insert(spec.job_id, spec.clone());
                    self.spawn_execution(spec);
                    accepted += 1;
                }
                Err(e) => {
                    // Someone else won the race, or the job moved on.
                    debug!("could not accept job {}: {}", spec.job_id, e);
                }
            }
        }
        accepted
    }

    fn spawn_execution(self: &Arc<Self>, spec: JobSpec) {
        let runtime = self.clone();
        tokio::spawn(async move {
            let permit = match runtime.slots.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            tokio::select! {
                _ = runtime.execute(spec) => {}
                _ = runtime.shutdown.cancelled() => {}
            }
            drop(permit);
        });
    }

    async fn execute(&self, spec: JobSpec) {
        let started = Instant::now();
        let input_dir = self.executor.input_dir(spec.job_id);
        let output_dir = self.executor.output_dir(spec.job_id);

        staging::stage_input(&self.http, &spec, &input_dir).await;

        match self.executor.run(&spec).await {
            Ok(outcome) if outcome.succeeded() => {
                staging::upload_output(&self.http, &spec, &output_dir).await;
                let duration = started.elapsed().as_secs_f64();
                let report = CompletionReport {
                    execution_time_s: duration,
                    output_data: Some(serde_json::json!({
                        "exit_code": outcome.exit_code,
                        "stdout_tail": outcome.stdout_tail,
                    })),
                    metrics: None,
                };
                self.report_completion(spec.job_id, &report).await;
                self.finish(&spec, true, duration).await;
                info!("job {} completed in {:.1}s", spec.job_id, duration);
            }
            Ok(outcome) => {
                let duration = started.elapsed().as_secs_f64();
                let message = if outcome.timed_out {
                    format!("job timed out after {} seconds", spec.timeout_s)
                } else {
                    format!(
                        "process exited with code {}: {}",
                        outcome.exit_code,
                        outcome.stderr_tail.trim()
                    )
                };
                let kind = if outcome.timed_out { "timeout" } else { "exit_code" };
                self.report_failure(spec.job_id, &message, Some(kind)).await;
                self.finish(&spec, false, duration).await;
                warn!("job {} failed: {}", spec.job_id, message);
            }
            Err(e) => {
                let duration = started.elapsed().as_secs_f64();
                let message = format!("executor error: {e}");
                self.report_failure(spec.job_id, &message, Some("executor")).await;
                self.finish(&spec, false, duration).await;
                error!("job {} could not run: {}", spec.job_id, e);
            }
        }
    }

    async fn finish(&self, spec: &JobSpec, success: bool, duration_s: f64) {
        self.active.write().await.remove(&spec.job_id);
        let mut history = self.history.write().await;
        history.push_back(JobHistoryEntry {
            job_id: spec.job_id,
            job_type: spec.job_type.clone(),
            success,
            duration_s,
            reward_lamports: if success { spec.reward_lamports } else { 0 },
            finished_at: Utc::now(),
        });
        while history.len() > HISTORY_CAP {
            history.pop_front();
        }
    }

    /// Terminal reports must land exactly once from this side; transient
    /// delivery failures get a bounded retry before giving up.
    async fn report_completion(&self, job_id: Uuid, report: &CompletionReport) {
        let mut backoff = REPORT_BACKOFF;
        for attempt in 1..=REPORT_ATTEMPTS {
            match self.client.report_complete(job_id, report).await {
                Ok(()) => return,
                Err(e) => {
                    warn!(
                        "completion report for {} failed (attempt {}/{}): {}",
                        job_id, attempt, REPORT_ATTEMPTS, e
                    );
                    if attempt < REPORT_ATTEMPTS {
                        sleep(backoff).await;
                        backoff *= 2;
                    }
                }
            }
        }
        error!("giving up reporting completion for job {}", job_id);
    }

    async fn report_failure(&self, job_id: Uuid, message: &str, kind: Option<&str>) {
        let mut backoff = REPORT_BACKOFF;
        for attempt in 1..=REPORT_ATTEMPTS {
            match self.client.report_failure(job_id, message, kind).await {
                Ok(()) => return,
                Err(e) => {
                    warn!(
                        "failure report for {} failed (attempt {}/{}): {}",
                        job_id, attempt, REPORT_ATTEMPTS, e
                    );
                    if attempt < REPORT_ATTEMPTS {
                        sleep(backoff).await;
                        backoff *= 2;
                    }
                }
            }
        }
        error!("giving up reporting failure for job {}", job_id);
    }

    pub async fn status(&self) -> AgentStatus {
        let history = self.history.read().await;
        let completed = history.iter().filter(|h| h.success).count();
        let failed = history.len() - completed;
        AgentStatus {
            wallet_address: self.wallet_address.clone(),
            active_jobs: self.active.read().await.len(),
            completed_jobs: completed,
            failed_jobs: failed,
            total_earned_lamports: history.iter().map(|h| h.reward_lamports).sum(),
        }
    }

    pub async fn history(&self) -> Vec<JobHistoryEntry> {
        self.history.read().await.iter().cloned().collect()
    }
}
