// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use rand::RngCore;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use super::{AgentStatsDelta, NewAgent, NewJob, Store, StoreError};
use crate::models::{
    AgentRecord, Capability, Job, JobPriority, JobStatus, Payment, PaymentState,
};

// EMA weight for completion times, matching the balancer's in-memory copy.
const COMPLETION_EMA_ALPHA: f64 = 0.3;
const INITIAL_AVG_COMPLETION_SECONDS: f64 = 60.0;

#[derive(Default)]
struct Tables {
    agents: HashMap<String, AgentRecord>,
    api_keys: HashMap<String, String>,
    jobs: HashMap<Uuid, Job>,
    payments: HashMap<Uuid, Payment>,
}

/// In-process store. One `RwLock` over all three tables gives every
/// multi-row operation transaction semantics for free.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn mint_api_key() -> String {
        let mut bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        URL_SAFE_NO_PAD.encode(bytes)
    }

    fn apply_stats(agent: &mut AgentRecord, delta: AgentStatsDelta) {
        agent.total_completed += delta.completed;
        agent.total_failed += delta.failed;
        agent.total_earned_lamports += delta.earned_lamports;
        if let Some(seconds) = delta.completion_seconds {
            agent.avg_completion_seconds = COMPLETION_EMA_ALPHA * seconds
                + (1.0 - COMPLETION_EMA_ALPHA) * agent.avg_completion_seconds;
        }
        agent.reputation = (agent.success_rate() * 100.0).clamp(0.0, 100.0);
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn health(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn create_agent(
        &self,
        spec: NewAgent,
        now: DateTime<Utc>,
    ) -> Result<AgentRecord, StoreError> {
        let mut tables = self.tables.write().await;
        let agent_id = format!("agent-{}", Uuid::new_v4());
        let api_key = Self::mint_api_key();
        let record = AgentRecord {
            agent_id: agent_id.clone(),
            api_key: api_key.clone(),
            wallet_address: spec.wallet_address,
            gpu_model: spec.gpu_model,
            gpu_vendor: spec.gpu_vendor,
            compute_framework: spec.compute_framework,
            gpu_memory: spec.gpu_memory,
            max_concurrent_jobs: spec.max_concurrent_jobs,
            total_completed: 0,
            total_failed: 0,
            total_earned_lamports: 0,
            avg_completion_seconds: INITIAL_AVG_COMPLETION_SECONDS,
            reputation: 100.0,
            last_heartbeat_at: now,
            is_healthy: true,
            created_at: now,
        };
        tables.api_keys.insert(api_key, agent_id.clone());
        tables.agents.insert(agent_id.clone(), record.clone());
        info!("registered agent {} ({})", agent_id, record.gpu_model);
        Ok(record)
    }

    async fn get_agent(&self, agent_id: &str) -> Result<AgentRecord, StoreError> {
        self.tables
            .read()
            .await
            .agents
            .get(agent_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("agent {agent_id}")))
    }

    async fn get_agent_by_api_key(&self, api_key: &str) -> Result<AgentRecord, StoreError> {
        let tables = self.tables.read().await;
        let agent_id = tables
            .api_keys
            .get(api_key)
            .ok_or_else(|| StoreError::NotFound("api key".to_string()))?;
        tables
            .agents
            .get(agent_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("agent {agent_id}")))
    }

    async fn list_agents(&self) -> Result<Vec<AgentRecord>, StoreError> {
        Ok(self.tables.read().await.agents.values().cloned().collect())
    }

    async fn touch_agent(&self, agent_id: &str, now: DateTime<Utc>) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        let agent = tables
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| StoreError::NotFound(format!("agent {agent_id}")))?;
        if now > agent.last_heartbeat_at {
            agent.last_heartbeat_at = now;
        }
        agent.is_healthy = true;
        Ok(())
    }

    async fn update_agent_capability(
        &self,
        agent_id: &str,
        capability: &Capability,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        let agent = tables
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| StoreError::NotFound(format!("agent {agent_id}")))?;
        agent.gpu_model = capability.gpu_model.clone();
        agent.gpu_vendor = capability.gpu_vendor.clone();
        agent.compute_framework = capability.compute_framework;
        agent.gpu_memory = capability.gpu_memory;
        agent.max_concurrent_jobs = capability.max_concurrent_jobs;
        Ok(())
    }

    async fn update_agent_stats(
        &self,
        agent_id: &str,
        delta: AgentStatsDelta,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        let agent = tables
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| StoreError::NotFound(format!("agent {agent_id}")))?;
        Self::apply_stats(agent, delta);
        Ok(())
    }

    async fn create_job(&self, spec: NewJob, now: DateTime<Utc>) -> Result<Job, StoreError> {
        let mut tables = self.tables.write().await;
        let job = Job {
            job_id: Uuid::new_v4(),
            job_type: spec.job_type,
            image_ref: spec.image_ref,
            command: spec.command,
            env: spec.env,
            input_url: spec.input_url,
            output_url: spec.output_url,
            gpu_memory_required: spec.gpu_memory_required,
            requires_gpu: spec.requires_gpu,
            estimated_duration_s: spec.estimated_duration_s,
            timeout_s: spec.timeout_s,
            reward_lamports: spec.reward_lamports,
            status: JobStatus::Available,
            priority: spec.priority,
            agent_id: None,
            agent_wallet: None,
            retry_count: 0,
            max_retries: spec.max_retries,
            created_at: now,
            accepted_at: None,
            started_at: None,
            completed_at: None,
            completion_data: None,
            failure_reason: None,
            payment_signature: None,
        };
        tables.jobs.insert(job.job_id, job.clone());
        info!(
            "created job {} ({}, priority {:?}, reward {} lamports)",
            job.job_id, job.job_type, job.priority, job.reward_lamports
        );
        Ok(job)
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Job, StoreError> {
        self.tables
            .read()
            .await
            .jobs
            .get(&job_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("job {job_id}")))
    }

    async fn list_available_jobs(
        &self,
        capability: &Capability,
        limit: usize,
    ) -> Result<Vec<Job>, StoreError> {
        let tables = self.tables.read().await;
        let mut jobs: Vec<Job> = tables
            .jobs
            .values()
            .filter(|job| {
                job.status == JobStatus::Available
                    && capability.fits(job.gpu_memory_required, job.requires_gpu)
            })
            .cloned()
            .collect();
        jobs.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        jobs.truncate(limit);
        Ok(jobs)
    }

    async fn assign_job(
        &self,
        job_id: Uuid,
        agent_id: &str,
        agent_wallet: &str,
        now: DateTime<Utc>,
    ) -> Result<Job, StoreError> {
        let mut tables = self.tables.write().await;
        if !tables.agents.contains_key(agent_id) {
            return Err(StoreError::NotFound(format!("agent {agent_id}")));
        }
        let job = tables
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| StoreError::NotFound(format!("job {job_id}")))?;
        if job.status != JobStatus::Available {
            return Err(StoreError::Conflict(format!(
                "job {job_id} is {:?}, not available",
                job.status
            )));
        }
        job.status = JobStatus::Assigned;
        job.agent_id = Some(agent_id.to_string());
        job.agent_wallet = Some(agent_wallet.to_string());
        job.accepted_at = Some(now);
        debug!("job {} assigned to {}", job_id, agent_id);
        Ok(job.clone())
    }

    async fn mark_agent_jobs_running(
        &self,
        agent_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, StoreError> {
        let mut tables = self.tables.write().await;
        let mut promoted = Vec::new();
        for job in tables.jobs.values_mut() {
            if job.status == JobStatus::Assigned && job.agent_id.as_deref() == Some(agent_id) {
                job.status = JobStatus::Running;
                job.started_at = Some(now);
                promoted.push(job.job_id);
            }
        }
        Ok(promoted)
    }

    async fn complete_job(
        &self,
        job_id: Uuid,
        agent_id: &str,
        completion_data: Option<serde_json::Value>,
        completion_seconds: f64,
        now: DateTime<Utc>,
    ) -> Result<(Job, Payment), StoreError> {
        let mut tables = self.tables.write().await;
        if tables.payments.contains_key(&job_id) {
            return Err(StoreError::Conflict(format!(
                "payment row for job {job_id} already exists"
            )));
        }
        let job = tables
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| StoreError::NotFound(format!("job {job_id}")))?;
        match job.status {
            JobStatus::Available | JobStatus::Assigned | JobStatus::Running => {}
            other => {
                return Err(StoreError::Conflict(format!(
                    "job {job_id} is already {other:?}"
                )))
            }
        }
        if let Some(assigned) = job.agent_id.as_deref() {
            if assigned != agent_id {
                return Err(StoreError::WrongAgent(job_id));
            }
        }
        job.status = JobStatus::Completed;
        job.completed_at = Some(now);
        job.completion_data = completion_data;
        let wallet = job.agent_wallet.clone().unwrap_or_default();
        let payment = Payment {
            job_id,
            agent_id: agent_id.to_string(),
            agent_wallet: wallet,
            amount_lamports: job.reward_lamports,
            signature: None,
            status: PaymentState::Pending,
            created_at: now,
        };
        let job = job.clone();
        tables.payments.insert(job_id, payment.clone());
        if let Some(agent) = tables.agents.get_mut(agent_id) {
            Self::apply_stats(
                agent,
                AgentStatsDelta {
                    completed: 1,
                    earned_lamports: job.reward_lamports,
                    completion_seconds: Some(completion_seconds),
                    ..Default::default()
                },
            );
        }
        info!(
            "job {} completed by {} in {:.1}s, payment pending ({} lamports)",
            job_id, agent_id, completion_seconds, job.reward_lamports
        );
        Ok((job, payment))
    }

    async fn fail_job(
        &self,
        job_id: Uuid,
        agent_id: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Job, StoreError> {
        let mut tables = self.tables.write().await;
        let job = tables
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| StoreError::NotFound(format!("job {job_id}")))?;
        match job.status {
            JobStatus::Assigned | JobStatus::Running => {}
            other => {
                return Err(StoreError::Conflict(format!(
                    "job {job_id} is {other:?}, not failable"
                )))
            }
        }
        if job.agent_id.as_deref() != Some(agent_id) {
            return Err(StoreError::WrongAgent(job_id));
        }
        job.status = JobStatus::Failed;
        job.completed_at = Some(now);
        job.failure_reason = Some(reason.to_string());
        let job = job.clone();
        if let Some(agent) = tables.agents.get_mut(agent_id) {
            Self::apply_stats(
                agent,
                AgentStatsDelta {
                    failed: 1,
                    ..Default::default()
                },
            );
        }
        info!("job {} failed terminally on {}: {}", job_id, agent_id, reason);
        Ok(job)
    }

    async fn requeue_job(
        &self,
        job_id: Uuid,
        failing_agent: &str,
        reason: &str,
        priority: JobPriority,
        _now: DateTime<Utc>,
    ) -> Result<Job, StoreError> {
        let mut tables = self.tables.write().await;
        let job = tables
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| StoreError::NotFound(format!("job {job_id}")))?;
        match job.status {
            JobStatus::Assigned | JobStatus::Running => {}
            other => {
                return Err(StoreError::Conflict(format!(
                    "job {job_id} is {other:?}, not requeueable"
                )))
            }
        }
        if job.agent_id.as_deref() != Some(failing_agent) {
            return Err(StoreError::WrongAgent(job_id));
        }
        if job.retry_count >= job.max_retries {
            return Err(StoreError::Conflict(format!(
                "job {job_id} has no retry budget left"
            )));
        }
        job.status = JobStatus::Available;
        job.agent_id = None;
        job.agent_wallet = None;
        job.accepted_at = None;
        job.started_at = None;
        job.retry_count += 1;
        job.priority = priority;
        job.failure_reason = Some(reason.to_string());
        let job = job.clone();
        if let Some(agent) = tables.agents.get_mut(failing_agent) {
            Self::apply_stats(
                agent,
                AgentStatsDelta {
                    failed: 1,
                    ..Default::default()
                },
            );
        }
        info!(
            "job {} requeued after failure on {} (attempt {}/{}, priority {:?}): {}",
            job_id, failing_agent, job.retry_count, job.max_retries, job.priority, reason
        );
        Ok(job)
    }

    async fn update_payment_status(
        &self,
        job_id: Uuid,
        signature: Option<&str>,
        status: PaymentState,
    ) -> Result<Payment, StoreError> {
        let mut tables = self.tables.write().await;
        let payment = tables
            .payments
            .get_mut(&job_id)
            .ok_or_else(|| StoreError::NotFound(format!("payment for job {job_id}")))?;
        // Idempotent: re-applying a terminal status is a no-op.
        if payment.status != PaymentState::Pending && payment.status == status {
            return Ok(payment.clone());
        }
        if payment.status != PaymentState::Pending {
            return Err(StoreError::Conflict(format!(
                "payment for job {job_id} already {:?}",
                payment.status
            )));
        }
        if let Some(sig) = signature {
            payment.signature = Some(sig.to_string());
        }
        payment.status = status;
        let payment = payment.clone();
        if status == PaymentState::Confirmed {
            if let Some(job) = tables.jobs.get_mut(&job_id) {
                job.payment_signature = payment.signature.clone();
            }
        }
        Ok(payment)
    }

    async fn get_payment(&self, job_id: Uuid) -> Result<Payment, StoreError> {
        self.tables
            .read()
            .await
            .payments
            .get(&job_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("payment for job {job_id}")))
    }

    async fn list_payments(&self) -> Result<Vec<Payment>, StoreError> {
        let tables = self.tables.read().await;
        let mut payments: Vec<Payment> = tables.payments.values().cloned().collect();
        payments.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(payments)
    }

    async fn pending_payments(&self) -> Result<Vec<Payment>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .payments
            .values()
            .filter(|p| p.status == PaymentState::Pending)
            .cloned()
            .collect())
    }

    async fn jobs_by_status(&self) -> Result<HashMap<JobStatus, u64>, StoreError> {
        let tables = self.tables.read().await;
        let mut counts = HashMap::new();
        for job in tables.jobs.values() {
            *counts.entry(job.status).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn jobs_in_flight(&self) -> Result<Vec<Job>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .jobs
            .values()
            .filter(|job| {
                matches!(
                    job.status,
                    JobStatus::Available | JobStatus::Assigned | JobStatus::Running
                )
            })
            .cloned()
            .collect())
    }
}
