// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//
// Persistence contract for agents, jobs and payments. The broker only ever
// talks to this trait; the in-memory implementation below is the single
// source of truth for the single-broker deployment and for tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use uuid::Uuid;

use crate::models::{
    AgentRecord, Capability, ComputeFramework, Job, JobPriority, JobStatus, Payment, PaymentState,
};

mod memory;
pub use memory::MemoryStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("job {0} is assigned to a different agent")]
    WrongAgent(Uuid),

    #[error("transient store failure: {0}")]
    Transient(String),

    #[error("fatal store failure: {0}")]
    Fatal(String),
}

/// Fields fixed at registration time. Capability details are refreshed on
/// every poll via `update_agent_capability`.
#[derive(Debug, Clone)]
pub struct NewAgent {
    pub wallet_address: String,
    pub gpu_model: String,
    pub gpu_vendor: Option<String>,
    pub compute_framework: ComputeFramework,
    pub gpu_memory: u64,
    pub max_concurrent_jobs: u32,
}

#[derive(Debug, Clone)]
pub struct NewJob {
    pub job_type: String,
    pub image_ref: String,
    pub command: Vec<String>,
    pub env: HashMap<String, String>,
    pub input_url: Option<String>,
    pub output_url: Option<String>,
    pub gpu_memory_required: u64,
    pub requires_gpu: bool,
    pub estimated_duration_s: u64,
    pub timeout_s: u64,
    pub reward_lamports: u64,
    pub priority: JobPriority,
    pub max_retries: u32,
}

/// Stat counters applied to an agent row inside job transitions.
#[derive(Debug, Clone, Copy, Default)]
pub struct AgentStatsDelta {
    pub completed: u64,
    pub failed: u64,
    pub earned_lamports: u64,
    /// Present on successful completions; feeds the EMA.
    pub completion_seconds: Option<f64>,
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn health(&self) -> Result<(), StoreError>;

    async fn create_agent(&self, spec: NewAgent, now: DateTime<Utc>)
        -> Result<AgentRecord, StoreError>;
    async fn get_agent(&self, agent_id: &str) -> Result<AgentRecord, StoreError>;
    async fn get_agent_by_api_key(&self, api_key: &str) -> Result<AgentRecord, StoreError>;
    async fn list_agents(&self) -> Result<Vec<AgentRecord>, StoreError>;
    async fn touch_agent(&self, agent_id: &str, now: DateTime<Utc>) -> Result<(), StoreError>;
    async fn update_agent_capability(
        &self,
        agent_id: &str,
        capability: &Capability,
    ) -> Result<(), StoreError>;
    async fn update_agent_stats(
        &self,
        agent_id: &str,
        delta: AgentStatsDelta,
    ) -> Result<(), StoreError>;

    async fn create_job(&self, spec: NewJob, now: DateTime<Utc>) -> Result<Job, StoreError>;
    async fn get_job(&self, job_id: Uuid) -> Result<Job, StoreError>;
    /// AVAILABLE jobs the capability can run, ordered by (priority desc,
    /// created_at asc), capped at `limit`.
    async fn list_available_jobs(
        &self,
        capability: &Capability,
        limit: usize,
    ) -> Result<Vec<Job>, StoreError>;
    /// Compare-and-set AVAILABLE -> ASSIGNED. Loses with `Conflict` if the
    /// row moved under us.
    async fn assign_job(
        &self,
        job_id: Uuid,
        agent_id: &str,
        agent_wallet: &str,
        now: DateTime<Utc>,
    ) -> Result<Job, StoreError>;
    /// ASSIGNED -> RUNNING for every job held by the agent. Driven by the
    /// agent's first heartbeat after accept.
    async fn mark_agent_jobs_running(
        &self,
        agent_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, StoreError>;
    /// Single transaction: job -> COMPLETED, agent stats updated, PENDING
    /// payment row inserted. `WrongAgent` if the job belongs to someone else.
    async fn complete_job(
        &self,
        job_id: Uuid,
        agent_id: &str,
        completion_data: Option<serde_json::Value>,
        completion_seconds: f64,
        now: DateTime<Utc>,
    ) -> Result<(Job, Payment), StoreError>;
    /// Terminal failure; the retry decision happens before this is called.
    async fn fail_job(
        &self,
        job_id: Uuid,
        agent_id: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Job, StoreError>;
    /// Failure with retry budget left: back to AVAILABLE with the agent
    /// cleared, `retry_count + 1` and the escalated priority. The failing
    /// agent's stats take the hit in the same transaction.
    async fn requeue_job(
        &self,
        job_id: Uuid,
        failing_agent: &str,
        reason: &str,
        priority: JobPriority,
        now: DateTime<Utc>,
    ) -> Result<Job, StoreError>;

    /// Idempotent PENDING -> CONFIRMED | FAILED. Recording a signature while
    /// still PENDING is allowed so a crash between submit and confirm can be
    /// reconciled without paying twice.
    async fn update_payment_status(
        &self,
        job_id: Uuid,
        signature: Option<&str>,
        status: PaymentState,
    ) -> Result<Payment, StoreError>;
    async fn get_payment(&self, job_id: Uuid) -> Result<Payment, StoreError>;
    async fn list_payments(&self) -> Result<Vec<Payment>, StoreError>;
    async fn pending_payments(&self) -> Result<Vec<Payment>, StoreError>;

    async fn jobs_by_status(&self) -> Result<HashMap<JobStatus, u64>, StoreError>;
    /// Everything the load balancer needs to rebuild its cache after a
    /// restart: AVAILABLE, ASSIGNED and RUNNING rows.
    async fn jobs_in_flight(&self) -> Result<Vec<Job>, StoreError>;
}
