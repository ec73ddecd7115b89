// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Lifecycle of a job row. The broker is the only transition authority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Available,
    Assigned,
    Running,
    Completed,
    Failed,
    Expired,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Expired)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    Low = 0,
    Normal = 1,
    High = 2,
    Urgent = 3,
}

impl JobPriority {
    /// One level up, capped at Urgent. Used when a failed job re-enters the queue.
    pub fn escalate(self) -> Self {
        match self {
            JobPriority::Low => JobPriority::Normal,
            JobPriority::Normal => JobPriority::High,
            JobPriority::High | JobPriority::Urgent => JobPriority::Urgent,
        }
    }
}

impl Default for JobPriority {
    fn default() -> Self {
        JobPriority::Normal
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComputeFramework {
    Cuda,
    Rocm,
    Metal,
    Opencl,
    None,
}

impl Default for ComputeFramework {
    fn default() -> Self {
        ComputeFramework::None
    }
}

impl std::str::FromStr for ComputeFramework {
    type Err = std::convert::Infallible;

    /// Anything unrecognized degrades to `None` rather than failing; the
    /// framework is a hint, not a contract.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "cuda" => ComputeFramework::Cuda,
            "rocm" => ComputeFramework::Rocm,
            "metal" => ComputeFramework::Metal,
            "opencl" => ComputeFramework::Opencl,
            _ => ComputeFramework::None,
        })
    }
}

/// What an agent can run. Sent on registration and refreshed on every poll;
/// GPU detection itself happens outside this crate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capability {
    pub gpu_model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_vendor: Option<String>,
    #[serde(default)]
    pub compute_framework: ComputeFramework,
    pub gpu_memory: u64,
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: u32,
}

fn default_max_concurrent_jobs() -> u32 {
    1
}

impl Capability {
    pub fn has_gpu(&self) -> bool {
        self.gpu_memory > 0
    }

    /// Whether a job with the given requirements fits on this hardware.
    pub fn fits(&self, gpu_memory_required: u64, requires_gpu: bool) -> bool {
        if requires_gpu && !self.has_gpu() {
            return false;
        }
        gpu_memory_required <= self.gpu_memory
    }
}

/// A registered worker. Rows are never deleted; stale agents stay for audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub agent_id: String,
    pub api_key: String,
    pub wallet_address: String,
    pub gpu_model: String,
    pub gpu_vendor: Option<String>,
    pub compute_framework: ComputeFramework,
    pub gpu_memory: u64,
    pub max_concurrent_jobs: u32,
    pub total_completed: u64,
    pub total_failed: u64,
    pub total_earned_lamports: u64,
    pub avg_completion_seconds: f64,
    pub reputation: f64,
    pub last_heartbeat_at: DateTime<Utc>,
    pub is_healthy: bool,
    pub created_at: DateTime<Utc>,
}

impl AgentRecord {
    pub fn success_rate(&self) -> f64 {
        let total = self.total_completed + self.total_failed;
        if total == 0 {
            1.0
        } else {
            self.total_completed as f64 / total as f64
        }
    }
}

/// A unit of work. `command` runs in a per-job scratch directory on the agent;
/// amounts are integer lamports end to end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: Uuid,
    pub job_type: String,
    pub image_ref: String,
    pub command: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub input_url: Option<String>,
    pub output_url: Option<String>,
    pub gpu_memory_required: u64,
    pub requires_gpu: bool,
    pub estimated_duration_s: u64,
    pub timeout_s: u64,
    pub reward_lamports: u64,
    pub status: JobStatus,
    pub priority: JobPriority,
    pub agent_id: Option<String>,
    pub agent_wallet: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub completion_data: Option<serde_json::Value>,
    pub failure_reason: Option<String>,
    pub payment_signature: Option<String>,
}

impl Job {
    /// Wire form served to agents. Assignment and retry bookkeeping stay server-side.
    pub fn to_spec(&self) -> JobSpec {
        JobSpec {
            job_id: self.job_id,
            job_type: self.job_type.clone(),
            image_ref: self.image_ref.clone(),
            command: self.command.clone(),
            env: self.env.clone(),
            gpu_memory_required: self.gpu_memory_required,
            requires_gpu: self.requires_gpu,
            estimated_duration_s: self.estimated_duration_s,
            timeout_s: self.timeout_s,
            reward_lamports: self.reward_lamports,
            input_url: self.input_url.clone(),
            output_url: self.output_url.clone(),
        }
    }
}

/// Job as it travels over the wire between broker and agents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub job_id: Uuid,
    pub job_type: String,
    pub image_ref: String,
    pub command: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub gpu_memory_required: u64,
    pub requires_gpu: bool,
    pub estimated_duration_s: u64,
    pub timeout_s: u64,
    pub reward_lamports: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentState {
    Pending,
    Confirmed,
    Failed,
}

/// At-most-once transfer record, one row per job, inserted in the same
/// transaction that completes the job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
    pub job_id: Uuid,
    pub agent_id: String,
    pub agent_wallet: String,
    pub amount_lamports: u64,
    pub signature: Option<String>,
    pub status: PaymentState,
    pub created_at: DateTime<Utc>,
}
