// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//
// In-memory scheduling state: agent capacity, the priority queue of
// runnable jobs, and live reservations. This is a cache over the store,
// rebuilt from it on startup; the store stays the source of truth and the
// caller of every selection here performs the store-side CAS before a
// reservation is recorded.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::fmt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::models::{AgentRecord, Job, JobPriority};

const COMPLETION_EMA_ALPHA: f64 = 0.3;
const INITIAL_AVG_COMPLETION_SECONDS: f64 = 60.0;

#[derive(Debug, Clone)]
pub struct LoadBalancerConfig {
    pub heartbeat_timeout: Duration,
    /// Watchdog fires at `timeout_s * job_timeout_buffer`.
    pub job_timeout_buffer: f64,
}

impl Default for LoadBalancerConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: Duration::seconds(60),
            job_timeout_buffer: 1.2,
        }
    }
}

/// Live view of one worker's capacity and track record.
#[derive(Debug, Clone)]
pub struct AgentCapacity {
    pub agent_id: String,
    pub gpu_memory: u64,
    pub max_concurrent_jobs: u32,
    pub current_jobs: u32,
    pub total_completed: u64,
    pub total_failed: u64,
    pub last_heartbeat: DateTime<Utc>,
    pub avg_completion_seconds: f64,
    pub success_rate: f64,
    pub is_healthy: bool,
}

impl AgentCapacity {
    pub fn available_slots(&self) -> u32 {
        self.max_concurrent_jobs.saturating_sub(self.current_jobs)
    }

    pub fn load_percentage(&self) -> f64 {
        if self.max_concurrent_jobs == 0 {
            return 100.0;
        }
        (self.current_jobs as f64 / self.max_concurrent_jobs as f64) * 100.0
    }

    /// Higher is better: availability weighs 0.5, success rate 0.3, speed 0.2.
    pub fn score(&self) -> f64 {
        let availability = self.available_slots() as f64 / self.max_concurrent_jobs.max(1) as f64;
        let speed = (60.0 / self.avg_completion_seconds.max(1.0)).min(1.0);
        availability * 0.5 + self.success_rate * 0.3 + speed * 0.2
    }
}

/// Queue mirror of an AVAILABLE job row.
#[derive(Debug, Clone)]
pub struct QueuedJob {
    pub job_id: Uuid,
    pub priority: JobPriority,
    pub gpu_memory_required: u64,
    pub requires_gpu: bool,
    pub estimated_duration_s: u64,
    pub timeout_s: u64,
    pub created_at: DateTime<Utc>,
    pub retry_count: u32,
    pub max_retries: u32,
}

impl From<&Job> for QueuedJob {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.job_id,
            priority: job.priority,
            gpu_memory_required: job.gpu_memory_required,
            requires_gpu: job.requires_gpu,
            estimated_duration_s: job.estimated_duration_s,
            timeout_s: job.timeout_s,
            created_at: job.created_at,
            retry_count: job.retry_count,
            max_retries: job.max_retries,
        }
    }
}

impl PartialEq for QueuedJob {
    fn eq(&self, other: &Self) -> bool {
        self.job_id == other.job_id
    }
}

impl Eq for QueuedJob {}

impl Ord for QueuedJob {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: highest priority first, FIFO within a priority.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.created_at.cmp(&self.created_at))
    }
}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone)]
struct Reservation {
    job: QueuedJob,
    agent_id: String,
    assignment_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Requeue {
        priority: JobPriority,
        retry_count: u32,
    },
    Terminal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCause {
    Timeout,
    AgentUnhealthy,
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureCause::Timeout => write!(f, "execution timed out"),
            FailureCause::AgentUnhealthy => write!(f, "agent stopped heartbeating"),
        }
    }
}

/// A failure the watchdog detected, with the retry decision already applied
/// to in-memory state. The caller mirrors it into the store.
#[derive(Debug, Clone)]
pub struct FailureEvent {
    pub job_id: Uuid,
    pub agent_id: String,
    pub cause: FailureCause,
    pub decision: RetryDecision,
}

#[derive(Debug, Clone)]
pub struct Placement {
    pub job_id: Uuid,
    pub agent_id: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct LbCounters {
    pub total_jobs_queued: u64,
    pub total_jobs_assigned: u64,
    pub total_jobs_failed: u64,
    pub total_jobs_retried: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LbAgentStats {
    pub agent_id: String,
    pub current_jobs: u32,
    pub max_jobs: u32,
    pub load_percent: f64,
    pub total_completed: u64,
    pub total_failed: u64,
    pub success_rate: f64,
    pub avg_time: f64,
    pub score: f64,
    pub is_healthy: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct LbStats {
    pub total_agents: usize,
    pub healthy_agents: usize,
    pub total_capacity: u32,
    pub current_load: u32,
    pub utilization: f64,
    pub queued_jobs: usize,
    pub assigned_jobs: usize,
    #[serde(flatten)]
    pub counters: LbCounters,
    pub agents: Vec<LbAgentStats>,
}

#[derive(Default)]
struct Inner {
    agents: HashMap<String, AgentCapacity>,
    queue: BinaryHeap<QueuedJob>,
    assigned: HashMap<Uuid, Reservation>,
    assignments_by_agent: HashMap<String, HashSet<Uuid>>,
    counters: LbCounters,
}

pub struct LoadBalancer {
    config: LoadBalancerConfig,
    inner: Mutex<Inner>,
}

impl LoadBalancer {
    pub fn new(config: LoadBalancerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Register a new agent or refresh an existing one's capacity. Called on
    /// registration and on every poll, which doubles as a liveness signal.
    pub async fn register_agent(
        &self,
        agent_id: &str,
        gpu_memory: u64,
        max_concurrent_jobs: u32,
        now: DateTime<Utc>,
    ) {
        let mut inner = self.inner.lock().await;
        match inner.agents.get_mut(agent_id) {
            Some(agent) => {
                agent.gpu_memory = gpu_memory;
                agent.max_concurrent_jobs = max_concurrent_jobs;
                agent.last_heartbeat = now;
                agent.is_healthy = true;
            }
            None => {
                inner.agents.insert(
                    agent_id.to_string(),
                    AgentCapacity {
                        agent_id: agent_id.to_string(),
                        gpu_memory,
                        max_concurrent_jobs,
                        current_jobs: 0,
                        total_completed: 0,
                        total_failed: 0,
                        last_heartbeat: now,
                        avg_completion_seconds: INITIAL_AVG_COMPLETION_SECONDS,
                        success_rate: 1.0,
                        is_healthy: true,
                    },
                );
                info!(
                    "registered agent {} ({} slots, {:.1}GB GPU)",
                    agent_id,
                    max_concurrent_jobs,
                    gpu_memory as f64 / 1e9
                );
            }
        }
    }

    /// Seed an agent entry from its store row during startup rebuild.
    pub async fn restore_agent(&self, record: &AgentRecord) {
        let mut inner = self.inner.lock().await;
        inner.agents.insert(
            record.agent_id.clone(),
            AgentCapacity {
                agent_id: record.agent_id.clone(),
                gpu_memory: record.gpu_memory,
                max_concurrent_jobs: record.max_concurrent_jobs,
                current_jobs: 0,
                total_completed: record.total_completed,
                total_failed: record.total_failed,
                last_heartbeat: record.last_heartbeat_at,
                avg_completion_seconds: record.avg_completion_seconds,
                success_rate: record.success_rate(),
                is_healthy: record.is_healthy,
            },
        );
    }

    pub async fn heartbeat(&self, agent_id: &str, now: DateTime<Utc>) {
        let mut inner = self.inner.lock().await;
        if let Some(agent) = inner.agents.get_mut(agent_id) {
            if now > agent.last_heartbeat {
                agent.last_heartbeat = now;
            }
            agent.is_healthy = true;
        }
    }

    /// Add a job to the queue. Duplicates (already queued or reserved) are
    /// rejected so a row can never hold two live queue entries.
    pub async fn enqueue(&self, job: QueuedJob) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.assigned.contains_key(&job.job_id) {
            warn!("job {} already assigned, not queueing", job.job_id);
            return false;
        }
        if inner.queue.iter().any(|q| q.job_id == job.job_id) {
            warn!("job {} already queued", job.job_id);
            return false;
        }
        debug!(
            "queued job {} (priority {:?}, {:.1}GB GPU)",
            job.job_id,
            job.priority,
            job.gpu_memory_required as f64 / 1e9
        );
        inner.queue.push(job);
        inner.counters.total_jobs_queued += 1;
        true
    }

    /// The assignment pass: healthy agents sorted by score (ties broken by
    /// agent id), jobs in queue order, first agent that fits wins. Jobs stay
    /// queued until the caller wins the store CAS and calls `reserve`.
    pub async fn assign_jobs(&self) -> Vec<Placement> {
        self.plan(None, usize::MAX).await
    }

    /// Same pass restricted to one polling agent; used to answer
    /// `/api/jobs/available` without stranding offers on idle workers.
    pub async fn select_for_agent(&self, agent_id: &str, limit: usize) -> Vec<Placement> {
        self.plan(Some(agent_id), limit).await
    }

    async fn plan(&self, only_agent: Option<&str>, limit: usize) -> Vec<Placement> {
        let inner = self.inner.lock().await;
        let mut agents: Vec<(&AgentCapacity, u32)> = inner
            .agents
            .values()
            .filter(|a| a.is_healthy && a.available_slots() > 0)
            .filter(|a| only_agent.map_or(true, |id| a.agent_id == id))
            .map(|a| (a, a.available_slots()))
            .collect();
        if agents.is_empty() {
            if !inner.queue.is_empty() {
                debug!("no available agents for {} queued jobs", inner.queue.len());
            }
            return Vec::new();
        }
        agents.sort_by(|(a, _), (b, _)| {
            b.score()
                .partial_cmp(&a.score())
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.agent_id.cmp(&b.agent_id))
        });

        let mut ordered: Vec<&QueuedJob> = inner.queue.iter().collect();
        ordered.sort_by(|a, b| b.cmp(a));

        let mut placements = Vec::new();
        for job in ordered {
            if placements.len() >= limit {
                break;
            }
            for (agent, slots) in agents.iter_mut() {
                if *slots == 0 {
                    continue;
                }
                if agent.gpu_memory < job.gpu_memory_required {
                    continue;
                }
                if job.requires_gpu && agent.gpu_memory == 0 {
                    continue;
                }
                *slots -= 1;
                placements.push(Placement {
                    job_id: job.job_id,
                    agent_id: agent.agent_id.clone(),
                });
                break;
            }
        }
        placements
    }

    /// Record a reservation after the store CAS succeeded: the queue entry
    /// moves to `assigned` and the agent's slot count goes up.
    pub async fn reserve(&self, job: &Job, now: DateTime<Utc>) {
        let Some(agent_id) = job.agent_id.clone() else {
            warn!("reserve called for job {} without an agent", job.job_id);
            return;
        };
        let mut inner = self.inner.lock().await;
        let queued = inner
            .queue
            .iter()
            .find(|q| q.job_id == job.job_id)
            .cloned()
            .unwrap_or_else(|| QueuedJob::from(job));
        inner.queue.retain(|q| q.job_id != job.job_id);
        inner.assigned.insert(
            job.job_id,
            Reservation {
                job: queued,
                agent_id: agent_id.clone(),
                assignment_time: now,
            },
        );
        inner
            .assignments_by_agent
            .entry(agent_id.clone())
            .or_default()
            .insert(job.job_id);
        inner.counters.total_jobs_assigned += 1;
        if let Some(agent) = inner.agents.get_mut(&agent_id) {
            agent.current_jobs += 1;
            info!(
                "assigned job {} to agent {} (load {:.1}%)",
                job.job_id,
                agent_id,
                agent.load_percentage()
            );
        } else {
            warn!("reservation for job {} on unknown agent {}", job.job_id, agent_id);
        }
    }

    /// Successful completion: drop the reservation and fold the duration
    /// into the agent's moving average.
    pub async fn complete(&self, job_id: Uuid, agent_id: &str, duration_seconds: f64) {
        let mut inner = self.inner.lock().await;
        let released = inner
            .assigned
            .get(&job_id)
            .map_or(false, |r| r.agent_id == agent_id)
            && inner.release(job_id, agent_id).is_some();
        if let Some(agent) = inner.agents.get_mut(agent_id) {
            if released {
                agent.current_jobs = agent.current_jobs.saturating_sub(1);
            }
            agent.total_completed += 1;
            agent.avg_completion_seconds = COMPLETION_EMA_ALPHA * duration_seconds
                + (1.0 - COMPLETION_EMA_ALPHA) * agent.avg_completion_seconds;
            let total = agent.total_completed + agent.total_failed;
            agent.success_rate = agent.total_completed as f64 / total.max(1) as f64;
        }
        info!("job {} completed by {} in {:.1}s", job_id, agent_id, duration_seconds);
    }

    /// Failure reported for a reserved job. Returns the retry decision, or
    /// `None` when no reservation is known (the caller falls back to the
    /// store row).
    pub async fn fail(&self, job_id: Uuid, agent_id: &str) -> Option<RetryDecision> {
        let mut inner = self.inner.lock().await;
        inner.fail_reserved(job_id, agent_id)
    }

    /// Watchdog pass: jobs running past `timeout_s * buffer` fail and go
    /// back through the retry path.
    pub async fn check_timeouts(&self, now: DateTime<Utc>) -> Vec<FailureEvent> {
        let mut inner = self.inner.lock().await;
        let buffer = self.config.job_timeout_buffer;
        let expired: Vec<(Uuid, String, f64, f64)> = inner
            .assigned
            .iter()
            .filter_map(|(job_id, res)| {
                let elapsed = (now - res.assignment_time).num_milliseconds() as f64 / 1000.0;
                let allowed = res.job.timeout_s as f64 * buffer;
                (elapsed > allowed).then(|| (*job_id, res.agent_id.clone(), elapsed, allowed))
            })
            .collect();

        let mut events = Vec::new();
        for (job_id, agent_id, elapsed, allowed) in expired {
            warn!(
                "job {} timed out on agent {} ({:.0}s > {:.0}s)",
                job_id, agent_id, elapsed, allowed
            );
            if let Some(decision) = inner.fail_reserved(job_id, &agent_id) {
                events.push(FailureEvent {
                    job_id,
                    agent_id,
                    cause: FailureCause::Timeout,
                    decision,
                });
            }
        }
        events
    }

    /// Watchdog pass: agents silent past the heartbeat timeout flip
    /// unhealthy and shed all their reservations through the retry path.
    pub async fn check_agent_health(&self, now: DateTime<Utc>) -> Vec<FailureEvent> {
        let mut inner = self.inner.lock().await;
        let timeout = self.config.heartbeat_timeout;
        let stale: Vec<String> = inner
            .agents
            .values()
            .filter(|a| a.is_healthy && now - a.last_heartbeat > timeout)
            .map(|a| a.agent_id.clone())
            .collect();

        let mut events = Vec::new();
        for agent_id in stale {
            warn!(
                "agent {} is unhealthy (no heartbeat for {}s)",
                agent_id,
                timeout.num_seconds()
            );
            if let Some(agent) = inner.agents.get_mut(&agent_id) {
                agent.is_healthy = false;
            }
            let jobs: Vec<Uuid> = inner
                .assignments_by_agent
                .get(&agent_id)
                .map(|set| set.iter().copied().collect())
                .unwrap_or_default();
            for job_id in jobs {
                warn!("reassigning job {} from unhealthy agent {}", job_id, agent_id);
                if let Some(decision) = inner.fail_reserved(job_id, &agent_id) {
                    events.push(FailureEvent {
                        job_id,
                        agent_id: agent_id.clone(),
                        cause: FailureCause::AgentUnhealthy,
                        decision,
                    });
                }
            }
        }
        events
    }

    pub async fn stats(&self) -> LbStats {
        let inner = self.inner.lock().await;
        let healthy: Vec<&AgentCapacity> =
            inner.agents.values().filter(|a| a.is_healthy).collect();
        let total_capacity: u32 = healthy.iter().map(|a| a.max_concurrent_jobs).sum();
        let current_load: u32 = healthy.iter().map(|a| a.current_jobs).sum();
        let mut agents: Vec<LbAgentStats> = inner
            .agents
            .values()
            .map(|a| LbAgentStats {
                agent_id: a.agent_id.clone(),
                current_jobs: a.current_jobs,
                max_jobs: a.max_concurrent_jobs,
                load_percent: a.load_percentage(),
                total_completed: a.total_completed,
                total_failed: a.total_failed,
                success_rate: a.success_rate * 100.0,
                avg_time: a.avg_completion_seconds,
                score: a.score(),
                is_healthy: a.is_healthy,
            })
            .collect();
        agents.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.agent_id.cmp(&b.agent_id))
        });
        LbStats {
            total_agents: inner.agents.len(),
            healthy_agents: healthy.len(),
            total_capacity,
            current_load,
            utilization: (current_load as f64 / total_capacity.max(1) as f64) * 100.0,
            queued_jobs: inner.queue.len(),
            assigned_jobs: inner.assigned.len(),
            counters: inner.counters,
            agents,
        }
    }

    pub async fn agent_snapshot(&self, agent_id: &str) -> Option<AgentCapacity> {
        self.inner.lock().await.agents.get(agent_id).cloned()
    }

    pub async fn queued_len(&self) -> usize {
        self.inner.lock().await.queue.len()
    }

    pub async fn assigned_len(&self) -> usize {
        self.inner.lock().await.assigned.len()
    }

    pub async fn is_queued(&self, job_id: Uuid) -> bool {
        self.inner
            .lock()
            .await
            .queue
            .iter()
            .any(|q| q.job_id == job_id)
    }
}

impl Inner {
    fn release(&mut self, job_id: Uuid, agent_id: &str) -> Option<Reservation> {
        let reservation = self.assigned.remove(&job_id);
        if let Some(set) = self.assignments_by_agent.get_mut(agent_id) {
            set.remove(&job_id);
            if set.is_empty() {
                self.assignments_by_agent.remove(agent_id);
            }
        }
        reservation
    }

    fn fail_reserved(&mut self, job_id: Uuid, agent_id: &str) -> Option<RetryDecision> {
        // Only the holding agent may release a reservation.
        if self.assigned.get(&job_id)?.agent_id != agent_id {
            return None;
        }
        let reservation = self.release(job_id, agent_id)?;
        if let Some(agent) = self.agents.get_mut(agent_id) {
            agent.current_jobs = agent.current_jobs.saturating_sub(1);
            agent.total_failed += 1;
            let total = agent.total_completed + agent.total_failed;
            agent.success_rate = agent.total_completed as f64 / total.max(1) as f64;
        }

        let mut job = reservation.job;
        if job.retry_count < job.max_retries {
            job.retry_count += 1;
            job.priority = job.priority.escalate();
            let decision = RetryDecision::Requeue {
                priority: job.priority,
                retry_count: job.retry_count,
            };
            warn!(
                "retrying job {} (attempt {}/{}, priority {:?})",
                job_id, job.retry_count, job.max_retries, job.priority
            );
            self.queue.push(job);
            self.counters.total_jobs_retried += 1;
            Some(decision)
        } else {
            self.counters.total_jobs_failed += 1;
            warn!("job {} failed after {} retries", job_id, job.max_retries);
            Some(RetryDecision::Terminal)
        }
    }
}
