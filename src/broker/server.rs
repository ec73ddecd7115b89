// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
use axum::{
    extract::{Path, State},
    http::HeaderMap,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;
use uuid::Uuid;

use super::errors::ApiError;
use super::state::{Runtime, AVAILABLE_BATCH};
use crate::balancer::{LbStats, QueuedJob, RetryDecision};
use crate::clock::Clock;
use crate::models::{
    AgentRecord, Capability, ComputeFramework, JobPriority, JobSpec, JobStatus, Payment,
    PaymentState,
};
use crate::payments::PaymentBackend;
use crate::store::{NewAgent, NewJob, Store, StoreError};

pub fn router(runtime: Arc<Runtime>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/agents/register", post(register_handler))
        .route("/api/agents/heartbeat", post(heartbeat_handler))
        .route("/api/jobs/available", post(available_handler))
        .route("/api/jobs/:job_id/accept", post(accept_handler))
        .route("/api/jobs/:job_id/complete", post(complete_handler))
        .route("/api/jobs/:job_id/fail", post(fail_handler))
        .route("/api/admin/jobs/create", post(create_job_handler))
        .route("/api/admin/stats", get(stats_handler))
        .route("/api/admin/payments", get(payments_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(runtime)
}

async fn authenticate_agent(
    runtime: &Runtime,
    headers: &HeaderMap,
) -> Result<AgentRecord, ApiError> {
    let key = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::Unauthorized("missing X-API-Key header".to_string()))?;
    match runtime.store.get_agent_by_api_key(key).await {
        Ok(agent) => Ok(agent),
        Err(StoreError::NotFound(_)) => {
            Err(ApiError::Unauthorized("invalid API key".to_string()))
        }
        Err(e) => Err(e.into()),
    }
}

fn require_admin(runtime: &Runtime, headers: &HeaderMap) -> Result<(), ApiError> {
    let key = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::Unauthorized("missing X-API-Key header".to_string()))?;
    if key != runtime.admin_api_key {
        return Err(ApiError::Forbidden("admin key required".to_string()));
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    store: &'static str,
    payment_backend: &'static str,
    now: DateTime<Utc>,
}

async fn health_handler(State(runtime): State<Arc<Runtime>>) -> Json<HealthResponse> {
    let store_ok = runtime.store.health().await.is_ok();
    let payments_ok = runtime
        .payments
        .get_balance(&runtime.payer_wallet)
        .await
        .is_ok();
    Json(HealthResponse {
        status: if store_ok && payments_ok {
            "healthy"
        } else {
            "degraded"
        },
        store: if store_ok { "ok" } else { "error" },
        payment_backend: if payments_ok { "ok" } else { "error" },
        now: runtime.clock.now(),
    })
}

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    wallet_address: String,
    gpu_model: String,
    #[serde(default)]
    gpu_vendor: Option<String>,
    #[serde(default)]
    compute_framework: ComputeFramework,
    gpu_memory: u64,
    // Reported by CUDA agents; accepted but not interpreted here.
    #[serde(default)]
    #[allow(dead_code)]
    compute_capability: Option<serde_json::Value>,
    #[serde(default = "default_one")]
    max_concurrent_jobs: u32,
}

fn default_one() -> u32 {
    1
}

#[derive(Debug, Serialize)]
struct RegisterResponse {
    agent_id: String,
    api_key: String,
}

async fn register_handler(
    State(runtime): State<Arc<Runtime>>,
    Json(body): Json<RegisterRequest>,
) -> Result<Json<RegisterResponse>, ApiError> {
    if body.wallet_address.trim().is_empty() {
        return Err(ApiError::ValidationError {
            field: "wallet_address".to_string(),
            message: "wallet address is required for payment".to_string(),
        });
    }
    let now = runtime.clock.now();
    let record = runtime
        .store
        .create_agent(
            NewAgent {
                wallet_address: body.wallet_address,
                gpu_model: body.gpu_model,
                gpu_vendor: body.gpu_vendor,
                compute_framework: body.compute_framework,
                gpu_memory: body.gpu_memory,
                max_concurrent_jobs: body.max_concurrent_jobs,
            },
            now,
        )
        .await?;
    runtime
        .balancer
        .register_agent(
            &record.agent_id,
            record.gpu_memory,
            record.max_concurrent_jobs,
            now,
        )
        .await;
    Ok(Json(RegisterResponse {
        agent_id: record.agent_id,
        api_key: record.api_key,
    }))
}

#[derive(Debug, Serialize)]
struct HeartbeatResponse {
    ok: bool,
    now: DateTime<Utc>,
}

async fn heartbeat_handler(
    State(runtime): State<Arc<Runtime>>,
    headers: HeaderMap,
) -> Result<Json<HeartbeatResponse>, ApiError> {
    let agent = authenticate_agent(&runtime, &headers).await?;
    let now = runtime.clock.now();
    runtime.store.touch_agent(&agent.agent_id, now).await?;
    // First heartbeat after accept moves the agent's ASSIGNED jobs to
    // RUNNING; later heartbeats find nothing to promote.
    runtime
        .store
        .mark_agent_jobs_running(&agent.agent_id, now)
        .await?;
    runtime.balancer.heartbeat(&agent.agent_id, now).await;
    Ok(Json(HeartbeatResponse { ok: true, now }))
}

#[derive(Debug, Serialize)]
struct AvailableResponse {
    jobs: Vec<JobSpec>,
}

async fn available_handler(
    State(runtime): State<Arc<Runtime>>,
    headers: HeaderMap,
    Json(capability): Json<Capability>,
) -> Result<Json<AvailableResponse>, ApiError> {
    let agent = authenticate_agent(&runtime, &headers).await?;
    let now = runtime.clock.now();
    runtime
        .store
        .update_agent_capability(&agent.agent_id, &capability)
        .await?;
    runtime
        .balancer
        .register_agent(
            &agent.agent_id,
            capability.gpu_memory,
            capability.max_concurrent_jobs,
            now,
        )
        .await;

    let placements = runtime
        .balancer
        .select_for_agent(&agent.agent_id, AVAILABLE_BATCH)
        .await;
    let mut jobs = Vec::with_capacity(placements.len());
    for placement in placements {
        match runtime.store.get_job(placement.job_id).await {
            Ok(job) if job.status == JobStatus::Available => jobs.push(job.to_spec()),
            Ok(_) => {}
            Err(e) => warn!("offered job {} missing from store: {}", placement.job_id, e),
        }
    }
    Ok(Json(AvailableResponse { jobs }))
}

#[derive(Debug, Deserialize)]
struct AcceptRequest {
    wallet_address: String,
}

#[derive(Debug, Serialize)]
struct AcceptResponse {
    status: &'static str,
    reward_lamports: u64,
}

async fn accept_handler(
    State(runtime): State<Arc<Runtime>>,
    Path(job_id): Path<Uuid>,
    headers: HeaderMap,
    Json(body): Json<AcceptRequest>,
) -> Result<Json<AcceptResponse>, ApiError> {
    let agent = authenticate_agent(&runtime, &headers).await?;
    if body.wallet_address.trim().is_empty() {
        return Err(ApiError::ValidationError {
            field: "wallet_address".to_string(),
            message: "wallet address is required for payment".to_string(),
        });
    }
    let now = runtime.clock.now();
    let job = runtime
        .store
        .assign_job(job_id, &agent.agent_id, &body.wallet_address, now)
        .await?;
    runtime.balancer.reserve(&job, now).await;
    Ok(Json(AcceptResponse {
        status: "accepted",
        reward_lamports: job.reward_lamports,
    }))
}

#[derive(Debug, Deserialize)]
struct CompleteRequest {
    #[serde(default)]
    execution_time_s: Option<f64>,
    #[serde(default)]
    output_data: Option<serde_json::Value>,
    #[serde(default)]
    metrics: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct CompleteResponse {
    status: &'static str,
    reward_lamports: u64,
}

async fn complete_handler(
    State(runtime): State<Arc<Runtime>>,
    Path(job_id): Path<Uuid>,
    headers: HeaderMap,
    Json(body): Json<CompleteRequest>,
) -> Result<Json<CompleteResponse>, ApiError> {
    let agent = authenticate_agent(&runtime, &headers).await?;
    let now = runtime.clock.now();
    let job = runtime.store.get_job(job_id).await?;

    let duration = body.execution_time_s.unwrap_or_else(|| {
        job.started_at
            .or(job.accepted_at)
            .map(|t| ((now - t).num_milliseconds() as f64 / 1000.0).max(0.0))
            .unwrap_or(0.0)
    });

    let mut completion = serde_json::Map::new();
    completion.insert("execution_time_s".to_string(), serde_json::json!(duration));
    if let Some(output) = body.output_data {
        completion.insert("output_data".to_string(), output);
    }
    if let Some(metrics) = body.metrics {
        completion.insert("metrics".to_string(), metrics);
    }

    let (job, _payment) = runtime
        .store
        .complete_job(
            job_id,
            &agent.agent_id,
            Some(serde_json::Value::Object(completion)),
            duration,
            now,
        )
        .await?;
    runtime
        .balancer
        .complete(job_id, &agent.agent_id, duration)
        .await;

    // Hand the job to the settlement worker; a full channel leaves the row
    // PENDING for the reconciler instead of blocking the handler.
    if let Err(e) = runtime.settlement_tx.try_send(job_id) {
        warn!("settlement channel refused job {}: {}", job_id, e);
    }

    Ok(Json(CompleteResponse {
        status: "completed",
        reward_lamports: job.reward_lamports,
    }))
}

#[derive(Debug, Deserialize)]
struct FailRequest {
    error_message: String,
    #[serde(default)]
    error_type: Option<String>,
}

#[derive(Debug, Serialize)]
struct FailResponse {
    status: &'static str,
}

async fn fail_handler(
    State(runtime): State<Arc<Runtime>>,
    Path(job_id): Path<Uuid>,
    headers: HeaderMap,
    Json(body): Json<FailRequest>,
) -> Result<Json<FailResponse>, ApiError> {
    let agent = authenticate_agent(&runtime, &headers).await?;
    let now = runtime.clock.now();
    let job = runtime.store.get_job(job_id).await?;

    let reason = match &body.error_type {
        Some(kind) => format!("{}: {}", kind, body.error_message),
        None => body.error_message.clone(),
    };

    // The balancer holds the retry state for reserved jobs; fall back to
    // the store row if the reservation is gone (e.g. after a restart).
    let decision = match runtime.balancer.fail(job_id, &agent.agent_id).await {
        Some(decision) => decision,
        None => {
            if job.retry_count < job.max_retries {
                RetryDecision::Requeue {
                    priority: job.priority.escalate(),
                    retry_count: job.retry_count + 1,
                }
            } else {
                RetryDecision::Terminal
            }
        }
    };

    match decision {
        RetryDecision::Requeue { priority, .. } => {
            let requeued = runtime
                .store
                .requeue_job(job_id, &agent.agent_id, &reason, priority, now)
                .await?;
            // No-op when the balancer already re-queued its own copy.
            runtime.balancer.enqueue(QueuedJob::from(&requeued)).await;
        }
        RetryDecision::Terminal => {
            runtime
                .store
                .fail_job(job_id, &agent.agent_id, &reason, now)
                .await?;
        }
    }
    Ok(Json(FailResponse { status: "failed" }))
}

#[derive(Debug, Deserialize)]
pub struct CreateJobRequest {
    pub job_type: String,
    #[serde(default, alias = "docker_image")]
    pub image_ref: String,
    pub command: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub input_url: Option<String>,
    #[serde(default)]
    pub output_url: Option<String>,
    #[serde(default)]
    pub gpu_memory_required: u64,
    #[serde(default)]
    pub requires_gpu: bool,
    #[serde(default = "default_estimated_duration")]
    pub estimated_duration_s: u64,
    pub timeout_s: u64,
    #[serde(default)]
    pub reward_lamports: u64,
    #[serde(default)]
    pub priority: JobPriority,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_estimated_duration() -> u64 {
    60
}

fn default_max_retries() -> u32 {
    3
}

#[derive(Debug, Serialize)]
struct CreateJobResponse {
    job_id: Uuid,
}

async fn create_job_handler(
    State(runtime): State<Arc<Runtime>>,
    headers: HeaderMap,
    Json(body): Json<CreateJobRequest>,
) -> Result<Json<CreateJobResponse>, ApiError> {
    require_admin(&runtime, &headers)?;
    if body.timeout_s == 0 {
        return Err(ApiError::ValidationError {
            field: "timeout_s".to_string(),
            message: "must be at least 1 second".to_string(),
        });
    }
    if body.command.is_empty() {
        return Err(ApiError::ValidationError {
            field: "command".to_string(),
            message: "command must not be empty".to_string(),
        });
    }
    let now = runtime.clock.now();
    let job = runtime
        .store
        .create_job(
            NewJob {
                job_type: body.job_type,
                image_ref: body.image_ref,
                command: body.command,
                env: body.env,
                input_url: body.input_url.filter(|u| !u.trim().is_empty()),
                output_url: body.output_url.filter(|u| !u.trim().is_empty()),
                gpu_memory_required: body.gpu_memory_required,
                requires_gpu: body.requires_gpu,
                estimated_duration_s: body.estimated_duration_s,
                timeout_s: body.timeout_s,
                reward_lamports: body.reward_lamports,
                priority: body.priority,
                max_retries: body.max_retries,
            },
            now,
        )
        .await?;
    runtime.balancer.enqueue(QueuedJob::from(&job)).await;
    Ok(Json(CreateJobResponse { job_id: job.job_id }))
}

#[derive(Debug, Serialize)]
struct AgentsSummary {
    total: usize,
    healthy: usize,
}

#[derive(Debug, Serialize)]
struct PaymentsSummary {
    total_count: usize,
    total_lamports: u64,
    confirmed: usize,
    pending: usize,
    failed: usize,
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    agents: AgentsSummary,
    jobs_by_status: HashMap<JobStatus, u64>,
    payments: PaymentsSummary,
    load_balancer: LbStats,
}

async fn stats_handler(
    State(runtime): State<Arc<Runtime>>,
    headers: HeaderMap,
) -> Result<Json<StatsResponse>, ApiError> {
    require_admin(&runtime, &headers)?;
    let lb = runtime.balancer.stats().await;
    let jobs_by_status = runtime.store.jobs_by_status().await?;
    let payments = runtime.store.list_payments().await?;
    let agents_total = runtime.store.list_agents().await?.len();

    let summary = PaymentsSummary {
        total_count: payments.len(),
        total_lamports: payments.iter().map(|p| p.amount_lamports).sum(),
        confirmed: count_by_state(&payments, PaymentState::Confirmed),
        pending: count_by_state(&payments, PaymentState::Pending),
        failed: count_by_state(&payments, PaymentState::Failed),
    };
    Ok(Json(StatsResponse {
        agents: AgentsSummary {
            total: agents_total,
            healthy: lb.healthy_agents,
        },
        jobs_by_status,
        payments: summary,
        load_balancer: lb,
    }))
}

fn count_by_state(payments: &[Payment], state: PaymentState) -> usize {
    payments.iter().filter(|p| p.status == state).count()
}

#[derive(Debug, Serialize)]
struct PaymentsResponse {
    payments: Vec<Payment>,
    total_count: usize,
    total_lamports: u64,
}

async fn payments_handler(
    State(runtime): State<Arc<Runtime>>,
    headers: HeaderMap,
) -> Result<Json<PaymentsResponse>, ApiError> {
    require_admin(&runtime, &headers)?;
    let payments = runtime.store.list_payments().await?;
    let total_lamports = payments.iter().map(|p| p.amount_lamports).sum();
    Ok(Json(PaymentsResponse {
        total_count: payments.len(),
        total_lamports,
        payments,
    }))
}
