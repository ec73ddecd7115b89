// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//
// Shared harness for broker tests: a full Runtime over the in-memory
// store, a manual clock, a scriptable payment backend, and the axum
// router driven in-process.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use chrono::Utc;
use gridmarket::balancer::{LoadBalancer, LoadBalancerConfig};
use gridmarket::broker::{router, settlement_channel, Runtime};
use gridmarket::clock::ManualClock;
use gridmarket::payments::MockPaymentBackend;
use gridmarket::store::{MemoryStore, Store};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use tower::ServiceExt;
use uuid::Uuid;

pub const ADMIN_KEY: &str = "test-admin-key";

pub struct TestHarness {
    pub app: Router,
    pub runtime: Arc<Runtime>,
    pub clock: Arc<ManualClock>,
    pub payments: Arc<MockPaymentBackend>,
    pub settlement_rx: Option<mpsc::Receiver<Uuid>>,
}

pub async fn harness() -> TestHarness {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let balancer = Arc::new(LoadBalancer::new(LoadBalancerConfig::default()));
    let payments = Arc::new(MockPaymentBackend::new());
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let (settlement_tx, settlement_rx) = settlement_channel();
    let runtime = Arc::new(Runtime {
        store,
        balancer,
        payments: payments.clone(),
        clock: clock.clone(),
        settlement_tx,
        admin_api_key: ADMIN_KEY.to_string(),
        payer_wallet: "BrokerPayerWallet11111111111111111111111111".to_string(),
    });
    TestHarness {
        app: router(runtime.clone()),
        runtime,
        clock,
        payments,
        settlement_rx: Some(settlement_rx),
    }
}

pub async fn post_json(
    app: &Router,
    path: &str,
    api_key: Option<&str>,
    body: Value,
) -> (StatusCode, Value) {
    let mut request = Request::builder()
        .method("POST")
        .uri(path)
        .header("content-type", "application/json");
    if let Some(key) = api_key {
        request = request.header("x-api-key", key);
    }
    let response = app
        .clone()
        .oneshot(request.body(Body::from(body.to_string())).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

pub async fn get_json(app: &Router, path: &str, api_key: Option<&str>) -> (StatusCode, Value) {
    let mut request = Request::builder().method("GET").uri(path);
    if let Some(key) = api_key {
        request = request.header("x-api-key", key);
    }
    let response = app
        .clone()
        .oneshot(request.body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

/// Register an agent and return (agent_id, api_key).
pub async fn register_agent(app: &Router, gpu_memory: u64, max_concurrent: u32) -> (String, String) {
    let (status, body) = post_json(
        app,
        "/api/agents/register",
        None,
        json!({
            "wallet_address": format!("Wallet{}", Uuid::new_v4().simple()),
            "gpu_model": "RTX 4090",
            "gpu_vendor": "NVIDIA",
            "compute_framework": "cuda",
            "gpu_memory": gpu_memory,
            "max_concurrent_jobs": max_concurrent,
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "register failed: {body}");
    (
        body["agent_id"].as_str().unwrap().to_string(),
        body["api_key"].as_str().unwrap().to_string(),
    )
}

pub fn job_request(priority: &str, reward: u64, timeout_s: u64) -> Value {
    json!({
        "job_type": "inference",
        "image_ref": "python:3.11-slim",
        "command": ["python3", "-c", "print('ok')"],
        "env": {},
        "gpu_memory_required": 4_000_000_000u64,
        "requires_gpu": false,
        "estimated_duration_s": 60,
        "timeout_s": timeout_s,
        "reward_lamports": reward,
        "priority": priority,
    })
}

pub async fn create_job(app: &Router, body: Value) -> Uuid {
    let (status, response) = post_json(app, "/api/admin/jobs/create", Some(ADMIN_KEY), body).await;
    assert_eq!(status, StatusCode::OK, "create job failed: {response}");
    response["job_id"].as_str().unwrap().parse().unwrap()
}

pub fn capability(gpu_memory: u64, max_concurrent: u32) -> Value {
    json!({
        "gpu_model": "RTX 4090",
        "gpu_vendor": "NVIDIA",
        "compute_framework": "cuda",
        "gpu_memory": gpu_memory,
        "max_concurrent_jobs": max_concurrent,
    })
}

/// Poll the available endpoint and return the offered job ids in order.
pub async fn poll_jobs(app: &Router, api_key: &str, cap: Value) -> Vec<Uuid> {
    let (status, body) = post_json(app, "/api/jobs/available", Some(api_key), cap).await;
    assert_eq!(status, StatusCode::OK, "poll failed: {body}");
    body["jobs"]
        .as_array()
        .unwrap()
        .iter()
        .map(|j| j["job_id"].as_str().unwrap().parse().unwrap())
        .collect()
}

pub async fn accept_job(app: &Router, api_key: &str, job_id: Uuid) -> (StatusCode, Value) {
    post_json(
        app,
        &format!("/api/jobs/{job_id}/accept"),
        Some(api_key),
        json!({ "wallet_address": "AgentWallet1111111111111111111111111111111" }),
    )
    .await
}

pub async fn complete_job(app: &Router, api_key: &str, job_id: Uuid) -> (StatusCode, Value) {
    post_json(
        app,
        &format!("/api/jobs/{job_id}/complete"),
        Some(api_key),
        json!({ "execution_time_s": 12.5 }),
    )
    .await
}

pub async fn fail_job(app: &Router, api_key: &str, job_id: Uuid) -> (StatusCode, Value) {
    post_json(
        app,
        &format!("/api/jobs/{job_id}/fail"),
        Some(api_key),
        json!({ "error_message": "boom", "error_type": "test" }),
    )
    .await
}
