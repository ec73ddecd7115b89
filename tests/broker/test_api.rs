// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
use axum::http::StatusCode;
use gridmarket::models::JobStatus;
use gridmarket::store::Store as _;
use serde_json::json;

use super::common::{
    accept_job, capability, complete_job, create_job, get_json, harness, job_request, poll_jobs,
    post_json, register_agent, ADMIN_KEY,
};

#[tokio::test]
async fn agent_endpoints_require_an_api_key() {
    let h = harness().await;
    let (status, body) = post_json(&h.app, "/api/jobs/available", None, capability(0, 1)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error_type"], "unauthorized");

    let (status, _) = post_json(
        &h.app,
        "/api/jobs/available",
        Some("not-a-real-key"),
        capability(0, 1),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn admin_endpoints_reject_agent_keys() {
    let h = harness().await;
    let (_, api_key) = register_agent(&h.app, 8_000_000_000, 1).await;

    let (status, _) = get_json(&h.app, "/api/admin/stats", None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = get_json(&h.app, "/api/admin/stats", Some(&api_key)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error_type"], "forbidden");

    let (status, _) = get_json(&h.app, "/api/admin/stats", Some(ADMIN_KEY)).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn registration_requires_a_wallet() {
    let h = harness().await;
    let (status, body) = post_json(
        &h.app,
        "/api/agents/register",
        None,
        json!({
            "wallet_address": "",
            "gpu_model": "RTX 4090",
            "gpu_memory": 8_000_000_000u64,
        }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error_type"], "validation_error");
    assert_eq!(body["details"]["field"], "wallet_address");
}

#[tokio::test]
async fn zero_timeout_jobs_are_rejected() {
    let h = harness().await;
    let (status, body) = post_json(
        &h.app,
        "/api/admin/jobs/create",
        Some(ADMIN_KEY),
        job_request("normal", 1_000, 0),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["details"]["field"], "timeout_s");
}

#[tokio::test]
async fn empty_commands_are_rejected() {
    let h = harness().await;
    let mut body = job_request("normal", 1_000, 60);
    body["command"] = json!([]);
    let (status, response) =
        post_json(&h.app, "/api/admin/jobs/create", Some(ADMIN_KEY), body).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(response["details"]["field"], "command");
}

#[tokio::test]
async fn resubmitting_a_spec_yields_fresh_job_ids() {
    let h = harness().await;
    let first = create_job(&h.app, job_request("normal", 1_000, 60)).await;
    let second = create_job(&h.app, job_request("normal", 1_000, 60)).await;
    assert_ne!(first, second);
}

#[tokio::test]
async fn heartbeats_are_monotonic_and_job_neutral() {
    let h = harness().await;
    let (agent_id, api_key) = register_agent(&h.app, 8_000_000_000, 1).await;
    let job_id = create_job(&h.app, job_request("normal", 1_000, 60)).await;
    accept_job(&h.app, &api_key, job_id).await;

    // First heartbeat promotes the assigned job to running.
    let (status, _) = post_json(&h.app, "/api/agents/heartbeat", Some(&api_key), json!({})).await;
    assert_eq!(status, StatusCode::OK);
    let job = h.runtime.store.get_job(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Running);

    // Later heartbeats only advance the liveness timestamp.
    let mut last_seen = h
        .runtime
        .store
        .get_agent(&agent_id)
        .await
        .unwrap()
        .last_heartbeat_at;
    for _ in 0..3 {
        h.clock.advance(chrono::Duration::seconds(5));
        let (status, _) =
            post_json(&h.app, "/api/agents/heartbeat", Some(&api_key), json!({})).await;
        assert_eq!(status, StatusCode::OK);
        let agent = h.runtime.store.get_agent(&agent_id).await.unwrap();
        assert!(agent.last_heartbeat_at >= last_seen);
        last_seen = agent.last_heartbeat_at;
        let job = h.runtime.store.get_job(job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Running);
    }
}

#[tokio::test]
async fn accept_is_first_winner_takes_all() {
    let h = harness().await;
    let (_, key_a) = register_agent(&h.app, 8_000_000_000, 1).await;
    let (_, key_b) = register_agent(&h.app, 8_000_000_000, 1).await;
    let job_id = create_job(&h.app, job_request("normal", 1_000, 60)).await;

    let (status, _) = accept_job(&h.app, &key_a, job_id).await;
    assert_eq!(status, StatusCode::OK);
    let (status, body) = accept_job(&h.app, &key_b, job_id).await;
    assert_eq!(status, StatusCode::CONFLICT, "loser should get 409: {body}");
}

#[tokio::test]
async fn unknown_jobs_return_404() {
    let h = harness().await;
    let (_, api_key) = register_agent(&h.app, 8_000_000_000, 1).await;
    let (status, _) = accept_job(&h.app, &api_key, uuid::Uuid::new_v4()).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn completing_someone_elses_job_is_forbidden() {
    let h = harness().await;
    let (_, key_a) = register_agent(&h.app, 8_000_000_000, 1).await;
    let (_, key_b) = register_agent(&h.app, 8_000_000_000, 1).await;
    let job_id = create_job(&h.app, job_request("normal", 1_000, 60)).await;
    accept_job(&h.app, &key_a, job_id).await;

    let (status, _) = complete_job(&h.app, &key_b, job_id).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn double_completion_reports_conflict() {
    let h = harness().await;
    let (_, api_key) = register_agent(&h.app, 8_000_000_000, 1).await;
    let job_id = create_job(&h.app, job_request("normal", 1_000, 60)).await;
    accept_job(&h.app, &api_key, job_id).await;

    let (status, _) = complete_job(&h.app, &api_key, job_id).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = complete_job(&h.app, &api_key, job_id).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn exact_memory_fit_is_admissible() {
    let h = harness().await;
    let (_, api_key) = register_agent(&h.app, 8_000_000_000, 1).await;
    let mut body = job_request("normal", 1_000, 60);
    body["gpu_memory_required"] = json!(8_000_000_000u64);
    let job_id = create_job(&h.app, body).await;

    let offered = poll_jobs(&h.app, &api_key, capability(8_000_000_000, 1)).await;
    assert_eq!(offered, vec![job_id]);
}

#[tokio::test]
async fn saturated_agents_are_offered_nothing() {
    let h = harness().await;
    let (_, api_key) = register_agent(&h.app, 8_000_000_000, 1).await;
    let first = create_job(&h.app, job_request("normal", 1_000, 60)).await;
    let _second = create_job(&h.app, job_request("normal", 1_000, 60)).await;

    let offered = poll_jobs(&h.app, &api_key, capability(8_000_000_000, 1)).await;
    assert_eq!(offered[0], first);
    accept_job(&h.app, &api_key, first).await;

    // One slot, one reservation: the queue still has work but this agent
    // is full until the first job terminates.
    let offered = poll_jobs(&h.app, &api_key, capability(8_000_000_000, 1)).await;
    assert!(offered.is_empty());

    complete_job(&h.app, &api_key, first).await;
    let offered = poll_jobs(&h.app, &api_key, capability(8_000_000_000, 1)).await;
    assert_eq!(offered.len(), 1);
}

#[tokio::test]
async fn polls_return_jobs_in_priority_order() {
    let h = harness().await;
    let (_, api_key) = register_agent(&h.app, 8_000_000_000, 4).await;

    let low = create_job(&h.app, job_request("low", 1, 60)).await;
    let normal = create_job(&h.app, job_request("normal", 1, 60)).await;
    let high = create_job(&h.app, job_request("high", 1, 60)).await;
    let urgent = create_job(&h.app, job_request("urgent", 1, 60)).await;

    let offered = poll_jobs(&h.app, &api_key, capability(8_000_000_000, 4)).await;
    assert_eq!(offered, vec![urgent, high, normal, low]);
}

#[tokio::test]
async fn health_reports_dependency_status() {
    let h = harness().await;
    let (status, body) = get_json(&h.app, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["store"], "ok");
    assert_eq!(body["payment_backend"], "ok");
    assert!(body["now"].is_string());
}
