// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//
// End-to-end lifecycle scenarios driven through the REST surface, with the
// watchdog ticked by hand on a manual clock.

use axum::http::StatusCode;
use chrono::Duration;
use gridmarket::broker::run_tick;
use gridmarket::models::{JobPriority, JobStatus, PaymentState};
use gridmarket::store::Store as _;
use serde_json::json;

use super::common::{
    accept_job, capability, complete_job, create_job, fail_job, get_json, harness, job_request,
    poll_jobs, register_agent, ADMIN_KEY,
};

#[tokio::test]
async fn happy_path_completes_and_records_a_payment() {
    let h = harness().await;
    let (agent_id, api_key) = register_agent(&h.app, 8_000_000_000, 2).await;

    let mut body = job_request("normal", 1_000, 60);
    body["gpu_memory_required"] = json!(4_000_000_000u64);
    body["command"] = json!(["python3", "-c", "print('ok')"]);
    let job_id = create_job(&h.app, body).await;

    // Poll offers the job; accept wins the CAS; heartbeat starts it.
    let offered = poll_jobs(&h.app, &api_key, capability(8_000_000_000, 2)).await;
    assert_eq!(offered, vec![job_id]);
    let (status, body) = accept_job(&h.app, &api_key, job_id).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["reward_lamports"], 1_000);

    let (status, _) = super::common::post_json(
        &h.app,
        "/api/agents/heartbeat",
        Some(&api_key),
        json!({}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // Status history is a prefix of AVAILABLE -> ASSIGNED -> RUNNING ->
    // COMPLETED at every observation point.
    let job = h.runtime.store.get_job(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Running);

    let (status, body) = complete_job(&h.app, &api_key, job_id).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "completed");

    let (status, stats) = get_json(&h.app, "/api/admin/stats", Some(ADMIN_KEY)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["jobs_by_status"]["completed"], 1);
    assert_eq!(stats["payments"]["total_count"], 1);
    assert_eq!(stats["payments"]["pending"], 1);

    let agent = h.runtime.store.get_agent(&agent_id).await.unwrap();
    assert_eq!(agent.total_completed, 1);
    assert_eq!(agent.total_earned_lamports, 1_000);

    // A COMPLETED job always has its payment row (same transaction).
    let payment = h.runtime.store.get_payment(job_id).await.unwrap();
    assert_eq!(payment.amount_lamports, 1_000);
    assert_eq!(payment.status, PaymentState::Pending);
}

#[tokio::test]
async fn failed_jobs_requeue_with_escalated_priority() {
    let h = harness().await;
    let (agent_a, key_a) = register_agent(&h.app, 8_000_000_000, 2).await;

    let job_id = create_job(&h.app, job_request("normal", 500, 60)).await;
    accept_job(&h.app, &key_a, job_id).await;
    let (status, _) = fail_job(&h.app, &key_a, job_id).await;
    assert_eq!(status, StatusCode::OK);

    let job = h.runtime.store.get_job(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Available);
    assert_eq!(job.retry_count, 1);
    assert_eq!(job.priority, JobPriority::High);
    assert!(job.agent_id.is_none());

    // A second agent picks it up and completes it.
    let (agent_b, key_b) = register_agent(&h.app, 8_000_000_000, 2).await;
    let offered = poll_jobs(&h.app, &key_b, capability(8_000_000_000, 2)).await;
    assert_eq!(offered, vec![job_id]);
    accept_job(&h.app, &key_b, job_id).await;
    let (status, _) = complete_job(&h.app, &key_b, job_id).await;
    assert_eq!(status, StatusCode::OK);

    let a = h.runtime.store.get_agent(&agent_a).await.unwrap();
    let b = h.runtime.store.get_agent(&agent_b).await.unwrap();
    assert_eq!(a.total_failed, 1);
    assert_eq!(a.total_completed, 0);
    assert_eq!(b.total_completed, 1);

    // Completed counters line up with the completed row count.
    let by_status = h.runtime.store.jobs_by_status().await.unwrap();
    assert_eq!(
        by_status.get(&JobStatus::Completed).copied().unwrap_or(0),
        a.total_completed + b.total_completed
    );
}

#[tokio::test]
async fn watchdog_times_out_silent_jobs_and_flags_the_agent() {
    let h = harness().await;
    let (agent_id, api_key) = register_agent(&h.app, 8_000_000_000, 1).await;
    let job_id = create_job(&h.app, job_request("normal", 100, 10)).await;
    accept_job(&h.app, &api_key, job_id).await;

    // Inside the 12s buffered window nothing happens.
    h.clock.advance(Duration::seconds(11));
    run_tick(&h.runtime).await;
    let job = h.runtime.store.get_job(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Assigned);

    // Past timeout_s * 1.2 the job is failed and requeued.
    h.clock.advance(Duration::seconds(2));
    run_tick(&h.runtime).await;
    let job = h.runtime.store.get_job(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Available);
    assert_eq!(job.retry_count, 1);

    // After the heartbeat timeout the agent itself flips unhealthy.
    h.clock.advance(Duration::seconds(60));
    run_tick(&h.runtime).await;
    let snapshot = h.runtime.balancer.agent_snapshot(&agent_id).await.unwrap();
    assert!(!snapshot.is_healthy);

    let (_, stats) = get_json(&h.app, "/api/admin/stats", Some(ADMIN_KEY)).await;
    assert_eq!(stats["agents"]["healthy"], 0);
    assert_eq!(stats["agents"]["total"], 1);
}

#[tokio::test]
async fn retries_exhaust_into_terminal_failure() {
    let h = harness().await;
    let (_, api_key) = register_agent(&h.app, 8_000_000_000, 1).await;

    let mut body = job_request("normal", 100, 60);
    body["max_retries"] = json!(2);
    let job_id = create_job(&h.app, body).await;

    for attempt in 1..=2u32 {
        accept_job(&h.app, &api_key, job_id).await;
        let (status, _) = fail_job(&h.app, &api_key, job_id).await;
        assert_eq!(status, StatusCode::OK);
        let job = h.runtime.store.get_job(job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Available, "attempt {attempt}");
        assert_eq!(job.retry_count, attempt);
    }

    // Third failure exhausts the budget: terminal, out of the queue.
    accept_job(&h.app, &api_key, job_id).await;
    let (status, _) = fail_job(&h.app, &api_key, job_id).await;
    assert_eq!(status, StatusCode::OK);
    let job = h.runtime.store.get_job(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.retry_count, 2);
    assert!(job.completed_at.is_some());
    assert!(!h.runtime.balancer.is_queued(job_id).await);

    // A terminal job is not offered again.
    let offered = poll_jobs(&h.app, &api_key, capability(8_000_000_000, 1)).await;
    assert!(offered.is_empty());
}

#[tokio::test]
async fn priority_escalation_caps_at_urgent_across_retries() {
    let h = harness().await;
    let (_, api_key) = register_agent(&h.app, 8_000_000_000, 1).await;

    let mut body = job_request("high", 100, 60);
    body["max_retries"] = json!(3);
    let job_id = create_job(&h.app, body).await;

    accept_job(&h.app, &api_key, job_id).await;
    fail_job(&h.app, &api_key, job_id).await;
    let job = h.runtime.store.get_job(job_id).await.unwrap();
    assert_eq!(job.priority, JobPriority::Urgent);

    accept_job(&h.app, &api_key, job_id).await;
    fail_job(&h.app, &api_key, job_id).await;
    let job = h.runtime.store.get_job(job_id).await.unwrap();
    assert_eq!(job.priority, JobPriority::Urgent);
}

#[tokio::test]
async fn per_job_payment_rows_stay_unique() {
    let h = harness().await;
    let (_, api_key) = register_agent(&h.app, 8_000_000_000, 2).await;
    let job_id = create_job(&h.app, job_request("normal", 777, 60)).await;
    accept_job(&h.app, &api_key, job_id).await;
    complete_job(&h.app, &api_key, job_id).await;
    // Replayed terminal report must not mint a second payment row.
    complete_job(&h.app, &api_key, job_id).await;

    let payments = h.runtime.store.list_payments().await.unwrap();
    assert_eq!(payments.len(), 1);
    assert_eq!(payments[0].job_id, job_id);
}
