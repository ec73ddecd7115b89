// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
use chrono::{Duration, Utc};
use gridmarket::balancer::{LoadBalancer, LoadBalancerConfig, QueuedJob};
use gridmarket::models::JobPriority;
use uuid::Uuid;

fn queued(priority: JobPriority, gpu_memory_required: u64) -> QueuedJob {
    QueuedJob {
        job_id: Uuid::new_v4(),
        priority,
        gpu_memory_required,
        requires_gpu: false,
        estimated_duration_s: 60,
        timeout_s: 300,
        created_at: Utc::now(),
        retry_count: 0,
        max_retries: 3,
    }
}

#[tokio::test]
async fn the_best_scoring_agent_wins_placements() {
    let lb = LoadBalancer::new(LoadBalancerConfig::default());
    let now = Utc::now();
    // Same capacity; the slow agent's moving average drags its score down.
    lb.register_agent("agent-busy", 24_000_000_000, 2, now).await;
    lb.register_agent("agent-idle", 24_000_000_000, 2, now).await;
    lb.complete(Uuid::new_v4(), "agent-busy", 120.0).await;

    let job = queued(JobPriority::Normal, 0);
    lb.enqueue(job.clone()).await;
    let placements = lb.assign_jobs().await;
    assert_eq!(placements.len(), 1);
    assert_eq!(placements[0].agent_id, "agent-idle");
}

#[tokio::test]
async fn equal_scores_break_ties_by_agent_id() {
    let lb = LoadBalancer::new(LoadBalancerConfig::default());
    let now = Utc::now();
    lb.register_agent("agent-b", 8_000_000_000, 1, now).await;
    lb.register_agent("agent-a", 8_000_000_000, 1, now).await;

    lb.enqueue(queued(JobPriority::Normal, 0)).await;
    let placements = lb.assign_jobs().await;
    assert_eq!(placements[0].agent_id, "agent-a");
}

#[tokio::test]
async fn placements_respect_remaining_slots_within_a_pass() {
    let lb = LoadBalancer::new(LoadBalancerConfig::default());
    let now = Utc::now();
    lb.register_agent("agent-1", 8_000_000_000, 2, now).await;

    for _ in 0..4 {
        lb.enqueue(queued(JobPriority::Normal, 0)).await;
    }
    let placements = lb.assign_jobs().await;
    // Two slots, four queued jobs: exactly two placements.
    assert_eq!(placements.len(), 2);
}

#[tokio::test]
async fn oversized_jobs_fall_through_to_bigger_agents() {
    let lb = LoadBalancer::new(LoadBalancerConfig::default());
    let now = Utc::now();
    lb.register_agent("agent-small", 8_000_000_000, 1, now).await;
    lb.register_agent("agent-large", 48_000_000_000, 1, now).await;

    let big = queued(JobPriority::Urgent, 24_000_000_000);
    let small = queued(JobPriority::Low, 1_000_000_000);
    lb.enqueue(big.clone()).await;
    lb.enqueue(small.clone()).await;

    let placements = lb.assign_jobs().await;
    let big_target = placements
        .iter()
        .find(|p| p.job_id == big.job_id)
        .map(|p| p.agent_id.clone());
    assert_eq!(big_target.as_deref(), Some("agent-large"));
    // The small job still finds a home on the remaining agent.
    assert!(placements.iter().any(|p| p.job_id == small.job_id));
}

#[tokio::test]
async fn unhealthy_agents_receive_nothing() {
    let lb = LoadBalancer::new(LoadBalancerConfig::default());
    let t0 = Utc::now();
    lb.register_agent("agent-1", 8_000_000_000, 1, t0).await;
    lb.enqueue(queued(JobPriority::Normal, 0)).await;

    lb.check_agent_health(t0 + Duration::seconds(120)).await;
    assert!(lb.assign_jobs().await.is_empty());
    assert!(lb
        .select_for_agent("agent-1", 10)
        .await
        .is_empty());
}

#[tokio::test]
async fn selection_limit_caps_a_single_poll() {
    let lb = LoadBalancer::new(LoadBalancerConfig::default());
    let now = Utc::now();
    lb.register_agent("agent-1", 8_000_000_000, 32, now).await;
    for _ in 0..15 {
        lb.enqueue(queued(JobPriority::Normal, 0)).await;
    }
    let placements = lb.select_for_agent("agent-1", 10).await;
    assert_eq!(placements.len(), 10);
}

#[tokio::test]
async fn stats_reflect_capacity_and_utilization() {
    let lb = LoadBalancer::new(LoadBalancerConfig::default());
    let now = Utc::now();
    lb.register_agent("agent-1", 8_000_000_000, 2, now).await;
    lb.register_agent("agent-2", 24_000_000_000, 3, now).await;

    let stats = lb.stats().await;
    assert_eq!(stats.total_agents, 2);
    assert_eq!(stats.healthy_agents, 2);
    assert_eq!(stats.total_capacity, 5);
    assert_eq!(stats.current_load, 0);
    assert_eq!(stats.agents.len(), 2);
}
