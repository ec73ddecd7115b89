// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//
// The watchdog: a single worker ticking on its own task so timeout and
// liveness enforcement never block request handling.

use std::sync::Arc;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::state::Runtime;
use crate::balancer::{FailureEvent, RetryDecision};
use crate::clock::Clock;
use crate::store::Store;

pub const DEFAULT_MAINTENANCE_INTERVAL: Duration = Duration::from_secs(30);

pub async fn run_maintenance(
    runtime: Arc<Runtime>,
    tick_interval: Duration,
    shutdown: CancellationToken,
) {
    info!(
        "maintenance worker started (tick every {}s)",
        tick_interval.as_secs()
    );
    let mut ticker = interval(tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                run_tick(&runtime).await;
            }
            _ = shutdown.cancelled() => {
                info!("maintenance worker stopped");
                break;
            }
        }
    }
}

/// One watchdog pass. Public so tests can drive it without the ticker.
pub async fn run_tick(runtime: &Runtime) {
    let now = runtime.clock.now();
    let timed_out = runtime.balancer.check_timeouts(now).await;
    if !timed_out.is_empty() {
        info!("watchdog found {} timed out jobs", timed_out.len());
    }
    apply_events(runtime, timed_out).await;

    let now = runtime.clock.now();
    let unhealthy = runtime.balancer.check_agent_health(now).await;
    if !unhealthy.is_empty() {
        info!(
            "watchdog reassigned {} jobs from unhealthy agents",
            unhealthy.len()
        );
    }
    apply_events(runtime, unhealthy).await;

    let stats = runtime.balancer.stats().await;
    info!(
        "load balancer: {}/{} agents, {}/{} jobs ({:.1}% util), {} queued",
        stats.healthy_agents,
        stats.total_agents,
        stats.current_load,
        stats.total_capacity,
        stats.utilization,
        stats.queued_jobs
    );
}

/// Mirror watchdog decisions into the store. The balancer already moved
/// its own copy; the store row must follow for observers to agree.
async fn apply_events(runtime: &Runtime, events: Vec<FailureEvent>) {
    for event in events {
        let now = runtime.clock.now();
        let reason = event.cause.to_string();
        let result = match event.decision {
            RetryDecision::Requeue { priority, .. } => runtime
                .store
                .requeue_job(event.job_id, &event.agent_id, &reason, priority, now)
                .await
                .map(|_| ()),
            RetryDecision::Terminal => runtime
                .store
                .fail_job(event.job_id, &event.agent_id, &reason, now)
                .await
                .map(|_| ()),
        };
        if let Err(e) = result {
            error!(
                "failed to persist watchdog decision for job {}: {}",
                event.job_id, e
            );
        }
    }
}
