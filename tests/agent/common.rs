// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//
// Agent-side test harness: a real broker served over HTTP on an ephemeral
// port, plus a scripted subprocess spawner.

use async_trait::async_trait;
use chrono::Utc;
use gridmarket::agent::{ExecutionOutcome, ExecutorError, PreparedCommand, SubprocessSpawner};
use gridmarket::balancer::{LoadBalancer, LoadBalancerConfig, QueuedJob};
use gridmarket::broker::{router, settlement_channel, Runtime, SettlementWorker};
use gridmarket::clock::SystemClock;
use gridmarket::models::{Job, JobPriority};
use gridmarket::payments::MockPaymentBackend;
use gridmarket::store::{MemoryStore, NewJob, Store};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

pub const ADMIN_KEY: &str = "agent-test-admin-key";

pub struct BrokerHandle {
    pub base_url: String,
    pub runtime: Arc<Runtime>,
    pub payments: Arc<MockPaymentBackend>,
    shutdown: CancellationToken,
}

impl Drop for BrokerHandle {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Serve a full broker (handlers + settlement worker) on 127.0.0.1.
pub async fn spawn_broker() -> BrokerHandle {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let balancer = Arc::new(LoadBalancer::new(LoadBalancerConfig::default()));
    let payments = Arc::new(MockPaymentBackend::new());
    let (settlement_tx, settlement_rx) = settlement_channel();
    let runtime = Arc::new(Runtime {
        store: store.clone(),
        balancer,
        payments: payments.clone(),
        clock: Arc::new(SystemClock),
        settlement_tx,
        admin_api_key: ADMIN_KEY.to_string(),
        payer_wallet: "BrokerPayerWallet11111111111111111111111111".to_string(),
    });

    let shutdown = CancellationToken::new();
    let worker = SettlementWorker::new(store, payments.clone());
    tokio::spawn(worker.run(settlement_rx, shutdown.child_token()));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = router(runtime.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    BrokerHandle {
        base_url: format!("http://{addr}"),
        runtime,
        payments,
        shutdown,
    }
}

/// Create a job directly through the runtime and put it on the queue.
pub async fn seed_job(broker: &BrokerHandle, command: Vec<&str>, timeout_s: u64, reward: u64) -> Job {
    let job = broker
        .runtime
        .store
        .create_job(
            NewJob {
                job_type: "test".to_string(),
                image_ref: "python:3.11-slim".to_string(),
                command: command.into_iter().map(String::from).collect(),
                env: Default::default(),
                input_url: None,
                output_url: None,
                gpu_memory_required: 0,
                requires_gpu: false,
                estimated_duration_s: 5,
                timeout_s,
                reward_lamports: reward,
                priority: JobPriority::Normal,
                max_retries: 3,
            },
            Utc::now(),
        )
        .await
        .unwrap();
    broker.runtime.balancer.enqueue(QueuedJob::from(&job)).await;
    job
}

/// Wait until `predicate` holds for the job row, or panic after `secs`.
pub async fn wait_for_job(
    broker: &BrokerHandle,
    job_id: uuid::Uuid,
    secs: u64,
    predicate: impl Fn(&Job) -> bool,
) -> Job {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(secs);
    loop {
        let job = broker.runtime.store.get_job(job_id).await.unwrap();
        if predicate(&job) {
            return job;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("job {} never reached the expected state: {:?}", job_id, job.status);
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

/// Spawner returning pre-scripted outcomes instead of running anything.
pub struct ScriptedSpawner {
    outcomes: Mutex<VecDeque<ExecutionOutcome>>,
    pub seen: Mutex<Vec<PreparedCommand>>,
}

impl ScriptedSpawner {
    pub fn new(outcomes: Vec<ExecutionOutcome>) -> Self {
        Self {
            outcomes: Mutex::new(outcomes.into()),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn success() -> ExecutionOutcome {
        ExecutionOutcome {
            exit_code: 0,
            timed_out: false,
            stdout_tail: "ok".to_string(),
            stderr_tail: String::new(),
            duration: Duration::from_millis(10),
        }
    }

    pub fn failure(exit_code: i32, stderr: &str) -> ExecutionOutcome {
        ExecutionOutcome {
            exit_code,
            timed_out: false,
            stdout_tail: String::new(),
            stderr_tail: stderr.to_string(),
            duration: Duration::from_millis(10),
        }
    }

    pub fn timeout() -> ExecutionOutcome {
        ExecutionOutcome {
            exit_code: -1,
            timed_out: true,
            stdout_tail: String::new(),
            stderr_tail: String::new(),
            duration: Duration::from_secs(1),
        }
    }
}

#[async_trait]
impl SubprocessSpawner for ScriptedSpawner {
    async fn spawn_and_wait(
        &self,
        spec: PreparedCommand,
    ) -> Result<ExecutionOutcome, ExecutorError> {
        self.seen.lock().await.push(spec);
        Ok(self
            .outcomes
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(Self::success))
    }
}
