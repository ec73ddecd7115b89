// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
pub mod agent;
pub mod balancer;
pub mod broker;
pub mod clock;
pub mod config;
pub mod models;
pub mod payments;
pub mod store;

// Re-export the main types each layer exposes
pub use agent::{
    AgentRuntime, CompletionReport, MarketplaceClient, NativeExecutor, NativeSpawner,
    SubprocessSpawner,
};
pub use balancer::{
    AgentCapacity, FailureCause, FailureEvent, LbStats, LoadBalancer, LoadBalancerConfig,
    Placement, QueuedJob, RetryDecision,
};
pub use broker::{
    router, run_maintenance, settlement_channel, ApiError, Runtime, SettlementWorker,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{AgentConfig, BrokerConfig};
pub use models::{
    AgentRecord, Capability, ComputeFramework, Job, JobPriority, JobSpec, JobStatus, Payment,
    PaymentState,
};
pub use payments::{
    MockPaymentBackend, PaymentBackend, PaymentError, RpcPaymentBackend, TransferStatus, Wallet,
};
pub use store::{MemoryStore, NewAgent, NewJob, Store, StoreError};
