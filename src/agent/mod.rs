// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
pub mod client;
pub mod executor;
pub mod runtime;
pub mod staging;

pub use client::{AcceptedJob, CompletionReport, MarketplaceClient, RegisterCredentials};
pub use executor::{
    ExecutionOutcome, ExecutorError, NativeExecutor, NativeSpawner, PreparedCommand,
    SubprocessSpawner, DEFAULT_MEMORY_LIMIT_BYTES,
};
pub use runtime::{AgentRuntime, AgentStatus, JobHistoryEntry, HEARTBEAT_INTERVAL, POLL_INTERVAL};
