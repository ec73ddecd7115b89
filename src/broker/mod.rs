// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
pub mod errors;
pub mod maintenance;
pub mod server;
pub mod settlement;
pub mod state;

pub use errors::{ApiError, ErrorResponse};
pub use maintenance::{run_maintenance, run_tick, DEFAULT_MAINTENANCE_INTERVAL};
pub use server::router;
pub use settlement::{settlement_channel, SettlementWorker, SETTLEMENT_CHANNEL_CAPACITY};
pub use state::{Runtime, AVAILABLE_BATCH};
