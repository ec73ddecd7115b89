// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//
// Environment-backed configuration for the two long-running binaries.
// Unknown variables are simply ignored.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use rand::RngCore;
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::warn;

use crate::agent::DEFAULT_MEMORY_LIMIT_BYTES;
use crate::models::{Capability, ComputeFramework};

const DEFAULT_RPC_URL: &str = "https://api.devnet.solana.com";

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw.parse().unwrap_or(default),
        Err(_) => default,
    }
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub bind_addr: SocketAddr,
    pub admin_api_key: String,
    pub rpc_url: String,
    pub wallet_path: PathBuf,
    pub heartbeat_timeout_s: i64,
    pub maintenance_interval_s: u64,
}

impl BrokerConfig {
    pub fn from_env() -> Self {
        let bind_addr = env_or("BROKER_BIND", "127.0.0.1:8000")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([127, 0, 0, 1], 8000)));
        let admin_api_key = match env::var("ADMIN_API_KEY") {
            Ok(key) if !key.trim().is_empty() => key,
            _ => {
                let mut bytes = [0u8; 32];
                rand::rngs::OsRng.fill_bytes(&mut bytes);
                let key = URL_SAFE_NO_PAD.encode(bytes);
                warn!("ADMIN_API_KEY not set; using ephemeral key {}", key);
                key
            }
        };
        Self {
            bind_addr,
            admin_api_key,
            rpc_url: env_or("RPC_URL", DEFAULT_RPC_URL),
            wallet_path: PathBuf::from(env_or("WALLET_PATH", "./marketplace_wallet.json")),
            heartbeat_timeout_s: env_parse("HEARTBEAT_TIMEOUT_S", 60),
            maintenance_interval_s: env_parse("MAINTENANCE_INTERVAL_S", 30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub marketplace_url: String,
    pub api_key: Option<String>,
    pub wallet_path: PathBuf,
    pub rpc_url: String,
    pub workdir: PathBuf,
    pub capability: Capability,
    pub memory_limit_bytes: u64,
}

impl AgentConfig {
    pub fn from_env() -> Self {
        let capability = Capability {
            gpu_model: env_or("GPU_MODEL", "cpu-only"),
            gpu_vendor: env::var("GPU_VENDOR").ok().filter(|v| !v.is_empty()),
            compute_framework: env_parse("COMPUTE_FRAMEWORK", ComputeFramework::None),
            gpu_memory: env_parse("GPU_MEMORY", 0u64),
            max_concurrent_jobs: env_parse("MAX_CONCURRENT_JOBS", 1u32),
        };
        Self {
            marketplace_url: env_or("MARKETPLACE_URL", "http://127.0.0.1:8000"),
            api_key: env::var("API_KEY").ok().filter(|k| !k.is_empty()),
            wallet_path: PathBuf::from(env_or("WALLET_PATH", "./wallet.json")),
            rpc_url: env_or("RPC_URL", DEFAULT_RPC_URL),
            workdir: PathBuf::from(env_or("AGENT_WORKDIR", "./workdir")),
            capability,
            memory_limit_bytes: env_parse("JOB_MEMORY_LIMIT_BYTES", DEFAULT_MEMORY_LIMIT_BYTES),
        }
    }
}
