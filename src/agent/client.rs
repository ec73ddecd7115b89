// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
use anyhow::{anyhow, Result};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use uuid::Uuid;

use crate::models::{Capability, JobSpec};

// Deadlines per call class: quick status traffic vs. state transitions.
const STATUS_TIMEOUT: Duration = Duration::from_secs(5);
const ACTION_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP client for the broker's agent-facing surface.
pub struct MarketplaceClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterCredentials {
    pub agent_id: String,
    pub api_key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AcceptedJob {
    pub status: String,
    pub reward_lamports: u64,
}

#[derive(Debug, Deserialize)]
struct AvailableResponse {
    jobs: Vec<JobSpec>,
}

#[derive(Debug, Clone, Default)]
pub struct CompletionReport {
    pub execution_time_s: f64,
    pub output_data: Option<serde_json::Value>,
    pub metrics: Option<serde_json::Value>,
}

impl MarketplaceClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: None,
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.header("X-API-Key", key),
            None => builder,
        }
    }

    /// First-run registration; the only call that goes out without a key.
    pub async fn register(
        &self,
        wallet_address: &str,
        capability: &Capability,
    ) -> Result<RegisterCredentials> {
        let body = json!({
            "wallet_address": wallet_address,
            "gpu_model": capability.gpu_model,
            "gpu_vendor": capability.gpu_vendor,
            "compute_framework": capability.compute_framework,
            "gpu_memory": capability.gpu_memory,
            "max_concurrent_jobs": capability.max_concurrent_jobs,
        });
        let response = self
            .http
            .post(self.url("/api/agents/register"))
            .timeout(ACTION_TIMEOUT)
            .json(&body)
            .send()
            .await?;
        Ok(Self::expect_success(response).await?.json().await?)
    }

    pub async fn heartbeat(&self) -> Result<()> {
        let response = self
            .request(self.http.post(self.url("/api/agents/heartbeat")))
            .timeout(STATUS_TIMEOUT)
            .send()
            .await?;
        Self::expect_success(response).await?;
        Ok(())
    }

    pub async fn poll_available(&self, capability: &Capability) -> Result<Vec<JobSpec>> {
        let response = self
            .request(self.http.post(self.url("/api/jobs/available")))
            .timeout(ACTION_TIMEOUT)
            .json(capability)
            .send()
            .await?;
        let parsed: AvailableResponse = Self::expect_success(response).await?.json().await?;
        Ok(parsed.jobs)
    }

    pub async fn accept_job(&self, job_id: Uuid, wallet_address: &str) -> Result<AcceptedJob> {
        let response = self
            .request(
                self.http
                    .post(self.url(&format!("/api/jobs/{job_id}/accept"))),
            )
            .timeout(ACTION_TIMEOUT)
            .json(&json!({ "wallet_address": wallet_address }))
            .send()
            .await?;
        Ok(Self::expect_success(response).await?.json().await?)
    }

    pub async fn report_complete(&self, job_id: Uuid, report: &CompletionReport) -> Result<()> {
        let mut body = json!({ "execution_time_s": report.execution_time_s });
        if let Some(output) = &report.output_data {
            body["output_data"] = output.clone();
        }
        if let Some(metrics) = &report.metrics {
            body["metrics"] = metrics.clone();
        }
        let response = self
            .request(
                self.http
                    .post(self.url(&format!("/api/jobs/{job_id}/complete"))),
            )
            .timeout(ACTION_TIMEOUT)
            .json(&body)
            .send()
            .await?;
        Self::expect_success(response).await?;
        Ok(())
    }

    pub async fn report_failure(
        &self,
        job_id: Uuid,
        error_message: &str,
        error_type: Option<&str>,
    ) -> Result<()> {
        let mut body = json!({ "error_message": error_message });
        if let Some(kind) = error_type {
            body["error_type"] = json!(kind);
        }
        let response = self
            .request(
                self.http
                    .post(self.url(&format!("/api/jobs/{job_id}/fail"))),
            )
            .timeout(ACTION_TIMEOUT)
            .json(&body)
            .send()
            .await?;
        Self::expect_success(response).await?;
        Ok(())
    }

    async fn expect_success(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(anyhow!("marketplace returned {status}: {body}"))
    }
}
