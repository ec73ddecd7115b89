// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//
// Admin CLI for the marketplace: job creation, stats, health and payment
// history over the admin REST surface.

use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};

#[derive(Parser, Debug)]
#[command(name = "gridmarket-admin", about = "gridmarket marketplace admin CLI")]
struct Cli {
    /// Marketplace base URL
    #[arg(long, env = "MARKETPLACE_URL", default_value = "http://127.0.0.1:8000")]
    marketplace_url: String,

    /// Admin API key
    #[arg(long, env = "ADMIN_API_KEY", default_value = "")]
    admin_api_key: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a job in the marketplace
    CreateJob(CreateJobArgs),
    /// Create a batch of small test jobs
    CreateTestJobs {
        #[arg(long, default_value_t = 10)]
        count: usize,
        /// Reward per job in lamports
        #[arg(long, default_value_t = 1_000)]
        reward: u64,
    },
    /// Show marketplace statistics
    Stats,
    /// Check marketplace health
    Health,
    /// Show payment history
    Payments,
}

#[derive(Args, Debug)]
struct CreateJobArgs {
    #[arg(long, default_value = "inference")]
    job_type: String,

    #[arg(long, default_value = "python:3.11-slim")]
    image_ref: String,

    /// Command to run (repeat for each argument)
    #[arg(long = "command", required = true)]
    command: Vec<String>,

    /// Reward in lamports
    #[arg(long, default_value_t = 1_000)]
    reward: u64,

    /// Required GPU memory in bytes
    #[arg(long, default_value_t = 0)]
    gpu_memory: u64,

    #[arg(long, default_value_t = false)]
    requires_gpu: bool,

    /// Estimated duration in seconds
    #[arg(long, default_value_t = 60)]
    duration: u64,

    /// Timeout in seconds
    #[arg(long, default_value_t = 300)]
    timeout: u64,

    /// Priority: low, normal, high or urgent
    #[arg(long, default_value = "normal")]
    priority: String,

    #[arg(long)]
    input_url: Option<String>,

    #[arg(long)]
    output_url: Option<String>,
}

struct AdminClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl AdminClient {
    fn new(base_url: String, api_key: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    async fn get(&self, path: &str) -> Result<Value> {
        let response = self
            .http
            .get(format!("{}{}", self.base_url, path))
            .header("X-API-Key", &self.api_key)
            .send()
            .await?;
        Self::parse(response).await
    }

    async fn post(&self, path: &str, body: &Value) -> Result<Value> {
        let response = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .header("X-API-Key", &self.api_key)
            .json(body)
            .send()
            .await?;
        Self::parse(response).await
    }

    async fn parse(response: reqwest::Response) -> Result<Value> {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(anyhow!("marketplace returned {status}: {body}"));
        }
        Ok(serde_json::from_str(&body)?)
    }
}

fn job_body(args: &CreateJobArgs, command: Vec<String>, reward: u64) -> Value {
    json!({
        "job_type": args.job_type,
        "image_ref": args.image_ref,
        "command": command,
        "env": {},
        "gpu_memory_required": args.gpu_memory,
        "requires_gpu": args.requires_gpu,
        "estimated_duration_s": args.duration,
        "timeout_s": args.timeout,
        "reward_lamports": reward,
        "priority": args.priority,
        "input_url": args.input_url,
        "output_url": args.output_url,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();
    if cli.admin_api_key.is_empty() {
        eprintln!("warning: ADMIN_API_KEY not set");
    }
    let client = AdminClient::new(cli.marketplace_url.clone(), cli.admin_api_key.clone());

    match &cli.command {
        Command::CreateJob(args) => {
            let body = job_body(args, args.command.clone(), args.reward);
            let result = client.post("/api/admin/jobs/create", &body).await?;
            println!("job created: {}", result["job_id"].as_str().unwrap_or("?"));
        }
        Command::CreateTestJobs { count, reward } => {
            let test_commands: [Vec<&str>; 3] = [
                vec!["python3", "-c", "import time; time.sleep(5); print('job complete')"],
                vec!["python3", "-c", "print('quick job'); print('done')"],
                vec![
                    "python3",
                    "-c",
                    "for i in range(10): print(f'processing {i}')",
                ],
            ];
            let args = CreateJobArgs {
                job_type: "test".to_string(),
                image_ref: "python:3.11-slim".to_string(),
                command: Vec::new(),
                reward: *reward,
                gpu_memory: 0,
                requires_gpu: false,
                duration: 30,
                timeout: 60,
                priority: "normal".to_string(),
                input_url: None,
                output_url: None,
            };
            let mut created = 0;
            for i in 0..*count {
                let command: Vec<String> = test_commands[i % test_commands.len()]
                    .iter()
                    .map(|s| s.to_string())
                    .collect();
                match client
                    .post("/api/admin/jobs/create", &job_body(&args, command, *reward))
                    .await
                {
                    Ok(result) => {
                        created += 1;
                        println!(
                            "  created job {}/{} ({})",
                            i + 1,
                            count,
                            result["job_id"].as_str().unwrap_or("?")
                        );
                    }
                    Err(e) => eprintln!("  failed to create job {}: {e}", i + 1),
                }
            }
            println!("created {created}/{count} test jobs");
        }
        Command::Stats => {
            let stats = client.get("/api/admin/stats").await?;
            println!("agents:   {}", stats["agents"]);
            println!("jobs:     {}", stats["jobs_by_status"]);
            println!("payments: {}", stats["payments"]);
            println!(
                "balancer: {} queued, {} assigned, {:.1}% utilization",
                stats["load_balancer"]["queued_jobs"],
                stats["load_balancer"]["assigned_jobs"],
                stats["load_balancer"]["utilization"].as_f64().unwrap_or(0.0)
            );
        }
        Command::Health => {
            let health = client.get("/health").await?;
            println!(
                "status: {} (store: {}, payments: {})",
                health["status"].as_str().unwrap_or("?"),
                health["store"].as_str().unwrap_or("?"),
                health["payment_backend"].as_str().unwrap_or("?")
            );
        }
        Command::Payments => {
            let history = client.get("/api/admin/payments").await?;
            let payments = history["payments"].as_array().cloned().unwrap_or_default();
            if payments.is_empty() {
                println!("no payments yet");
            }
            for payment in payments.iter().take(20) {
                println!(
                    "job {}  {} lamports  {}  {}",
                    payment["job_id"].as_str().unwrap_or("?"),
                    payment["amount_lamports"],
                    payment["status"].as_str().unwrap_or("?"),
                    payment["signature"].as_str().unwrap_or("-")
                );
            }
            println!(
                "total: {} payments, {} lamports",
                history["total_count"], history["total_lamports"]
            );
        }
    }
    Ok(())
}
