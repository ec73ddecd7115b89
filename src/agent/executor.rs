// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//
// Native job execution: a sandboxed subprocess in a per-job scratch
// directory. Sandboxing here is best-effort: rlimits plus an isolated
// working directory and its own process group so a timeout can kill the
// whole tree.

use async_trait::async_trait;
use regex::Regex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::time::sleep;
use tracing::{info, warn};
use uuid::Uuid;

use crate::models::JobSpec;

/// Last bytes of each stream kept for failure reports.
pub const OUTPUT_TAIL_BYTES: usize = 4096;
pub const DEFAULT_MEMORY_LIMIT_BYTES: u64 = 8 * 1024 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("job command is empty")]
    EmptyCommand,

    #[error("failed to spawn job process: {0}")]
    Spawn(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Fully resolved command, ready to hand to a spawner.
#[derive(Debug, Clone)]
pub struct PreparedCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub cwd: PathBuf,
    pub timeout: Duration,
    pub memory_limit_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub exit_code: i32,
    pub timed_out: bool,
    pub stdout_tail: String,
    pub stderr_tail: String,
    pub duration: Duration,
}

impl ExecutionOutcome {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }
}

/// Seam between command preparation and actual process control, so tests
/// can script exit codes without spawning anything.
#[async_trait]
pub trait SubprocessSpawner: Send + Sync {
    async fn spawn_and_wait(&self, spec: PreparedCommand) -> Result<ExecutionOutcome, ExecutorError>;
}

#[derive(Debug, Default)]
pub struct NativeSpawner;

#[async_trait]
impl SubprocessSpawner for NativeSpawner {
    async fn spawn_and_wait(
        &self,
        spec: PreparedCommand,
    ) -> Result<ExecutionOutcome, ExecutorError> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(&spec.env)
            .current_dir(&spec.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        unsafe {
            let memory_limit = spec.memory_limit_bytes as libc::rlim_t;
            let cpu_limit = spec.timeout.as_secs() as libc::rlim_t;
            cmd.pre_exec(move || {
                // Own process group, so the timeout path can kill the tree.
                if libc::setpgid(0, 0) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                let mem = libc::rlimit {
                    rlim_cur: memory_limit,
                    rlim_max: memory_limit,
                };
                // Not every platform honors RLIMIT_AS; failure is tolerable.
                libc::setrlimit(libc::RLIMIT_AS, &mem);
                let cpu = libc::rlimit {
                    rlim_cur: cpu_limit,
                    rlim_max: cpu_limit,
                };
                libc::setrlimit(libc::RLIMIT_CPU, &cpu);
                Ok(())
            });
        }

        let start = Instant::now();
        let mut child = cmd
            .spawn()
            .map_err(|e| ExecutorError::Spawn(format!("{}: {e}", spec.program)))?;
        let pid = child.id();

        let stdout_task = child
            .stdout
            .take()
            .map(|stream| tokio::spawn(read_tail(stream)));
        let stderr_task = child
            .stderr
            .take()
            .map(|stream| tokio::spawn(read_tail(stream)));

        let status = tokio::select! {
            status = child.wait() => Some(status?),
            _ = sleep(spec.timeout) => None,
        };

        let (exit_code, timed_out) = match status {
            Some(status) => (status.code().unwrap_or(-1), false),
            None => {
                warn!("job process exceeded {}s, killing", spec.timeout.as_secs());
                #[cfg(unix)]
                if let Some(pid) = pid {
                    unsafe {
                        libc::killpg(pid as i32, libc::SIGKILL);
                    }
                }
                let _ = child.kill().await;
                let _ = child.wait().await;
                (-1, true)
            }
        };

        let stdout_tail = match stdout_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };
        let stderr_tail = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };

        Ok(ExecutionOutcome {
            exit_code,
            timed_out,
            stdout_tail,
            stderr_tail,
            duration: start.elapsed(),
        })
    }
}

async fn read_tail<R: tokio::io::AsyncRead + Unpin>(mut stream: R) -> String {
    let mut tail: Vec<u8> = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                tail.extend_from_slice(&buf[..n]);
                if tail.len() > OUTPUT_TAIL_BYTES {
                    let excess = tail.len() - OUTPUT_TAIL_BYTES;
                    tail.drain(..excess);
                }
            }
        }
    }
    String::from_utf8_lossy(&tail).into_owned()
}

pub struct NativeExecutor {
    work_dir: PathBuf,
    spawner: Arc<dyn SubprocessSpawner>,
    memory_limit_bytes: u64,
}

impl NativeExecutor {
    pub fn new(
        work_dir: PathBuf,
        spawner: Arc<dyn SubprocessSpawner>,
        memory_limit_bytes: u64,
    ) -> Self {
        Self {
            work_dir,
            spawner,
            memory_limit_bytes,
        }
    }

    pub fn job_dir(&self, job_id: Uuid) -> PathBuf {
        self.work_dir.join(job_id.to_string())
    }

    pub fn input_dir(&self, job_id: Uuid) -> PathBuf {
        self.job_dir(job_id).join("input")
    }

    pub fn output_dir(&self, job_id: Uuid) -> PathBuf {
        self.job_dir(job_id).join("output")
    }

    pub async fn run(&self, job: &JobSpec) -> Result<ExecutionOutcome, ExecutorError> {
        let prepared = self.prepare(job)?;
        info!(
            "executing job {} natively: {} {}",
            job.job_id,
            prepared.program,
            prepared.args.join(" ")
        );
        self.spawner.spawn_and_wait(prepared).await
    }

    pub fn prepare(&self, job: &JobSpec) -> Result<PreparedCommand, ExecutorError> {
        if job.command.is_empty() {
            return Err(ExecutorError::EmptyCommand);
        }
        let job_dir = self.job_dir(job.job_id);
        let input_dir = self.input_dir(job.job_id);
        let output_dir = self.output_dir(job.job_id);
        std::fs::create_dir_all(&input_dir)?;
        std::fs::create_dir_all(&output_dir)?;

        let mut command = rewrite_command(&job.command, &input_dir, &output_dir);
        resolve_script_path(&mut command, &input_dir);

        let mut env: HashMap<String, String> = std::env::vars().collect();
        env.extend(job.env.clone());
        env.insert("JOB_ID".to_string(), job.job_id.to_string());
        env.insert(
            "INPUT_DIR".to_string(),
            input_dir.to_string_lossy().into_owned(),
        );
        env.insert(
            "OUTPUT_DIR".to_string(),
            output_dir.to_string_lossy().into_owned(),
        );

        Ok(PreparedCommand {
            program: command[0].clone(),
            args: command[1..].to_vec(),
            env,
            cwd: job_dir,
            timeout: Duration::from_secs(job.timeout_s),
            memory_limit_bytes: self.memory_limit_bytes,
        })
    }
}

const SHELL_INTERPRETERS: [&str; 5] = ["python", "python3", "sh", "bash", "node"];

/// Jobs are often authored against a container layout with `/input` and
/// `/output` mounts. When the command is an interpreter invocation, rewrite
/// those paths to the per-job scratch directories.
pub fn rewrite_command(command: &[String], input_dir: &Path, output_dir: &Path) -> Vec<String> {
    let mut rewritten: Vec<String> = command.to_vec();
    // python is rarely on PATH anymore; python3 always is.
    if rewritten[0] == "python" {
        rewritten[0] = "python3".to_string();
    }
    if !SHELL_INTERPRETERS.contains(&rewritten[0].as_str()) {
        return rewritten;
    }
    let input = input_dir.to_string_lossy();
    let output = output_dir.to_string_lossy();
    for arg in rewritten.iter_mut().skip(1) {
        if arg.contains("/input") || arg.contains("/output") {
            *arg = rewrite_container_paths(arg, &input, &output);
        }
    }
    rewritten
}

fn rewrite_container_paths(arg: &str, input_dir: &str, output_dir: &str) -> String {
    // `/input` or `/output` followed by a separator or the end of the
    // token; longer words like `/inputs` are left alone.
    let re = Regex::new(r#"/(input|output)(/|['"\s]|$)"#).unwrap();
    re.replace_all(arg, |caps: &regex::Captures<'_>| {
        let dir = if &caps[1] == "input" {
            input_dir
        } else {
            output_dir
        };
        format!("{}{}", dir, &caps[2])
    })
    .into_owned()
}

/// Container jobs reference scripts at paths that do not exist here
/// (`/app/run.py`). Look for the script (1) in a test-job directory beside
/// the executable, (2) in the job's input directory, then (3) leave the
/// path as given.
fn resolve_script_path(command: &mut [String], input_dir: &Path) {
    if command.len() < 2 {
        return;
    }
    let candidate = command[1].clone();
    if candidate.starts_with('-') {
        return;
    }
    let looks_like_path = candidate.contains('/')
        || candidate.ends_with(".py")
        || candidate.ends_with(".sh");
    if !looks_like_path || Path::new(&candidate).exists() {
        return;
    }
    let Some(name) = Path::new(&candidate).file_name() else {
        return;
    };

    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            let test_script = dir.join("test_jobs").join(name);
            if test_script.exists() {
                info!("resolved script {} -> {}", candidate, test_script.display());
                command[1] = test_script.to_string_lossy().into_owned();
                return;
            }
        }
    }
    let staged = input_dir.join(name);
    if staged.exists() {
        info!("resolved script {} -> {}", candidate, staged.display());
        command[1] = staged.to_string_lossy().into_owned();
    }
}
