// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
use gridmarket::agent::{NativeExecutor, NativeSpawner, DEFAULT_MEMORY_LIMIT_BYTES};
use gridmarket::models::JobSpec;
use std::collections::HashMap;
use std::sync::Arc;
use tempfile::tempdir;
use uuid::Uuid;

use super::common::ScriptedSpawner;

fn job(command: Vec<&str>) -> JobSpec {
    JobSpec {
        job_id: Uuid::new_v4(),
        job_type: "test".to_string(),
        image_ref: String::new(),
        command: command.into_iter().map(String::from).collect(),
        env: HashMap::new(),
        gpu_memory_required: 0,
        requires_gpu: false,
        estimated_duration_s: 5,
        timeout_s: 30,
        reward_lamports: 0,
        input_url: None,
        output_url: None,
    }
}

#[cfg(unix)]
#[tokio::test]
async fn container_style_output_paths_land_in_the_job_directory() {
    let dir = tempdir().unwrap();
    let executor = NativeExecutor::new(
        dir.path().to_path_buf(),
        Arc::new(NativeSpawner),
        DEFAULT_MEMORY_LIMIT_BYTES,
    );

    // Authored against a container layout; must write to the scratch dir.
    let spec = job(vec!["sh", "-c", "echo rewritten > /output/result.txt"]);
    let outcome = executor.run(&spec).await.unwrap();
    assert!(outcome.succeeded(), "stderr: {}", outcome.stderr_tail);

    let result = std::fs::read_to_string(executor.output_dir(spec.job_id).join("result.txt"))
        .unwrap();
    assert_eq!(result.trim(), "rewritten");
}

#[cfg(unix)]
#[tokio::test]
async fn jobs_see_their_injected_environment() {
    let dir = tempdir().unwrap();
    let executor = NativeExecutor::new(
        dir.path().to_path_buf(),
        Arc::new(NativeSpawner),
        DEFAULT_MEMORY_LIMIT_BYTES,
    );

    let mut spec = job(vec![
        "sh",
        "-c",
        "echo \"$JOB_ID:$CUSTOM_FLAG\" > \"$OUTPUT_DIR/env.txt\"",
    ]);
    spec.env
        .insert("CUSTOM_FLAG".to_string(), "enabled".to_string());

    let outcome = executor.run(&spec).await.unwrap();
    assert!(outcome.succeeded());
    let written =
        std::fs::read_to_string(executor.output_dir(spec.job_id).join("env.txt")).unwrap();
    assert_eq!(written.trim(), format!("{}:enabled", spec.job_id));
}

#[tokio::test]
async fn the_spawner_seam_carries_the_prepared_command() {
    let dir = tempdir().unwrap();
    let spawner = Arc::new(ScriptedSpawner::new(vec![ScriptedSpawner::failure(
        2, "scripted",
    )]));
    let executor = NativeExecutor::new(
        dir.path().to_path_buf(),
        spawner.clone(),
        DEFAULT_MEMORY_LIMIT_BYTES,
    );

    let spec = job(vec!["python", "-c", "print('never runs')"]);
    let outcome = executor.run(&spec).await.unwrap();
    assert_eq!(outcome.exit_code, 2);
    assert_eq!(outcome.stderr_tail, "scripted");

    let seen = spawner.seen.lock().await;
    assert_eq!(seen.len(), 1);
    // python is normalized and the scratch layout is present.
    assert_eq!(seen[0].program, "python3");
    assert_eq!(seen[0].timeout.as_secs(), 30);
    assert!(seen[0].env.contains_key("INPUT_DIR"));
    assert!(seen[0].cwd.ends_with(spec.job_id.to_string()));
}

#[tokio::test]
async fn empty_commands_are_rejected_before_spawning() {
    let dir = tempdir().unwrap();
    let executor = NativeExecutor::new(
        dir.path().to_path_buf(),
        Arc::new(ScriptedSpawner::new(Vec::new())),
        DEFAULT_MEMORY_LIMIT_BYTES,
    );
    let spec = job(Vec::new());
    assert!(executor.run(&spec).await.is_err());
}
