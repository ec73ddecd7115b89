// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//
// Input/output staging over http(s). Staging problems never fail a job:
// execution proceeds without input, and results stay on disk when an
// upload does not work out.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::Cursor;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};
use url::Url;

use crate::models::JobSpec;

const TRANSFER_TIMEOUT: Duration = Duration::from_secs(300);
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

fn staged_url(raw: Option<&String>) -> Option<Url> {
    let raw = raw?.trim();
    if raw.is_empty() {
        return None;
    }
    match Url::parse(raw) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => Some(url),
        Ok(url) => {
            warn!("unsupported url scheme {} for {}", url.scheme(), raw);
            None
        }
        Err(e) => {
            warn!("invalid staging url {}: {}", raw, e);
            None
        }
    }
}

/// Download the job's input into its input directory. Gzipped tarballs are
/// extracted; anything else lands as a single file.
pub async fn stage_input(http: &reqwest::Client, job: &JobSpec, input_dir: &Path) {
    let Some(url) = staged_url(job.input_url.as_ref()) else {
        return;
    };
    info!("downloading input for job {}", job.job_id);

    let payload = match fetch(http, &url).await {
        Ok(payload) => payload,
        Err(e) => {
            warn!(
                "input download for job {} failed: {} - continuing without input",
                job.job_id, e
            );
            return;
        }
    };

    let target = input_dir.to_path_buf();
    let file_name = url
        .path_segments()
        .and_then(|segments| segments.last())
        .filter(|name| !name.is_empty())
        .unwrap_or("input.bin")
        .to_string();
    let result = tokio::task::spawn_blocking(move || unpack_payload(&payload, &target, &file_name))
        .await
        .unwrap_or_else(|e| Err(format!("unpack task failed: {e}")));
    match result {
        Ok(()) => info!("input staged for job {}", job.job_id),
        Err(e) => warn!("could not stage input for job {}: {}", job.job_id, e),
    }
}

async fn fetch(http: &reqwest::Client, url: &Url) -> Result<Vec<u8>, String> {
    let response = http
        .get(url.clone())
        .timeout(TRANSFER_TIMEOUT)
        .send()
        .await
        .map_err(|e| e.to_string())?;
    if !response.status().is_success() {
        return Err(format!("http {}", response.status()));
    }
    response
        .bytes()
        .await
        .map(|b| b.to_vec())
        .map_err(|e| e.to_string())
}

fn unpack_payload(payload: &[u8], input_dir: &Path, file_name: &str) -> Result<(), String> {
    std::fs::create_dir_all(input_dir).map_err(|e| e.to_string())?;
    if payload.starts_with(&GZIP_MAGIC) {
        let decoder = GzDecoder::new(Cursor::new(payload));
        let mut archive = tar::Archive::new(decoder);
        archive.unpack(input_dir).map_err(|e| e.to_string())?;
    } else {
        std::fs::write(input_dir.join(file_name), payload).map_err(|e| e.to_string())?;
    }
    Ok(())
}

/// Tar-gzip the output directory and PUT it to the job's output URL.
/// Returns quietly when there is nothing to upload or no usable URL.
pub async fn upload_output(http: &reqwest::Client, job: &JobSpec, output_dir: &Path) {
    let Some(url) = staged_url(job.output_url.as_ref()) else {
        if job.output_url.is_some() {
            info!(
                "results for job {} remain at {}",
                job.job_id,
                output_dir.display()
            );
        }
        return;
    };

    let dir = output_dir.to_path_buf();
    let archive = match tokio::task::spawn_blocking(move || pack_directory(&dir))
        .await
        .unwrap_or_else(|e| Err(format!("pack task failed: {e}")))
    {
        Ok(Some(archive)) => archive,
        Ok(None) => {
            info!("no output files to upload for job {}", job.job_id);
            return;
        }
        Err(e) => {
            warn!("could not pack output for job {}: {}", job.job_id, e);
            return;
        }
    };

    match http
        .put(url)
        .timeout(TRANSFER_TIMEOUT)
        .body(archive)
        .send()
        .await
    {
        Ok(response) if response.status().is_success() => {
            info!("results uploaded for job {}", job.job_id);
        }
        Ok(response) => warn!(
            "result upload for job {} returned {} - results saved locally at {}",
            job.job_id,
            response.status(),
            output_dir.display()
        ),
        Err(e) => warn!(
            "result upload for job {} failed: {} - results saved locally at {}",
            job.job_id,
            e,
            output_dir.display()
        ),
    }
}

fn pack_directory(output_dir: &Path) -> Result<Option<Vec<u8>>, String> {
    let has_files = std::fs::read_dir(output_dir)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false);
    if !has_files {
        return Ok(None);
    }
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder
        .append_dir_all("output", output_dir)
        .map_err(|e| e.to_string())?;
    let encoder = builder.into_inner().map_err(|e| e.to_string())?;
    encoder.finish().map_err(|e| e.to_string()).map(Some)
}
