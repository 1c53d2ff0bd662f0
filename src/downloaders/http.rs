//! HTTP client with stall detection and progress tracking

use anyhow::{Context, Result};
use futures::StreamExt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tracing::{debug, warn};

use super::ProgressCallback;

/// Stall detection: timeout if no progress for this duration.
const STALL_TIMEOUT: Duration = Duration::from_secs(120);

/// Progress check interval
const PROGRESS_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// How often to invoke the progress callback (in milliseconds)
const CALLBACK_INTERVAL_MS: u128 = 250;

/// Connection timeout: time to establish TCP connection
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Read timeout: maximum time to wait for data between chunks
const READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Overall request timeout. Dolphin builds are tens of MB, so this is
/// generous and stall detection catches dead links.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Failures that another attempt can't fix
#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("HTTP {status} - {body}")]
    Status { status: u16, body: String },

    #[error("Size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },
}

/// Whether `err` is worth another attempt
///
/// Connection and stream errors are; a rejected request or a truncated
/// body with a known length is not.
pub fn is_retryable(err: &anyhow::Error) -> bool {
    err.downcast_ref::<DownloadError>().is_none()
}

/// Shared HTTP client
#[derive(Clone)]
pub struct HttpClient {
    client: reqwest::Client,
}

impl HttpClient {
    pub fn new(user_agent: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .connect_timeout(CONNECT_TIMEOUT)
            .read_timeout(READ_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self { client })
    }

    /// Get the underlying reqwest client
    pub fn inner(&self) -> &reqwest::Client {
        &self.client
    }
}

/// Shared progress state for stall detection
struct DownloadProgress {
    bytes_downloaded: AtomicU64,
    last_progress_time: std::sync::Mutex<Instant>,
}

impl DownloadProgress {
    fn new() -> Self {
        Self {
            bytes_downloaded: AtomicU64::new(0),
            last_progress_time: std::sync::Mutex::new(Instant::now()),
        }
    }

    fn add_bytes(&self, count: u64) {
        self.bytes_downloaded.fetch_add(count, Ordering::Relaxed);
        if let Ok(mut last) = self.last_progress_time.lock() {
            *last = Instant::now();
        }
    }

    fn total_bytes(&self) -> u64 {
        self.bytes_downloaded.load(Ordering::Relaxed)
    }

    fn time_since_progress(&self) -> Duration {
        self.last_progress_time
            .lock()
            .map(|t| t.elapsed())
            .unwrap_or_default()
    }
}

/// Download `url` into `output_path`, replacing any existing file
///
/// The callback receives (downloaded_bytes, total_bytes); total is 0 when
/// the server sends no content length.
pub async fn download_file(
    client: &HttpClient,
    url: &str,
    output_path: &Path,
    progress_callback: Option<&ProgressCallback>,
) -> Result<u64> {
    if let Some(parent) = output_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let response = client
        .inner()
        .get(url)
        .send()
        .await
        .with_context(|| format!("Connection failed: {}", truncate_url(url)))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(DownloadError::Status {
            status: status.as_u16(),
            body: truncate_error(&body),
        }
        .into());
    }

    let total_size = response.content_length().unwrap_or(0);

    let mut file = File::create(output_path)
        .await
        .with_context(|| format!("Failed to create {}", output_path.display()))?;

    let progress = Arc::new(DownloadProgress::new());
    let progress_clone = progress.clone();
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    let stall_detector = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(PROGRESS_CHECK_INTERVAL) => {
                    let stall_time = progress_clone.time_since_progress();
                    if stall_time >= STALL_TIMEOUT {
                        warn!("Download stalled - no progress for {:?}", stall_time);
                        return Err(anyhow::anyhow!(
                            "Stalled: no data for {}s",
                            STALL_TIMEOUT.as_secs()
                        ));
                    }
                    debug!("Downloaded: {} / {} bytes", progress_clone.total_bytes(), total_size);
                }
                _ = shutdown_rx.changed() => {
                    return Ok(());
                }
            }
        }
    });

    let mut last_callback_time = Instant::now();
    let mut stream = response.bytes_stream();
    let download_result: Result<u64> = async {
        while let Some(chunk_result) = stream.next().await {
            let chunk = chunk_result.context("Failed to read chunk")?;
            file.write_all(&chunk)
                .await
                .context("Failed to write chunk")?;
            progress.add_bytes(chunk.len() as u64);

            if let Some(callback) = progress_callback {
                let now = Instant::now();
                if now.duration_since(last_callback_time).as_millis() >= CALLBACK_INTERVAL_MS {
                    callback(progress.total_bytes(), total_size);
                    last_callback_time = now;
                }
            }
        }

        if let Some(callback) = progress_callback {
            callback(progress.total_bytes(), total_size);
        }

        file.flush().await.context("Failed to flush file")?;
        Ok(progress.total_bytes())
    }
    .await;

    let _ = shutdown_tx.send(true);
    let total_bytes = match stall_detector.await {
        Ok(Ok(())) => download_result?,
        Ok(Err(e)) => return Err(e),
        Err(e) => {
            warn!("Stall detector task failed: {}", e);
            download_result?
        }
    };

    if total_size > 0 && total_bytes != total_size {
        return Err(DownloadError::SizeMismatch {
            expected: total_size,
            actual: total_bytes,
        }
        .into());
    }

    Ok(total_bytes)
}

/// Truncate URL for error messages
fn truncate_url(url: &str) -> String {
    if url.chars().count() > 80 {
        format!("{}...", url.chars().take(77).collect::<String>())
    } else {
        url.to_string()
    }
}

/// Truncate error body for display
fn truncate_error(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.chars().count() > 100 {
        format!("{}...", trimmed.chars().take(97).collect::<String>())
    } else if trimmed.is_empty() {
        "No details".to_string()
    } else {
        trimmed.to_string()
    }
}
