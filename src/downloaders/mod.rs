//! Archive download
//!
//! [`ArchiveFetcher`] is the seam the updater downloads through; the HTTP
//! implementation retries connection failures before giving up.

mod http;

pub use http::{download_file, is_retryable, DownloadError, HttpClient};

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::future::Future;
use std::path::Path;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

/// Default retry configuration
pub const MAX_RETRIES: u32 = 3;
pub const RETRY_DELAY: Duration = Duration::from_secs(5);

/// Progress callback: (downloaded_bytes, total_bytes)
pub type ProgressCallback = Box<dyn Fn(u64, u64) + Send + Sync>;

/// Wrapper that adds retry logic to any async operation
///
/// Errors that [`is_retryable`] rejects end the loop on the first attempt.
pub async fn with_retry<F, Fut, T>(
    operation_name: &str,
    max_retries: u32,
    delay: Duration,
    mut f: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_retries = max_retries.max(1);
    let mut last_error = None;

    for attempt in 1..=max_retries {
        match f().await {
            Ok(result) => {
                if attempt > 1 {
                    info!("{} succeeded on attempt {}/{}", operation_name, attempt, max_retries);
                }
                return Ok(result);
            }
            Err(e) if !is_retryable(&e) => {
                warn!("{} failed, not retrying: {:#}", operation_name, e);
                return Err(e).with_context(|| format!("{} failed", operation_name));
            }
            Err(e) => {
                warn!(
                    "{} failed (attempt {}/{}): {:#}",
                    operation_name, attempt, max_retries, e
                );
                last_error = Some(e);

                if attempt < max_retries {
                    info!("Retrying in {} seconds...", delay.as_secs());
                    sleep(delay).await;
                }
            }
        }
    }

    let error = last_error.unwrap_or_else(|| anyhow::anyhow!("{} was never attempted", operation_name));
    Err(error).with_context(|| format!("{} failed after {} attempts", operation_name, max_retries))
}

/// Downloads a release archive to a local file
#[async_trait]
pub trait ArchiveFetcher: Send + Sync {
    async fn fetch(
        &self,
        url: &str,
        dest: &Path,
        progress: Option<&ProgressCallback>,
    ) -> Result<u64>;
}

/// Fetches archives over HTTP
pub struct HttpFetcher {
    client: HttpClient,
    max_retries: u32,
    retry_delay: Duration,
}

impl HttpFetcher {
    pub fn new(client: HttpClient, max_retries: u32) -> Self {
        Self {
            client,
            max_retries,
            retry_delay: RETRY_DELAY,
        }
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }
}

#[async_trait]
impl ArchiveFetcher for HttpFetcher {
    async fn fetch(
        &self,
        url: &str,
        dest: &Path,
        progress: Option<&ProgressCallback>,
    ) -> Result<u64> {
        let name = format!("Download of {}", dest.display());
        with_retry(&name, self.max_retries, self.retry_delay, || {
            download_file(&self.client, url, dest, progress)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_with_retry_succeeds_after_failures() {
        let calls = AtomicU32::new(0);
        let result = with_retry("flaky", 3, Duration::ZERO, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    anyhow::bail!("attempt {} failed", n)
                }
                Ok(n)
            }
        })
        .await
        .unwrap();

        assert_eq!(result, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_with_retry_reports_last_error() {
        let result: Result<()> = with_retry("always", 2, Duration::ZERO, || async {
            Err::<(), _>(anyhow::anyhow!("boom"))
        })
        .await;

        let message = format!("{:#}", result.unwrap_err());
        assert!(message.contains("always failed after 2 attempts"));
        assert!(message.contains("boom"));
    }

    #[tokio::test]
    async fn test_with_retry_stops_on_http_status() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retry("missing build", 3, Duration::ZERO, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(DownloadError::Status {
                    status: 404,
                    body: "Not Found".into(),
                }
                .into())
            }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let err = result.unwrap_err();
        assert!(err.downcast_ref::<DownloadError>().is_some());
        assert!(format!("{:#}", err).contains("HTTP 404"));
    }

    #[tokio::test]
    async fn test_http_fetcher_fails_on_refused_connection() {
        let fetcher = HttpFetcher::new(HttpClient::new("dolphin-update-test").unwrap(), 2)
            .with_retry_delay(Duration::ZERO);
        let temp = tempfile::tempdir().unwrap();

        let result = fetcher
            .fetch("http://127.0.0.1:9/a.7z", &temp.path().join("a.7z"), None)
            .await;
        assert!(result.is_err());
    }
}
