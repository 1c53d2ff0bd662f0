//! Remote catalog client
//!
//! Fetches the vendor download page and hands the markup to a
//! [`PageParser`] to learn the newest build. Every call re-fetches; nothing
//! is cached here.

pub mod page;

pub use page::{DolphinPage, PageParser, ParsedPage};

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::AppConfig;
use crate::downloaders::HttpClient;
use crate::paths::file_name_from_url;

/// Errors from resolving the newest release
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CatalogError {
    /// Connectivity, DNS, timeout or a non-success HTTP status
    #[error("network error: {0}")]
    Network(String),

    /// The page was fetched but its markup no longer has the expected shape
    #[error("unexpected download page format: {0}")]
    Parse(String),
}

/// One published build as advertised on the download page
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRelease {
    pub download_url: String,
    /// Last path segment of `download_url`
    pub file_name: String,
    pub changelog: String,
}

static VERSION_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:^|[-_])(\d+\.\d+(?:-\d+)?)(?:[-_.]|$)").expect("version regex is valid"));

/// Version identity of a build file name
///
/// `dolphin-master-5.0-12345-x64.7z` -> `5.0-12345`. Names without a
/// dotted version token are their own version.
pub fn version_from_file_name(file_name: &str) -> String {
    VERSION_TOKEN
        .captures(file_name)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| file_name.to_string())
}

impl RemoteRelease {
    pub fn new(download_url: impl Into<String>, changelog: impl Into<String>) -> Result<Self, CatalogError> {
        let download_url = download_url.into();
        let file_name = file_name_from_url(&download_url)
            .ok_or_else(|| CatalogError::Parse(format!("download link has no file name: {}", download_url)))?
            .to_string();

        Ok(Self {
            download_url,
            file_name,
            changelog: changelog.into(),
        })
    }

    pub fn version(&self) -> String {
        version_from_file_name(&self.file_name)
    }
}

/// Anything that can tell us about the newest release
#[async_trait]
pub trait ReleaseSource: Send + Sync {
    async fn fetch_release(&self) -> Result<RemoteRelease, CatalogError>;
}

/// Fetches the live download page over HTTP
pub struct CatalogClient {
    http: HttpClient,
    page_url: String,
    parser: Box<dyn PageParser>,
}

impl CatalogClient {
    pub fn new(config: &AppConfig) -> anyhow::Result<Self> {
        Ok(Self::with_parser(
            HttpClient::new(&config.user_agent)?,
            config.page_url.clone(),
            Box::new(DolphinPage),
        ))
    }

    pub fn with_parser(http: HttpClient, page_url: String, parser: Box<dyn PageParser>) -> Self {
        Self {
            http,
            page_url,
            parser,
        }
    }

    async fn fetch_page(&self) -> Result<String, CatalogError> {
        debug!("Fetching download page: {}", self.page_url);

        let response = self
            .http
            .inner()
            .get(&self.page_url)
            .send()
            .await
            .map_err(|e| CatalogError::Network(format!("failed to reach {}: {}", self.page_url, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(CatalogError::Network(format!(
                "{} returned HTTP {}",
                self.page_url,
                status.as_u16()
            )));
        }

        response
            .text()
            .await
            .map_err(|e| CatalogError::Network(format!("failed to read {}: {}", self.page_url, e)))
    }
}

#[async_trait]
impl ReleaseSource for CatalogClient {
    async fn fetch_release(&self) -> Result<RemoteRelease, CatalogError> {
        let html = self.fetch_page().await?;
        let parsed = self.parser.parse(&html, &self.page_url)?;
        let release = RemoteRelease::new(parsed.download_url, parsed.changelog)?;

        info!("Newest version: {} ({})", release.version(), release.file_name);
        Ok(release)
    }
}
