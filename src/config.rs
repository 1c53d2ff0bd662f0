//! Application configuration
//!
//! Defines where state lives, which page is scraped and which extractor
//! binary is used.

use std::path::PathBuf;

use crate::downloaders::MAX_RETRIES;
use crate::paths;

/// Vendor page listing the newest development builds
pub const DEFAULT_PAGE_URL: &str = "https://dolphin-emu.org/download/";

/// Configuration shared by the catalog client, downloader and store
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Directory holding the state database, downloads and logs
    pub data_dir: PathBuf,

    /// Download page to scrape for the newest build
    pub page_url: String,

    /// Explicit 7-Zip binary; searched for when unset
    pub seven_zip: Option<PathBuf>,

    /// User agent sent with every request
    pub user_agent: String,

    /// Download attempts before giving up
    pub max_retries: u32,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: paths::default_data_dir().unwrap_or_else(|| PathBuf::from(".dolphin-update")),
            page_url: DEFAULT_PAGE_URL.to_string(),
            seven_zip: None,
            user_agent: concat!("dolphin-update/", env!("CARGO_PKG_VERSION")).to_string(),
            max_retries: MAX_RETRIES,
        }
    }
}

impl AppConfig {
    /// Get the path to the user state database
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("user.db")
    }

    /// Scratch directory for downloaded archives
    pub fn downloads_dir(&self) -> PathBuf {
        self.data_dir.join("downloads")
    }

    pub fn log_path(&self) -> PathBuf {
        self.data_dir.join("dolphin-update.log")
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.page_url.trim().is_empty() {
            return Err(ConfigError::EmptyPageUrl);
        }

        match reqwest::Url::parse(&self.page_url) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => {}
            _ => return Err(ConfigError::InvalidPageUrl(self.page_url.clone())),
        }

        if let Some(sz) = &self.seven_zip {
            if !sz.is_file() {
                return Err(ConfigError::ExtractorNotFound(sz.clone()));
            }
        }

        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Download page URL is empty")]
    EmptyPageUrl,

    #[error("Download page URL is not an http(s) URL: {0}")]
    InvalidPageUrl(String),

    #[error("7-Zip binary not found: {0}")]
    ExtractorNotFound(PathBuf),
}
