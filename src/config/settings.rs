//! Resolved runtime settings.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::category::{
    default_antibot_phrases, WalkerConfig, DEFAULT_BASE_URL, DEFAULT_MAX_DEPTH,
    DEFAULT_SLEEP_AFTER_SUBCATEGORIES, DEFAULT_SUBCATEGORY_COOLDOWN,
};
use crate::fetch::{ClassifierConfig, FallbackPolicy, FetchMode};
use crate::leaf::{
    EntryConfig, PaginatorConfig, DEFAULT_ENTRY_CONCURRENCY, DEFAULT_PAGE_DELAY_MAX,
    DEFAULT_PAGE_DELAY_MIN, DEFAULT_PAGE_SIZE, DEFAULT_SESSION_REFRESH_EVERY,
};
use crate::parser::DEFAULT_PARSE_WORKERS;
use crate::phones::{
    BatchConfig, DEFAULT_BATCH_SIZE, DEFAULT_MAX_REFRESHES_PER_BATCH, DEFAULT_PARALLELISM,
};
use crate::proxy::DEFAULT_CHECK_URL;
use crate::storage::StorageLayout;

/// Default cap on concurrent page fetches across the whole run.
pub const DEFAULT_PAGE_CONCURRENCY: usize = 15;
pub const DEFAULT_CATEGORY_CONCURRENCY: usize = 2;
pub const DEFAULT_REQUEST_TIMEOUT: u64 = 30;
pub const DEFAULT_BLOCK_COOLDOWN_SECS: u64 = 60;
pub const DEFAULT_AUTH_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_WEBSHARE_PAGE_SIZE: usize = 100;

/// Application settings.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Base data directory.
    pub data_dir: PathBuf,
    /// Fixed User-Agent. `None` picks a browser one per run.
    pub user_agent: Option<String>,
    /// Request timeout in seconds.
    pub request_timeout: u64,
    pub block_cooldown_secs: u64,

    pub proxy_file: Option<PathBuf>,
    pub webshare_token: Option<String>,
    pub webshare_page_size: usize,
    pub fallback: FallbackPolicy,
    /// Configured routing mode; the selector's default when unset.
    pub mode: Option<FetchMode>,
    pub check_url: String,
    pub classifier: ClassifierConfig,

    pub categories: Vec<String>,
    pub base_url: String,
    pub page_concurrency: usize,
    pub category_concurrency: usize,
    pub max_depth: usize,
    pub sleep_after_subcategories: usize,
    pub subcategory_cooldown_secs: u64,
    pub antibot_phrases: Vec<String>,

    pub entry_concurrency: usize,
    pub page_size: usize,
    pub max_failed_pages: Option<u32>,
    pub page_delay_min_ms: u64,
    pub page_delay_max_ms: u64,
    pub session_refresh_every: usize,

    pub phone_batch_size: usize,
    pub phone_parallelism: usize,
    pub max_refreshes_per_batch: u32,
    pub rescrape_nulls: bool,

    /// Helper program and its arguments.
    pub auth_command: Option<(String, Vec<String>)>,
    pub auth_timeout_secs: u64,
    pub bearer_token: Option<String>,
    pub cookies: BTreeMap<String, String>,

    pub parse_workers: usize,
}

impl Default for Settings {
    fn default() -> Self {
        // Data dir -> Home dir -> Current dir
        let data_dir = dirs::data_dir()
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("njuskalo");

        Self {
            data_dir,
            user_agent: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            block_cooldown_secs: DEFAULT_BLOCK_COOLDOWN_SECS,
            proxy_file: None,
            webshare_token: None,
            webshare_page_size: DEFAULT_WEBSHARE_PAGE_SIZE,
            fallback: FallbackPolicy::default(),
            mode: None,
            check_url: DEFAULT_CHECK_URL.to_string(),
            classifier: ClassifierConfig::default(),
            categories: vec!["prodaja-stanova".to_string()],
            base_url: DEFAULT_BASE_URL.to_string(),
            page_concurrency: DEFAULT_PAGE_CONCURRENCY,
            category_concurrency: DEFAULT_CATEGORY_CONCURRENCY,
            max_depth: DEFAULT_MAX_DEPTH,
            sleep_after_subcategories: DEFAULT_SLEEP_AFTER_SUBCATEGORIES,
            subcategory_cooldown_secs: DEFAULT_SUBCATEGORY_COOLDOWN.as_secs(),
            antibot_phrases: default_antibot_phrases(),
            entry_concurrency: DEFAULT_ENTRY_CONCURRENCY,
            page_size: DEFAULT_PAGE_SIZE,
            max_failed_pages: None,
            page_delay_min_ms: DEFAULT_PAGE_DELAY_MIN.as_millis() as u64,
            page_delay_max_ms: DEFAULT_PAGE_DELAY_MAX.as_millis() as u64,
            session_refresh_every: DEFAULT_SESSION_REFRESH_EVERY,
            phone_batch_size: DEFAULT_BATCH_SIZE,
            phone_parallelism: DEFAULT_PARALLELISM,
            max_refreshes_per_batch: DEFAULT_MAX_REFRESHES_PER_BATCH,
            rescrape_nulls: false,
            auth_command: None,
            auth_timeout_secs: DEFAULT_AUTH_TIMEOUT_SECS,
            bearer_token: None,
            cookies: BTreeMap::new(),
            parse_workers: DEFAULT_PARSE_WORKERS,
        }
    }
}

impl Settings {
    /// Create settings with a custom data directory.
    pub fn with_data_dir(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            ..Default::default()
        }
    }

    pub fn layout(&self) -> StorageLayout {
        StorageLayout::new(&self.data_dir)
    }

    /// Ensure all data directories exist.
    pub fn ensure_directories(&self) -> std::io::Result<()> {
        self.layout().ensure_directories().map_err(|e| {
            std::io::Error::new(
                e.kind(),
                format!(
                    "Failed to create data directory {}: {}",
                    self.data_dir.display(),
                    e
                ),
            )
        })
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }

    pub fn block_cooldown(&self) -> Duration {
        Duration::from_secs(self.block_cooldown_secs)
    }

    pub fn walker_config(&self, mode: FetchMode) -> WalkerConfig {
        WalkerConfig {
            max_depth: self.max_depth,
            sleep_after_subcategories: self.sleep_after_subcategories,
            subcategory_cooldown: Duration::from_secs(self.subcategory_cooldown_secs),
            mode,
        }
    }

    pub fn paginator_config(&self, mode: FetchMode) -> PaginatorConfig {
        // A reversed range would panic in the jitter.
        let min = self.page_delay_min_ms.min(self.page_delay_max_ms);
        PaginatorConfig {
            page_size: self.page_size.max(1),
            max_failed_pages: self.max_failed_pages,
            page_delay_min: Duration::from_millis(min),
            page_delay_max: Duration::from_millis(self.page_delay_max_ms),
            mode,
        }
    }

    pub fn entry_config(&self, mode: FetchMode, force: bool) -> EntryConfig {
        EntryConfig {
            concurrency: self.entry_concurrency.max(1),
            force,
            mode,
        }
    }

    pub fn batch_config(&self) -> BatchConfig {
        BatchConfig {
            batch_size: self.phone_batch_size.max(1),
            parallelism: self.phone_parallelism.max(1),
            max_refreshes_per_batch: self.max_refreshes_per_batch,
            rescrape_nulls: self.rescrape_nulls,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::with_data_dir(PathBuf::from("/tmp/njuskalo"));
        assert_eq!(settings.page_concurrency, 15);
        assert_eq!(settings.entry_concurrency, 6);
        assert_eq!(settings.session_refresh_every, 50);
        assert!(!settings.rescrape_nulls);
        assert_eq!(settings.max_failed_pages, None);
        assert_eq!(
            settings.layout().phones_db(),
            PathBuf::from("/tmp/njuskalo").join("phones.db")
        );
    }

    #[test]
    fn test_paginator_config_orders_delays() {
        let settings = Settings {
            page_delay_min_ms: 900,
            page_delay_max_ms: 100,
            ..Settings::default()
        };
        let config = settings.paginator_config(FetchMode::LocalOnly);
        assert!(config.page_delay_min <= config.page_delay_max);
        assert_eq!(config.mode, FetchMode::LocalOnly);
    }
}
