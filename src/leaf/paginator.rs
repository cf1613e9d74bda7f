//! Page-by-page harvest of a leaf listing.
//!
//! The site happily serves page N+1 forever, so pagination stops on
//! content: a canonical redirect back to page 1, an empty page, a repeated
//! page or a short page. Progress is checkpointed after every page.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use super::extract::EntryExtractor;
use crate::checkpoint::{CheckpointStore, PaginationRecord};
use crate::error::{CrawlError, Result};
use crate::fetch::{FetchMode, PageFetcher};
use crate::session::Session;

/// Entries on a full listing page.
pub const DEFAULT_PAGE_SIZE: usize = 25;
pub const DEFAULT_PAGE_DELAY_MIN: Duration = Duration::from_millis(500);
pub const DEFAULT_PAGE_DELAY_MAX: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone)]
pub struct PaginatorConfig {
    pub page_size: usize,
    /// Give up on a leaf after this many consecutive failed pages.
    pub max_failed_pages: Option<u32>,
    pub page_delay_min: Duration,
    pub page_delay_max: Duration,
    pub mode: FetchMode,
}

impl Default for PaginatorConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            max_failed_pages: None,
            page_delay_min: DEFAULT_PAGE_DELAY_MIN,
            page_delay_max: DEFAULT_PAGE_DELAY_MAX,
            mode: FetchMode::ProxyPreferred,
        }
    }
}

/// Why pagination of a leaf ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The checkpoint already had the leaf finished.
    AlreadyFinished,
    CanonicalRedirect,
    EmptyPage,
    RepeatedPrevious,
    RepeatedFirst,
    ShortPage,
    TooManyFailures,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StopReason::AlreadyFinished => "already finished",
            StopReason::CanonicalRedirect => "canonical points back to page 1",
            StopReason::EmptyPage => "empty page",
            StopReason::RepeatedPrevious => "repeat of previous page",
            StopReason::RepeatedFirst => "repeat of page 1",
            StopReason::ShortPage => "short page",
            StopReason::TooManyFailures => "too many failed pages",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct LeafHarvest {
    pub entries: BTreeSet<String>,
    pub last_page: u32,
    pub pages_fetched: u32,
    pub stop: StopReason,
}

/// URL of `page` of a leaf listing.
pub fn page_url(leaf_url: &str, page: u32) -> String {
    if page <= 1 {
        leaf_url.to_string()
    } else if leaf_url.contains('?') {
        format!("{}&page={}", leaf_url, page)
    } else {
        format!("{}?page={}", leaf_url, page)
    }
}

pub struct LeafPaginator {
    fetcher: Arc<dyn PageFetcher>,
    extractor: Arc<dyn EntryExtractor>,
    checkpoints: Arc<CheckpointStore>,
    checkpoint_key: String,
    page_permits: Arc<Semaphore>,
    config: PaginatorConfig,
}

impl LeafPaginator {
    pub fn new(
        fetcher: Arc<dyn PageFetcher>,
        extractor: Arc<dyn EntryExtractor>,
        checkpoints: Arc<CheckpointStore>,
        checkpoint_key: impl Into<String>,
    ) -> Self {
        Self {
            fetcher,
            extractor,
            checkpoints,
            checkpoint_key: checkpoint_key.into(),
            page_permits: Arc::new(Semaphore::new(Semaphore::MAX_PERMITS)),
            config: PaginatorConfig::default(),
        }
    }

    /// Share the run-wide in-flight page limit.
    pub fn with_page_permits(mut self, permits: Arc<Semaphore>) -> Self {
        self.page_permits = permits;
        self
    }

    pub fn with_config(mut self, config: PaginatorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn checkpoint_key(&self) -> &str {
        &self.checkpoint_key
    }

    /// Collect every entry URL of `leaf_url`, resuming from the checkpoint.
    pub async fn harvest(&self, leaf_url: &str, session: Option<&Session>) -> Result<LeafHarvest> {
        let mut record = self
            .checkpoints
            .pagination(&self.checkpoint_key, leaf_url)
            .await?
            .unwrap_or_default();
        if record.finished {
            debug!("Leaf {} already paginated ({} entries)", leaf_url, record.entries.len());
            return Ok(LeafHarvest {
                entries: record.entries,
                last_page: record.last_page,
                pages_fetched: 0,
                stop: StopReason::AlreadyFinished,
            });
        }

        let canonical_leaf = leaf_url.trim_end_matches('/');
        let mut page = record.next_page();
        let mut pages_fetched = 0;
        if page > 1 {
            info!(
                "Resuming {} at page {} (last fetched {})",
                leaf_url, page, record.last_url_fetched
            );
        }

        let stop = loop {
            let url = page_url(leaf_url, page);
            let outcome = {
                let _permit = self
                    .page_permits
                    .acquire()
                    .await
                    .map_err(|_| CrawlError::Config("page semaphore closed".to_string()))?;
                self.fetcher.fetch(&url, session, self.config.mode).await
            };
            pages_fetched += 1;
            record.last_page = page;
            record.last_url_fetched = url.clone();

            let Some(body) = outcome.into_result()? else {
                record.failed_pages += 1;
                warn!(
                    "Failed to fetch page {} of {}, moving on to the next page",
                    page, leaf_url
                );
                if self
                    .config
                    .max_failed_pages
                    .is_some_and(|max| record.failed_pages >= max)
                {
                    break StopReason::TooManyFailures;
                }
                self.save(leaf_url, &record).await?;
                page += 1;
                continue;
            };
            record.failed_pages = 0;

            if let Some(stop) = self.inspect(&body.body, page, canonical_leaf, &mut record) {
                break stop;
            }
            self.save(leaf_url, &record).await?;
            page += 1;
            self.pause().await;
        };

        record.finished = true;
        self.save(leaf_url, &record).await?;
        info!(
            "Leaf {}: {} entries over {} pages ({})",
            leaf_url,
            record.entries.len(),
            record.last_page,
            stop
        );
        Ok(LeafHarvest {
            entries: record.entries,
            last_page: record.last_page,
            pages_fetched,
            stop,
        })
    }

    /// Apply the stop rules to one fetched page, folding its entries into `record`.
    fn inspect(
        &self,
        html: &str,
        page: u32,
        canonical_leaf: &str,
        record: &mut PaginationRecord,
    ) -> Option<StopReason> {
        if page > 1 {
            if let Some(canonical) = self.extractor.canonical(html) {
                if canonical.trim_end_matches('/') == canonical_leaf {
                    return Some(StopReason::CanonicalRedirect);
                }
            }
        }

        let entries = self.extractor.entries(html);
        if entries.is_empty() {
            return Some(StopReason::EmptyPage);
        }
        if !record.previous_page.is_empty() && entries == record.previous_page {
            return Some(StopReason::RepeatedPrevious);
        }
        if page > 1 && !record.first_page.is_empty() && entries == record.first_page {
            return Some(StopReason::RepeatedFirst);
        }

        if page == 1 {
            record.first_page = entries.clone();
        }
        let short = entries.len() < self.config.page_size;
        debug!("Page {}: {} entries", page, entries.len());
        record.entries.extend(entries.iter().cloned());
        record.previous_page = entries;
        short.then_some(StopReason::ShortPage)
    }

    async fn save(&self, leaf_url: &str, record: &PaginationRecord) -> Result<()> {
        self.checkpoints
            .save_pagination(&self.checkpoint_key, leaf_url, record.clone())
            .await?;
        Ok(())
    }

    async fn pause(&self) {
        let min = self.config.page_delay_min.as_millis() as u64;
        let max = (self.config.page_delay_max.as_millis() as u64).max(min);
        let delay = rand::rng().random_range(min..=max);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
    }
}
