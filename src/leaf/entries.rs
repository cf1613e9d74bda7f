//! Concurrent download of ad detail pages.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info, warn};

use crate::error::{CrawlError, Result};
use crate::fetch::{FetchMode, PageFetcher};
use crate::metrics::{MetricsSink, NoopMetrics, RateMeter};
use crate::repository::PhoneRepository;
use crate::session::Session;
use crate::storage::{ad_id_from_url, write_atomic, StorageLayout};

pub const DEFAULT_ENTRY_CONCURRENCY: usize = 6;

#[derive(Debug, Clone)]
pub struct EntryConfig {
    pub concurrency: usize,
    /// Re-download detail pages that already exist on disk.
    pub force: bool,
    pub mode: FetchMode,
}

impl Default for EntryConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_ENTRY_CONCURRENCY,
            force: false,
            mode: FetchMode::ProxyPreferred,
        }
    }
}

/// Per-entry result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryOutcome {
    Saved,
    KnownPhone,
    AlreadyOnDisk,
    /// Already attempted earlier in this run.
    Duplicate,
    NoAdId,
    Failed(String),
}

#[derive(Debug, Clone, Default)]
pub struct EntryReport {
    pub saved: usize,
    pub skipped: usize,
    pub failed: Vec<(String, String)>,
}

impl EntryReport {
    fn record(&mut self, url: &str, outcome: EntryOutcome) {
        match outcome {
            EntryOutcome::Saved => self.saved += 1,
            EntryOutcome::Failed(reason) => self.failed.push((url.to_string(), reason)),
            EntryOutcome::KnownPhone
            | EntryOutcome::AlreadyOnDisk
            | EntryOutcome::Duplicate
            | EntryOutcome::NoAdId => self.skipped += 1,
        }
    }

    pub fn merge(&mut self, other: EntryReport) {
        self.saved += other.saved;
        self.skipped += other.skipped;
        self.failed.extend(other.failed);
    }
}

/// Saves `{detail_dir}/{ad_id}.html` for harvested entries.
///
/// One downloader lives for a whole run so an ad seen under two leaves is
/// fetched once.
pub struct EntryDownloader {
    fetcher: Arc<dyn PageFetcher>,
    layout: StorageLayout,
    phones: Option<PhoneRepository>,
    attempted: Mutex<HashSet<String>>,
    metrics: Arc<dyn MetricsSink>,
    rate: RateMeter,
    config: EntryConfig,
}

impl EntryDownloader {
    pub fn new(fetcher: Arc<dyn PageFetcher>, layout: StorageLayout) -> Self {
        Self {
            fetcher,
            layout,
            phones: None,
            attempted: Mutex::new(HashSet::new()),
            metrics: Arc::new(NoopMetrics),
            rate: RateMeter::default(),
            config: EntryConfig::default(),
        }
    }

    /// Skip ads that already have a phone record.
    pub fn with_phones(mut self, phones: PhoneRepository) -> Self {
        self.phones = Some(phones);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_config(mut self, config: EntryConfig) -> Self {
        self.config = config;
        self
    }

    /// Download every entry, bounded by the per-leaf semaphore.
    ///
    /// A fatal block aborts the remaining downloads and is returned as an error.
    pub async fn download(
        &self,
        entries: &BTreeSet<String>,
        session: Option<&Session>,
    ) -> Result<EntryReport> {
        let permits = Semaphore::new(self.config.concurrency.max(1));
        let total = entries.len();
        let mut report = EntryReport::default();

        let mut pending: FuturesUnordered<_> = entries
            .iter()
            .map(|url| {
                let permits = &permits;
                async move {
                    let _permit = permits
                        .acquire()
                        .await
                        .map_err(|_| CrawlError::Config("entry semaphore closed".to_string()))?;
                    let outcome = self.download_one(url, session).await?;
                    Ok::<_, CrawlError>((url, outcome))
                }
            })
            .collect();

        let mut done = 0;
        while let Some(result) = pending.next().await {
            let (url, outcome) = result?;
            done += 1;
            if outcome == EntryOutcome::Saved {
                let (per_sec, per_min) = self.rate.tick();
                self.metrics.record("entries.per_sec", per_sec);
                self.metrics.record("entries.per_min", per_min);
                debug!(
                    "Saved {} ({}/{}, {:.2} req/s, {:.1} req/min)",
                    url, done, total, per_sec, per_min
                );
            }
            report.record(url, outcome);
        }

        info!(
            "Entries: {} saved, {} skipped, {} failed of {}",
            report.saved,
            report.skipped,
            report.failed.len(),
            total
        );
        Ok(report)
    }

    async fn download_one(&self, url: &str, session: Option<&Session>) -> Result<EntryOutcome> {
        let Some(ad_id) = ad_id_from_url(url) else {
            debug!("No ad id in {}", url);
            return Ok(EntryOutcome::NoAdId);
        };
        if !self.attempted.lock().await.insert(ad_id.clone()) {
            return Ok(EntryOutcome::Duplicate);
        }

        if let Some(phones) = &self.phones {
            let id = ad_id.clone();
            match phones.run_blocking(move |repo| repo.contains(&id)).await {
                Ok(true) => {
                    self.metrics.increment("entries.known_phone", 1);
                    return Ok(EntryOutcome::KnownPhone);
                }
                Ok(false) => {}
                Err(e) => warn!("Phone store lookup failed for {}: {}", ad_id, e),
            }
        }

        let path = self.layout.detail_file(&ad_id);
        if !self.config.force && path.exists() {
            return Ok(EntryOutcome::AlreadyOnDisk);
        }

        self.metrics.increment("entries.requests", 1);
        let Some(page) = self
            .fetcher
            .fetch(url, session, self.config.mode)
            .await
            .into_result()?
        else {
            self.metrics.increment("entries.failed", 1);
            return Ok(EntryOutcome::Failed("fetch failed".to_string()));
        };

        if let Err(e) = write_atomic(&path, page.body.as_bytes()) {
            warn!("Could not save {}: {}", path.display(), e);
            self.metrics.increment("entries.failed", 1);
            return Ok(EntryOutcome::Failed(format!("write failed: {}", e)));
        }
        self.metrics.increment("entries.saved", 1);
        Ok(EntryOutcome::Saved)
    }
}
