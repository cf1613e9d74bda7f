//! Drives a leaf-URL file: paginate each leaf, then download its entries.
//!
//! Emits [`LeafEvent`]s for progress display and leaves the rendering to the CLI.

use std::path::Path;
use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tracing::{info, warn};

use super::entries::{EntryDownloader, EntryReport};
use super::extract::{EntryExtractor, HtmlEntryExtractor};
use super::paginator::{LeafPaginator, PaginatorConfig};
use crate::category::read_url_lines;
use crate::checkpoint::{CheckpointScope, CheckpointStore, CheckpointUnit};
use crate::error::{CrawlError, Result};
use crate::fetch::PageFetcher;
use crate::session::{SessionHandle, SessionSnapshot};

pub const DEFAULT_SESSION_REFRESH_EVERY: usize = 50;

/// Progress of a leaf run.
#[derive(Debug, Clone)]
pub enum LeafEvent {
    Started { leaf_file: String, total: usize },
    LeafSkipped { leaf_url: String },
    LeafHarvested { leaf_url: String, entries: usize, last_page: u32 },
    LeafCompleted { leaf_url: String, saved: usize, skipped: usize, failed: usize },
    SessionRefreshed { generation: u64 },
}

#[derive(Debug, Clone, Default)]
pub struct LeafRunReport {
    pub leaves_total: usize,
    pub leaves_processed: usize,
    pub leaves_skipped: usize,
    pub entries: EntryReport,
}

pub struct LeafRunner {
    fetcher: Arc<dyn PageFetcher>,
    extractor: Arc<dyn EntryExtractor>,
    checkpoints: Arc<CheckpointStore>,
    page_permits: Arc<Semaphore>,
    paginator_config: PaginatorConfig,
    downloader: Arc<EntryDownloader>,
    session: Option<Arc<SessionHandle>>,
    session_refresh_every: usize,
}

impl LeafRunner {
    pub fn new(
        fetcher: Arc<dyn PageFetcher>,
        checkpoints: Arc<CheckpointStore>,
        downloader: Arc<EntryDownloader>,
    ) -> Self {
        Self {
            fetcher,
            extractor: Arc::new(HtmlEntryExtractor),
            checkpoints,
            page_permits: Arc::new(Semaphore::new(Semaphore::MAX_PERMITS)),
            paginator_config: PaginatorConfig::default(),
            downloader,
            session: None,
            session_refresh_every: DEFAULT_SESSION_REFRESH_EVERY,
        }
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn EntryExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn with_page_permits(mut self, permits: Arc<Semaphore>) -> Self {
        self.page_permits = permits;
        self
    }

    pub fn with_paginator_config(mut self, config: PaginatorConfig) -> Self {
        self.paginator_config = config;
        self
    }

    /// Send the session's cookies with every request and refresh it periodically.
    pub fn with_session(mut self, session: Arc<SessionHandle>, refresh_every: usize) -> Self {
        self.session = Some(session);
        self.session_refresh_every = refresh_every;
        self
    }

    /// Process every leaf of `leaf_file`. `restart` forgets today's progress first.
    pub async fn run(
        &self,
        leaf_file: &Path,
        restart: bool,
        events: Option<mpsc::Sender<LeafEvent>>,
    ) -> Result<LeafRunReport> {
        let key = leaf_file
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .ok_or_else(|| {
                CrawlError::Config(format!("not a leaf file: {}", leaf_file.display()))
            })?;
        if restart {
            self.checkpoints
                .clear(CheckpointScope::Pagination, &key)
                .await?;
        }

        let contents =
            std::fs::read_to_string(leaf_file).map_err(|e| CrawlError::io(leaf_file, e))?;
        let leaves = read_url_lines(&contents);
        let emit = |event: LeafEvent| {
            if let Some(tx) = &events {
                let _ = tx.try_send(event);
            }
        };
        emit(LeafEvent::Started {
            leaf_file: key.clone(),
            total: leaves.len(),
        });
        info!("Processing {} leaves from {}", leaves.len(), leaf_file.display());

        let paginator = LeafPaginator::new(
            self.fetcher.clone(),
            self.extractor.clone(),
            self.checkpoints.clone(),
            key.as_str(),
        )
        .with_page_permits(self.page_permits.clone())
        .with_config(self.paginator_config.clone());

        let mut report = LeafRunReport {
            leaves_total: leaves.len(),
            ..LeafRunReport::default()
        };
        let mut snapshot: Option<SessionSnapshot> = None;

        for leaf_url in &leaves {
            let done = CheckpointUnit::Leaf { leaf_url };
            if self.checkpoints.is_complete(&key, done).await? {
                report.leaves_skipped += 1;
                emit(LeafEvent::LeafSkipped {
                    leaf_url: leaf_url.clone(),
                });
                continue;
            }

            if let Some(handle) = &self.session {
                let due = report.leaves_processed > 0
                    && self.session_refresh_every > 0
                    && report.leaves_processed % self.session_refresh_every == 0;
                if due || snapshot.is_none() {
                    let fresh = if due {
                        handle.force_refresh().await?
                    } else {
                        handle.current().await?
                    };
                    if due {
                        emit(LeafEvent::SessionRefreshed {
                            generation: fresh.generation,
                        });
                    }
                    snapshot = Some(fresh);
                }
            }
            let session = snapshot.as_ref().map(|s| s.session.as_ref());

            let harvest = paginator.harvest(leaf_url, session).await?;
            emit(LeafEvent::LeafHarvested {
                leaf_url: leaf_url.clone(),
                entries: harvest.entries.len(),
                last_page: harvest.last_page,
            });

            let entries = self.downloader.download(&harvest.entries, session).await?;
            if !entries.failed.is_empty() {
                warn!("{} entries of {} failed", entries.failed.len(), leaf_url);
            }
            emit(LeafEvent::LeafCompleted {
                leaf_url: leaf_url.clone(),
                saved: entries.saved,
                skipped: entries.skipped,
                failed: entries.failed.len(),
            });
            report.entries.merge(entries);

            self.checkpoints.mark_complete(&key, done).await?;
            report.leaves_processed += 1;
        }

        info!(
            "Leaf file {}: {} processed, {} already done, {} entries saved",
            key, report.leaves_processed, report.leaves_skipped, report.entries.saved
        );
        Ok(report)
    }
}
