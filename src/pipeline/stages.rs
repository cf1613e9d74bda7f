//! Stage bodies. Each returns a [`StageSummary`] or a run-stopping error.

use std::path::PathBuf;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::info;

use super::{CrawlContext, Stage, StageSummary};
use crate::category::{export_from_tree_files, HtmlCategoryExtractor, TreeBuilder, WalkerDeps};
use crate::error::{CrawlError, Result};
use crate::leaf::{EntryDownloader, LeafEvent, LeafRunReport, LeafRunner};
use crate::parser::ParseRunner;
use crate::phones::{BatchAuthFetcher, HttpPhoneApi, PhoneEvent};
use crate::storage::detail_ids;

/// Flags shared by the stage commands.
#[derive(Debug, Clone, Default)]
pub struct StageOptions {
    /// Forget today's checkpoints before starting.
    pub restart: bool,
    /// Re-download or re-parse outputs that already exist.
    pub force: bool,
    pub rescrape_nulls: bool,
    /// Leaf files to harvest; today's per-category files when empty.
    pub leaf_files: Vec<PathBuf>,
}

/// Progress channels for the CLI.
#[derive(Clone, Default)]
pub struct StageEvents {
    pub leaves: Option<mpsc::Sender<LeafEvent>>,
    pub phones: Option<mpsc::Sender<PhoneEvent>>,
}

/// Crawl the category trees and write leaf-URL files.
pub async fn build_trees(ctx: &CrawlContext, options: &StageOptions) -> Result<StageSummary> {
    let settings = &ctx.settings;
    let deps = WalkerDeps {
        fetcher: ctx.selector.clone(),
        extractor: Arc::new(HtmlCategoryExtractor::new(settings.antibot_phrases.clone())),
        checkpoints: ctx.checkpoints.clone(),
        layout: ctx.layout.clone(),
        page_permits: ctx.page_permits.clone(),
        subcategory_counter: Arc::new(AtomicUsize::new(0)),
        config: settings.walker_config(ctx.mode),
    };
    let builder = TreeBuilder::new(deps, ctx.date)
        .with_base_url(settings.base_url.clone())
        .with_category_concurrency(settings.category_concurrency);

    if options.restart {
        builder.reset(&settings.categories).await?;
    }
    let report = builder.run(&settings.categories).await?;

    let leaves: usize = report.trees.values().map(|t| t.leaf_urls().len()).sum();
    let nodes: usize = report.trees.values().map(|t| t.node_count()).sum();
    Ok(StageSummary::completed(Stage::Tree)
        .count("categories", report.trees.len())
        .count("reused", report.reused.len())
        .count("nodes", nodes)
        .count("leaves", leaves))
}

/// Rebuild leaf-URL files from today's saved trees.
pub async fn export_leaves(ctx: &CrawlContext) -> Result<Vec<(PathBuf, usize)>> {
    export_from_tree_files(&ctx.layout, ctx.date).await
}

/// Leaf files the harvest stage works through.
pub fn leaf_files(ctx: &CrawlContext, options: &StageOptions) -> Result<Vec<PathBuf>> {
    if !options.leaf_files.is_empty() {
        return Ok(options.leaf_files.clone());
    }
    let files: Vec<PathBuf> = ctx
        .settings
        .categories
        .iter()
        .map(|c| ctx.layout.leaf_url_file(c, ctx.date))
        .filter(|p| p.exists())
        .collect();
    if files.is_empty() {
        return Err(CrawlError::Config(format!(
            "no leaf URL files for today in {}; run `njus tree` or `njus export-leaves` first",
            ctx.layout.leaf_urls_dir().display()
        )));
    }
    Ok(files)
}

/// Paginate every leaf and download its entries.
pub async fn harvest(
    ctx: &CrawlContext,
    options: &StageOptions,
    events: &StageEvents,
) -> Result<StageSummary> {
    let settings = &ctx.settings;
    let files = leaf_files(ctx, options)?;

    let mut downloader = EntryDownloader::new(ctx.selector.clone(), ctx.layout.clone())
        .with_metrics(ctx.metrics.clone())
        .with_config(settings.entry_config(ctx.mode, options.force));
    if ctx.layout.phones_db().exists() {
        downloader = downloader.with_phones(ctx.phones()?);
    }

    let mut runner = LeafRunner::new(
        ctx.selector.clone(),
        ctx.checkpoints.clone(),
        Arc::new(downloader),
    )
    .with_page_permits(ctx.page_permits.clone())
    .with_paginator_config(settings.paginator_config(ctx.mode));
    if let Some(session) = ctx.session_handle() {
        runner = runner.with_session(session, settings.session_refresh_every);
    }

    let mut total = LeafRunReport::default();
    for file in &files {
        let report = runner
            .run(file, options.restart, events.leaves.clone())
            .await?;
        total.leaves_total += report.leaves_total;
        total.leaves_processed += report.leaves_processed;
        total.leaves_skipped += report.leaves_skipped;
        total.entries.merge(report.entries);
    }
    info!(
        "Harvest done: {} leaves processed, {} entries saved",
        total.leaves_processed, total.entries.saved
    );

    Ok(StageSummary::completed(Stage::Harvest)
        .count("leaf files", files.len())
        .count("leaves", total.leaves_total)
        .count("leaves skipped", total.leaves_skipped)
        .count("saved", total.entries.saved)
        .count("skipped", total.entries.skipped)
        .count("failed", total.entries.failed.len())
        .with_failures(total.entries.failed))
}

/// Look up phone numbers for every saved detail page.
pub async fn fetch_phones(
    ctx: &CrawlContext,
    options: &StageOptions,
    events: &StageEvents,
) -> Result<StageSummary> {
    let session = ctx.session_handle().ok_or_else(|| {
        CrawlError::Config(
            "phone lookups need a session: set auth.command or NJUSKALO_BEARER_TOKEN".to_string(),
        )
    })?;

    let detail_dir = ctx.layout.detail_dir();
    let ids = detail_ids(&detail_dir).map_err(|e| CrawlError::io(&detail_dir, e))?;

    let mut config = ctx.settings.batch_config();
    config.rescrape_nulls |= options.rescrape_nulls;
    // The API goes over the local connection.
    let api = Arc::new(HttpPhoneApi::new(ctx.transport.clone()));
    let repo = ctx.phones()?;
    let fetcher = BatchAuthFetcher::new(api, session, repo.clone())
        .with_config(config)
        .with_metrics(ctx.metrics.clone());

    let report = fetcher.process_all(ids, events.phones.clone()).await?;
    let failures: Vec<(String, String)> = report
        .failed()
        .into_iter()
        .map(|(id, reason)| (id.to_string(), reason.to_string()))
        .chain(report.persist_failures.iter().cloned())
        .collect();

    Ok(StageSummary::completed(Stage::Phones)
        .count("looked up", report.outcomes.len())
        .count("found", report.found())
        .count("failed", failures.len())
        .count("already stored", report.skipped)
        .count("session refreshes", report.refreshes as usize)
        .count("stored", repo.count()? as usize)
        .with_failures(failures))
}

/// Parse saved detail pages into JSON.
pub async fn parse_details(ctx: &CrawlContext, options: &StageOptions) -> Result<StageSummary> {
    let mut runner = ParseRunner::new(ctx.layout.clone())
        .with_workers(ctx.settings.parse_workers)
        .with_force(options.force);
    if ctx.layout.phones_db().exists() {
        runner = runner.with_phones(ctx.phones()?);
    }
    let report = runner.run().await?;

    Ok(StageSummary::completed(Stage::Parse)
        .count("parsed", report.parsed)
        .count("skipped", report.skipped)
        .count("failed", report.failed.len())
        .with_failures(report.failed))
}
