//! Tree, export-leaves and harvest commands.

use std::path::PathBuf;

use console::style;

use super::helpers::print_stage_summary;
use crate::cli::progress::leaf_progress;
use crate::config::Settings;
use crate::fetch::FetchMode;
use crate::pipeline::{
    build_trees, export_leaves, harvest, CrawlContext, StageEvents, StageOptions,
};

/// Crawl the configured category trees.
pub async fn cmd_tree(
    settings: Settings,
    restart: bool,
    mode: Option<FetchMode>,
) -> anyhow::Result<()> {
    let ctx = CrawlContext::build(settings, mode).await?;
    println!(
        "{} Crawling {} categories ({} mode)",
        style("→").cyan(),
        ctx.settings.categories.len(),
        ctx.mode
    );

    let options = StageOptions {
        restart,
        ..StageOptions::default()
    };
    let started = std::time::Instant::now();
    let mut summary = build_trees(&ctx, &options).await?;
    summary.elapsed = started.elapsed();
    print_stage_summary(&summary);
    Ok(())
}

/// Rewrite today's leaf-URL files from the saved tree JSON.
pub async fn cmd_export_leaves(settings: Settings) -> anyhow::Result<()> {
    let ctx = CrawlContext::build(settings, Some(FetchMode::LocalOnly)).await?;
    let exported = export_leaves(&ctx).await?;

    if exported.is_empty() {
        println!(
            "{} No tree files for today in {}",
            style("!").yellow(),
            ctx.layout.tree_dir().display()
        );
        return Ok(());
    }
    for (path, written) in exported {
        println!(
            "{} {} ({} new URLs)",
            style("✓").green(),
            path.display(),
            written
        );
    }
    Ok(())
}

/// Paginate leaves and save their detail pages.
pub async fn cmd_harvest(
    settings: Settings,
    files: Vec<PathBuf>,
    restart: bool,
    force: bool,
    mode: Option<FetchMode>,
) -> anyhow::Result<()> {
    let ctx = CrawlContext::build(settings, mode).await?;
    let options = StageOptions {
        restart,
        force,
        leaf_files: files,
        ..StageOptions::default()
    };

    let (tx, handler) = leaf_progress();
    let events = StageEvents {
        leaves: Some(tx),
        phones: None,
    };
    let started = std::time::Instant::now();
    let result = harvest(&ctx, &options, &events).await;
    drop(events);
    let _ = handler.await;

    let mut summary = result?;
    summary.elapsed = started.elapsed();
    print_stage_summary(&summary);
    Ok(())
}
