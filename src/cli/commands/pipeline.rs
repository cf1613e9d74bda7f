//! Parse and full pipeline commands.

use console::style;

use super::helpers::{print_run_summary, print_stage_summary};
use crate::cli::progress::{leaf_progress, phone_progress};
use crate::config::Settings;
use crate::fetch::FetchMode;
use crate::pipeline::{
    parse_details, run_pipeline, CrawlContext, PipelineOptions, StageEvents, StageOptions,
};

pub async fn cmd_parse(settings: Settings, force: bool) -> anyhow::Result<()> {
    let ctx = CrawlContext::build(settings, Some(FetchMode::LocalOnly)).await?;
    let options = StageOptions {
        force,
        ..StageOptions::default()
    };
    let started = std::time::Instant::now();
    let mut summary = parse_details(&ctx, &options).await?;
    summary.elapsed = started.elapsed();
    print_stage_summary(&summary);
    Ok(())
}

pub async fn cmd_run(
    settings: Settings,
    options: PipelineOptions,
    mode: Option<FetchMode>,
) -> anyhow::Result<()> {
    let ctx = CrawlContext::build(settings, mode).await?;
    match options.step {
        Some(stage) => println!("{} Running stage {} only", style("→").cyan(), stage),
        None => println!(
            "{} Running pipeline in {}",
            style("→").cyan(),
            ctx.layout.data_dir.display()
        ),
    }

    let (leaf_tx, leaf_handler) = leaf_progress();
    let (phone_tx, phone_handler) = phone_progress();
    let events = StageEvents {
        leaves: Some(leaf_tx),
        phones: Some(phone_tx),
    };
    let result = run_pipeline(&ctx, &options, &events).await;
    drop(events);
    let _ = leaf_handler.await;
    let _ = phone_handler.await;

    let summary = result?;
    print_run_summary(&summary);

    if let Some(failed) = summary.failed_stage() {
        println!(
            "  {} Fix the issue and rerun to resume from stage {}",
            style("→").dim(),
            failed.stage
        );
        anyhow::bail!("pipeline stopped at stage {}", failed.stage);
    }
    println!("{} Pipeline completed", style("✓").green());
    Ok(())
}
