//! Phone lookup command.

use console::style;

use super::helpers::print_stage_summary;
use crate::cli::progress::phone_progress;
use crate::config::Settings;
use crate::fetch::FetchMode;
use crate::pipeline::{fetch_phones, CrawlContext, StageEvents, StageOptions};

pub async fn cmd_phones(settings: Settings, rescrape_nulls: bool) -> anyhow::Result<()> {
    // The phone API never goes through proxies.
    let ctx = CrawlContext::build(settings, Some(FetchMode::LocalOnly)).await?;
    println!(
        "{} Looking up phone numbers for ads in {}",
        style("→").cyan(),
        ctx.layout.detail_dir().display()
    );

    let options = StageOptions {
        rescrape_nulls,
        ..StageOptions::default()
    };
    let (tx, handler) = phone_progress();
    let events = StageEvents {
        leaves: None,
        phones: Some(tx),
    };
    let started = std::time::Instant::now();
    let result = fetch_phones(&ctx, &options, &events).await;
    drop(events);
    let _ = handler.await;

    let mut summary = result?;
    summary.elapsed = started.elapsed();
    print_stage_summary(&summary);
    Ok(())
}
