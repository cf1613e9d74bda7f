//! Stage orchestration: tree, harvest, phones, parse.
//!
//! The index of the next stage is kept in `pipeline_checkpoint_{date}.txt`
//! so an interrupted `run` resumes at the stage that stopped it.

mod context;
mod stages;
mod summary;

pub use context::{load_proxies, CrawlContext};
pub use stages::{
    build_trees, export_leaves, fetch_phones, harvest, leaf_files, parse_details, StageEvents,
    StageOptions,
};
pub use summary::{RunSummary, StageStatus, StageSummary};

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Instant;

use tracing::{error, info, warn};

use crate::error::{CrawlError, Result};
use crate::storage::StorageLayout;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, clap::ValueEnum)]
pub enum Stage {
    /// Crawl category trees into leaf-URL files
    Tree,
    /// Paginate leaves and download detail pages
    Harvest,
    /// Look up phone numbers
    Phones,
    /// Parse detail pages into JSON
    Parse,
}

impl Stage {
    pub const ALL: [Stage; 4] = [Stage::Tree, Stage::Harvest, Stage::Phones, Stage::Parse];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn description(self) -> &'static str {
        match self {
            Stage::Tree => "Category tree crawl",
            Stage::Harvest => "Leaf pagination and detail download",
            Stage::Phones => "Phone number lookups",
            Stage::Parse => "Detail page parsing",
        }
    }

    /// Whether this stage's output is already on disk.
    pub fn output_exists(self, layout: &StorageLayout, date: chrono::NaiveDate) -> bool {
        match self {
            Stage::Tree => layout.merged_tree_file(date).exists(),
            Stage::Harvest => dir_has_entries(&layout.detail_dir()),
            Stage::Phones => layout.phones_db().exists(),
            Stage::Parse => dir_has_entries(&layout.json_dir()),
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Tree => write!(f, "tree"),
            Stage::Harvest => write!(f, "harvest"),
            Stage::Phones => write!(f, "phones"),
            Stage::Parse => write!(f, "parse"),
        }
    }
}

fn dir_has_entries(dir: &Path) -> bool {
    std::fs::read_dir(dir)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

/// The day's "next stage" marker.
#[derive(Debug, Clone)]
pub struct StepCheckpoint {
    path: PathBuf,
}

impl StepCheckpoint {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Index of the next stage to run; 0 when missing or unreadable.
    pub fn load(&self) -> usize {
        std::fs::read_to_string(&self.path)
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(0)
    }

    pub fn save(&self, next: usize) -> Result<()> {
        std::fs::write(&self.path, next.to_string()).map_err(|e| CrawlError::io(&self.path, e))
    }

    pub fn clear(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CrawlError::io(&self.path, e)),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PipelineOptions {
    /// Run only this stage; the step checkpoint is left alone.
    pub step: Option<Stage>,
    /// Skip stages whose output already exists.
    pub skip_existing: bool,
    pub stage: StageOptions,
}

/// Run one stage, timing it.
pub async fn run_stage(
    ctx: &CrawlContext,
    stage: Stage,
    options: &StageOptions,
    events: &StageEvents,
) -> Result<StageSummary> {
    let started = Instant::now();
    info!("Starting stage {}: {}", stage, stage.description());
    let mut summary = match stage {
        Stage::Tree => build_trees(ctx, options).await?,
        Stage::Harvest => harvest(ctx, options, events).await?,
        Stage::Phones => fetch_phones(ctx, options, events).await?,
        Stage::Parse => parse_details(ctx, options).await?,
    };
    summary.elapsed = started.elapsed();
    info!("{}", summary);
    Ok(summary)
}

/// Run the pipeline from the step checkpoint (or just `options.step`).
///
/// A failing stage stops the run and is recorded in the summary; the
/// checkpoint keeps pointing at it. A fatal block is returned as an error.
pub async fn run_pipeline(
    ctx: &CrawlContext,
    options: &PipelineOptions,
    events: &StageEvents,
) -> Result<RunSummary> {
    let checkpoint = StepCheckpoint::new(ctx.layout.pipeline_checkpoint(ctx.date));
    let stages: Vec<Stage> = match options.step {
        Some(stage) => vec![stage],
        None => {
            let start = checkpoint.load().min(Stage::ALL.len());
            if start > 0 {
                info!("Resuming pipeline at stage {}", start + 1);
            }
            Stage::ALL[start..].to_vec()
        }
    };

    let mut summary = RunSummary::default();
    for stage in stages {
        if options.skip_existing && stage.output_exists(&ctx.layout, ctx.date) {
            info!("Skipping stage {}: output already exists", stage);
            summary.push(StageSummary::skipped(stage));
        } else {
            let started = Instant::now();
            match run_stage(ctx, stage, &options.stage, events).await {
                Ok(done) => summary.push(done),
                Err(e) if e.is_fatal_block() => return Err(e),
                Err(e) => {
                    error!("Stage {} failed: {}", stage, e);
                    let mut failed = StageSummary::failed(stage, e.to_string());
                    failed.elapsed = started.elapsed();
                    summary.push(failed);
                    return Ok(summary);
                }
            }
        }
        if options.step.is_none() {
            checkpoint.save(stage.index() + 1)?;
        }
    }

    if options.step.is_none() {
        if let Err(e) = checkpoint.clear() {
            warn!("Could not remove step checkpoint: {}", e);
        }
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::fetch::FetchMode;

    async fn context(dir: &Path) -> CrawlContext {
        CrawlContext::build(
            Settings::with_data_dir(dir.to_path_buf()),
            Some(FetchMode::LocalOnly),
        )
        .await
        .unwrap()
    }

    #[test]
    fn test_step_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoint = StepCheckpoint::new(dir.path().join("pipeline_checkpoint.txt"));
        assert_eq!(checkpoint.load(), 0);
        checkpoint.save(2).unwrap();
        assert_eq!(checkpoint.load(), 2);
        std::fs::write(checkpoint.path(), "garbage").unwrap();
        assert_eq!(checkpoint.load(), 0);
        checkpoint.clear().unwrap();
        checkpoint.clear().unwrap();
        assert!(!checkpoint.path().exists());
    }

    #[test]
    fn test_stage_order() {
        assert_eq!(Stage::ALL.map(Stage::index), [0, 1, 2, 3]);
        assert!(Stage::Tree < Stage::Parse);
        assert_eq!(Stage::Phones.to_string(), "phones");
    }

    #[tokio::test]
    async fn test_resume_runs_remaining_stages() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path()).await;
        std::fs::write(ctx.layout.detail_file("42"), "<html><title>Stan</title></html>").unwrap();

        let checkpoint = StepCheckpoint::new(ctx.layout.pipeline_checkpoint(ctx.date));
        checkpoint.save(Stage::Parse.index()).unwrap();

        let summary = run_pipeline(&ctx, &PipelineOptions::default(), &StageEvents::default())
            .await
            .unwrap();
        assert!(summary.is_success());
        assert_eq!(summary.stages.len(), 1);
        assert_eq!(summary.stages[0].stage, Stage::Parse);
        assert_eq!(summary.stages[0].get("parsed"), Some(1));
        assert!(ctx.layout.json_file("42").exists());
        assert!(!checkpoint.path().exists());
    }

    #[tokio::test]
    async fn test_failed_stage_keeps_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path()).await;
        let checkpoint = StepCheckpoint::new(ctx.layout.pipeline_checkpoint(ctx.date));
        checkpoint.save(Stage::Harvest.index()).unwrap();

        // No leaf files exist for today.
        let summary = run_pipeline(&ctx, &PipelineOptions::default(), &StageEvents::default())
            .await
            .unwrap();
        assert!(!summary.is_success());
        assert_eq!(summary.failed_stage().map(|s| s.stage), Some(Stage::Harvest));
        assert_eq!(checkpoint.load(), Stage::Harvest.index());
    }

    #[tokio::test]
    async fn test_skip_existing_and_single_step() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path()).await;
        std::fs::write(ctx.layout.json_file("1"), "{}").unwrap();
        assert!(Stage::Parse.output_exists(&ctx.layout, ctx.date));
        assert!(!Stage::Phones.output_exists(&ctx.layout, ctx.date));

        let options = PipelineOptions {
            step: Some(Stage::Parse),
            skip_existing: true,
            ..PipelineOptions::default()
        };
        let summary = run_pipeline(&ctx, &options, &StageEvents::default())
            .await
            .unwrap();
        assert_eq!(summary.stages[0].status, StageStatus::Skipped);
        assert!(!ctx.layout.pipeline_checkpoint(ctx.date).exists());
    }
}
