//! CLI commands implementation.
//!
//! This module contains the CLI parser and dispatches to command-specific modules.

mod crawl;
mod helpers;
mod maintenance;
mod phones;
mod pipeline;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use console::style;

use crate::config::{load_settings_with_options, LoadOptions};
use crate::error::CrawlError;
use crate::fetch::FetchMode;
use crate::pipeline::{PipelineOptions, Stage, StageOptions};

/// Exit status after an unrecoverable block.
pub const BLOCKED_EXIT_CODE: i32 = 99;

#[derive(Parser)]
#[command(name = "njus")]
#[command(about = "Resumable category, listing and phone-number harvester for njuskalo.hr")]
#[command(version)]
pub struct Cli {
    /// Data directory (overrides config file and NJUSKALO_DATA_DIR)
    #[arg(long, short = 't', global = true)]
    target: Option<PathBuf>,

    /// Config file path (overrides auto-discovery)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Resolve relative paths from current working directory instead of config file location
    #[arg(long, global = true)]
    cwd: bool,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Check if verbose mode is enabled (for early logging setup).
pub fn is_verbose() -> bool {
    std::env::args().any(|arg| arg == "-v" || arg == "--verbose")
}

#[derive(Subcommand)]
enum Commands {
    /// Crawl category trees and write leaf-URL files
    Tree {
        /// Categories to crawl, e.g. prodaja-stanova (default: from config)
        categories: Vec<String>,
        /// Maximum concurrent page fetches
        #[arg(short = 'n', long)]
        concurrency: Option<usize>,
        /// Forget today's progress and start over
        #[arg(long)]
        restart: bool,
        /// Routing mode (default: from config or proxy policy)
        #[arg(long, value_enum)]
        mode: Option<FetchMode>,
    },

    /// Regenerate leaf-URL files from today's saved trees
    ExportLeaves,

    /// Paginate leaves and download detail pages
    Harvest {
        /// Leaf-URL files (default: today's files for the configured categories)
        files: Vec<PathBuf>,
        /// Concurrent detail downloads per leaf
        #[arg(short = 'n', long)]
        concurrency: Option<usize>,
        /// Forget today's pagination progress
        #[arg(long)]
        restart: bool,
        /// Download detail pages that already exist on disk
        #[arg(long)]
        force: bool,
        /// Routing mode (default: from config or proxy policy)
        #[arg(long, value_enum)]
        mode: Option<FetchMode>,
    },

    /// Fetch phone numbers for downloaded ads
    Phones {
        /// Concurrent API calls per batch
        #[arg(short = 'n', long)]
        concurrency: Option<usize>,
        /// Look up again ads stored without numbers
        #[arg(long)]
        rescrape_nulls: bool,
    },

    /// Parse downloaded detail pages into JSON
    Parse {
        /// Parser workers
        #[arg(short = 'n', long)]
        concurrency: Option<usize>,
        /// Re-parse ads that already have JSON output
        #[arg(long)]
        force: bool,
    },

    /// Run the pipeline, resuming from today's step checkpoint
    Run {
        /// Run this stage only
        #[arg(long, value_enum)]
        step: Option<Stage>,
        /// Skip stages whose output already exists
        #[arg(long)]
        skip_existing: bool,
        /// Forget today's tree and pagination progress
        #[arg(long)]
        restart: bool,
        /// Re-download and re-parse existing outputs
        #[arg(long)]
        force: bool,
        /// Look up again ads stored without numbers
        #[arg(long)]
        rescrape_nulls: bool,
        /// Maximum concurrent page fetches
        #[arg(short = 'n', long)]
        concurrency: Option<usize>,
        /// Routing mode (default: from config or proxy policy)
        #[arg(long, value_enum)]
        mode: Option<FetchMode>,
    },

    /// Test every configured proxy against a sample page
    Proxies {
        /// Page to request through each proxy
        #[arg(long)]
        url: Option<String>,
        /// Proxies tested at once
        #[arg(short = 'n', long, default_value = "5")]
        concurrency: usize,
        /// Write the working proxies to this file
        #[arg(long)]
        save: Option<PathBuf>,
    },

    /// Delete checkpoints left over from previous days
    Purge {
        /// Also delete today's checkpoints
        #[arg(long)]
        all: bool,
    },
}

/// Run the CLI.
pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let options = LoadOptions {
        config_path: cli.config,
        use_cwd: cli.cwd,
        target: cli.target,
    };
    let (mut settings, _config) = load_settings_with_options(options).await;
    let cooldown = settings.block_cooldown();

    let result = match cli.command {
        Commands::Tree {
            categories,
            concurrency,
            restart,
            mode,
        } => {
            if !categories.is_empty() {
                settings.categories = categories;
            }
            if let Some(n) = concurrency {
                settings.page_concurrency = n;
            }
            crawl::cmd_tree(settings, restart, mode).await
        }
        Commands::ExportLeaves => crawl::cmd_export_leaves(settings).await,
        Commands::Harvest {
            files,
            concurrency,
            restart,
            force,
            mode,
        } => {
            if let Some(n) = concurrency {
                settings.entry_concurrency = n;
            }
            crawl::cmd_harvest(settings, files, restart, force, mode).await
        }
        Commands::Phones {
            concurrency,
            rescrape_nulls,
        } => {
            if let Some(n) = concurrency {
                settings.phone_parallelism = n;
            }
            phones::cmd_phones(settings, rescrape_nulls).await
        }
        Commands::Parse { concurrency, force } => {
            if let Some(n) = concurrency {
                settings.parse_workers = n;
            }
            pipeline::cmd_parse(settings, force).await
        }
        Commands::Run {
            step,
            skip_existing,
            restart,
            force,
            rescrape_nulls,
            concurrency,
            mode,
        } => {
            if let Some(n) = concurrency {
                settings.page_concurrency = n;
            }
            let options = PipelineOptions {
                step,
                skip_existing,
                stage: StageOptions {
                    restart,
                    force,
                    rescrape_nulls,
                    leaf_files: Vec::new(),
                },
            };
            pipeline::cmd_run(settings, options, mode).await
        }
        Commands::Proxies {
            url,
            concurrency,
            save,
        } => maintenance::cmd_proxies(&settings, url, concurrency, save).await,
        Commands::Purge { all } => maintenance::cmd_purge(&settings, all),
    };

    if let Err(ref e) = result {
        if e
            .downcast_ref::<CrawlError>()
            .is_some_and(CrawlError::is_fatal_block)
        {
            eprintln!("{} {}", style("✗").red(), e);
            eprintln!(
                "  {} Cooling down for {}s before exiting",
                style("→").dim(),
                cooldown.as_secs()
            );
            tokio::time::sleep(cooldown).await;
            std::process::exit(BLOCKED_EXIT_CODE);
        }
    }
    result
}
