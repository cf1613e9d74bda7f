//! Recursive category crawl.
//!
//! Children are walked sequentially; the page semaphore is held only around
//! the fetch, so a deep recursion never starves its own descendants.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use futures::future::{BoxFuture, FutureExt};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use super::export::{export_tree_leaves, LeafUrlWriter};
use super::extract::{CategoryExtractor, ExtractOutcome};
use super::CategoryNode;
use crate::checkpoint::{CheckpointScope, CheckpointStore, CheckpointUnit};
use crate::error::{CrawlError, Result};
use crate::fetch::{FetchMode, PageFetcher};
use crate::storage::{clean_name, write_atomic, StorageLayout};

pub const DEFAULT_MAX_DEPTH: usize = 10;
pub const DEFAULT_SLEEP_AFTER_SUBCATEGORIES: usize = 15;
pub const DEFAULT_SUBCATEGORY_COOLDOWN: Duration = Duration::from_secs(60);
pub const DEFAULT_BASE_URL: &str = "https://www.njuskalo.hr";

/// Checkpoint key for the list of finished top-level categories.
const CATEGORIES_KEY: &str = "categories";

#[derive(Debug, Clone)]
pub struct WalkerConfig {
    pub max_depth: usize,
    /// Sleep after this many first-level subcategories. 0 disables the pause.
    pub sleep_after_subcategories: usize,
    pub subcategory_cooldown: Duration,
    pub mode: FetchMode,
}

impl Default for WalkerConfig {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
            sleep_after_subcategories: DEFAULT_SLEEP_AFTER_SUBCATEGORIES,
            subcategory_cooldown: DEFAULT_SUBCATEGORY_COOLDOWN,
            mode: FetchMode::ProxyPreferred,
        }
    }
}

/// Collaborators shared by every walker of a run.
#[derive(Clone)]
pub struct WalkerDeps {
    pub fetcher: Arc<dyn PageFetcher>,
    pub extractor: Arc<dyn CategoryExtractor>,
    pub checkpoints: Arc<CheckpointStore>,
    pub layout: StorageLayout,
    pub page_permits: Arc<Semaphore>,
    pub subcategory_counter: Arc<AtomicUsize>,
    pub config: WalkerConfig,
}

/// Walks the tree of one top-level category.
pub struct CategoryTreeWalker {
    deps: WalkerDeps,
    category: String,
    leaf_writer: LeafUrlWriter,
}

impl CategoryTreeWalker {
    pub fn new(deps: WalkerDeps, category: impl Into<String>, date: NaiveDate) -> Result<Self> {
        let category = category.into();
        let leaf_writer = LeafUrlWriter::open(deps.layout.leaf_url_file(&category, date))?;
        Ok(Self {
            deps,
            category,
            leaf_writer,
        })
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    pub fn leaf_writer(&self) -> &LeafUrlWriter {
        &self.leaf_writer
    }

    /// Build the subtree rooted at `url`. `depth` 0 is the category page itself.
    pub async fn build_tree(&self, url: &str, name: &str, depth: usize) -> Result<CategoryNode> {
        self.walk(url, name, depth, &[]).await
    }

    fn walk<'a>(
        &'a self,
        url: &'a str,
        name: &'a str,
        depth: usize,
        parents: &'a [String],
    ) -> BoxFuture<'a, Result<CategoryNode>> {
        async move {
            if depth > self.deps.config.max_depth {
                debug!("Depth limit reached at {} ({})", name, url);
                self.leaf_writer.append(url).await?;
                return Ok(CategoryNode::leaf(name, url));
            }

            debug!("{}Processing: {} (depth={})", "  ".repeat(depth), name, depth);
            let outcome = {
                let _permit = self
                    .deps
                    .page_permits
                    .acquire()
                    .await
                    .map_err(|_| CrawlError::Config("page semaphore closed".to_string()))?;
                self.deps.fetcher.fetch(url, None, self.deps.config.mode).await
            };

            let Some(page) = outcome.into_result()? else {
                warn!("Failed to fetch category {} ({}), abandoning branch", name, url);
                return Ok(CategoryNode::failed(name, url));
            };

            let html_path = self.html_path(parents, name);
            if let Err(e) = write_atomic(&html_path, page.body.as_bytes()) {
                warn!("Could not save HTML for {}: {}", name, e);
            }

            let base = if page.final_url.is_empty() {
                url
            } else {
                page.final_url.as_str()
            };
            match self.deps.extractor.extract(&page.body, base) {
                ExtractOutcome::AntibotDetected => {
                    warn!("Anti-bot page at {} ({}), skipping branch", name, url);
                    Ok(CategoryNode::antibot(name, url))
                }
                ExtractOutcome::NoChildren => {
                    debug!("Leaf: {} ({})", name, url);
                    self.leaf_writer.append(url).await?;
                    Ok(CategoryNode::leaf(name, url))
                }
                ExtractOutcome::Children(links) => {
                    let mut chain = parents.to_vec();
                    chain.push(name.to_string());
                    let parent_key = chain.join("/");

                    let mut children = Vec::with_capacity(links.len());
                    for link in links {
                        if let Some(done) = self
                            .deps
                            .checkpoints
                            .completed_subcategory(&self.category, &parent_key, &link.name)
                            .await?
                        {
                            debug!("Skipping already completed subcategory: {}", link.name);
                            children.push(done);
                            continue;
                        }
                        if depth == 0 {
                            self.count_subcategory().await;
                        }
                        let child = self.walk(&link.url, &link.name, depth + 1, &chain).await?;
                        let unit = CheckpointUnit::Subcategory {
                            parent: &parent_key,
                            node: &child,
                        };
                        self.deps
                            .checkpoints
                            .mark_complete(&self.category, unit)
                            .await?;
                        children.push(child);
                    }
                    Ok(CategoryNode::branch(name, url, children))
                }
            }
        }
        .boxed()
    }

    /// `{html_dir}/{clean(chain)...}/{clean(name)}.html`
    fn html_path(&self, parents: &[String], name: &str) -> PathBuf {
        let mut path = self.deps.layout.html_dir();
        for parent in parents {
            path.push(clean_name(parent));
        }
        path.join(format!("{}.html", clean_name(name)))
    }

    async fn count_subcategory(&self) {
        let every = self.deps.config.sleep_after_subcategories;
        let n = self.deps.subcategory_counter.fetch_add(1, Ordering::AcqRel) + 1;
        if every > 0 && n % every == 0 {
            info!(
                "Sleeping {:?} after {} subcategories",
                self.deps.config.subcategory_cooldown, n
            );
            tokio::time::sleep(self.deps.config.subcategory_cooldown).await;
        }
    }
}

/// Builds the trees of a list of top-level categories.
pub struct TreeBuilder {
    deps: WalkerDeps,
    base_url: String,
    date: NaiveDate,
    category_concurrency: usize,
}

/// Result of [`TreeBuilder::run`].
#[derive(Debug, Default)]
pub struct TreeReport {
    pub trees: BTreeMap<String, CategoryNode>,
    pub reused: Vec<String>,
    pub merged_path: PathBuf,
}

impl TreeBuilder {
    pub fn new(deps: WalkerDeps, date: NaiveDate) -> Self {
        Self {
            deps,
            base_url: DEFAULT_BASE_URL.to_string(),
            date,
            category_concurrency: 1,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_category_concurrency(mut self, n: usize) -> Self {
        self.category_concurrency = n.max(1);
        self
    }

    /// Forget today's progress for `categories`.
    pub async fn reset(&self, categories: &[String]) -> Result<()> {
        let checkpoints = &self.deps.checkpoints;
        checkpoints
            .clear(CheckpointScope::Category, CATEGORIES_KEY)
            .await?;
        for category in categories {
            checkpoints.clear(CheckpointScope::Category, category).await?;
        }
        Ok(())
    }

    /// Walk every category, write per-category and merged tree files.
    pub async fn run(&self, categories: &[String]) -> Result<TreeReport> {
        use futures::stream::{self, StreamExt, TryStreamExt};

        let results: Vec<(String, CategoryNode, bool)> = stream::iter(categories.iter())
            .map(|category| self.build_category(category))
            .buffered(self.category_concurrency)
            .try_collect()
            .await?;

        let mut report = TreeReport {
            merged_path: self.deps.layout.merged_tree_file(self.date),
            ..Default::default()
        };
        for (category, tree, reused) in results {
            if reused {
                report.reused.push(category.clone());
            }
            report.trees.insert(category, tree);
        }

        let merged = serde_json::to_vec_pretty(&report.trees)?;
        write_atomic(&report.merged_path, &merged)
            .map_err(|e| CrawlError::io(&report.merged_path, e))?;
        info!("Merged category tree saved to {}", report.merged_path.display());
        Ok(report)
    }

    async fn build_category(&self, category: &str) -> Result<(String, CategoryNode, bool)> {
        let checkpoints = &self.deps.checkpoints;
        if let Some(tree) = checkpoints
            .completed_subcategory(CATEGORIES_KEY, "", category)
            .await?
        {
            info!("Skipping already completed category: {}", category);
            return Ok((category.to_string(), tree, true));
        }

        let walker = CategoryTreeWalker::new(self.deps.clone(), category, self.date)?;
        let url = format!("{}/{}", self.base_url, category);
        info!("Building category tree for {}", category);
        let tree = walker.build_tree(&url, category, 0).await?;

        // Leaves discovered before an interruption were appended already; this
        // also covers subtrees spliced back from the checkpoint.
        export_tree_leaves(&tree, walker.leaf_writer()).await?;

        let tree_path = self.deps.layout.category_tree_file(category, self.date);
        write_atomic(&tree_path, &serde_json::to_vec_pretty(&tree)?)
            .map_err(|e| CrawlError::io(&tree_path, e))?;
        info!(
            "Tree for {} saved to {} ({} leaf URLs)",
            category,
            tree_path.display(),
            tree.leaf_urls().len()
        );

        checkpoints
            .mark_complete(
                CATEGORIES_KEY,
                CheckpointUnit::Subcategory {
                    parent: "",
                    node: &tree,
                },
            )
            .await?;
        Ok((category.to_string(), tree, false))
    }
}
