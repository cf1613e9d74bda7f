//! Leaf-URL files.
//!
//! One URL per line, appended as leaves are discovered. Lines already in the
//! file are never written twice, so an interrupted walk can be re-run.

use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use chrono::NaiveDate;
use regex::Regex;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::CategoryNode;
use crate::error::{CrawlError, Result};
use crate::storage::{date_stamp, StorageLayout};

static TREE_FILE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(.+)_tree_(\d{4}-\d{2}-\d{2})\.json$").unwrap());

/// Append-only, deduplicated leaf-URL file.
pub struct LeafUrlWriter {
    path: PathBuf,
    seen: Mutex<HashSet<String>>,
}

impl LeafUrlWriter {
    /// Open `path`, loading the URLs it already contains.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let seen = match std::fs::read_to_string(&path) {
            Ok(contents) => read_url_lines(&contents).into_iter().collect(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashSet::new(),
            Err(e) => return Err(CrawlError::io(&path, e)),
        };
        Ok(Self {
            path,
            seen: Mutex::new(seen),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append `url` unless already present. Returns whether it was written.
    pub async fn append(&self, url: &str) -> Result<bool> {
        let url = url.trim();
        if url.is_empty() {
            return Ok(false);
        }
        let mut seen = self.seen.lock().await;
        if seen.contains(url) {
            return Ok(false);
        }
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| CrawlError::io(parent, e))?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| CrawlError::io(&self.path, e))?;
        writeln!(file, "{}", url).map_err(|e| CrawlError::io(&self.path, e))?;
        seen.insert(url.to_string());
        Ok(true)
    }

    pub async fn len(&self) -> usize {
        self.seen.lock().await.len()
    }
}

/// Non-empty, trimmed lines of a leaf-URL file.
pub fn read_url_lines(contents: &str) -> Vec<String> {
    contents
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_string)
        .collect()
}

/// Write every exportable leaf of `tree` to `writer`. Returns how many were new.
pub async fn export_tree_leaves(tree: &CategoryNode, writer: &LeafUrlWriter) -> Result<usize> {
    let mut written = 0;
    for url in tree.leaf_urls() {
        if writer.append(&url).await? {
            written += 1;
        }
    }
    Ok(written)
}

/// Regenerate leaf-URL files from the per-category tree files of `date`.
///
/// Returns `(leaf file, newly written URLs)` per category.
pub async fn export_from_tree_files(
    layout: &StorageLayout,
    date: NaiveDate,
) -> Result<Vec<(PathBuf, usize)>> {
    let tree_dir = layout.tree_dir();
    let stamp = date_stamp(date);
    let mut names: Vec<String> = match std::fs::read_dir(&tree_dir) {
        Ok(entries) => entries
            .flatten()
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        Err(e) => return Err(CrawlError::io(&tree_dir, e)),
    };
    names.sort();

    let mut results = Vec::new();
    for name in names {
        let Some(caps) = TREE_FILE_RE.captures(&name) else {
            continue;
        };
        if caps[2] != stamp || name.starts_with("category_tree_") {
            continue;
        }
        let category = caps[1].to_string();
        let tree_path = tree_dir.join(&name);
        let contents =
            std::fs::read_to_string(&tree_path).map_err(|e| CrawlError::io(&tree_path, e))?;
        let tree: CategoryNode = match serde_json::from_str(&contents) {
            Ok(tree) => tree,
            Err(e) => {
                warn!("Skipping unreadable tree file {}: {}", tree_path.display(), e);
                continue;
            }
        };
        let writer = LeafUrlWriter::open(layout.leaf_url_file(&category, date))?;
        let written = export_tree_leaves(&tree, &writer).await?;
        info!(
            "Exported {} new leaf URLs for {} to {}",
            written,
            category,
            writer.path().display()
        );
        results.push((writer.path().to_path_buf(), written));
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_writer_dedups_against_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("leaf_urls").join("a_leaf_urls_2024-05-17.txt");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "https://x/1\n").unwrap();

        let writer = LeafUrlWriter::open(&path).unwrap();
        assert!(!writer.append("https://x/1").await.unwrap());
        assert!(writer.append("https://x/2").await.unwrap());
        assert!(!writer.append("https://x/2").await.unwrap());
        assert_eq!(writer.len().await, 2);

        let reopened = LeafUrlWriter::open(&path).unwrap();
        assert!(!reopened.append("https://x/2").await.unwrap());
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "https://x/1\nhttps://x/2\n"
        );
    }

    #[tokio::test]
    async fn test_export_from_tree_files() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StorageLayout::new(dir.path());
        layout.ensure_directories().unwrap();
        let date = NaiveDate::from_ymd_opt(2024, 5, 17).unwrap();

        let tree = CategoryNode::branch(
            "prodaja-stanova",
            "https://www.njuskalo.hr/prodaja-stanova",
            vec![
                CategoryNode::leaf("A", "https://www.njuskalo.hr/a"),
                CategoryNode::failed("B", "https://www.njuskalo.hr/b"),
            ],
        );
        std::fs::write(
            layout.category_tree_file("prodaja-stanova", date),
            serde_json::to_string(&tree).unwrap(),
        )
        .unwrap();
        std::fs::write(layout.merged_tree_file(date), "{}").unwrap();

        let results = export_from_tree_files(&layout, date).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].1, 1);
        assert_eq!(
            std::fs::read_to_string(layout.leaf_url_file("prodaja-stanova", date)).unwrap(),
            "https://www.njuskalo.hr/a\n"
        );
    }
}
