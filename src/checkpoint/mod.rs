//! Date-scoped crawl checkpoints.
//!
//! One JSON file per (scope, key, date) under the checkpoint directory:
//! `category_{date}_{key}.json` and `pagination_{date}_{key}.json`. Files
//! are loaded lazily, cached, and rewritten whole on every change with a
//! temp-file-then-rename. All access goes through one async mutex, so
//! concurrent walkers never interleave a read-modify-write.

mod records;

pub use records::PaginationRecord;

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use chrono::{NaiveDate, Utc};
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::category::CategoryNode;
use crate::storage::{date_stamp, write_atomic};
use records::{CategoryCheckpoint, PaginationCheckpoint};

static CHECKPOINT_FILE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(category|pagination)_(\d{4}-\d{2}-\d{2})_.+\.json$").unwrap()
});

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("checkpoint I/O failed at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("corrupt checkpoint {}: {source}", path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

pub type Result<T> = std::result::Result<T, CheckpointError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CheckpointScope {
    Category,
    Pagination,
}

impl fmt::Display for CheckpointScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckpointScope::Category => write!(f, "category"),
            CheckpointScope::Pagination => write!(f, "pagination"),
        }
    }
}

/// A unit of completed work.
#[derive(Debug, Clone, Copy)]
pub enum CheckpointUnit<'a> {
    /// A finished subcategory. Its subtree is stored for splicing on resume.
    Subcategory {
        parent: &'a str,
        node: &'a CategoryNode,
    },
    /// Pagination of a leaf reached `page`.
    Page { leaf_url: &'a str, page: u32 },
    /// The entries of a leaf were downloaded.
    Leaf { leaf_url: &'a str },
}

#[derive(Default)]
struct Cache {
    categories: HashMap<String, CategoryCheckpoint>,
    pagination: HashMap<String, PaginationCheckpoint>,
}

pub struct CheckpointStore {
    dir: PathBuf,
    today: NaiveDate,
    cache: Mutex<Cache>,
}

impl CheckpointStore {
    /// Open (and create) the checkpoint directory for `today`.
    pub fn open(dir: impl Into<PathBuf>, today: NaiveDate) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|source| CheckpointError::Io {
            path: dir.clone(),
            source,
        })?;
        Ok(Self {
            dir,
            today,
            cache: Mutex::new(Cache::default()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn today(&self) -> NaiveDate {
        self.today
    }

    /// File backing `(scope, key)` for today.
    pub fn path_for(&self, scope: CheckpointScope, key: &str) -> PathBuf {
        self.dir.join(format!(
            "{}_{}_{}.json",
            scope,
            date_stamp(self.today),
            slug(key)
        ))
    }

    /// Delete every checkpoint file not dated `today`. Returns how many were removed.
    pub fn purge_stale(&self, today: NaiveDate) -> Result<usize> {
        let today = date_stamp(today);
        let entries = std::fs::read_dir(&self.dir).map_err(|source| CheckpointError::Io {
            path: self.dir.clone(),
            source,
        })?;

        let mut removed = 0;
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(caps) = CHECKPOINT_FILE_RE.captures(&name) else {
                continue;
            };
            if &caps[2] == today {
                continue;
            }
            match std::fs::remove_file(entry.path()) {
                Ok(()) => {
                    debug!("Removed stale checkpoint {}", name);
                    removed += 1;
                }
                Err(e) => warn!("Could not delete stale checkpoint {}: {}", name, e),
            }
        }
        if removed > 0 {
            info!("Purged {} stale checkpoint files", removed);
        }
        Ok(removed)
    }

    pub async fn mark_complete(&self, key: &str, unit: CheckpointUnit<'_>) -> Result<()> {
        match unit {
            CheckpointUnit::Subcategory { parent, node } => {
                let mut cache = self.cache.lock().await;
                let path = self.path_for(CheckpointScope::Category, key);
                let file = load_cached(&mut cache.categories, key, &path)?;
                file.parents
                    .entry(parent.to_string())
                    .or_default()
                    .insert(node.name.clone(), Some(node.clone()));
                file.timestamp = Utc::now();
                persist(&path, &*file)
            }
            CheckpointUnit::Page { leaf_url, page } => {
                self.update_pagination(key, leaf_url, |record| {
                    record.last_page = record.last_page.max(page);
                })
                .await
            }
            CheckpointUnit::Leaf { leaf_url } => {
                self.update_pagination(key, leaf_url, |record| {
                    record.finished = true;
                    record.completed = true;
                })
                .await
            }
        }
    }

    pub async fn is_complete(&self, key: &str, unit: CheckpointUnit<'_>) -> Result<bool> {
        match unit {
            CheckpointUnit::Subcategory { parent, node } => Ok(self
                .completed_subcategory(key, parent, &node.name)
                .await?
                .is_some()),
            CheckpointUnit::Page { leaf_url, page } => Ok(self
                .pagination(key, leaf_url)
                .await?
                .is_some_and(|r| r.last_page >= page)),
            CheckpointUnit::Leaf { leaf_url } => Ok(self
                .pagination(key, leaf_url)
                .await?
                .is_some_and(|r| r.completed)),
        }
    }

    /// Stored subtree of a finished subcategory.
    pub async fn completed_subcategory(
        &self,
        key: &str,
        parent: &str,
        name: &str,
    ) -> Result<Option<CategoryNode>> {
        let mut cache = self.cache.lock().await;
        let path = self.path_for(CheckpointScope::Category, key);
        let file = load_cached(&mut cache.categories, key, &path)?;
        Ok(file
            .parents
            .get(parent)
            .and_then(|done| done.get(name))
            .cloned()
            .flatten())
    }

    pub async fn pagination(&self, key: &str, leaf_url: &str) -> Result<Option<PaginationRecord>> {
        let mut cache = self.cache.lock().await;
        let path = self.path_for(CheckpointScope::Pagination, key);
        let file = load_cached(&mut cache.pagination, key, &path)?;
        Ok(file.leaves.get(leaf_url).cloned())
    }

    pub async fn save_pagination(
        &self,
        key: &str,
        leaf_url: &str,
        mut record: PaginationRecord,
    ) -> Result<()> {
        let mut cache = self.cache.lock().await;
        let path = self.path_for(CheckpointScope::Pagination, key);
        let file = load_cached(&mut cache.pagination, key, &path)?;
        record.timestamp = Utc::now();
        file.leaves.insert(leaf_url.to_string(), record);
        file.timestamp = Utc::now();
        persist(&path, &*file)
    }

    /// Read-modify-write of one leaf record under a single lock.
    async fn update_pagination(
        &self,
        key: &str,
        leaf_url: &str,
        update: impl FnOnce(&mut PaginationRecord),
    ) -> Result<()> {
        let mut cache = self.cache.lock().await;
        let path = self.path_for(CheckpointScope::Pagination, key);
        let file = load_cached(&mut cache.pagination, key, &path)?;
        let now = Utc::now();
        let record = file.leaves.entry(leaf_url.to_string()).or_default();
        update(record);
        record.timestamp = now;
        file.timestamp = now;
        persist(&path, &*file)
    }

    /// Forget everything stored under `(scope, key)` for today.
    pub async fn clear(&self, scope: CheckpointScope, key: &str) -> Result<()> {
        let mut cache = self.cache.lock().await;
        match scope {
            CheckpointScope::Category => {
                cache.categories.remove(key);
            }
            CheckpointScope::Pagination => {
                cache.pagination.remove(key);
            }
        }
        let path = self.path_for(scope, key);
        match std::fs::remove_file(&path) {
            Ok(()) => {
                info!("Cleared checkpoint {}", path.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(CheckpointError::Io { path, source }),
        }
    }
}

fn load_cached<'a, T>(
    cache: &'a mut HashMap<String, T>,
    key: &str,
    path: &Path,
) -> Result<&'a mut T>
where
    T: DeserializeOwned + Default,
{
    if !cache.contains_key(key) {
        let loaded = read_json(path)?.unwrap_or_default();
        cache.insert(key.to_string(), loaded);
    }
    Ok(cache.entry(key.to_string()).or_default())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(CheckpointError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    serde_json::from_str(&contents)
        .map(Some)
        .map_err(|source| CheckpointError::Corrupt {
            path: path.to_path_buf(),
            source,
        })
}

fn persist<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_vec_pretty(value).map_err(|source| CheckpointError::Corrupt {
        path: path.to_path_buf(),
        source,
    })?;
    write_atomic(path, &json).map_err(|source| CheckpointError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// File-name-safe form of a key. Altered keys get a short hash suffix so
/// distinct keys never collide.
fn slug(key: &str) -> String {
    let cleaned: String = key
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned == key && !key.is_empty() {
        return cleaned;
    }
    let digest = hex::encode(Sha256::digest(key.as_bytes()));
    format!("{}-{}", cleaned, &digest[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, d).unwrap()
    }

    #[test]
    fn test_slug() {
        assert_eq!(slug("categories"), "categories");
        let s = slug("https://www.njuskalo.hr/x?page=2");
        assert!(s.starts_with("https___www_njuskalo_hr_x_page_2-"));
        assert_ne!(slug("a/b"), slug("a_b"));
    }

    #[tokio::test]
    async fn test_subcategory_roundtrip_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let node = CategoryNode::leaf("Trnje", "https://www.njuskalo.hr/prodaja-stanova/zagreb-trnje");
        let unit = CheckpointUnit::Subcategory {
            parent: "Zagreb",
            node: &node,
        };
        {
            let store = CheckpointStore::open(dir.path(), day(17)).unwrap();
            store.mark_complete("prodaja-stanova", unit).await.unwrap();
        }
        let store = CheckpointStore::open(dir.path(), day(17)).unwrap();
        assert!(store.is_complete("prodaja-stanova", unit).await.unwrap());
        assert_eq!(
            store
                .completed_subcategory("prodaja-stanova", "Zagreb", "Trnje")
                .await
                .unwrap(),
            Some(node.clone())
        );
        let elsewhere = CheckpointUnit::Subcategory {
            parent: "Split",
            node: &node,
        };
        assert!(!store.is_complete("prodaja-stanova", elsewhere).await.unwrap());
    }

    #[tokio::test]
    async fn test_page_units() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::open(dir.path(), day(17)).unwrap();
        let leaf = "https://www.njuskalo.hr/prodaja-stanova/zagreb-trnje";
        store
            .mark_complete("leaves", CheckpointUnit::Page { leaf_url: leaf, page: 3 })
            .await
            .unwrap();
        assert!(store
            .is_complete("leaves", CheckpointUnit::Page { leaf_url: leaf, page: 2 })
            .await
            .unwrap());
        assert!(!store
            .is_complete("leaves", CheckpointUnit::Page { leaf_url: leaf, page: 4 })
            .await
            .unwrap());
        assert_eq!(store.pagination("leaves", leaf).await.unwrap().unwrap().next_page(), 4);
    }

    #[tokio::test]
    async fn test_leaf_done_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::open(dir.path(), day(17)).unwrap();
        let unit = CheckpointUnit::Leaf {
            leaf_url: "https://x/a",
        };
        store.mark_complete("leaves", unit).await.unwrap();
        assert!(store.is_complete("leaves", unit).await.unwrap());
        assert!(store.path_for(CheckpointScope::Pagination, "leaves").exists());

        store.clear(CheckpointScope::Pagination, "leaves").await.unwrap();
        assert!(!store.is_complete("leaves", unit).await.unwrap());
        assert!(!store.path_for(CheckpointScope::Pagination, "leaves").exists());
    }

    #[tokio::test]
    async fn test_concurrent_updates_to_one_leaf_are_kept() {
        let dir = tempfile::tempdir().unwrap();
        let store = std::sync::Arc::new(CheckpointStore::open(dir.path(), day(17)).unwrap());
        let leaves: Vec<String> = (0..20).map(|i| format!("https://x/{}", i)).collect();

        let mut tasks = Vec::new();
        for leaf in &leaves {
            for page in 1..=3 {
                let (store, leaf) = (store.clone(), leaf.clone());
                tasks.push(tokio::spawn(async move {
                    store
                        .mark_complete("leaves", CheckpointUnit::Page { leaf_url: &leaf, page })
                        .await
                }));
            }
            let (store, leaf) = (store.clone(), leaf.clone());
            tasks.push(tokio::spawn(async move {
                store
                    .mark_complete("leaves", CheckpointUnit::Leaf { leaf_url: &leaf })
                    .await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let reopened = CheckpointStore::open(dir.path(), day(17)).unwrap();
        for leaf in &leaves {
            let record = reopened.pagination("leaves", leaf).await.unwrap().unwrap();
            assert_eq!(record.last_page, 3, "{}", leaf);
            assert!(record.completed, "{}", leaf);
        }
    }

    #[tokio::test]
    async fn test_purge_stale_keeps_today() {
        let dir = tempfile::tempdir().unwrap();
        let old = CheckpointStore::open(dir.path(), day(16)).unwrap();
        old.mark_complete("leaves", CheckpointUnit::Leaf { leaf_url: "https://x/a" })
            .await
            .unwrap();
        let store = CheckpointStore::open(dir.path(), day(17)).unwrap();
        store
            .mark_complete("leaves", CheckpointUnit::Leaf { leaf_url: "https://x/b" })
            .await
            .unwrap();
        std::fs::write(dir.path().join("unrelated.json"), "{}").unwrap();

        assert_eq!(store.purge_stale(day(17)).unwrap(), 1);
        assert!(store.path_for(CheckpointScope::Pagination, "leaves").exists());
        assert!(dir.path().join("unrelated.json").exists());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::open(dir.path(), day(17)).unwrap();
        std::fs::write(store.path_for(CheckpointScope::Category, "categories"), "{oops").unwrap();
        let err = store
            .completed_subcategory("categories", "", "x")
            .await
            .unwrap_err();
        assert!(matches!(err, CheckpointError::Corrupt { .. }));
    }
}
