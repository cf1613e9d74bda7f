//! Serialized checkpoint file contents.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::category::CategoryNode;

/// Category-scope file: finished subtrees keyed by parent path, then by name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct CategoryCheckpoint {
    #[serde(default)]
    pub parents: BTreeMap<String, BTreeMap<String, Option<CategoryNode>>>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

/// Pagination-scope file: one record per leaf URL.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct PaginationCheckpoint {
    #[serde(default)]
    pub leaves: BTreeMap<String, PaginationRecord>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

/// Progress through one leaf's result pages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaginationRecord {
    /// Highest page fully processed. 0 means nothing fetched yet.
    pub last_page: u32,
    #[serde(default)]
    pub last_url_fetched: String,
    pub timestamp: DateTime<Utc>,
    /// Entries accumulated across all processed pages.
    #[serde(default)]
    pub entries: BTreeSet<String>,
    /// Entry set of page 1, for the loop-back check.
    #[serde(default)]
    pub first_page: BTreeSet<String>,
    /// Entry set of the last successfully parsed page.
    #[serde(default)]
    pub previous_page: BTreeSet<String>,
    /// Consecutive pages that failed to fetch.
    #[serde(default)]
    pub failed_pages: u32,
    /// Pagination reached a stop condition.
    #[serde(default)]
    pub finished: bool,
    /// Entries of this leaf were downloaded.
    #[serde(default)]
    pub completed: bool,
}

impl Default for PaginationRecord {
    fn default() -> Self {
        Self {
            last_page: 0,
            last_url_fetched: String::new(),
            timestamp: Utc::now(),
            entries: BTreeSet::new(),
            first_page: BTreeSet::new(),
            previous_page: BTreeSet::new(),
            failed_pages: 0,
            finished: false,
            completed: false,
        }
    }
}

impl PaginationRecord {
    /// First page to fetch when resuming.
    pub fn next_page(&self) -> u32 {
        self.last_page + 1
    }
}
