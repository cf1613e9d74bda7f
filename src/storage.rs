//! On-disk layout of the data directory and file helpers.
//!
//! Every write here is an overwrite by path, so re-running a stage never
//! duplicates files.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use chrono::NaiveDate;
use regex::Regex;

static AD_ID_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"-(\d+)$").unwrap());

const CATEGORIES_SUBDIR: &str = "categories";
const HTMLS_SUBDIR: &str = "htmls";
const TREE_JSONS_SUBDIR: &str = "tree_jsons";
const LEAF_URLS_SUBDIR: &str = "leaf_urls";
const DETAIL_SUBDIR: &str = "website";
const JSON_SUBDIR: &str = "json";
const CHECKPOINTS_SUBDIR: &str = "checkpoints";
pub const PHONES_DB_FILENAME: &str = "phones.db";

/// Paths under the data directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageLayout {
    pub data_dir: PathBuf,
}

impl StorageLayout {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    /// Raw category pages, mirrored by category chain.
    pub fn html_dir(&self) -> PathBuf {
        self.data_dir.join(CATEGORIES_SUBDIR).join(HTMLS_SUBDIR)
    }

    pub fn tree_dir(&self) -> PathBuf {
        self.data_dir.join(CATEGORIES_SUBDIR).join(TREE_JSONS_SUBDIR)
    }

    pub fn leaf_urls_dir(&self) -> PathBuf {
        self.data_dir.join(LEAF_URLS_SUBDIR)
    }

    /// Saved detail pages.
    pub fn detail_dir(&self) -> PathBuf {
        self.data_dir.join(DETAIL_SUBDIR)
    }

    pub fn json_dir(&self) -> PathBuf {
        self.data_dir.join(JSON_SUBDIR)
    }

    pub fn checkpoint_dir(&self) -> PathBuf {
        self.data_dir.join(CHECKPOINTS_SUBDIR)
    }

    pub fn phones_db(&self) -> PathBuf {
        self.data_dir.join(PHONES_DB_FILENAME)
    }

    pub fn pipeline_checkpoint(&self, date: NaiveDate) -> PathBuf {
        self.data_dir
            .join(format!("pipeline_checkpoint_{}.txt", date_stamp(date)))
    }

    pub fn category_tree_file(&self, category: &str, date: NaiveDate) -> PathBuf {
        self.tree_dir()
            .join(format!("{}_tree_{}.json", clean_name(category), date_stamp(date)))
    }

    pub fn merged_tree_file(&self, date: NaiveDate) -> PathBuf {
        self.tree_dir()
            .join(format!("category_tree_{}.json", date_stamp(date)))
    }

    pub fn leaf_url_file(&self, category: &str, date: NaiveDate) -> PathBuf {
        self.leaf_urls_dir().join(format!(
            "{}_leaf_urls_{}.txt",
            clean_name(category),
            date_stamp(date)
        ))
    }

    pub fn detail_file(&self, ad_id: &str) -> PathBuf {
        self.detail_dir().join(format!("{}.html", ad_id))
    }

    pub fn json_file(&self, ad_id: &str) -> PathBuf {
        self.json_dir().join(format!("{}.json", ad_id))
    }

    /// Create every directory of the layout.
    pub fn ensure_directories(&self) -> std::io::Result<()> {
        for dir in [
            self.data_dir.clone(),
            self.html_dir(),
            self.tree_dir(),
            self.leaf_urls_dir(),
            self.detail_dir(),
            self.json_dir(),
            self.checkpoint_dir(),
        ] {
            std::fs::create_dir_all(&dir).map_err(|e| {
                std::io::Error::new(
                    e.kind(),
                    format!("Failed to create directory '{}': {}", dir.display(), e),
                )
            })?;
        }
        Ok(())
    }
}

/// `YYYY-MM-DD`, the date format embedded in every dated file name.
pub fn date_stamp(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

/// Today's date in local time.
pub fn today() -> NaiveDate {
    chrono::Local::now().date_naive()
}

/// Filesystem-safe name: alphanumerics, space, `-` and `_` survive, spaces become `_`.
pub fn clean_name(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, ' ' | '-' | '_'))
        .collect::<String>()
        .replace(' ', "_")
}

/// Trailing numeric id of a detail URL, ignoring query string and trailing slash.
pub fn ad_id_from_url(url: &str) -> Option<String> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let path = path.trim_end_matches('/');
    AD_ID_RE
        .captures(path)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// Write a whole file atomically: temp file in the same directory, then rename.
pub fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Ad ids of every `*.html` file in `dir`, sorted.
pub fn detail_ids(dir: &Path) -> std::io::Result<Vec<String>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut ids = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "html") {
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                ids.push(stem.to_string());
            }
        }
    }
    ids.sort();
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, 17).unwrap()
    }

    #[test]
    fn test_clean_name() {
        assert_eq!(clean_name("Prodaja stanova"), "Prodaja_stanova");
        assert_eq!(clean_name("Grad Zagreb / Trešnjevka"), "Grad_Zagreb__Trešnjevka");
        assert_eq!(clean_name("a-b_c?*"), "a-b_c");
    }

    #[test]
    fn test_ad_id_from_url() {
        assert_eq!(
            ad_id_from_url("https://www.njuskalo.hr/nekretnine/stan-zagreb-oglas-43821931")
                .as_deref(),
            Some("43821931")
        );
        assert_eq!(
            ad_id_from_url("https://www.njuskalo.hr/nekretnine/stan-oglas-123/?ref=list")
                .as_deref(),
            Some("123")
        );
        assert_eq!(ad_id_from_url("https://www.njuskalo.hr/prodaja-stanova"), None);
    }

    #[test]
    fn test_layout_paths() {
        let layout = StorageLayout::new("/data");
        assert_eq!(
            layout.category_tree_file("prodaja-stanova", date()),
            PathBuf::from("/data/categories/tree_jsons/prodaja-stanova_tree_2024-05-17.json")
        );
        assert_eq!(
            layout.leaf_url_file("prodaja-stanova", date()),
            PathBuf::from("/data/leaf_urls/prodaja-stanova_leaf_urls_2024-05-17.txt")
        );
        assert_eq!(layout.detail_file("42"), PathBuf::from("/data/website/42.html"));
        assert_eq!(
            layout.pipeline_checkpoint(date()),
            PathBuf::from("/data/pipeline_checkpoint_2024-05-17.txt")
        );
    }

    #[test]
    fn test_write_atomic_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("file.json");
        write_atomic(&path, b"first").unwrap();
        write_atomic(&path, b"second").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "second");
        assert_eq!(std::fs::read_dir(path.parent().unwrap()).unwrap().count(), 1);
    }

    #[test]
    fn test_detail_ids() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("20.html"), "").unwrap();
        std::fs::write(dir.path().join("10.html"), "").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "").unwrap();
        assert_eq!(detail_ids(dir.path()).unwrap(), vec!["10", "20"]);
        assert!(detail_ids(&dir.path().join("missing")).unwrap().is_empty());
    }
}
