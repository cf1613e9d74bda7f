//! Detail-page parsing into per-ad JSON files.

mod detail;

pub use detail::{DetailParser, DetailRecord, HtmlDetailParser, Location};

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tracing::{debug, info, warn};

use crate::error::{CrawlError, Result};
use crate::repository::PhoneRepository;
use crate::storage::{detail_ids, write_atomic, StorageLayout};

pub const DEFAULT_PARSE_WORKERS: usize = 8;

#[derive(Debug, Clone, Default)]
pub struct ParseReport {
    pub parsed: usize,
    pub skipped: usize,
    pub failed: Vec<(String, String)>,
}

/// Parses every saved detail page that has no JSON output yet.
pub struct ParseRunner {
    parser: Arc<dyn DetailParser>,
    layout: StorageLayout,
    phones: Option<PhoneRepository>,
    workers: usize,
    force: bool,
}

impl ParseRunner {
    pub fn new(layout: StorageLayout) -> Self {
        Self {
            parser: Arc::new(HtmlDetailParser),
            layout,
            phones: None,
            workers: DEFAULT_PARSE_WORKERS,
            force: false,
        }
    }

    pub fn with_parser(mut self, parser: Arc<dyn DetailParser>) -> Self {
        self.parser = parser;
        self
    }

    /// Fill `telefon` from the phone store.
    pub fn with_phones(mut self, phones: PhoneRepository) -> Self {
        self.phones = Some(phones);
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Overwrite existing JSON outputs.
    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub async fn run(&self) -> Result<ParseReport> {
        let detail_dir = self.layout.detail_dir();
        let ids = detail_ids(&detail_dir).map_err(|e| CrawlError::io(&detail_dir, e))?;
        let mut report = ParseReport::default();

        let todo: Vec<String> = ids
            .into_iter()
            .filter(|id| {
                let exists = self.layout.json_file(id).exists();
                if exists && !self.force {
                    report.skipped += 1;
                    false
                } else {
                    true
                }
            })
            .collect();
        info!(
            "Parsing {} detail pages ({} already parsed)",
            todo.len(),
            report.skipped
        );

        let mut results = stream::iter(todo)
            .map(|ad_id| {
                let parser = self.parser.clone();
                let layout = self.layout.clone();
                let phones = self.phones.clone();
                async move {
                    let id = ad_id.clone();
                    let joined = tokio::task::spawn_blocking(move || {
                        parse_one(&*parser, &layout, phones.as_ref(), &ad_id)
                    })
                    .await;
                    match joined {
                        Ok(result) => (id, result),
                        Err(e) => (id, Err(format!("parser task failed: {}", e))),
                    }
                }
            })
            .buffer_unordered(self.workers);

        while let Some((ad_id, result)) = results.next().await {
            match result {
                Ok(()) => report.parsed += 1,
                Err(reason) => {
                    warn!("Could not parse ad {}: {}", ad_id, reason);
                    report.failed.push((ad_id, reason));
                }
            }
        }

        info!(
            "Parsed {} ads, {} skipped, {} failed",
            report.parsed,
            report.skipped,
            report.failed.len()
        );
        Ok(report)
    }
}

fn parse_one(
    parser: &dyn DetailParser,
    layout: &StorageLayout,
    phones: Option<&PhoneRepository>,
    ad_id: &str,
) -> std::result::Result<(), String> {
    let source = layout.detail_file(ad_id);
    let bytes = std::fs::read(&source).map_err(|e| format!("read {}: {}", source.display(), e))?;
    let html = String::from_utf8_lossy(&bytes);

    let mut record = parser.extract(&html, ad_id);
    if let Some(phones) = phones {
        match phones.first_phone(ad_id) {
            Ok(phone) => record.phone = phone.map(|p| p.trim().to_string()),
            Err(e) => debug!("No phone for ad {}: {}", ad_id, e),
        }
    }

    let json = serde_json::to_vec(&record).map_err(|e| format!("serialize: {}", e))?;
    let target = layout.json_file(ad_id);
    write_atomic(&target, &json).map_err(|e| format!("write {}: {}", target.display(), e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_writes_json_and_skips_existing() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StorageLayout::new(dir.path());
        layout.ensure_directories().unwrap();
        std::fs::write(layout.detail_file("1"), "<html><title>Prvi</title></html>").unwrap();
        std::fs::write(layout.detail_file("2"), "<html><title>Drugi</title></html>").unwrap();
        std::fs::write(layout.json_file("2"), "{}").unwrap();

        let phones = PhoneRepository::new(&layout.phones_db()).unwrap();
        phones
            .upsert("1", Some(&[" 091 111 ".to_string(), "092".to_string()]))
            .unwrap();

        let report = ParseRunner::new(layout.clone())
            .with_phones(phones)
            .run()
            .await
            .unwrap();
        assert_eq!(report.parsed, 1);
        assert_eq!(report.skipped, 1);
        assert!(report.failed.is_empty());

        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(layout.json_file("1")).unwrap())
                .unwrap();
        assert_eq!(json["id"], "1");
        assert_eq!(json["naslov"], "Prvi");
        assert_eq!(json["telefon"], "091 111");
        assert_eq!(std::fs::read_to_string(layout.json_file("2")).unwrap(), "{}");

        let forced = ParseRunner::new(layout.clone())
            .with_force(true)
            .run()
            .await
            .unwrap();
        assert_eq!(forced.parsed, 2);
        assert_ne!(std::fs::read_to_string(layout.json_file("2")).unwrap(), "{}");
    }
}
