//! Phone-number store keyed by ad id.
//!
//! A row with `phones = NULL` means the lookup ran and found nothing (or
//! failed); a missing row means the ad was never looked up.

use std::path::{Path, PathBuf};

use rusqlite::{params, Connection};

use super::{to_option, RepositoryError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhoneRecord {
    pub ad_id: String,
    pub phones: Option<Vec<String>>,
}

/// SQLite-backed phone repository.
#[derive(Debug, Clone)]
pub struct PhoneRepository {
    db_path: PathBuf,
}

impl PhoneRepository {
    pub fn new(db_path: &Path) -> Result<Self> {
        let repo = Self {
            db_path: db_path.to_path_buf(),
        };
        repo.init_schema()?;
        Ok(repo)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Run `f` against a clone of this repository on the blocking pool.
    pub async fn run_blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&PhoneRepository) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let repo = self.clone();
        tokio::task::spawn_blocking(move || f(&repo))
            .await
            .map_err(|e| RepositoryError::Task(e.to_string()))?
    }

    fn connect(&self) -> Result<Connection> {
        super::connect(&self.db_path)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.connect()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS phones (
                ad_id TEXT PRIMARY KEY,
                phones TEXT
            );
        "#,
        )?;
        Ok(())
    }

    pub fn get(&self, ad_id: &str) -> Result<Option<PhoneRecord>> {
        let conn = self.connect()?;
        let raw: Option<Option<String>> = to_option(conn.query_row(
            "SELECT phones FROM phones WHERE ad_id = ?",
            params![ad_id],
            |row| row.get(0),
        ))?;
        let Some(raw) = raw else {
            return Ok(None);
        };
        let phones = match raw {
            Some(json) => Some(serde_json::from_str(&json).map_err(|source| {
                RepositoryError::Corrupt {
                    ad_id: ad_id.to_string(),
                    source,
                }
            })?),
            None => None,
        };
        Ok(Some(PhoneRecord {
            ad_id: ad_id.to_string(),
            phones,
        }))
    }

    /// Whether the ad has a row, NULL or not.
    pub fn contains(&self, ad_id: &str) -> Result<bool> {
        let conn = self.connect()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM phones WHERE ad_id = ?",
            params![ad_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Ads whose lookup found nothing.
    pub fn null_ids(&self) -> Result<Vec<String>> {
        self.query_ids("SELECT ad_id FROM phones WHERE phones IS NULL ORDER BY ad_id")
    }

    fn query_ids(&self, sql: &str) -> Result<Vec<String>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(sql)?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids)
    }

    pub fn count(&self) -> Result<u64> {
        let conn = self.connect()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM phones", [], |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }

    /// First stored number of an ad, if any.
    pub fn first_phone(&self, ad_id: &str) -> Result<Option<String>> {
        Ok(self
            .get(ad_id)?
            .and_then(|record| record.phones)
            .and_then(|phones| phones.into_iter().next()))
    }

    /// Insert or replace the row for `ad_id`. `None` stores NULL.
    pub fn upsert(&self, ad_id: &str, phones: Option<&[String]>) -> Result<()> {
        let json = match phones {
            Some(phones) => Some(serde_json::to_string(phones).map_err(|source| {
                RepositoryError::Corrupt {
                    ad_id: ad_id.to_string(),
                    source,
                }
            })?),
            None => None,
        };
        let conn = self.connect()?;
        conn.execute(
            "REPLACE INTO phones (ad_id, phones) VALUES (?1, ?2)",
            params![ad_id, json],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo() -> (tempfile::TempDir, PhoneRepository) {
        let dir = tempfile::tempdir().unwrap();
        let repo = PhoneRepository::new(&dir.path().join("phones.db")).unwrap();
        (dir, repo)
    }

    #[test]
    fn test_upsert_replaces_null_with_numbers() {
        let (_dir, repo) = repo();
        repo.upsert("123", None).unwrap();
        assert_eq!(
            repo.get("123").unwrap(),
            Some(PhoneRecord {
                ad_id: "123".into(),
                phones: None
            })
        );
        assert_eq!(repo.null_ids().unwrap(), vec!["123".to_string()]);

        let numbers = vec!["+385 91 234 5678".to_string()];
        repo.upsert("123", Some(&numbers)).unwrap();
        assert_eq!(repo.count().unwrap(), 1);
        assert_eq!(repo.get("123").unwrap().unwrap().phones, Some(numbers));
        assert!(repo.null_ids().unwrap().is_empty());
        assert_eq!(
            repo.first_phone("123").unwrap().as_deref(),
            Some("+385 91 234 5678")
        );
    }

    #[test]
    fn test_missing_row() {
        let (_dir, repo) = repo();
        assert_eq!(repo.get("404").unwrap(), None);
        assert!(!repo.contains("404").unwrap());
        assert_eq!(repo.first_phone("404").unwrap(), None);
    }

    #[test]
    fn test_rows_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("phones.db");
        {
            let repo = PhoneRepository::new(&path).unwrap();
            repo.upsert("2", None).unwrap();
            repo.upsert("1", Some(&["+385 1".to_string()])).unwrap();
        }
        let repo = PhoneRepository::new(&path).unwrap();
        assert_eq!(repo.count().unwrap(), 2);
        assert_eq!(repo.null_ids().unwrap(), vec!["2".to_string()]);
        assert_eq!(repo.first_phone("1").unwrap().as_deref(), Some("+385 1"));
    }

    #[tokio::test]
    async fn test_run_blocking_sees_writes() {
        let (_dir, repo) = repo();
        repo.upsert("7", None).unwrap();
        let found = repo
            .run_blocking(|repo| Ok((repo.contains("7")?, repo.contains("8")?)))
            .await
            .unwrap();
        assert_eq!(found, (true, false));
    }
}
