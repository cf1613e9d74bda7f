//! SQLite persistence.
//!
//! Each repository opens a short-lived connection per call, so a repository
//! can be shared across tasks without holding a connection across awaits.

mod phones;

pub use phones::{PhoneRecord, PhoneRepository};

use std::path::Path;

use rusqlite::Connection;

#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("stored phone list for ad {ad_id} is not valid JSON: {source}")]
    Corrupt {
        ad_id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("phone store task failed: {0}")]
    Task(String),
}

pub type Result<T> = std::result::Result<T, RepositoryError>;

/// Open a connection with WAL and a generous busy timeout.
pub fn connect(db_path: &Path) -> Result<Connection> {
    let conn = Connection::open(db_path)?;
    conn.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA busy_timeout = 30000;
    "#,
    )?;
    Ok(conn)
}

/// Map `QueryReturnedNoRows` to `None`.
pub(crate) fn to_option<T>(result: rusqlite::Result<T>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}
