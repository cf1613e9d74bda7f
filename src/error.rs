//! Crate-level error type.
//!
//! Component errors live next to their components and convert into
//! [`CrawlError`] with `?`. Only [`CrawlError::Blocked`] and
//! [`CrawlError::Auth`] are process-fatal; everything else is recovered at
//! the smallest unit of work that can absorb it.

use std::path::PathBuf;

use crate::checkpoint::CheckpointError;
use crate::fetch::BlockKind;
use crate::proxy::ProxyError;
use crate::repository::RepositoryError;
use crate::session::AuthError;

#[derive(Debug, thiserror::Error)]
pub enum CrawlError {
    /// Bot challenge on the final transport; the whole run has to stop.
    #[error("blocked by {kind} challenge at {url} with no transport left")]
    Blocked { url: String, kind: BlockKind },

    #[error("session unavailable: {0}")]
    Auth(#[from] AuthError),

    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("phone store error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("proxy setup failed: {0}")]
    Proxy(#[from] ProxyError),

    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

impl CrawlError {
    /// Wrap an I/O error with the path it happened on.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CrawlError::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether this error must terminate the process after the block cool-down.
    pub fn is_fatal_block(&self) -> bool {
        matches!(self, CrawlError::Blocked { .. })
    }
}

pub type Result<T> = std::result::Result<T, CrawlError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocked_is_fatal() {
        let err = CrawlError::Blocked {
            url: "https://www.njuskalo.hr/prodaja-stanova".into(),
            kind: BlockKind::ShieldSquare,
        };
        assert!(err.is_fatal_block());
        assert!(err.to_string().contains("ShieldSquare"));
    }

    #[test]
    fn test_io_error_mentions_path() {
        let err = CrawlError::io(
            "/tmp/nowhere/x.json",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert!(!err.is_fatal_block());
        assert!(err.to_string().contains("/tmp/nowhere/x.json"));
    }
}
