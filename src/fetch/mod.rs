//! Fetch-with-fallback: routing, response classification and fallback policies.

mod classify;
mod policy;
mod selector;

pub use classify::{page_title, BlockKind, Classifier, ClassifierConfig, ResponseClass};
pub use policy::{
    CyclePhase, CycleWindows, FallbackPolicy, FetchMode, DEFAULT_MAX_PROXY_RETRIES,
};
pub use selector::ConnectionSelector;

use std::fmt;

use async_trait::async_trait;

use crate::error::CrawlError;
use crate::session::Session;

/// The transport a response came through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Local,
    /// Masked proxy URL.
    Proxy(String),
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Route::Local => write!(f, "local"),
            Route::Proxy(p) => write!(f, "proxy {}", p),
        }
    }
}

/// A real content page.
#[derive(Debug, Clone)]
pub struct PageBody {
    pub url: String,
    pub final_url: String,
    pub body: String,
    pub route: Route,
}

/// Result of [`PageFetcher::fetch`].
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    Page(PageBody),
    /// Challenge page on the final attempt. Callers escalate this to
    /// [`CrawlError::Blocked`].
    Blocked {
        url: String,
        kind: BlockKind,
        route: Route,
    },
    /// Every allowed transport failed; the request is given up.
    Failed { url: String, reason: String },
}

impl FetchOutcome {
    /// Turn a fatal block into an error, keeping pages and soft failures.
    pub fn into_result(self) -> Result<Option<PageBody>, CrawlError> {
        match self {
            FetchOutcome::Page(page) => Ok(Some(page)),
            FetchOutcome::Failed { .. } => Ok(None),
            FetchOutcome::Blocked { url, kind, .. } => Err(CrawlError::Blocked { url, kind }),
        }
    }
}

/// Anything that can fetch a page under a routing mode.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &str, session: Option<&Session>, mode: FetchMode) -> FetchOutcome;
}
