//! Leaf listings: pagination, entry harvesting and detail-page download.

mod entries;
mod extract;
mod paginator;
mod runner;

pub use entries::{EntryConfig, EntryDownloader, EntryOutcome, EntryReport, DEFAULT_ENTRY_CONCURRENCY};
pub use extract::{EntryExtractor, HtmlEntryExtractor, SITE_ROOT};
pub use paginator::{
    page_url, LeafHarvest, LeafPaginator, PaginatorConfig, StopReason, DEFAULT_PAGE_DELAY_MAX,
    DEFAULT_PAGE_DELAY_MIN, DEFAULT_PAGE_SIZE,
};
pub use runner::{LeafEvent, LeafRunReport, LeafRunner, DEFAULT_SESSION_REFRESH_EVERY};
