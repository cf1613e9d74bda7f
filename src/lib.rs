//! njuskalo - resumable crawler for the njuskalo.hr classifieds site.
//!
//! Walks the category hierarchy into leaf search pages, paginates every leaf
//! into ad detail pages, looks up gated phone numbers through the
//! authenticated API, and parses saved pages into JSON. Every stage keeps
//! date-scoped checkpoints so an interrupted run picks up where it stopped.

pub mod category;
pub mod checkpoint;
pub mod cli;
pub mod config;
pub mod error;
pub mod fetch;
pub mod http_client;
pub mod leaf;
pub mod metrics;
pub mod parser;
pub mod phones;
pub mod pipeline;
pub mod proxy;
pub mod repository;
pub mod session;
pub mod storage;

pub use error::{CrawlError, Result};
