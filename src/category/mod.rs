//! Category hierarchy crawl and leaf-URL export.

mod export;
mod extract;
mod node;
mod walker;

pub use export::{export_from_tree_files, export_tree_leaves, read_url_lines, LeafUrlWriter};
pub use extract::{
    default_antibot_phrases, CategoryExtractor, ChildLink, ExtractOutcome, HtmlCategoryExtractor,
};
pub use node::CategoryNode;
pub use walker::{
    CategoryTreeWalker, TreeBuilder, TreeReport, WalkerConfig, WalkerDeps, DEFAULT_BASE_URL,
    DEFAULT_MAX_DEPTH, DEFAULT_SLEEP_AFTER_SUBCATEGORIES, DEFAULT_SUBCATEGORY_COOLDOWN,
};
