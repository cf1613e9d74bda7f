//! Child-category link extraction from a category page.

use std::collections::HashSet;
use std::sync::LazyLock;

use scraper::{Html, Selector};
use url::Url;

static CONTAINER: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("div.entity-list-categories").unwrap());
static ITEM: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse(
        "li.CategoryListing-topCategoryItem, li.CategoryListing-topCategoryItemFauxAnchor",
    )
    .unwrap()
});
static LINK: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("a.CategoryListing-topCategoryLink").unwrap());

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildLink {
    pub name: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractOutcome {
    AntibotDetected,
    NoChildren,
    Children(Vec<ChildLink>),
}

/// Finds subcategory links on a category page.
pub trait CategoryExtractor: Send + Sync {
    fn extract(&self, html: &str, page_url: &str) -> ExtractOutcome;
}

/// Phrases that mark an anti-bot interstitial when the category list is missing.
pub fn default_antibot_phrases() -> Vec<String> {
    ["prove you are human", "unusual traffic", "are you a human"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Extractor for the site's category listing markup.
#[derive(Debug, Clone)]
pub struct HtmlCategoryExtractor {
    antibot_phrases: Vec<String>,
}

impl Default for HtmlCategoryExtractor {
    fn default() -> Self {
        Self::new(default_antibot_phrases())
    }
}

impl HtmlCategoryExtractor {
    pub fn new(antibot_phrases: Vec<String>) -> Self {
        Self {
            antibot_phrases: antibot_phrases
                .into_iter()
                .map(|p| p.to_lowercase())
                .filter(|p| !p.is_empty())
                .collect(),
        }
    }
}

impl CategoryExtractor for HtmlCategoryExtractor {
    fn extract(&self, html: &str, page_url: &str) -> ExtractOutcome {
        let document = Html::parse_document(html);
        let Some(container) = document.select(&CONTAINER).next() else {
            let lower = html.to_lowercase();
            if self.antibot_phrases.iter().any(|p| lower.contains(p.as_str())) {
                return ExtractOutcome::AntibotDetected;
            }
            return ExtractOutcome::NoChildren;
        };

        let base = Url::parse(page_url).ok();
        let mut seen = HashSet::new();
        let mut links = Vec::new();
        for item in container.select(&ITEM) {
            let Some(anchor) = item.select(&LINK).next() else {
                continue;
            };
            let Some(href) = anchor.value().attr("href").map(str::trim) else {
                continue;
            };
            if href.is_empty() {
                continue;
            }
            let url = match &base {
                Some(base) => match base.join(href) {
                    Ok(joined) => joined.to_string(),
                    Err(_) => continue,
                },
                None => href.to_string(),
            };
            if !seen.insert(url.clone()) {
                continue;
            }
            let name = anchor
                .text()
                .collect::<Vec<_>>()
                .join(" ")
                .split_whitespace()
                .collect::<Vec<_>>()
                .join(" ");
            links.push(ChildLink { name, url });
        }

        if links.is_empty() {
            ExtractOutcome::NoChildren
        } else {
            ExtractOutcome::Children(links)
        }
    }
}
