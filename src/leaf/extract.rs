//! Entry links on a leaf listing page.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use scraper::{Html, Selector};
use url::Url;

pub const SITE_ROOT: &str = "https://www.njuskalo.hr";

/// Group titles of the organic ad list, in Croatian and English.
const AD_GROUP_TITLES: [&str; 2] = ["Njuškalo oglasi", "Sniff ads"];

static SECTION: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("section.EntityList").unwrap());
static GROUP_TITLE: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("h2.EntityList-groupTitle").unwrap());
static ENTRY_LINK: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse("ul.EntityList-items li.EntityList-item a.link[href]").unwrap()
});
static CANONICAL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("link[rel=\"canonical\"][href]").unwrap());

/// Reads a listing page.
pub trait EntryExtractor: Send + Sync {
    /// Absolute entry URLs on the page.
    fn entries(&self, html: &str) -> BTreeSet<String>;

    /// `<link rel="canonical">` target, if any.
    fn canonical(&self, html: &str) -> Option<String>;
}

#[derive(Debug, Clone, Default)]
pub struct HtmlEntryExtractor;

impl EntryExtractor for HtmlEntryExtractor {
    fn entries(&self, html: &str) -> BTreeSet<String> {
        let document = Html::parse_document(html);
        let root = Url::parse(SITE_ROOT).ok();
        let mut urls = BTreeSet::new();

        for section in document.select(&SECTION) {
            let is_ad_group = section.select(&GROUP_TITLE).next().is_some_and(|h2| {
                let title = h2.text().map(str::trim).collect::<String>();
                AD_GROUP_TITLES.contains(&title.as_str())
            });
            if !is_ad_group {
                continue;
            }
            for link in section.select(&ENTRY_LINK) {
                let Some(href) = link.value().attr("href").map(str::trim) else {
                    continue;
                };
                if href.is_empty() {
                    continue;
                }
                let absolute = match &root {
                    Some(root) => match root.join(href) {
                        Ok(url) => url.to_string(),
                        Err(_) => continue,
                    },
                    None => href.to_string(),
                };
                urls.insert(absolute);
            }
        }
        urls
    }

    fn canonical(&self, html: &str) -> Option<String> {
        let document = Html::parse_document(html);
        document
            .select(&CANONICAL)
            .next()
            .and_then(|link| link.value().attr("href"))
            .map(|href| href.trim().to_string())
            .filter(|href| !href.is_empty())
    }
}
