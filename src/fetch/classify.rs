//! Response classification shared by every fetch path.
//!
//! A body is checked for a bot challenge first and for proxy quota/deny
//! markers second. Neither kind of response is ever handed to a parser.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

static TITLE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<title[^>]*>(.*?)</title>").unwrap());

/// Which challenge a blocked response looked like.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockKind {
    ShieldSquare,
    Cloudflare,
    Captcha,
    AccessDenied,
    Other,
}

impl fmt::Display for BlockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockKind::ShieldSquare => write!(f, "ShieldSquare"),
            BlockKind::Cloudflare => write!(f, "Cloudflare"),
            BlockKind::Captcha => write!(f, "captcha"),
            BlockKind::AccessDenied => write!(f, "access-denied"),
            BlockKind::Other => write!(f, "bot-check"),
        }
    }
}

/// Outcome of classifying a 2xx body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseClass {
    Ok,
    /// Proxy-specific deny or quota exhaustion.
    Forbidden,
    /// Anti-automation challenge page.
    Blocked(BlockKind),
}

/// Marker lists used by [`Classifier`]. All matching is case-insensitive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifierConfig {
    /// Substrings of `<title>` that mean a challenge page.
    #[serde(default = "default_title_markers")]
    pub title_markers: Vec<String>,
    /// Substrings anywhere in the body that mean a challenge page.
    #[serde(default = "default_body_markers")]
    pub body_markers: Vec<String>,
    /// Substrings anywhere in the body that mean the proxy was refused.
    #[serde(default = "default_forbidden_markers")]
    pub forbidden_markers: Vec<String>,
}

fn default_title_markers() -> Vec<String> {
    ["shieldsquare captcha", "captcha", "just a moment", "attention required", "access denied"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_body_markers() -> Vec<String> {
    ["cf-challenge", "cf_chl_opt", "captcha-delivery"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_forbidden_markers() -> Vec<String> {
    ["forbidden", "insufficient flow", "errormsg"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            title_markers: default_title_markers(),
            body_markers: default_body_markers(),
            forbidden_markers: default_forbidden_markers(),
        }
    }
}

/// The one classifier every component uses.
#[derive(Debug, Clone, Default)]
pub struct Classifier {
    config: ClassifierConfig,
}

impl Classifier {
    pub fn new(config: ClassifierConfig) -> Self {
        let lower = |v: Vec<String>| v.into_iter().map(|s| s.to_lowercase()).collect();
        Self {
            config: ClassifierConfig {
                title_markers: lower(config.title_markers),
                body_markers: lower(config.body_markers),
                forbidden_markers: lower(config.forbidden_markers),
            },
        }
    }

    pub fn classify(&self, body: &str) -> ResponseClass {
        if body.is_empty() {
            return ResponseClass::Ok;
        }
        let lower = body.to_lowercase();
        if let Some(kind) = self.block_kind(&lower) {
            return ResponseClass::Blocked(kind);
        }
        if self
            .config
            .forbidden_markers
            .iter()
            .any(|m| lower.contains(m.as_str()))
        {
            return ResponseClass::Forbidden;
        }
        ResponseClass::Ok
    }

    fn block_kind(&self, lower: &str) -> Option<BlockKind> {
        let title = page_title(lower).unwrap_or_default();
        if title.contains("shieldsquare") {
            return Some(BlockKind::ShieldSquare);
        }
        let title_hit = self
            .config
            .title_markers
            .iter()
            .any(|m| title.contains(m.as_str()));
        let body_hit = self
            .config
            .body_markers
            .iter()
            .any(|m| lower.contains(m.as_str()));
        if !title_hit && !body_hit {
            return None;
        }
        Some(if lower.contains("cloudflare") || lower.contains("cf_chl") {
            BlockKind::Cloudflare
        } else if title.contains("access denied") {
            BlockKind::AccessDenied
        } else if title.contains("captcha") || lower.contains("captcha-delivery") {
            BlockKind::Captcha
        } else {
            BlockKind::Other
        })
    }
}

/// Trimmed text of the first `<title>` element.
pub fn page_title(html: &str) -> Option<String> {
    TITLE_RE
        .captures(html)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> Classifier {
        Classifier::new(ClassifierConfig::default())
    }

    #[test]
    fn test_shieldsquare_title() {
        let html = "<html><head><title>\n  ShieldSquare Captcha  \n</title></head></html>";
        assert_eq!(
            classifier().classify(html),
            ResponseClass::Blocked(BlockKind::ShieldSquare)
        );
    }

    #[test]
    fn test_forbidden_markers() {
        assert_eq!(
            classifier().classify(r#"{"errorMsg":"Insufficient flow"}"#),
            ResponseClass::Forbidden
        );
        assert_eq!(classifier().classify("403 Forbidden"), ResponseClass::Forbidden);
    }

    #[test]
    fn test_block_wins_over_forbidden() {
        let html = "<title>Access Denied</title><p>Forbidden</p>";
        assert_eq!(
            classifier().classify(html),
            ResponseClass::Blocked(BlockKind::AccessDenied)
        );
    }

    #[test]
    fn test_cloudflare_body_marker() {
        let html = "<title>Moment</title><script>window._cf_chl_opt={}</script>";
        assert_eq!(
            classifier().classify(html),
            ResponseClass::Blocked(BlockKind::Cloudflare)
        );
    }

    #[test]
    fn test_regular_listing_page_is_ok() {
        let html = r#"<html><head><title>Prodaja stanova Zagreb | Njuškalo</title></head>
            <body><section class="EntityList"></section></body></html>"#;
        assert_eq!(classifier().classify(html), ResponseClass::Ok);
    }

    #[test]
    fn test_captcha_word_outside_title_is_ok() {
        let html = "<title>Stan 50m2</title><script src=\"/recaptcha.js\"></script>";
        assert_eq!(classifier().classify(html), ResponseClass::Ok);
    }

    #[test]
    fn test_page_title() {
        assert_eq!(
            page_title("<TITLE lang=\"hr\"> Njuškalo </TITLE>").as_deref(),
            Some("Njuškalo")
        );
        assert_eq!(page_title("<p>no title</p>"), None);
    }
}
