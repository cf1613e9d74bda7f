//! Category tree node.

use serde::{Deserialize, Serialize};

fn is_false(value: &bool) -> bool {
    !*value
}

/// One node of the category hierarchy.
///
/// Either `children` is non-empty or `is_leaf` is set. Anti-bot nodes are the
/// exception: no children, not a leaf, and never exported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryNode {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub children: Vec<CategoryNode>,
    #[serde(default)]
    pub is_leaf: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub antibot: bool,
    /// The page could not be fetched; kept as a leaf but not exported.
    #[serde(default, skip_serializing_if = "is_false")]
    pub fetch_failed: bool,
}

impl CategoryNode {
    pub fn leaf(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            children: Vec::new(),
            is_leaf: true,
            antibot: false,
            fetch_failed: false,
        }
    }

    pub fn branch(name: impl Into<String>, url: impl Into<String>, children: Vec<CategoryNode>) -> Self {
        let is_leaf = children.is_empty();
        Self {
            name: name.into(),
            url: url.into(),
            children,
            is_leaf,
            antibot: false,
            fetch_failed: false,
        }
    }

    pub fn antibot(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            antibot: true,
            is_leaf: false,
            ..Self::leaf(name, url)
        }
    }

    pub fn failed(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            fetch_failed: true,
            ..Self::leaf(name, url)
        }
    }

    /// A leaf whose URL belongs in the leaf-URL export.
    pub fn is_exportable_leaf(&self) -> bool {
        self.is_leaf && !self.antibot && !self.fetch_failed
    }

    /// Exportable leaf URLs in depth-first order.
    pub fn leaf_urls(&self) -> Vec<String> {
        let mut urls = Vec::new();
        self.collect_leaf_urls(&mut urls);
        urls
    }

    fn collect_leaf_urls(&self, out: &mut Vec<String>) {
        if self.is_exportable_leaf() {
            out.push(self.url.clone());
        }
        for child in &self.children {
            child.collect_leaf_urls(out);
        }
    }

    /// Total number of nodes, this one included.
    pub fn node_count(&self) -> usize {
        1 + self.children.iter().map(|c| c.node_count()).sum::<usize>()
    }

    /// Whether the leaf/children invariant holds for the whole subtree.
    pub fn is_well_formed(&self) -> bool {
        let own = if self.antibot {
            !self.is_leaf && self.children.is_empty()
        } else {
            self.is_leaf == self.children.is_empty()
        };
        own && self.children.iter().all(|c| c.is_well_formed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> CategoryNode {
        CategoryNode::branch(
            "prodaja-stanova",
            "https://www.njuskalo.hr/prodaja-stanova",
            vec![
                CategoryNode::branch(
                    "Zagreb",
                    "https://www.njuskalo.hr/prodaja-stanova/zagreb",
                    vec![
                        CategoryNode::leaf("Trnje", "https://www.njuskalo.hr/prodaja-stanova/zagreb-trnje"),
                        CategoryNode::antibot("Dubrava", "https://www.njuskalo.hr/prodaja-stanova/zagreb-dubrava"),
                    ],
                ),
                CategoryNode::failed("Split", "https://www.njuskalo.hr/prodaja-stanova/split"),
                CategoryNode::leaf("Rijeka", "https://www.njuskalo.hr/prodaja-stanova/rijeka"),
            ],
        )
    }

    #[test]
    fn test_leaf_urls_skip_antibot_and_failed() {
        assert_eq!(
            sample().leaf_urls(),
            vec![
                "https://www.njuskalo.hr/prodaja-stanova/zagreb-trnje",
                "https://www.njuskalo.hr/prodaja-stanova/rijeka",
            ]
        );
    }

    #[test]
    fn test_well_formed() {
        let tree = sample();
        assert!(tree.is_well_formed());
        assert_eq!(tree.node_count(), 6);

        let mut broken = CategoryNode::leaf("x", "u");
        broken.children.push(CategoryNode::leaf("y", "v"));
        assert!(!broken.is_well_formed());
    }

    #[test]
    fn test_serde_omits_false_flags() {
        let json = serde_json::to_string(&CategoryNode::leaf("a", "b")).unwrap();
        assert!(!json.contains("antibot"));
        assert!(!json.contains("fetch_failed"));

        let parsed: CategoryNode =
            serde_json::from_str(r#"{"name":"a","url":"b","children":[],"antibot":true}"#).unwrap();
        assert!(parsed.antibot);
        assert!(!parsed.is_leaf);
    }
}
