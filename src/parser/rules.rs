use std::fmt;
use std::path::Path;

use scraper::Selector;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Every field the detail-page extractor knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FieldKey {
    Title,
    Description,
    RatingSummary,
    ReleaseDate,
    Developer,
    Publisher,
    Tags,
    DiscountPrice,
    StandardPrice,
    MinimumRequirements,
    RecommendedRequirements,
    MediaPrimary,
    MediaFallback,
    HeaderImage,
    DlcMarker,
}

impl FieldKey {
    pub const ALL: [FieldKey; 15] = [
        FieldKey::Title,
        FieldKey::Description,
        FieldKey::RatingSummary,
        FieldKey::ReleaseDate,
        FieldKey::Developer,
        FieldKey::Publisher,
        FieldKey::Tags,
        FieldKey::DiscountPrice,
        FieldKey::StandardPrice,
        FieldKey::MinimumRequirements,
        FieldKey::RecommendedRequirements,
        FieldKey::MediaPrimary,
        FieldKey::MediaFallback,
        FieldKey::HeaderImage,
        FieldKey::DlcMarker,
    ];

    pub fn name(self) -> &'static str {
        match self {
            FieldKey::Title => "title",
            FieldKey::Description => "description",
            FieldKey::RatingSummary => "rating-summary",
            FieldKey::ReleaseDate => "release-date",
            FieldKey::Developer => "developer",
            FieldKey::Publisher => "publisher",
            FieldKey::Tags => "tags",
            FieldKey::DiscountPrice => "discount-price",
            FieldKey::StandardPrice => "standard-price",
            FieldKey::MinimumRequirements => "minimum-requirements",
            FieldKey::RecommendedRequirements => "recommended-requirements",
            FieldKey::MediaPrimary => "media-primary",
            FieldKey::MediaFallback => "media-fallback",
            FieldKey::HeaderImage => "header-image",
            FieldKey::DlcMarker => "dlc-marker",
        }
    }
}

impl fmt::Display for FieldKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How a value is read off a matched element.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "mode")]
pub enum Access {
    /// All descendant text, whitespace-collapsed.
    Text,
    /// A named attribute.
    Attr { name: String },
    /// Descendant text minus bold/emphasis/label sub-nodes.
    /// Requirement lines look like `<strong>OS:</strong> Windows 10`.
    OwnText,
}

/// Only single-value rules carry a sentinel: a list rule that matches
/// nothing yields an empty list.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "kind", deny_unknown_fields)]
pub enum Cardinality {
    /// First match, or `Missing { sentinel }` when nothing matches.
    First { sentinel: String },
    All { cap: Option<usize> },
}

/// A rule as written in a rules file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleSpec {
    pub field: FieldKey,
    pub selector: String,
    pub access: Access,
    pub cardinality: Cardinality,
}

#[derive(Debug)]
pub struct FieldRule {
    pub field: FieldKey,
    pub selector: Selector,
    pub access: Access,
    pub cardinality: Cardinality,
}

/// Compiled rules in extraction order. Built once, then shared read-only.
#[derive(Debug)]
pub struct FieldRuleSet {
    rules: Vec<FieldRule>,
}

impl FieldRuleSet {
    /// Every `FieldKey` needs exactly one rule.
    pub fn compile(specs: Vec<RuleSpec>) -> Result<Self, ConfigError> {
        let mut rules: Vec<FieldRule> = Vec::with_capacity(specs.len());
        for spec in specs {
            if rules.iter().any(|r| r.field == spec.field) {
                return Err(ConfigError::Invalid(format!(
                    "field {} has more than one rule",
                    spec.field
                )));
            }
            let selector = Selector::parse(&spec.selector).map_err(|e| ConfigError::Selector {
                field: spec.field.to_string(),
                selector: spec.selector.clone(),
                reason: e.to_string(),
            })?;
            rules.push(FieldRule {
                field: spec.field,
                selector,
                access: spec.access,
                cardinality: spec.cardinality,
            });
        }
        let missing: Vec<&str> = FieldKey::ALL
            .iter()
            .filter(|key| !rules.iter().any(|r| r.field == **key))
            .map(|key| key.name())
            .collect();
        if !missing.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "no rule for field(s): {}",
                missing.join(", ")
            )));
        }
        Ok(FieldRuleSet { rules })
    }

    /// Rules from a JSON array of `RuleSpec`.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let fail = |reason: String| ConfigError::RulesFile {
            path: path.display().to_string(),
            reason,
        };
        let raw = std::fs::read_to_string(path).map_err(|e| fail(e.to_string()))?;
        let specs: Vec<RuleSpec> = serde_json::from_str(&raw).map_err(|e| fail(e.to_string()))?;
        Self::compile(specs)
    }

    /// Rules for the Steam store app page.
    pub fn storefront() -> Result<Self, ConfigError> {
        Self::compile(storefront_specs())
    }

    pub fn rules(&self) -> &[FieldRule] {
        &self.rules
    }
}

fn spec(field: FieldKey, selector: &str, access: Access, cardinality: Cardinality) -> RuleSpec {
    RuleSpec {
        field,
        selector: selector.to_string(),
        access,
        cardinality,
    }
}

fn first(sentinel: &str) -> Cardinality {
    Cardinality::First {
        sentinel: sentinel.to_string(),
    }
}

fn all(cap: Option<usize>) -> Cardinality {
    Cardinality::All { cap }
}

fn attr(name: &str) -> Access {
    Access::Attr { name: name.to_string() }
}

pub(crate) fn storefront_specs() -> Vec<RuleSpec> {
    use Access::{OwnText, Text};
    use FieldKey::*;

    vec![
        spec(Title, "div.apphub_AppName, #appHubAppName", Text, first("No title")),
        spec(Description, "div.game_description_snippet", Text, first("No description")),
        spec(RatingSummary, "div.user_reviews_summary_row", attr("data-tooltip-html"), first("No reviews")),
        spec(ReleaseDate, "div.release_date div.date", Text, first("No release date")),
        spec(Developer, "#developers_list a", Text, first("No developer")),
        spec(
            Publisher,
            "div.glance_ctn_responsive_left > div.dev_row + div.dev_row div.summary a",
            Text,
            first("No publisher"),
        ),
        spec(Tags, "a.app_tag", Text, all(Some(20))),
        spec(
            DiscountPrice,
            "div.game_area_purchase_game div.discount_block[data-price-final]",
            attr("data-price-final"),
            first("No discount"),
        ),
        spec(
            StandardPrice,
            "div.game_area_purchase_game div.game_purchase_price[data-price-final]",
            attr("data-price-final"),
            first("No price"),
        ),
        spec(
            MinimumRequirements,
            "div.game_area_sys_req_leftCol ul.bb_ul li, div.game_area_sys_req_full ul.bb_ul li",
            OwnText,
            all(None),
        ),
        spec(
            RecommendedRequirements,
            "div.game_area_sys_req_rightCol ul.bb_ul li",
            OwnText,
            all(None),
        ),
        spec(MediaPrimary, "a.highlight_screenshot_link", attr("href"), all(None)),
        spec(
            MediaFallback,
            "div.highlight_strip_screenshot img",
            attr("src"),
            all(None),
        ),
        spec(HeaderImage, "img.game_header_image_full", attr("src"), first("No header image")),
        spec(DlcMarker, "div.game_area_dlc_bubble", Text, first("Not DLC")),
    ]
}
