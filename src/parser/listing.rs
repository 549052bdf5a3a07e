use std::collections::HashSet;
use std::sync::LazyLock;

use scraper::{Html, Selector};
use serde::Deserialize;
use url::Url;

static ANCHOR: LazyLock<Selector> = LazyLock::new(|| Selector::parse("a[href]").unwrap());

/// The JSON envelope the search endpoint returns in infinite-scroll mode.
#[derive(Debug, Deserialize)]
pub struct ListingPage {
    pub results_html: String,
    #[serde(default)]
    pub total_count: Option<u64>,
}

pub fn parse_listing(body: &str) -> Result<ListingPage, serde_json::Error> {
    serde_json::from_str(body)
}

/// Item URLs in the fragment whose target starts with `prefix`,
/// normalized and deduplicated in document order.
pub fn item_urls(fragment: &str, prefix: &str) -> Vec<String> {
    let html = Html::parse_fragment(fragment);
    let mut seen = HashSet::new();
    html.select(&ANCHOR)
        .filter_map(|a| a.value().attr("href"))
        .filter(|href| href.starts_with(prefix))
        .filter_map(normalize_item_url)
        .filter(|url| seen.insert(url.clone()))
        .collect()
}

/// Drops the tracking query string and fragment so the same item
/// reached from different pages compares equal.
pub fn normalize_item_url(href: &str) -> Option<String> {
    let mut url = Url::parse(href.trim()).ok()?;
    url.set_query(None);
    url.set_fragment(None);
    Some(url.to_string())
}
