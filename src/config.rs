use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Deserialize;

use crate::error::ConfigError;

const ENV_PREFIX: &str = "HARVEST";
const DEFAULT_CONFIG_FILE: &str = "harvest";
/// Ceiling for `concurrency`; far above what one storefront tolerates.
pub const MAX_CONCURRENCY: usize = 1024;

const LISTING_TEMPLATE: &str = "https://store.steampowered.com/search/results/?query&start={start}&count={count}&dynamic_data=&sort_by={sort}&ignore_preferences=1&supportedlang={language}&os={platform}&snr=1_7_7_230_7&infinite=1";
const ITEM_PREFIX: &str = "https://store.steampowered.com/app/";
const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64)";
const RATING_PATTERN: &str = r"(?P<percent>\d{1,3})% of the (?P<count>[\d,.\s]+) user reviews";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub db_path: PathBuf,
    /// Upper bound on simultaneously in-flight requests.
    pub concurrency: usize,
    /// Maximum number of media URLs kept per record.
    pub media_cap: usize,
    /// Optional JSON file replacing the built-in field rules.
    pub rules_file: Option<PathBuf>,
    pub http: HttpSettings,
    pub listing: ListingSettings,
    pub rating: RatingSettings,
    pub retry: RetrySettings,
    pub gate: GateSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            db_path: PathBuf::from("data/catalog.sqlite"),
            concurrency: 10,
            media_cap: 4,
            rules_file: None,
            http: HttpSettings::default(),
            listing: ListingSettings::default(),
            rating: RatingSettings::default(),
            retry: RetrySettings::default(),
            gate: GateSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpSettings {
    pub user_agent: String,
    pub accept_language: String,
    pub cookies: BTreeMap<String, String>,
    pub headers: BTreeMap<String, String>,
    pub timeout_secs: u64,
    pub verify_tls: bool,
}

impl Default for HttpSettings {
    fn default() -> Self {
        // Locale plus the age-gate bypass the store checks on mature titles.
        let cookies = [
            ("Steam_Language", "english"),
            ("birthtime", "0"),
            ("lastagecheckage", "1-0-1990"),
            ("wants_mature_content", "1"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        HttpSettings {
            user_agent: USER_AGENT.to_string(),
            accept_language: "en-US,en;q=0.9".to_string(),
            cookies,
            headers: BTreeMap::new(),
            timeout_secs: 30,
            verify_tls: true,
        }
    }
}

impl HttpSettings {
    /// `name=value; name=value`, or `None` when no cookies are configured.
    pub fn cookie_header(&self) -> Option<String> {
        if self.cookies.is_empty() {
            return None;
        }
        let pairs: Vec<String> = self
            .cookies
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        Some(pairs.join("; "))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ListingSettings {
    pub url_template: String,
    pub page_size: u32,
    pub language: String,
    pub platform: String,
    pub sort_by: String,
    pub item_prefix: String,
    pub pages: PageRange,
}

impl Default for ListingSettings {
    fn default() -> Self {
        ListingSettings {
            url_template: LISTING_TEMPLATE.to_string(),
            page_size: 50,
            language: "english".to_string(),
            platform: "win".to_string(),
            sort_by: "_ASC".to_string(),
            item_prefix: ITEM_PREFIX.to_string(),
            pages: PageRange::default(),
        }
    }
}

impl ListingSettings {
    pub fn listing_url(&self, start: u32) -> String {
        self.url_template
            .replace("{start}", &start.to_string())
            .replace("{count}", &self.page_size.to_string())
            .replace("{sort}", &self.sort_by)
            .replace("{language}", &self.language)
            .replace("{platform}", &self.platform)
    }

    pub fn listing_urls(&self) -> Vec<String> {
        self.pages
            .offsets()
            .into_iter()
            .map(|start| self.listing_url(start))
            .collect()
    }
}

/// Listing offsets `start..=end`, stepping by `stride`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PageRange {
    pub start: u32,
    pub end: u32,
    pub stride: u32,
}

impl Default for PageRange {
    fn default() -> Self {
        PageRange {
            start: 0,
            end: 100,
            stride: 50,
        }
    }
}

impl PageRange {
    pub fn offsets(&self) -> Vec<u32> {
        if self.stride == 0 || self.start > self.end {
            return Vec::new();
        }
        (self.start..=self.end).step_by(self.stride as usize).collect()
    }

    fn check(&self, input: &str) -> Result<(), ConfigError> {
        let fail = |reason: &str| ConfigError::PageRange {
            input: input.to_string(),
            reason: reason.to_string(),
        };
        if self.stride == 0 {
            return Err(fail("stride must be positive"));
        }
        if self.start > self.end {
            return Err(fail("start is after end"));
        }
        Ok(())
    }
}

/// Parses `START:END` or `START:END:STRIDE`. The stride defaults to 50.
impl FromStr for PageRange {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fail = |reason: &str| ConfigError::PageRange {
            input: s.to_string(),
            reason: reason.to_string(),
        };
        let parts: Vec<&str> = s.trim().split(':').collect();
        if parts.len() < 2 || parts.len() > 3 {
            return Err(fail("expected START:END or START:END:STRIDE"));
        }
        let num = |p: &str| p.trim().parse::<u32>().map_err(|_| fail("not a number"));
        let range = PageRange {
            start: num(parts[0])?,
            end: num(parts[1])?,
            stride: match parts.get(2) {
                Some(p) => num(p)?,
                None => PageRange::default().stride,
            },
        };
        range.check(s)?;
        Ok(range)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RatingSettings {
    /// Regex with `percent` and `count` named groups.
    pub pattern: String,
    /// Records with fewer reviews than this never pass the gate.
    pub min_reviews: u64,
}

impl Default for RatingSettings {
    fn default() -> Self {
        RatingSettings {
            pattern: RATING_PATTERN.to_string(),
            min_reviews: 1000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Extra attempts for transient fetch failures. 0 disables retrying.
    pub attempts: u32,
    pub delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        RetrySettings {
            attempts: 1,
            delay_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GateSettings {
    /// Checks run in order; see `gate::Check` for the names.
    pub checks: Vec<String>,
}

impl Default for GateSettings {
    fn default() -> Self {
        GateSettings {
            checks: crate::gate::Check::DEFAULT_ORDER
                .iter()
                .map(|c| c.name().to_string())
                .collect(),
        }
    }
}

impl Settings {
    /// Defaults, then `harvest.toml` (or `path`), then `HARVEST__*` env vars.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let file = match path {
            Some(p) => config::File::from(p.to_path_buf()).required(true),
            None => config::File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };
        let settings: Settings = config::Config::builder()
            .add_source(file)
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 || self.concurrency > MAX_CONCURRENCY {
            return Err(ConfigError::Invalid(format!(
                "concurrency must be between 1 and {}, got {}",
                MAX_CONCURRENCY, self.concurrency
            )));
        }
        if self.media_cap == 0 {
            return Err(ConfigError::Invalid("media_cap must be at least 1".into()));
        }
        if self.listing.page_size == 0 {
            return Err(ConfigError::Invalid("listing.page_size must be at least 1".into()));
        }
        let p = self.listing.pages;
        p.check(&format!("{}:{}:{}", p.start, p.end, p.stride))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_range_matches_three_pages() {
        assert_eq!(PageRange::default().offsets(), vec![0, 50, 100]);
    }

    #[test]
    fn parse_range_with_stride() {
        let r: PageRange = "0:200:100".parse().unwrap();
        assert_eq!(r.offsets(), vec![0, 100, 200]);
    }

    #[test]
    fn parse_range_default_stride() {
        let r: PageRange = "50:150".parse().unwrap();
        assert_eq!(r.stride, 50);
        assert_eq!(r.offsets(), vec![50, 100, 150]);
    }

    #[test]
    fn single_page_range() {
        let r: PageRange = "0:0".parse().unwrap();
        assert_eq!(r.offsets(), vec![0]);
    }

    #[test]
    fn bad_ranges_are_errors() {
        for input in ["", "10", "a:b", "100:0", "0:100:0", "0:1:2:3"] {
            assert!(
                matches!(input.parse::<PageRange>(), Err(ConfigError::PageRange { .. })),
                "expected error for {:?}",
                input
            );
        }
    }

    #[test]
    fn listing_url_fills_template() {
        let listing = ListingSettings::default();
        let url = listing.listing_url(50);
        assert!(url.contains("start=50&count=50"));
        assert!(url.contains("supportedlang=english&os=win"));
        assert!(!url.contains('{'));
        assert_eq!(listing.listing_urls().len(), 3);
    }

    #[test]
    fn cookie_header_joins_pairs() {
        let mut http = HttpSettings::default();
        http.cookies.clear();
        assert_eq!(http.cookie_header(), None);
        http.cookies.insert("birthtime".into(), "0".into());
        http.cookies.insert("Steam_Language".into(), "russian".into());
        assert_eq!(
            http.cookie_header().as_deref(),
            Some("Steam_Language=russian; birthtime=0")
        );
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let settings = Settings {
            concurrency: 0,
            ..Settings::default()
        };
        assert!(settings.validate().is_err());
        assert!(Settings::default().validate().is_ok());
    }

    #[test]
    fn concurrency_above_ceiling_is_rejected() {
        let at_ceiling = Settings {
            concurrency: MAX_CONCURRENCY,
            ..Settings::default()
        };
        assert!(at_ceiling.validate().is_ok());

        let over = Settings {
            concurrency: usize::MAX,
            ..Settings::default()
        };
        match over.validate() {
            Err(ConfigError::Invalid(msg)) => assert!(msg.contains("concurrency"), "{msg}"),
            other => panic!("expected Invalid, got {other:?}"),
        }
    }

    #[test]
    fn zero_media_cap_is_rejected() {
        let settings = Settings {
            media_cap: 0,
            ..Settings::default()
        };
        match settings.validate() {
            Err(ConfigError::Invalid(msg)) => assert!(msg.contains("media_cap"), "{msg}"),
            other => panic!("expected Invalid, got {other:?}"),
        }
    }
}
