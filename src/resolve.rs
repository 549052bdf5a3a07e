use std::collections::HashSet;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;

use crate::config::Settings;
use crate::error::ConfigError;
use crate::parser::extract::{ExtractedRecord, FieldValue};
use crate::parser::rules::FieldKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Rating {
    pub percent: u8,
    pub count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case", tag = "status")]
pub enum RatingResolution {
    Rated(Rating),
    /// Parsed, but with fewer reviews than the configured floor.
    BelowFloor(Rating),
    /// No summary, or one the pattern could not read.
    Absent,
}

impl RatingResolution {
    pub fn rated(&self) -> Option<Rating> {
        match self {
            RatingResolution::Rated(r) => Some(*r),
            _ => None,
        }
    }
}

/// A record with typed, derived fields. Text fields are `None` where
/// extraction found nothing.
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedRecord {
    pub source_url: String,
    pub fetched_at: DateTime<Utc>,
    pub is_dlc: bool,
    pub title: Option<String>,
    pub description: Option<String>,
    pub rating_summary: Option<String>,
    pub rating: RatingResolution,
    pub release_date: Option<String>,
    pub developer: Option<String>,
    pub publisher: Option<String>,
    pub tags: Vec<String>,
    /// `Some(0)` is free; `None` means a price was present but unreadable.
    pub price_minor_units: Option<u64>,
    pub minimum_requirements: Vec<String>,
    pub recommended_requirements: Vec<String>,
    pub media_urls: Vec<String>,
    pub header_image: Option<String>,
}

pub struct Resolver {
    rating_pattern: Regex,
    min_reviews: u64,
    media_cap: usize,
}

impl Resolver {
    pub fn new(pattern: &str, min_reviews: u64, media_cap: usize) -> Result<Self, ConfigError> {
        let rating_pattern =
            Regex::new(pattern).map_err(|e| ConfigError::RatingPattern(e.to_string()))?;
        let names: Vec<&str> = rating_pattern.capture_names().flatten().collect();
        for group in ["percent", "count"] {
            if !names.contains(&group) {
                return Err(ConfigError::RatingPattern(format!(
                    "pattern has no `{}` group",
                    group
                )));
            }
        }
        Ok(Resolver {
            rating_pattern,
            min_reviews,
            media_cap,
        })
    }

    pub fn from_settings(settings: &Settings) -> Result<Self, ConfigError> {
        Self::new(
            &settings.rating.pattern,
            settings.rating.min_reviews,
            settings.media_cap,
        )
    }

    pub fn resolve(&self, record: ExtractedRecord) -> ResolvedRecord {
        let text = |key| record.text(key).map(str::to_string);
        let list = |key| record.list(key).to_vec();

        let rating_summary = text(FieldKey::RatingSummary);
        let rating = rating_summary
            .as_deref()
            .and_then(|s| self.parse_rating(s))
            .map(|r| {
                if r.count >= self.min_reviews {
                    RatingResolution::Rated(r)
                } else {
                    RatingResolution::BelowFloor(r)
                }
            })
            .unwrap_or(RatingResolution::Absent);

        ResolvedRecord {
            is_dlc: record.text(FieldKey::DlcMarker).is_some(),
            title: text(FieldKey::Title),
            description: text(FieldKey::Description),
            rating,
            rating_summary,
            release_date: text(FieldKey::ReleaseDate),
            developer: text(FieldKey::Developer),
            publisher: text(FieldKey::Publisher),
            tags: list(FieldKey::Tags),
            price_minor_units: resolve_price(&record),
            minimum_requirements: list(FieldKey::MinimumRequirements),
            recommended_requirements: list(FieldKey::RecommendedRequirements),
            media_urls: merge_media(
                record.list(FieldKey::MediaPrimary),
                record.list(FieldKey::MediaFallback),
                self.media_cap,
            ),
            header_image: text(FieldKey::HeaderImage),
            source_url: record.source_url,
            fetched_at: record.fetched_at,
        }
    }

    /// `(percent, count)` from a summary such as
    /// "93% of the 12,345 user reviews for this game are positive."
    pub fn parse_rating(&self, summary: &str) -> Option<Rating> {
        let caps = self.rating_pattern.captures(summary)?;
        let percent: u8 = caps.name("percent")?.as_str().trim().parse().ok()?;
        if percent > 100 {
            return None;
        }
        let count = parse_grouped_integer(caps.name("count")?.as_str())?;
        Some(Rating { percent, count })
    }
}

/// Discount beats standard; no price at all means free.
fn resolve_price(record: &ExtractedRecord) -> Option<u64> {
    let candidates: Vec<&str> = [FieldKey::DiscountPrice, FieldKey::StandardPrice]
        .into_iter()
        .filter_map(|key| match record.value(key) {
            Some(FieldValue::Text(t)) => Some(t.as_str()),
            _ => None,
        })
        .collect();

    if candidates.is_empty() {
        return Some(0);
    }
    candidates.into_iter().find_map(parse_grouped_integer)
}

/// Digits with optional thousands separators (`,` `.` space, nbsp).
/// Anything else makes the value unreadable.
fn parse_grouped_integer(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let mut digits = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '0'..='9' => digits.push(c),
            ',' | '.' | ' ' | '\u{a0}' | '\u{202f}' => {}
            _ => return None,
        }
    }
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}

/// Primary entries first, then fallback; first occurrence wins; capped.
fn merge_media(primary: &[String], fallback: &[String], cap: usize) -> Vec<String> {
    let mut seen = HashSet::new();
    primary
        .iter()
        .chain(fallback)
        .filter(|url| seen.insert(url.as_str()))
        .take(cap)
        .cloned()
        .collect()
}
