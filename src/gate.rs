use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::error::ConfigError;
use crate::resolve::{RatingResolution, ResolvedRecord};

/// One completeness or business condition a record must meet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Check {
    NotDlc,
    Rating,
    Title,
    Description,
    ReleaseDate,
    Developer,
    Publisher,
    Tags,
    MinimumRequirements,
    RecommendedRequirements,
    Media,
    HeaderImage,
}

impl Check {
    pub const DEFAULT_ORDER: [Check; 12] = [
        Check::NotDlc,
        Check::Rating,
        Check::Title,
        Check::Description,
        Check::ReleaseDate,
        Check::Developer,
        Check::Publisher,
        Check::Tags,
        Check::MinimumRequirements,
        Check::RecommendedRequirements,
        Check::Media,
        Check::HeaderImage,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Check::NotDlc => "dlc",
            Check::Rating => "rating",
            Check::Title => "title",
            Check::Description => "description",
            Check::ReleaseDate => "release-date",
            Check::Developer => "developer",
            Check::Publisher => "publisher",
            Check::Tags => "tags",
            Check::MinimumRequirements => "minimum-requirements",
            Check::RecommendedRequirements => "recommended-requirements",
            Check::Media => "media",
            Check::HeaderImage => "header-image",
        }
    }

    fn apply(self, r: &ResolvedRecord) -> Option<RejectReason> {
        let missing = |v: &Option<String>| v.is_none().then_some(RejectReason::Missing(self));
        let empty = |v: &Vec<String>| v.is_empty().then_some(RejectReason::Empty(self));
        match self {
            Check::NotDlc => r.is_dlc.then_some(RejectReason::Dlc),
            Check::Rating => match r.rating {
                RatingResolution::Rated(_) => None,
                RatingResolution::BelowFloor(_) => Some(RejectReason::RatingBelowFloor),
                RatingResolution::Absent => Some(RejectReason::RatingAbsent),
            },
            Check::Title => missing(&r.title),
            Check::Description => missing(&r.description),
            Check::ReleaseDate => missing(&r.release_date),
            Check::Developer => missing(&r.developer),
            Check::Publisher => missing(&r.publisher),
            Check::Tags => empty(&r.tags),
            Check::MinimumRequirements => empty(&r.minimum_requirements),
            Check::RecommendedRequirements => empty(&r.recommended_requirements),
            Check::Media => empty(&r.media_urls),
            Check::HeaderImage => missing(&r.header_image),
        }
    }
}

impl FromStr for Check {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Check::DEFAULT_ORDER
            .into_iter()
            .find(|c| c.name() == s.trim())
            .ok_or_else(|| ConfigError::GateCheck(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RejectReason {
    Dlc,
    RatingAbsent,
    RatingBelowFloor,
    Missing(Check),
    Empty(Check),
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::Dlc => f.write_str("dlc"),
            RejectReason::RatingAbsent => f.write_str("rating:absent"),
            RejectReason::RatingBelowFloor => f.write_str("rating:below-floor"),
            RejectReason::Missing(c) => write!(f, "missing:{}", c.name()),
            RejectReason::Empty(c) => write!(f, "empty:{}", c.name()),
        }
    }
}

impl Serialize for RejectReason {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case", tag = "verdict", content = "reason")]
pub enum ValidationVerdict {
    Accept,
    Reject(RejectReason),
}

/// Decides whether a record is worth persisting. Checks run in order and
/// the first failure is the reported reason.
#[derive(Debug, Clone)]
pub struct Gate {
    checks: Vec<Check>,
}

impl Default for Gate {
    fn default() -> Self {
        Gate {
            checks: Check::DEFAULT_ORDER.to_vec(),
        }
    }
}

impl Gate {
    pub fn new(checks: Vec<Check>) -> Self {
        Gate { checks }
    }

    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Result<Self, ConfigError> {
        let checks = names
            .iter()
            .map(|n| n.as_ref().parse())
            .collect::<Result<Vec<Check>, _>>()?;
        Ok(Gate::new(checks))
    }

    pub fn validate(&self, record: &ResolvedRecord) -> ValidationVerdict {
        self.checks
            .iter()
            .find_map(|c| c.apply(record))
            .map_or(ValidationVerdict::Accept, ValidationVerdict::Reject)
    }
}
