//! Cache categories: the unit of TTL and cacheability policy.

use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;

use serde::{Serialize, Serializer};

/// Semantic category every cached value belongs to.
///
/// Unrecognised names are preserved in [`CacheCategory::Unknown`] so they can
/// fall back to the default policy instead of failing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CacheCategory {
    /// Login sessions and short-lived principal state.
    Session,
    /// User and practitioner profiles.
    Profile,
    /// Primary-store records (patients, encounters, ...).
    Record,
    /// Translation lookups; change rarely.
    Translation,
    /// Search result pages.
    SearchResult,
    /// Counts and other aggregate query results.
    Aggregate,
    /// Rendered documents.
    Document,
    /// Static assets served through the edge.
    EdgeAsset,
    /// Live readings that must never be cached.
    Realtime,
    /// Any category name not known at compile time.
    Unknown(String),
}

impl CacheCategory {
    /// Every category with a built-in policy.
    pub fn known() -> [CacheCategory; 9] {
        [
            Self::Session,
            Self::Profile,
            Self::Record,
            Self::Translation,
            Self::SearchResult,
            Self::Aggregate,
            Self::Document,
            Self::EdgeAsset,
            Self::Realtime,
        ]
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Session => "session",
            Self::Profile => "profile",
            Self::Record => "record",
            Self::Translation => "translation",
            Self::SearchResult => "search_result",
            Self::Aggregate => "aggregate",
            Self::Document => "document",
            Self::EdgeAsset => "edge_asset",
            Self::Realtime => "realtime",
            Self::Unknown(raw) => raw.as_str(),
        }
    }

    /// Parse a category name. Hyphens and case are normalised; anything else
    /// becomes [`CacheCategory::Unknown`].
    pub fn parse(raw: &str) -> Self {
        let normalized = raw.trim().to_ascii_lowercase().replace('-', "_");
        match normalized.as_str() {
            "session" => Self::Session,
            "profile" => Self::Profile,
            "record" => Self::Record,
            "translation" => Self::Translation,
            "search_result" | "search" => Self::SearchResult,
            "aggregate" => Self::Aggregate,
            "document" => Self::Document,
            "edge_asset" | "static" => Self::EdgeAsset,
            "realtime" => Self::Realtime,
            _ => Self::Unknown(raw.trim().to_string()),
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown(_))
    }
}

impl FromStr for CacheCategory {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse(s))
    }
}

impl fmt::Display for CacheCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for CacheCategory {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}
