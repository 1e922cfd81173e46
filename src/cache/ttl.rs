//! Per-category TTL policy.
//!
//! Every category maps to a base TTL, a cacheable flag and a visibility. TTLs
//! written to the store are jittered so entries populated together do not all
//! expire in the same instant.

use std::collections::HashMap;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use time::OffsetDateTime;
use time::macros::format_description;

use super::category::CacheCategory;

/// Fallback TTL for categories without a policy.
pub const DEFAULT_TTL_SECS: u64 = 300;
/// Jitter is capped at half the base TTL.
pub const MAX_JITTER_PERCENT: u8 = 50;

const NO_STORE: &str = "no-store, no-cache, must-revalidate";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TtlError {
    #[error("ttl override for `{category}` must be non-negative, got {value}")]
    Negative { category: String, value: i64 },
    #[error("ttl override names unknown category `{0}`")]
    UnknownCategory(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Public,
    Private,
}

impl Visibility {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Private => "private",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtlPolicy {
    pub base_ttl_secs: u64,
    pub cacheable: bool,
    pub visibility: Visibility,
}

impl TtlPolicy {
    const fn new(base_ttl_secs: u64, cacheable: bool, visibility: Visibility) -> Self {
        Self {
            base_ttl_secs,
            cacheable,
            visibility,
        }
    }
}

/// Header triple for HTTP-level caching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheHeaders {
    pub cache_control: String,
    pub expires: Option<String>,
    pub vary: String,
}

fn builtin_policy(category: &CacheCategory) -> Option<TtlPolicy> {
    use Visibility::{Private, Public};
    let policy = match category {
        CacheCategory::Session => TtlPolicy::new(1800, true, Private),
        CacheCategory::Profile => TtlPolicy::new(3600, true, Private),
        CacheCategory::Record => TtlPolicy::new(300, true, Private),
        CacheCategory::Translation => TtlPolicy::new(86_400, true, Public),
        CacheCategory::SearchResult => TtlPolicy::new(600, true, Private),
        CacheCategory::Aggregate => TtlPolicy::new(900, true, Private),
        CacheCategory::Document => TtlPolicy::new(3600, true, Public),
        CacheCategory::EdgeAsset => TtlPolicy::new(604_800, true, Public),
        CacheCategory::Realtime => TtlPolicy::new(0, false, Private),
        CacheCategory::Unknown(_) => return None,
    };
    Some(policy)
}

/// Category to policy table with the default fallback.
#[derive(Debug, Clone)]
pub struct TtlPolicyManager {
    policies: HashMap<CacheCategory, TtlPolicy>,
    fallback: TtlPolicy,
}

impl Default for TtlPolicyManager {
    fn default() -> Self {
        let policies = CacheCategory::known()
            .into_iter()
            .filter_map(|category| builtin_policy(&category).map(|policy| (category, policy)))
            .collect();
        Self {
            policies,
            fallback: TtlPolicy::new(DEFAULT_TTL_SECS, true, Visibility::Private),
        }
    }
}

impl TtlPolicyManager {
    /// Built-in table with base TTLs replaced by `overrides`.
    ///
    /// A zero override disables caching for the category.
    pub fn with_overrides<'a>(
        overrides: impl IntoIterator<Item = (&'a str, i64)>,
    ) -> Result<Self, TtlError> {
        let mut manager = Self::default();
        for (name, value) in overrides {
            let category = CacheCategory::parse(name);
            if !category.is_known() {
                return Err(TtlError::UnknownCategory(name.to_string()));
            }
            let secs = u64::try_from(value).map_err(|_| TtlError::Negative {
                category: name.to_string(),
                value,
            })?;
            let policy = manager
                .policies
                .entry(category)
                .or_insert(manager.fallback);
            policy.base_ttl_secs = secs;
            policy.cacheable = secs > 0;
        }
        Ok(manager)
    }

    pub fn policy(&self, category: &CacheCategory) -> TtlPolicy {
        self.policies.get(category).copied().unwrap_or(self.fallback)
    }

    /// Base TTL in seconds; unknown categories get [`DEFAULT_TTL_SECS`].
    pub fn ttl(&self, category: &CacheCategory) -> u64 {
        self.policy(category).base_ttl_secs
    }

    pub fn should_cache(&self, category: &CacheCategory) -> bool {
        let policy = self.policy(category);
        policy.cacheable && policy.base_ttl_secs > 0
    }

    /// Base TTL offset by a uniform draw from `±base * percent / 100`.
    ///
    /// Percent is clamped to [`MAX_JITTER_PERCENT`]. Non-cacheable categories
    /// yield zero.
    pub fn ttl_with_jitter(&self, category: &CacheCategory, jitter_percent: u8) -> u64 {
        if !self.should_cache(category) {
            return 0;
        }
        let base = self.ttl(category);
        jitter(base, jitter_percent, &mut rand::rng())
    }

    /// Jittered TTL as a [`Duration`], `None` when the category is not cacheable.
    pub fn store_ttl(&self, category: &CacheCategory, jitter_percent: u8) -> Option<Duration> {
        match self.ttl_with_jitter(category, jitter_percent) {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// Headers for a response of this category.
    ///
    /// Credentials downgrade public categories to private.
    pub fn cache_headers(&self, category: &CacheCategory, has_credentials: bool) -> CacheHeaders {
        if !self.should_cache(category) {
            return CacheHeaders {
                cache_control: NO_STORE.to_string(),
                expires: Some("0".to_string()),
                vary: "Accept-Encoding".to_string(),
            };
        }

        let policy = self.policy(category);
        let visibility = if has_credentials {
            Visibility::Private
        } else {
            policy.visibility
        };
        let ttl = policy.base_ttl_secs;
        let vary = match visibility {
            Visibility::Public => "Accept-Encoding",
            Visibility::Private => "Accept-Encoding, Authorization",
        };

        CacheHeaders {
            cache_control: format!("{}, max-age={ttl}", visibility.as_str()),
            expires: Some(expires_in(ttl)),
            vary: vary.to_string(),
        }
    }
}

pub(crate) fn jitter<R: Rng + ?Sized>(base: u64, jitter_percent: u8, rng: &mut R) -> u64 {
    let percent = jitter_percent.min(MAX_JITTER_PERCENT);
    if base == 0 || percent == 0 {
        return base;
    }
    let spread = base as f64 * f64::from(percent) / 100.0;
    let offset = rng.random_range(-spread..=spread);
    let low = (base as f64 - spread).ceil();
    let high = (base as f64 + spread).floor();
    (base as f64 + offset).round().clamp(low, high).max(1.0) as u64
}

/// HTTP-date `ttl` seconds from now.
pub fn expires_in(ttl_secs: u64) -> String {
    let ttl = time::Duration::seconds(i64::try_from(ttl_secs).unwrap_or(i64::MAX / 2));
    let at = OffsetDateTime::now_utc().saturating_add(ttl);
    http_date(at)
}

/// IMF-fixdate rendering, e.g. `Sun, 06 Nov 1994 08:49:37 GMT`.
pub fn http_date(at: OffsetDateTime) -> String {
    let format = format_description!(
        "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT"
    );
    at.to_offset(time::UtcOffset::UTC)
        .format(&format)
        .unwrap_or_else(|_| "0".to_string())
}
