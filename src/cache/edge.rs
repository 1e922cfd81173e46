//! Edge (CDN) cache policy: response headers, ETags and purge requests.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, error, info};

use super::category::CacheCategory;
use super::tasks::BackgroundTasks;
use super::ttl::{CacheHeaders, TtlPolicyManager, expires_in};

pub(crate) const METRIC_EDGE_PURGE: &str = "cachekeeper_edge_purge_total";

/// Longest stale-while-revalidate window offered to the edge.
const MAX_SWR_SECS: u64 = 3600;

#[derive(Debug, Error)]
pub enum PurgeError {
    #[error("purge request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("purge endpoint answered {status}")]
    Status { status: u16 },
    #[error("purge timed out after {0:?}")]
    Timeout(Duration),
}

/// What kind of content a response carries, for header selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentCategory {
    StaticAsset,
    /// Varies by `Accept-Language`.
    Localized,
    /// API responses scoped to the calling principal.
    PrincipalApi,
    Document,
    Generic,
}

impl ContentCategory {
    /// TTL category used when the caller does not name one.
    pub fn default_ttl_category(self) -> CacheCategory {
        match self {
            Self::StaticAsset => CacheCategory::EdgeAsset,
            Self::Localized => CacheCategory::Translation,
            Self::PrincipalApi => CacheCategory::Record,
            Self::Document => CacheCategory::Document,
            Self::Generic => CacheCategory::Unknown("generic".to_string()),
        }
    }

    pub fn vary(self) -> &'static str {
        match self {
            Self::Localized => "Accept-Encoding, Accept-Language",
            Self::PrincipalApi => "Accept-Encoding, Accept, Authorization",
            _ => "Accept-Encoding",
        }
    }
}

/// Sends purge requests to the edge.
#[async_trait]
pub trait CdnPurger: Send + Sync {
    async fn purge(&self, paths: &[String]) -> Result<(), PurgeError>;
}

/// Purger for deployments without an edge.
#[derive(Debug, Default)]
pub struct NoopPurger;

#[async_trait]
impl CdnPurger for NoopPurger {
    async fn purge(&self, paths: &[String]) -> Result<(), PurgeError> {
        debug!(paths = ?paths, "No edge configured; purge skipped");
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct PurgeRequest<'a> {
    paths: &'a [String],
}

/// POSTs `{"paths": [...]}` to a purge endpoint.
#[derive(Debug, Clone)]
pub struct HttpPurger {
    client: Client,
    endpoint: String,
    token: Option<String>,
}

impl HttpPurger {
    pub fn new(endpoint: impl Into<String>, token: Option<String>) -> Result<Self, PurgeError> {
        let client = Client::builder()
            .user_agent(concat!("cachekeeper/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            token,
        })
    }
}

#[async_trait]
impl CdnPurger for HttpPurger {
    async fn purge(&self, paths: &[String]) -> Result<(), PurgeError> {
        let mut request = self.client.post(&self.endpoint).json(&PurgeRequest { paths });
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(PurgeError::Status {
                status: status.as_u16(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct PurgeCounters {
    succeeded: AtomicU64,
    failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PurgeStats {
    pub succeeded: u64,
    pub failed: u64,
}

pub struct EdgeCachePolicy {
    ttl: Arc<TtlPolicyManager>,
    purger: Arc<dyn CdnPurger>,
    tasks: Arc<BackgroundTasks>,
    purge_timeout: Duration,
    counters: Arc<PurgeCounters>,
}

impl EdgeCachePolicy {
    pub fn new(
        ttl: Arc<TtlPolicyManager>,
        purger: Arc<dyn CdnPurger>,
        tasks: Arc<BackgroundTasks>,
        purge_timeout: Duration,
    ) -> Self {
        Self {
            ttl,
            purger,
            tasks,
            purge_timeout,
            counters: Arc::new(PurgeCounters::default()),
        }
    }

    /// Headers for a response of `content`.
    ///
    /// `ttl_category` overrides the content's default TTL category. Private
    /// responses never carry `s-maxage`.
    pub fn cache_headers(
        &self,
        content: ContentCategory,
        ttl_category: Option<&CacheCategory>,
        private: bool,
    ) -> CacheHeaders {
        let fallback = content.default_ttl_category();
        let category = ttl_category.unwrap_or(&fallback);
        if !self.ttl.should_cache(category) {
            return CacheHeaders {
                cache_control: "no-store".to_string(),
                expires: None,
                vary: content.vary().to_string(),
            };
        }

        let ttl = self.ttl.ttl(category);
        let mut directives = Vec::with_capacity(4);
        directives.push(if private { "private".to_string() } else { "public".to_string() });
        directives.push(format!("max-age={ttl}"));
        if !private {
            directives.push(format!("s-maxage={ttl}"));
        }
        if ttl > 60 {
            directives.push(format!("stale-while-revalidate={}", (ttl / 2).min(MAX_SWR_SECS)));
        }

        CacheHeaders {
            cache_control: directives.join(", "),
            expires: Some(expires_in(ttl)),
            vary: content.vary().to_string(),
        }
    }

    /// Purge and wait. Failures are logged and reported as `false`.
    pub async fn purge(&self, paths: &[String]) -> bool {
        purge_with(&*self.purger, &self.counters, paths, self.purge_timeout).await
    }

    /// Purge on a tracked background task; the caller does not wait.
    pub fn purge_in_background(&self, paths: Vec<String>) {
        if paths.is_empty() {
            return;
        }
        let purger = self.purger.clone();
        let counters = self.counters.clone();
        let timeout = self.purge_timeout;
        self.tasks.spawn("edge_purge", move |_signal| async move {
            purge_with(&*purger, &counters, &paths, timeout).await;
        });
    }

    pub fn purge_stats(&self) -> PurgeStats {
        PurgeStats {
            succeeded: self.counters.succeeded.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }
}

async fn purge_with(
    purger: &dyn CdnPurger,
    counters: &PurgeCounters,
    paths: &[String],
    timeout: Duration,
) -> bool {
    let outcome = match tokio::time::timeout(timeout, purger.purge(paths)).await {
        Ok(result) => result,
        Err(_) => Err(PurgeError::Timeout(timeout)),
    };
    match outcome {
        Ok(()) => {
            counters.succeeded.fetch_add(1, Ordering::Relaxed);
            counter!(METRIC_EDGE_PURGE, "result" => "ok").increment(1);
            info!(paths = ?paths, "Edge purge completed");
            true
        }
        Err(err) => {
            counters.failed.fetch_add(1, Ordering::Relaxed);
            counter!(METRIC_EDGE_PURGE, "result" => "error").increment(1);
            error!(paths = ?paths, error = %err, "Edge purge failed");
            false
        }
    }
}

/// Strong ETag over the response body.
pub fn etag(body: &[u8]) -> String {
    let digest = Sha256::digest(body);
    format!("\"{}\"", hex::encode(&digest[..16]))
}

/// True when an `If-None-Match` value matches `etag`.
pub fn etag_matches(if_none_match: &str, etag: &str) -> bool {
    let bare = etag.trim_start_matches("W/");
    if_none_match.split(',').map(str::trim).any(|candidate| {
        candidate == "*" || candidate.trim_start_matches("W/") == bare
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct RecordingPurger {
        calls: Mutex<Vec<Vec<String>>>,
        fail: bool,
    }

    #[async_trait]
    impl CdnPurger for RecordingPurger {
        async fn purge(&self, paths: &[String]) -> Result<(), PurgeError> {
            self.calls.lock().expect("lock").push(paths.to_vec());
            if self.fail {
                Err(PurgeError::Status { status: 503 })
            } else {
                Ok(())
            }
        }
    }

    fn policy(purger: Arc<dyn CdnPurger>) -> EdgeCachePolicy {
        EdgeCachePolicy::new(
            Arc::new(TtlPolicyManager::default()),
            purger,
            Arc::new(BackgroundTasks::new()),
            Duration::from_secs(1),
        )
    }

    #[test]
    fn static_assets_are_public_with_swr() {
        let policy = policy(Arc::new(NoopPurger));
        let headers = policy.cache_headers(ContentCategory::StaticAsset, None, false);
        assert_eq!(
            headers.cache_control,
            "public, max-age=604800, s-maxage=604800, stale-while-revalidate=3600"
        );
        assert_eq!(headers.vary, "Accept-Encoding");
        assert!(headers.expires.is_some());
    }

    #[test]
    fn localized_content_varies_by_language() {
        let policy = policy(Arc::new(NoopPurger));
        let headers = policy.cache_headers(ContentCategory::Localized, None, false);
        assert!(headers.vary.contains("Accept-Language"));
        assert!(headers.cache_control.contains("stale-while-revalidate=3600"));
    }

    #[test]
    fn private_responses_omit_shared_max_age() {
        let policy = policy(Arc::new(NoopPurger));
        let headers = policy.cache_headers(ContentCategory::PrincipalApi, None, true);
        assert_eq!(headers.cache_control, "private, max-age=300, stale-while-revalidate=150");
        assert_eq!(headers.vary, "Accept-Encoding, Accept, Authorization");
    }

    #[test]
    fn short_ttls_skip_stale_while_revalidate() {
        let ttl = TtlPolicyManager::with_overrides([("record", 30)]).expect("override");
        let policy = EdgeCachePolicy::new(
            Arc::new(ttl),
            Arc::new(NoopPurger),
            Arc::new(BackgroundTasks::new()),
            Duration::from_secs(1),
        );
        let headers = policy.cache_headers(ContentCategory::PrincipalApi, None, true);
        assert_eq!(headers.cache_control, "private, max-age=30");
    }

    #[test]
    fn uncacheable_categories_get_no_store() {
        let policy = policy(Arc::new(NoopPurger));
        let headers =
            policy.cache_headers(ContentCategory::Generic, Some(&CacheCategory::Realtime), false);
        assert_eq!(headers.cache_control, "no-store");
    }

    #[tokio::test]
    async fn failed_purge_is_counted_not_raised() {
        let purger = Arc::new(RecordingPurger {
            fail: true,
            ..Default::default()
        });
        let policy = policy(purger.clone());
        assert!(!policy.purge(&["/i18n/fr/*".to_string()]).await);
        assert_eq!(policy.purge_stats(), PurgeStats { succeeded: 0, failed: 1 });
        assert_eq!(purger.calls.lock().expect("lock").len(), 1);
    }

    #[test]
    fn etag_matching_accepts_weak_and_lists() {
        let tag = etag(b"hello");
        assert!(etag_matches(&tag, &tag));
        assert!(etag_matches(&format!("\"other\", W/{tag}"), &tag));
        assert!(etag_matches("*", &tag));
        assert!(!etag_matches("\"other\"", &tag));
    }
}
