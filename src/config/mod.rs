//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{collections::BTreeMap, net::SocketAddr, str::FromStr, time::Duration};

use axum::http::Method;
use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use url::Url;

use crate::cache::{CacheCategory, CacheConfig, ConfigError, ContentCategory};

mod cli;

pub use cli::{CheckArgs, CliArgs, Command, ServeArgs, ServeOverrides};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "cachekeeper";
const ENV_PREFIX: &str = "CACHEKEEPER";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 3080;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;

#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub cache: CacheConfig,
    pub edge: EdgeSettings,
    pub http: HttpSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
    pub graceful_shutdown: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone, Default)]
pub struct EdgeSettings {
    /// `None` disables CDN purges.
    pub purge_endpoint: Option<Url>,
    pub purge_token: Option<String>,
}

/// Which responses get caching headers.
#[derive(Debug, Clone)]
pub struct HttpSettings {
    /// Longest matching prefix wins.
    pub routes: Vec<RouteSettings>,
    pub cacheable_methods: Vec<Method>,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            routes: default_routes(),
            cacheable_methods: vec![Method::GET, Method::HEAD],
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RouteSettings {
    pub prefix: String,
    pub category: CacheCategory,
    pub content: ContentCategory,
    /// Credentialed requests keep shared caching only on public routes.
    pub public: bool,
}

impl HttpSettings {
    pub fn route_for(&self, path: &str) -> Option<&RouteSettings> {
        self.routes
            .iter()
            .filter(|route| path.starts_with(route.prefix.as_str()))
            .max_by_key(|route| route.prefix.len())
    }

    pub fn is_cacheable_method(&self, method: &Method) -> bool {
        self.cacheable_methods.contains(method)
    }
}

fn default_routes() -> Vec<RouteSettings> {
    vec![
        RouteSettings {
            prefix: "/static/".to_string(),
            category: CacheCategory::EdgeAsset,
            content: ContentCategory::StaticAsset,
            public: true,
        },
        RouteSettings {
            prefix: "/i18n/".to_string(),
            category: CacheCategory::Translation,
            content: ContentCategory::Localized,
            public: true,
        },
        RouteSettings {
            prefix: "/documents/".to_string(),
            category: CacheCategory::Document,
            content: ContentCategory::Document,
            public: true,
        },
        RouteSettings {
            prefix: "/api/".to_string(),
            category: CacheCategory::Record,
            content: ContentCategory::PrincipalApi,
            public: false,
        },
    ]
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
    #[error(transparent)]
    Cache(#[from] ConfigError),
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    if let Some(Command::Serve(args)) = cli.command.as_ref() {
        raw.apply_serve_overrides(&args.overrides);
    }

    Settings::from_raw(raw)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    cache: RawCacheSettings,
    ttl: BTreeMap<String, i64>,
    warming: RawWarmingSettings,
    stats: RawStatsSettings,
    edge: RawEdgeSettings,
    http: RawHttpSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.server_port {
            self.server.port = Some(port);
        }
        if let Some(seconds) = overrides.server_graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(timeout) = overrides.store_timeout_ms {
            self.cache.store_timeout_ms = Some(timeout);
        }
        if let Some(percent) = overrides.jitter_percent {
            self.cache.jitter_percent = Some(percent);
        }
        if let Some(enabled) = overrides.warming_enabled {
            self.warming.enabled = Some(enabled);
        }
        if let Some(endpoint) = overrides.edge_purge_endpoint.as_ref() {
            self.edge.purge_endpoint = Some(endpoint.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            cache,
            ttl,
            warming,
            stats,
            edge,
            http,
        } = raw;

        let server = build_server_settings(server)?;
        let logging = build_logging_settings(logging)?;
        let cache = build_cache_config(cache, ttl, warming, stats)?;
        let edge = build_edge_settings(edge)?;
        let http = build_http_settings(http)?;

        Ok(Self {
            server,
            logging,
            cache,
            edge,
            http,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());
    let port = server.port.unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "server.port",
            "port must be greater than zero",
        ));
    }
    let addr = parse_socket_addr(&host, port)
        .map_err(|reason| LoadError::invalid("server.addr", reason))?;

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);
    if graceful_secs == 0 {
        return Err(LoadError::invalid(
            "server.graceful_shutdown_seconds",
            "must be greater than zero",
        ));
    }

    Ok(ServerSettings {
        addr,
        graceful_shutdown: Duration::from_secs(graceful_secs),
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_cache_config(
    cache: RawCacheSettings,
    ttl: BTreeMap<String, i64>,
    warming: RawWarmingSettings,
    stats: RawStatsSettings,
) -> Result<CacheConfig, LoadError> {
    let defaults = CacheConfig::default();
    let config = CacheConfig {
        store_capacity: cache.store_capacity.unwrap_or(defaults.store_capacity),
        store_timeout_ms: cache.store_timeout_ms.unwrap_or(defaults.store_timeout_ms),
        compute_timeout_ms: cache
            .compute_timeout_ms
            .unwrap_or(defaults.compute_timeout_ms),
        purge_timeout_ms: cache.purge_timeout_ms.unwrap_or(defaults.purge_timeout_ms),
        jitter_percent: cache.jitter_percent.unwrap_or(defaults.jitter_percent),
        max_result_size: cache.max_result_size.unwrap_or(defaults.max_result_size),
        cache_null_results: cache
            .cache_null_results
            .unwrap_or(defaults.cache_null_results),
        query_namespace: cache.query_namespace.unwrap_or(defaults.query_namespace),
        ttl,
        invalidation_enabled: cache
            .invalidation_enabled
            .unwrap_or(defaults.invalidation_enabled),
        event_queue_limit: cache.event_queue_limit.unwrap_or(defaults.event_queue_limit),
        auto_consume_interval_ms: cache
            .auto_consume_interval_ms
            .unwrap_or(defaults.auto_consume_interval_ms),
        consume_batch_limit: cache
            .consume_batch_limit
            .unwrap_or(defaults.consume_batch_limit),
        warming_enabled: warming.enabled.unwrap_or(defaults.warming_enabled),
        inter_batch_delay_ms: warming
            .inter_batch_delay_ms
            .unwrap_or(defaults.inter_batch_delay_ms),
        warm_max_retries: warming.max_retries.unwrap_or(defaults.warm_max_retries),
        warm_retry_delay_ms: warming
            .retry_delay_ms
            .unwrap_or(defaults.warm_retry_delay_ms),
        stats_interval_secs: stats.interval_secs.unwrap_or(defaults.stats_interval_secs),
        stats_history_limit: stats.history_limit.unwrap_or(defaults.stats_history_limit),
        latency_window: stats.latency_window.unwrap_or(defaults.latency_window),
        min_hit_rate: stats.min_hit_rate.unwrap_or(defaults.min_hit_rate),
        max_memory_bytes: stats.max_memory_bytes.unwrap_or(defaults.max_memory_bytes),
        max_evictions: stats.max_evictions.unwrap_or(defaults.max_evictions),
    };
    config.validate()?;
    Ok(config)
}

fn build_edge_settings(edge: RawEdgeSettings) -> Result<EdgeSettings, LoadError> {
    let purge_endpoint = match edge.purge_endpoint.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(raw) => {
            let url = Url::parse(raw)
                .map_err(|err| LoadError::invalid("edge.purge_endpoint", err.to_string()))?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(LoadError::invalid(
                    "edge.purge_endpoint",
                    "scheme must be http or https",
                ));
            }
            Some(url)
        }
    };
    let purge_token = edge.purge_token.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    });

    Ok(EdgeSettings {
        purge_endpoint,
        purge_token,
    })
}

fn build_http_settings(http: RawHttpSettings) -> Result<HttpSettings, LoadError> {
    let defaults = HttpSettings::default();

    let routes = match http.routes {
        None => defaults.routes,
        Some(raw_routes) => raw_routes
            .into_iter()
            .map(build_route)
            .collect::<Result<Vec<_>, _>>()?,
    };

    let cacheable_methods = match http.cacheable_methods {
        None => defaults.cacheable_methods,
        Some(names) => {
            if names.is_empty() {
                return Err(LoadError::invalid(
                    "http.cacheable_methods",
                    "at least one method is required",
                ));
            }
            names
                .iter()
                .map(|name| {
                    Method::from_bytes(name.trim().to_ascii_uppercase().as_bytes()).map_err(|err| {
                        LoadError::invalid("http.cacheable_methods", format!("`{name}`: {err}"))
                    })
                })
                .collect::<Result<Vec<_>, _>>()?
        }
    };

    Ok(HttpSettings {
        routes,
        cacheable_methods,
    })
}

fn build_route(raw: RawRouteSettings) -> Result<RouteSettings, LoadError> {
    if !raw.prefix.starts_with('/') {
        return Err(LoadError::invalid(
            "http.routes.prefix",
            format!("`{}` must start with `/`", raw.prefix),
        ));
    }
    let category = match raw.category.as_deref() {
        Some(name) => {
            let category = CacheCategory::parse(name);
            if !category.is_known() {
                return Err(LoadError::invalid(
                    "http.routes.category",
                    format!("unknown category `{name}`"),
                ));
            }
            category
        }
        None => CacheCategory::Record,
    };

    Ok(RouteSettings {
        prefix: raw.prefix,
        category,
        content: raw.content.unwrap_or(ContentCategory::Generic),
        public: raw.public.unwrap_or(false),
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    store_capacity: Option<usize>,
    store_timeout_ms: Option<u64>,
    compute_timeout_ms: Option<u64>,
    purge_timeout_ms: Option<u64>,
    jitter_percent: Option<u8>,
    max_result_size: Option<usize>,
    cache_null_results: Option<bool>,
    query_namespace: Option<String>,
    invalidation_enabled: Option<bool>,
    event_queue_limit: Option<usize>,
    auto_consume_interval_ms: Option<u64>,
    consume_batch_limit: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawWarmingSettings {
    enabled: Option<bool>,
    inter_batch_delay_ms: Option<u64>,
    max_retries: Option<u32>,
    retry_delay_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawStatsSettings {
    interval_secs: Option<u64>,
    history_limit: Option<usize>,
    latency_window: Option<usize>,
    min_hit_rate: Option<f64>,
    max_memory_bytes: Option<u64>,
    max_evictions: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawEdgeSettings {
    purge_endpoint: Option<String>,
    purge_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawHttpSettings {
    routes: Option<Vec<RawRouteSettings>>,
    cacheable_methods: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawRouteSettings {
    prefix: String,
    category: Option<String>,
    content: Option<ContentCategory>,
    public: Option<bool>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}
