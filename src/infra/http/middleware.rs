use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Body,
    extract::State,
    http::{
        HeaderMap, HeaderValue, Request, StatusCode,
        header::{AUTHORIZATION, CACHE_CONTROL, COOKIE, ETAG, EXPIRES, IF_NONE_MATCH, VARY},
    },
    middleware::Next,
    response::{IntoResponse, Response},
};
use http_body_util::BodyExt;
use tracing::{debug, error, instrument, warn};

use crate::cache::{CacheHeaders, EdgeCachePolicy, TtlPolicyManager, Visibility, etag, etag_matches};
use crate::config::HttpSettings;

const CREDENTIALED_NO_STORE: &str = "private, no-store";

/// Shared state for header injection.
#[derive(Clone)]
pub struct HeaderPolicyState {
    pub edge: Arc<EdgeCachePolicy>,
    pub ttl: Arc<TtlPolicyManager>,
    pub http: Arc<HttpSettings>,
}

/// Adds `Cache-Control`, `Expires`, `Vary` and `ETag` to successful
/// responses on configured routes and answers matching `If-None-Match`
/// with `304 Not Modified`.
///
/// Requests carrying credentials only get shared caching on public routes;
/// elsewhere the response is marked `private, no-store`.
#[instrument(skip_all, fields(path = %request.uri().path()))]
pub async fn cache_headers_layer(
    State(state): State<HeaderPolicyState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if !state.http.is_cacheable_method(request.method()) {
        return next.run(request).await;
    }
    let Some(route) = state.http.route_for(request.uri().path()).cloned() else {
        return next.run(request).await;
    };

    let has_credentials = carries_credentials(request.headers());
    let if_none_match = request
        .headers()
        .get(IF_NONE_MATCH)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);

    let response = next.run(request).await;
    if response.status() != StatusCode::OK {
        return response;
    }

    if has_credentials && !route.public {
        debug!(route = %route.prefix, "Credentialed request on private route; not cacheable");
        let mut response = response;
        response
            .headers_mut()
            .insert(CACHE_CONTROL, HeaderValue::from_static(CREDENTIALED_NO_STORE));
        return response;
    }

    let (mut parts, body) = response.into_parts();
    let bytes = match BodyExt::collect(body).await {
        Ok(collected) => collected.to_bytes(),
        Err(err) => {
            error!(error = %err, "Failed to buffer response body for cache headers");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let private = has_credentials || state.ttl.policy(&route.category).visibility == Visibility::Private;
    let headers = state
        .edge
        .cache_headers(route.content, Some(&route.category), private);
    let tag = etag(&bytes);
    apply_headers(&mut parts.headers, &headers, &tag);

    if let Some(candidate) = if_none_match.as_deref()
        && etag_matches(candidate, &tag)
    {
        debug!(etag = %tag, "Conditional request matched; not modified");
        parts.status = StatusCode::NOT_MODIFIED;
        parts.headers.remove(axum::http::header::CONTENT_LENGTH);
        return Response::from_parts(parts, Body::empty());
    }

    Response::from_parts(parts, Body::from(bytes))
}

fn carries_credentials(headers: &HeaderMap) -> bool {
    headers.contains_key(AUTHORIZATION) || headers.contains_key(COOKIE)
}

fn apply_headers(target: &mut HeaderMap, headers: &CacheHeaders, tag: &str) {
    let pairs = [
        (CACHE_CONTROL, Some(headers.cache_control.as_str())),
        (EXPIRES, headers.expires.as_deref()),
        (VARY, Some(headers.vary.as_str())),
        (ETAG, Some(tag)),
    ];
    for (name, value) in pairs {
        let Some(value) = value else {
            continue;
        };
        match HeaderValue::from_str(value) {
            Ok(value) => {
                target.insert(name, value);
            }
            Err(err) => warn!(header = %name, error = %err, "Skipping invalid cache header value"),
        }
    }
}

pub async fn log_responses(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let start = Instant::now();

    let response = next.run(request).await;
    let status = response.status();
    let elapsed_ms = start.elapsed().as_millis() as u64;

    if status.is_server_error() {
        error!(
            target: "cachekeeper::http::response",
            status = status.as_u16(),
            method = %method,
            path = %uri.path(),
            elapsed_ms,
            "request failed"
        );
    } else if status.is_client_error() {
        warn!(
            target: "cachekeeper::http::response",
            status = status.as_u16(),
            method = %method,
            path = %uri.path(),
            elapsed_ms,
            "client request error"
        );
    } else {
        debug!(
            target: "cachekeeper::http::response",
            status = status.as_u16(),
            method = %method,
            path = %uri.path(),
            elapsed_ms,
            "request served"
        );
    }

    response
}
