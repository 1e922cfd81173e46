mod admin;
pub mod error;
mod middleware;

pub use admin::{AdminState, build_admin_router};
pub use middleware::{HeaderPolicyState, cache_headers_layer, log_responses};

use std::sync::Arc;

use axum::{Router, middleware as axum_middleware};

use crate::cache::CacheEngine;
use crate::config::HttpSettings;

/// Compose the service router.
///
/// `content` carries the application's own routes and is wrapped in the
/// cache header layer; the admin endpoints are merged alongside it without
/// header injection.
pub fn build_router(engine: Arc<CacheEngine>, http: Arc<HttpSettings>, content: Router) -> Router {
    let headers = HeaderPolicyState {
        edge: engine.edge().clone(),
        ttl: engine.ttl().clone(),
        http,
    };

    let content = content.layer(axum_middleware::from_fn_with_state(
        headers,
        cache_headers_layer,
    ));

    content
        .merge(build_admin_router(AdminState { engine }))
        .layer(axum_middleware::from_fn(log_responses))
}
