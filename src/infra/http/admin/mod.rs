//! Operator endpoints for inspecting and driving the cache engine.

mod cache;
mod events;
mod health;
mod state;
mod warming;

pub use state::AdminState;

use axum::{
    Router,
    routing::{get, post},
};

pub fn build_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health::admin_health))
        .route("/cache/stats", get(cache::cache_stats))
        .route("/cache/stats/history", get(cache::cache_stats_history))
        .route("/cache/recommendations", get(cache::cache_recommendations))
        .route("/cache/rules", get(cache::cache_rules))
        .route("/cache/rules/{name}/enabled", post(cache::cache_rule_toggle))
        .route("/cache/patterns", post(events::invalidate_pattern))
        .route("/cache/events/{event}", post(events::trigger_event))
        .route("/cache/warm", post(warming::warm_now))
        .route("/cache/warm/results", get(warming::warm_results))
        .with_state(state)
}
