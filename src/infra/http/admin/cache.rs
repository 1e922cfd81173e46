use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Deserialize;

use super::AdminState;
use crate::infra::http::error::ApiError;

pub(super) async fn cache_stats(State(state): State<AdminState>) -> Response {
    match state.engine.snapshot().await {
        Some(snapshot) => Json(snapshot).into_response(),
        None => ApiError::stats_unavailable().into_response(),
    }
}

pub(super) async fn cache_stats_history(State(state): State<AdminState>) -> Response {
    Json(state.engine.stats().history()).into_response()
}

pub(super) async fn cache_recommendations(State(state): State<AdminState>) -> Response {
    Json(state.engine.recommendations().await).into_response()
}

pub(super) async fn cache_rules(State(state): State<AdminState>) -> Response {
    Json(state.engine.invalidation().rules()).into_response()
}

#[derive(Debug, Deserialize)]
pub(super) struct RuleToggle {
    enabled: bool,
}

pub(super) async fn cache_rule_toggle(
    State(state): State<AdminState>,
    Path(name): Path<String>,
    Json(toggle): Json<RuleToggle>,
) -> Response {
    if state
        .engine
        .invalidation()
        .set_rule_enabled(&name, toggle.enabled)
    {
        StatusCode::NO_CONTENT.into_response()
    } else {
        StatusCode::NOT_FOUND.into_response()
    }
}
