use axum::{
    Json,
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::AdminState;
use crate::cache::{EventContext, has_wildcard};
use crate::infra::http::error::ApiError;

#[derive(Debug, Default, Deserialize)]
pub(super) struct TriggerParams {
    #[serde(default)]
    defer: bool,
}

#[derive(Debug, Serialize)]
struct Queued {
    event: String,
    queued: usize,
}

/// Publish `event`; unless `?defer=true` the queue is consumed before
/// answering and the dispatch reports are returned.
pub(super) async fn trigger_event(
    State(state): State<AdminState>,
    Path(event): Path<String>,
    Query(params): Query<TriggerParams>,
    body: Bytes,
) -> Response {
    let context = match parse_context(&body) {
        Ok(context) => context,
        Err(err) => return err.into_response(),
    };

    info!(event_name = %event, defer = params.defer, "Admin triggered cache event");
    let reports = state
        .engine
        .trigger()
        .trigger(&event, context, !params.defer)
        .await;

    if params.defer {
        let queued = state.engine.trigger().queue().len();
        return (StatusCode::ACCEPTED, Json(Queued { event, queued })).into_response();
    }
    Json(reports).into_response()
}

fn parse_context(body: &[u8]) -> Result<EventContext, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(EventContext::new());
    }
    serde_json::from_slice(body).map_err(|err| {
        ApiError::bad_request(
            "Event context must be a JSON object of strings",
            Some(err.to_string()),
        )
    })
}

#[derive(Debug, Deserialize)]
pub(super) struct PatternRequest {
    pattern: String,
}

#[derive(Debug, Serialize)]
struct PatternDeleted {
    pattern: String,
    keys_deleted: u64,
}

pub(super) async fn invalidate_pattern(
    State(state): State<AdminState>,
    Json(request): Json<PatternRequest>,
) -> Response {
    let pattern = request.pattern.trim();
    if pattern.is_empty() || pattern == "*" {
        return ApiError::bad_request(
            "Pattern must name a key prefix",
            Some(format!("rejected pattern `{pattern}`")),
        )
        .into_response();
    }
    if !has_wildcard(pattern) {
        let deleted = state.engine.adapter().delete(pattern).await;
        return Json(PatternDeleted {
            pattern: pattern.to_string(),
            keys_deleted: u64::from(deleted),
        })
        .into_response();
    }

    let keys_deleted = state.engine.invalidation().invalidate_pattern(pattern).await;
    Json(PatternDeleted {
        pattern: pattern.to_string(),
        keys_deleted,
    })
    .into_response()
}
