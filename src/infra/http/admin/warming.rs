use axum::{
    Json,
    body::Bytes,
    extract::State,
    response::{IntoResponse, Response},
};
use serde::Deserialize;

use super::AdminState;
use crate::cache::WarmPass;
use crate::infra::http::error::ApiError;

#[derive(Debug, Default, Deserialize)]
struct WarmRequest {
    #[serde(default)]
    tasks: Option<Vec<String>>,
}

/// Run a warming pass now, optionally limited to the named tasks.
pub(super) async fn warm_now(State(state): State<AdminState>, body: Bytes) -> Response {
    let request = if body.iter().all(u8::is_ascii_whitespace) {
        WarmRequest::default()
    } else {
        match serde_json::from_slice::<WarmRequest>(&body) {
            Ok(request) => request,
            Err(err) => {
                return ApiError::bad_request("Invalid warming request", Some(err.to_string()))
                    .into_response();
            }
        }
    };

    match state.engine.warming().warm(request.tasks.as_deref()).await {
        WarmPass::Completed(results) => Json(results).into_response(),
        WarmPass::AlreadyRunning => ApiError::warming_in_progress().into_response(),
    }
}

pub(super) async fn warm_results(State(state): State<AdminState>) -> Response {
    Json(state.engine.warming().results()).into_response()
}
