use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};

use super::AdminState;
use crate::infra::http::error::ApiError;

/// `204` while the backing store answers, `503` otherwise.
pub(super) async fn admin_health(State(state): State<AdminState>) -> Response {
    match state.engine.adapter().try_info().await {
        Ok(_) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => ApiError::store_unavailable(err.to_string()).into_response(),
    }
}
