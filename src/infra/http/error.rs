use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use tracing::warn;

pub mod codes {
    pub const BAD_REQUEST: &str = "bad_request";
    pub const WARMING_IN_PROGRESS: &str = "warming_in_progress";
    pub const STATS_UNAVAILABLE: &str = "stats_unavailable";
    pub const STORE_UNAVAILABLE: &str = "store_unavailable";
}

#[derive(Debug, Serialize)]
pub struct ApiErrorBody {
    pub error: ApiErrorMessage,
}

#[derive(Debug, Serialize)]
pub struct ApiErrorMessage {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: &'static str,
    hint: Option<String>,
}

impl ApiError {
    pub fn new(
        status: StatusCode,
        code: &'static str,
        message: &'static str,
        hint: Option<String>,
    ) -> Self {
        Self {
            status,
            code,
            message,
            hint,
        }
    }

    pub fn bad_request(message: &'static str, hint: Option<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, codes::BAD_REQUEST, message, hint)
    }

    pub fn warming_in_progress() -> Self {
        Self::new(
            StatusCode::CONFLICT,
            codes::WARMING_IN_PROGRESS,
            "A warming pass is already running",
            None,
        )
    }

    pub fn stats_unavailable() -> Self {
        Self::new(
            StatusCode::SERVICE_UNAVAILABLE,
            codes::STATS_UNAVAILABLE,
            "No consistent statistics snapshot is available",
            None,
        )
    }

    pub fn store_unavailable(hint: String) -> Self {
        Self::new(
            StatusCode::SERVICE_UNAVAILABLE,
            codes::STORE_UNAVAILABLE,
            "Cache store is unavailable",
            Some(hint),
        )
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        warn!(
            target: "cachekeeper::http::api",
            status = self.status.as_u16(),
            code = self.code,
            hint = self.hint.as_deref().unwrap_or(""),
            "{}",
            self.message
        );
        let body = ApiErrorBody {
            error: ApiErrorMessage {
                code: self.code.to_string(),
                message: self.message.to_string(),
                hint: self.hint,
            },
        };
        (self.status, Json(body)).into_response()
    }
}
