use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use vmgrid_pool::PoolError;
use vmgrid_session::SessionError;

/// Error half of the `/api` surface: the HTTP status stays 200 and the
/// metacode in the envelope carries the outcome.
#[derive(Debug)]
pub struct ApiError(pub StatusCode, pub anyhow::Error);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        Json(json!({
            "metacode": self.0.as_u16(),
            "result": self.1.to_string(),
        }))
        .into_response()
    }
}

// This enables using `?` on functions that return `Result<_, anyhow::Error>`
// to turn them into `Result<_, ApiError>`.
impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        let error = err.into();
        let status = status_code_from_error(&error);
        ApiError(status, error)
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Error half of the `/wd/hub` surface: real HTTP statuses, with
/// server-side failures rendered in the JSON-Wire error shape
/// (status 13, unknown server-side error).
#[derive(Debug)]
pub struct WireError(pub StatusCode, pub anyhow::Error);

impl IntoResponse for WireError {
    fn into_response(self) -> Response {
        if self.0 == StatusCode::NOT_FOUND {
            return (StatusCode::NOT_FOUND, self.1.to_string()).into_response();
        }
        (
            self.0,
            Json(json!({
                "status": 13,
                "value": { "message": self.1.to_string() },
            })),
        )
            .into_response()
    }
}

impl<E> From<E> for WireError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        let error = err.into();
        let status = status_code_from_error(&error);
        WireError(status, error)
    }
}

pub type WireResult<T> = std::result::Result<T, WireError>;

/// Walk the error chain for taxonomy types to pick a status.
fn status_code_from_error(error: &anyhow::Error) -> StatusCode {
    for cause in error.chain() {
        if let Some(session_error) = cause.downcast_ref::<SessionError>() {
            return match session_error {
                SessionError::UnknownSession(_) => StatusCode::NOT_FOUND,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
        }
        if cause.downcast_ref::<PoolError>().is_some() {
            return StatusCode::INTERNAL_SERVER_ERROR;
        }
    }
    StatusCode::INTERNAL_SERVER_ERROR
}
