use axum::{http::StatusCode, Json};

use crate::models::ApiResponse;

/// Error half of every handler result.
pub type ApiError = (StatusCode, Json<ApiResponse<()>>);

pub type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

pub fn api_error(status: StatusCode, msg: impl Into<String>) -> ApiError {
    (status, Json(ApiResponse::error(msg)))
}

pub fn bad_request(msg: impl Into<String>) -> ApiError {
    api_error(StatusCode::BAD_REQUEST, msg)
}

pub fn not_found(msg: impl Into<String>) -> ApiError {
    api_error(StatusCode::NOT_FOUND, msg)
}

pub fn conflict(msg: impl Into<String>) -> ApiError {
    api_error(StatusCode::CONFLICT, msg)
}

/// Log a database failure and hide its details from the caller.
pub fn db_error(context: &'static str) -> impl FnOnce(sqlx::Error) -> ApiError {
    move |e| {
        tracing::error!("{}: {}", context, e);
        api_error(StatusCode::INTERNAL_SERVER_ERROR, "Error de base de datos")
    }
}

pub fn ok<T: serde::Serialize>(data: T) -> ApiResult<T> {
    Ok(Json(ApiResponse::success(data)))
}
