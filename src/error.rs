use axum::extract::rejection::JsonRejection;
use axum::extract::FromRequest;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("authentication error: {0}")]
    Auth(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("quota exceeded: {limit_name}")]
    QuotaExceeded {
        limit_name: &'static str,
        retry_after_seconds: u64,
    },

    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("pool error: {0}")]
    Pool(#[from] deadpool_sqlite::InteractError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            AppError::Validation(msg) => (
                StatusCode::BAD_REQUEST,
                json!({ "error": msg }),
            ),
            AppError::Auth(msg) => (StatusCode::UNAUTHORIZED, json!({ "error": msg })),
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, json!({ "error": msg })),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, json!({ "error": msg })),
            AppError::QuotaExceeded {
                limit_name,
                retry_after_seconds,
            } => (
                StatusCode::TOO_MANY_REQUESTS,
                json!({
                    "error": "quota exceeded",
                    "limit": limit_name,
                    "retry_after_seconds": retry_after_seconds,
                }),
            ),
            AppError::UpstreamUnavailable(msg) => {
                tracing::warn!(error = %msg, "upstream unavailable");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    json!({ "error": "upstream unavailable", "detail": msg }),
                )
            }
            AppError::Database(e) => {
                tracing::error!(error = %e, "database error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "error": "internal server error" }),
                )
            }
            AppError::Pool(e) => {
                tracing::error!(error = %e, "pool error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "error": "internal server error" }),
                )
            }
            AppError::Internal(msg) => {
                tracing::error!(error = %msg, "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "error": "internal server error" }),
                )
            }
        };

        let retry_after = match &self {
            AppError::QuotaExceeded {
                retry_after_seconds,
                ..
            } => Some(*retry_after_seconds),
            _ => None,
        };

        let mut response = (status, axum::Json(body)).into_response();
        if let Some(secs) = retry_after {
            if let Ok(value) = axum::http::HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert("retry-after", value);
            }
        }
        response
    }
}

pub type AppResult<T> = Result<T, AppError>;

/// JSON extractor that logs deserialization errors (422s) before returning them.
/// Drop-in replacement for `axum::Json<T>`.
pub struct LoggedJson<T>(pub T);

impl<S, T> FromRequest<S> for LoggedJson<T>
where
    axum::Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request(
        req: axum::extract::Request,
        state: &S,
    ) -> Result<Self, Self::Rejection> {
        let path = req.uri().path().to_string();
        match axum::Json::<T>::from_request(req, state).await {
            Ok(axum::Json(value)) => Ok(LoggedJson(value)),
            Err(rejection) => {
                tracing::warn!(
                    path = %path,
                    status = 422,
                    error = %rejection,
                    "JSON parse error (client sent malformed payload)"
                );
                Err(AppError::Validation(rejection.body_text()))
            }
        }
    }
}
