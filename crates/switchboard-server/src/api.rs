//! Shared transport plumbing: the HTTP error wrapper and blocking-store
//! helpers used by every handler module.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use switchboard_db::DbPool;
use switchboard_types::{CoordError, ErrorKind};

/// The transport-boundary error: a [`CoordError`] rendered as an HTTP
/// response with its structured body.
#[derive(Debug)]
pub struct ApiError(pub CoordError);

impl From<CoordError> for ApiError {
    fn from(err: CoordError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err = self.0;
        if err.kind == ErrorKind::StoreUnavailable {
            tracing::error!(error = %err.message, "request failed on store access");
        }
        let status = StatusCode::from_u16(err.kind.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut body = serde_json::json!({
            "code": err.kind.code(),
            "error": err.message,
        });
        if let Some(suggestion) = err.suggestion {
            body["suggestion"] = serde_json::Value::String(suggestion);
        }
        (status, Json(body)).into_response()
    }
}

/// Runs a closure against a pooled connection on the blocking thread pool.
///
/// Pool exhaustion, join failures, and store errors all surface as
/// `STORE_UNAVAILABLE`; no panic crosses the request boundary.
pub async fn with_conn<T, F>(pool: &DbPool, f: F) -> Result<T, CoordError>
where
    T: Send + 'static,
    F: FnOnce(&rusqlite::Connection) -> Result<T, CoordError> + Send + 'static,
{
    let pool = pool.clone();
    tokio::task::spawn_blocking(move || {
        let conn = pool.get()?;
        f(&conn)
    })
    .await
    .map_err(|e| CoordError::store_unavailable(format!("task join error: {e}")))?
}
