// crates/server/src/error.rs
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use inbox_sync_core::{LockHolder, StoreError, SyncError, SyncKind};
use inbox_sync_db::DbError;
use serde::Serialize;
use thiserror::Error;

/// Structured JSON error response for API errors
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct ErrorResponse {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: None,
        }
    }

    pub fn with_details(error: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: Some(details.into()),
        }
    }
}

/// Body of a 409 when the sync lock is held.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
#[serde(rename_all = "camelCase")]
pub struct SyncConflictResponse {
    pub error: String,
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_type: Option<SyncKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_conversation_id: Option<String>,
}

impl SyncConflictResponse {
    fn from_holder(holder: Option<&LockHolder>, message: String) -> Self {
        let code = match holder.map(|h| h.kind) {
            Some(SyncKind::Global) => "GLOBAL_SYNC_IN_PROGRESS",
            Some(SyncKind::Single) => "SINGLE_SYNC_IN_PROGRESS",
            None => "SYNC_IN_PROGRESS",
        };
        Self {
            error: message,
            code: code.to_string(),
            lock_type: holder.map(|h| h.kind),
            lock_conversation_id: holder.and_then(|h| h.conversation_id.clone()),
        }
    }
}

/// Fixed body returned by mutating endpoints when sync is switched off.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
#[serde(rename_all = "camelCase")]
pub struct SyncDisabledResponse {
    pub error: String,
    pub code: String,
    pub sync_enabled: bool,
}

/// API error types that map to HTTP status codes
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{message}")]
    SyncConflict {
        holder: Option<LockHolder>,
        message: String,
    },

    #[error("No active {0} sync")]
    NoActiveSync(SyncKind),

    #[error("Sync is disabled in this environment")]
    SyncDisabled,

    #[error("Failed to spawn sync worker: {0}")]
    SpawnFailed(String),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::Busy { holder } => {
                let message = SyncError::Busy {
                    holder: holder.clone(),
                }
                .to_string();
                ApiError::SyncConflict { holder, message }
            }
            SyncError::NotFound(kind) => ApiError::NoActiveSync(kind),
            SyncError::SpawnFailed(details) => ApiError::SpawnFailed(details),
            SyncError::Store(e) => e.into(),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        ApiError::Internal(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_response) = match self {
            ApiError::SyncConflict { holder, message } => {
                tracing::warn!(
                    lock_type = ?holder.as_ref().map(|h| h.kind),
                    owner_pid = ?holder.as_ref().map(|h| h.owner_pid),
                    "Sync start rejected, lock held"
                );
                let body = SyncConflictResponse::from_holder(holder.as_ref(), message);
                return (StatusCode::CONFLICT, Json(body)).into_response();
            }
            ApiError::SyncDisabled => {
                tracing::warn!("Sync request rejected, sync disabled");
                let body = SyncDisabledResponse {
                    error: "Sync is disabled in this environment".to_string(),
                    code: "SYNC_DISABLED".to_string(),
                    sync_enabled: false,
                };
                return (StatusCode::FORBIDDEN, Json(body)).into_response();
            }
            ApiError::NoActiveSync(kind) => {
                tracing::info!(kind = %kind, "Cancel requested with no active sync");
                (
                    StatusCode::NOT_FOUND,
                    ErrorResponse::new(format!("No active {kind} sync")),
                )
            }
            ApiError::SpawnFailed(details) => {
                tracing::error!(error = %details, "Sync worker failed to spawn");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorResponse::with_details("Failed to start sync worker", details),
                )
            }
            ApiError::Database(db_err) => {
                tracing::error!(error = %db_err, "Database error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorResponse::with_details("Database error", db_err.to_string()),
                )
            }
            ApiError::Internal(msg) => {
                tracing::error!(message = %msg, "Internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorResponse::new("Internal server error"),
                )
            }
        };

        (status, Json(error_response)).into_response()
    }
}

/// Result type alias for API handlers
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use pretty_assertions::assert_eq;

    async fn extract<T: serde::de::DeserializeOwned>(response: Response) -> (StatusCode, T) {
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_global_busy_returns_409_with_code() {
        let error: ApiError = SyncError::Busy {
            holder: Some(LockHolder {
                kind: SyncKind::Global,
                owner_pid: 42,
                conversation_id: None,
            }),
        }
        .into();
        let (status, body): (_, SyncConflictResponse) = extract(error.into_response()).await;

        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body.code, "GLOBAL_SYNC_IN_PROGRESS");
        assert_eq!(body.error, "Global sync already in progress");
        assert_eq!(body.lock_type, Some(SyncKind::Global));
        assert_eq!(body.lock_conversation_id, None);
    }

    #[tokio::test]
    async fn test_single_busy_names_conversation() {
        let error: ApiError = SyncError::Busy {
            holder: Some(LockHolder {
                kind: SyncKind::Single,
                owner_pid: 42,
                conversation_id: Some("conv-7".to_string()),
            }),
        }
        .into();
        let (status, body): (_, SyncConflictResponse) = extract(error.into_response()).await;

        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body.code, "SINGLE_SYNC_IN_PROGRESS");
        assert_eq!(body.lock_conversation_id.as_deref(), Some("conv-7"));
        assert!(body.error.contains("conv-7"));
    }

    #[tokio::test]
    async fn test_unknown_holder_is_generic_conflict() {
        let error: ApiError = SyncError::Busy { holder: None }.into();
        let (status, body): (_, SyncConflictResponse) = extract(error.into_response()).await;

        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body.code, "SYNC_IN_PROGRESS");
        assert_eq!(body.lock_type, None);
    }

    #[tokio::test]
    async fn test_not_found_returns_404() {
        let error: ApiError = SyncError::NotFound(SyncKind::Global).into();
        let (status, body): (_, ErrorResponse) = extract(error.into_response()).await;

        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body.error, "No active global sync");
    }

    #[tokio::test]
    async fn test_disabled_returns_fixed_shape() {
        let (status, body): (_, SyncDisabledResponse) =
            extract(ApiError::SyncDisabled.into_response()).await;

        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body.code, "SYNC_DISABLED");
        assert!(!body.sync_enabled);
    }

    #[tokio::test]
    async fn test_spawn_failure_carries_details() {
        let error: ApiError = SyncError::SpawnFailed("No such file".to_string()).into();
        let (status, body): (_, ErrorResponse) = extract(error.into_response()).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body.details.as_deref(), Some("No such file"));
    }

    #[tokio::test]
    async fn test_store_error_hides_details() {
        let error: ApiError = SyncError::Store(StoreError::Backend("disk full".into())).into();
        let (status, body): (_, ErrorResponse) = extract(error.into_response()).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body.error, "Internal server error");
        assert!(body.details.is_none());
    }
}
