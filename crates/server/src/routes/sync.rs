//! Sync start, cancel and status endpoints.
//!
//! Start returns as soon as the worker is running; clients poll
//! `GET /api/sync/status` until the job reaches a terminal status.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use inbox_sync_core::status::SingleSyncView;
use inbox_sync_core::{SyncKind, SyncStatus, SyncTarget};
use serde::Serialize;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// Response for GET /api/sync/status.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub sync_enabled: bool,
    #[serde(flatten)]
    pub status: SyncStatus,
}

/// Response for a started sync.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
#[serde(rename_all = "camelCase")]
pub struct SyncStartedResponse {
    pub success: bool,
    pub pid: u32,
    pub job_id: String,
}

/// Response for a cancelled sync.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct SyncCancelledResponse {
    pub success: bool,
}

fn require_enabled(state: &AppState) -> ApiResult<()> {
    if state.sync_enabled {
        Ok(())
    } else {
        Err(ApiError::SyncDisabled)
    }
}

async fn start(state: &AppState, target: SyncTarget) -> ApiResult<impl IntoResponse> {
    require_enabled(state)?;
    let started = state.supervisor.start(target).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(SyncStartedResponse {
            success: true,
            pid: started.pid,
            job_id: started.job_id,
        }),
    ))
}

async fn cancel(state: &AppState, kind: SyncKind) -> ApiResult<Json<SyncCancelledResponse>> {
    require_enabled(state)?;
    state.supervisor.cancel(kind).await?;
    Ok(Json(SyncCancelledResponse { success: true }))
}

/// GET /api/sync/status - Aggregated status of both sync kinds.
pub async fn get_status(State(state): State<Arc<AppState>>) -> ApiResult<Json<StatusResponse>> {
    let status = state.status.status().await?;
    Ok(Json(StatusResponse {
        sync_enabled: state.sync_enabled,
        status,
    }))
}

/// POST /api/sync/global - Start a global sync.
///
/// Returns:
/// - 202 Accepted: worker launched
/// - 409 Conflict: a sync of either kind holds the lock
/// - 403 Forbidden: sync disabled
pub async fn start_global(State(state): State<Arc<AppState>>) -> ApiResult<impl IntoResponse> {
    start(&state, SyncTarget::Global).await
}

/// DELETE /api/sync/global - Cancel the running global sync (404 if none).
pub async fn cancel_global(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<SyncCancelledResponse>> {
    cancel(&state, SyncKind::Global).await
}

/// GET /api/sync/conversation/{id} - Last or current sync of one conversation.
pub async fn get_conversation_status(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<String>,
) -> ApiResult<Json<SingleSyncView>> {
    Ok(Json(state.status.conversation(&conversation_id).await?))
}

/// POST /api/sync/conversation/{id} - Start a single-conversation sync.
pub async fn start_conversation(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    start(&state, SyncTarget::Conversation(conversation_id)).await
}

/// DELETE /api/sync/conversation - Cancel the running single sync (404 if none).
pub async fn cancel_conversation(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<SyncCancelledResponse>> {
    cancel(&state, SyncKind::Single).await
}

/// Create the sync routes router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/sync/status", get(get_status))
        .route("/sync/global", post(start_global).delete(cancel_global))
        .route("/sync/conversation", delete(cancel_conversation))
        .route(
            "/sync/conversation/{id}",
            get(get_conversation_status).post(start_conversation),
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use inbox_sync_core::launcher::LaunchedWorker;
    use inbox_sync_core::{Launcher, MemoryStore, WorkerSpec, DEFAULT_LOCK_TTL};
    use inbox_sync_db::Database;
    use axum::body::{to_bytes, Body};
    use axum::http::{Method, Request};
    use pretty_assertions::assert_eq;
    use tower::ServiceExt;

    /// Workers that never exit; the lock stays held for the whole test.
    struct HangingLauncher;

    impl Launcher for HangingLauncher {
        fn spawn(&self, _spec: &WorkerSpec) -> std::io::Result<LaunchedWorker> {
            let (tx, exit) = tokio::sync::oneshot::channel();
            std::mem::forget(tx);
            Ok(LaunchedWorker {
                pid: i32::MAX as u32 - 7,
                exit,
            })
        }
    }

    async fn app(sync_enabled: bool) -> Router {
        let db = Database::new_in_memory().await.unwrap();
        let state = AppState::new(
            Arc::new(MemoryStore::new()),
            Arc::new(HangingLauncher),
            db,
            DEFAULT_LOCK_TTL,
            sync_enabled,
        );
        crate::routes::api_routes(state)
    }

    async fn send(app: &Router, method: Method, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_status_when_idle() {
        let app = app(true).await;
        let (status, body) = send(&app, Method::GET, "/api/sync/status").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["syncEnabled"], true);
        assert_eq!(body["globalSync"]["isRunning"], false);
        assert_eq!(body["globalSync"]["status"], "idle");
        assert_eq!(body["singleSync"]["isRunning"], false);
        assert_eq!(body["canStartGlobalSync"], true);
        assert_eq!(body["canStartSingleSync"], true);
    }

    #[tokio::test]
    async fn test_start_global_then_conflict_for_single() {
        let app = app(true).await;
        let (status, body) = send(&app, Method::POST, "/api/sync/global").await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["success"], true);
        assert_eq!(body["pid"], i32::MAX as u32 - 7);

        let (status, body) = send(&app, Method::POST, "/api/sync/conversation/c-1").await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "GLOBAL_SYNC_IN_PROGRESS");
        assert_eq!(body["lockType"], "global");

        let (_, body) = send(&app, Method::GET, "/api/sync/status").await;
        assert_eq!(body["globalSync"]["isRunning"], true);
        assert_eq!(body["globalSync"]["status"], "running");
        assert_eq!(body["canStartSingleSync"], false);
    }

    #[tokio::test]
    async fn test_single_conflict_names_conversation() {
        let app = app(true).await;
        let (status, _) = send(&app, Method::POST, "/api/sync/conversation/c-1").await;
        assert_eq!(status, StatusCode::ACCEPTED);

        let (status, body) = send(&app, Method::POST, "/api/sync/global").await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "SINGLE_SYNC_IN_PROGRESS");
        assert_eq!(body["lockConversationId"], "c-1");

        let (_, body) = send(&app, Method::GET, "/api/sync/conversation/c-1").await;
        assert_eq!(body["isRunning"], true);
        let (_, body) = send(&app, Method::GET, "/api/sync/conversation/c-2").await;
        assert_eq!(body["status"], "idle");
        assert_eq!(body["isRunning"], false);
    }

    #[tokio::test]
    async fn test_cancel_is_scoped_to_kind() {
        let app = app(true).await;
        send(&app, Method::POST, "/api/sync/conversation/c-1").await;

        let (status, _) = send(&app, Method::DELETE, "/api/sync/global").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = send(&app, Method::DELETE, "/api/sync/conversation").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);

        let (_, body) = send(&app, Method::GET, "/api/sync/status").await;
        assert_eq!(body["singleSync"]["status"], "cancelled");
        assert_eq!(body["canStartGlobalSync"], true);
    }

    #[tokio::test]
    async fn test_disabled_rejects_mutations_but_serves_status() {
        let app = app(false).await;
        for (method, uri) in [
            (Method::POST, "/api/sync/global"),
            (Method::DELETE, "/api/sync/global"),
            (Method::POST, "/api/sync/conversation/c-1"),
            (Method::DELETE, "/api/sync/conversation"),
        ] {
            let (status, body) = send(&app, method, uri).await;
            assert_eq!(status, StatusCode::FORBIDDEN, "{uri}");
            assert_eq!(body["code"], "SYNC_DISABLED");
            assert_eq!(body["syncEnabled"], false);
        }

        let (status, body) = send(&app, Method::GET, "/api/sync/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["syncEnabled"], false);
    }
}
