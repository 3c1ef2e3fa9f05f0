//! Real-time listener health endpoint.

use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};
use chrono::Utc;
use inbox_sync_core::ListenerReport;
use inbox_sync_db::LISTENER_LOCK_TYPE;

use crate::error::ApiResult;
use crate::state::AppState;

/// GET /api/sync/listener - Health derived from the listener's heartbeat and lease.
pub async fn get_listener(State(state): State<Arc<AppState>>) -> ApiResult<Json<ListenerReport>> {
    let listener_state = state.db.get_listener_state().await?;
    let lock = state.db.get_listener_lock(LISTENER_LOCK_TYPE).await?;
    let report = ListenerReport::build(listener_state.as_ref(), lock.as_ref(), Utc::now());
    tracing::debug!(status = report.status.as_str(), "Listener health evaluated");
    Ok(Json(report))
}

/// Create the listener routes router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/sync/listener", get(get_listener))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use inbox_sync_core::launcher::LaunchedWorker;
    use inbox_sync_core::{Launcher, ListenerState, MemoryStore, WorkerSpec, DEFAULT_LOCK_TTL};
    use inbox_sync_db::Database;
    use std::time::Duration;
    use tower::ServiceExt;

    struct NoLauncher;

    impl Launcher for NoLauncher {
        fn spawn(&self, _spec: &WorkerSpec) -> std::io::Result<LaunchedWorker> {
            Err(std::io::Error::new(std::io::ErrorKind::Unsupported, "no worker"))
        }
    }

    async fn get_report(db: Database) -> serde_json::Value {
        let state = AppState::new(
            Arc::new(MemoryStore::new()),
            Arc::new(NoLauncher),
            db,
            DEFAULT_LOCK_TTL,
            true,
        );
        let response = crate::routes::api_routes(state)
            .oneshot(
                Request::builder()
                    .uri("/api/sync/listener")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_offline_without_lock() {
        let db = Database::new_in_memory().await.unwrap();
        let body = get_report(db).await;
        assert_eq!(body["status"], "offline");
        assert_eq!(body["isRunning"], false);
        assert_eq!(body["isHealthy"], false);
        assert!(body["lockInfo"].is_null());
    }

    #[tokio::test]
    async fn test_unknown_with_lock_but_no_heartbeat() {
        let db = Database::new_in_memory().await.unwrap();
        db.acquire_listener_lock(LISTENER_LOCK_TYPE, 77, Duration::from_secs(300), Utc::now())
            .await
            .unwrap();
        let body = get_report(db).await;
        assert_eq!(body["status"], "unknown");
        assert_eq!(body["isRunning"], true);
        assert!(body["lockInfo"]["acquiredAt"].is_string());
    }

    #[tokio::test]
    async fn test_healthy_and_stale_heartbeats() {
        let db = Database::new_in_memory().await.unwrap();
        let now = Utc::now();
        db.acquire_listener_lock(LISTENER_LOCK_TYPE, 77, Duration::from_secs(300), now)
            .await
            .unwrap();
        let mut state = ListenerState {
            status: "running".to_string(),
            process_id: Some(77),
            hostname: Some("mail-box".to_string()),
            started_at: Some(now - chrono::Duration::hours(1)),
            last_heartbeat: Some(now - chrono::Duration::seconds(20)),
            last_message_at: None,
            messages_received: 5,
        };
        db.record_listener_heartbeat(&state).await.unwrap();

        let body = get_report(db.clone()).await;
        assert_eq!(body["status"], "running-healthy");
        assert_eq!(body["isHealthy"], true);
        assert_eq!(body["processId"], 77);
        assert_eq!(body["hostname"], "mail-box");
        assert_eq!(body["messagesReceived"], 5);

        state.last_heartbeat = Some(now - chrono::Duration::minutes(10));
        db.record_listener_heartbeat(&state).await.unwrap();
        let body = get_report(db).await;
        assert_eq!(body["status"], "running-stale");
        assert_eq!(body["isRunning"], true);
        assert_eq!(body["isHealthy"], false);
    }
}
