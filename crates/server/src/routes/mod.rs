//! API route handlers for the inbox-sync server.

pub mod health;
pub mod listener;
pub mod metrics;
pub mod sync;

use std::sync::Arc;

use axum::Router;

use crate::state::AppState;

/// Create the combined router.
///
/// Routes:
/// - GET    /api/health - Health check
/// - GET    /api/sync/status - Aggregated global + single sync status
/// - POST   /api/sync/global - Start a global sync
/// - DELETE /api/sync/global - Cancel the running global sync
/// - GET    /api/sync/conversation/{id} - Sync status of one conversation
/// - POST   /api/sync/conversation/{id} - Start a single-conversation sync
/// - DELETE /api/sync/conversation - Cancel the running single sync
/// - GET    /api/sync/listener - Real-time listener health
/// - GET    /metrics - Prometheus metrics
pub fn api_routes(state: Arc<AppState>) -> Router {
    Router::new()
        .nest("/api", health::router())
        .nest("/api", sync::router())
        .nest("/api", listener::router())
        .merge(metrics::router())
        .with_state(state)
}
