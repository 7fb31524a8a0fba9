use axum::{routing::get, Router};
use std::path::PathBuf;
use std::sync::Arc;
use txnd_core::TxndConfig;

/// Shared state of the health endpoint, passed as `Arc<MonitorState>` to handlers.
pub struct MonitorState {
    /// Snapshot written by the daemon. `None` when monitoring is disabled.
    pub monitor_file: Option<PathBuf>,
    /// Expected `x-authentication` header value.
    pub authentication: Option<String>,
}

impl MonitorState {
    pub fn from_config(config: &TxndConfig) -> Self {
        Self {
            monitor_file: config.daemon.monitor_file.as_ref().map(PathBuf::from),
            authentication: config.monitor.authentication.clone(),
        }
    }
}

/// Assemble the health endpoint router.
pub fn build_router(state: Arc<MonitorState>) -> Router {
    Router::new()
        .route("/monitor", get(crate::http::monitor::monitor_handler))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
