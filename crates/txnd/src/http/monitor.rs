//! Health endpoint: GET /monitor.
//!
//! Serves the daemon's latest snapshot together with a verdict. The HTTP
//! status is the verdict status, so a plain health check only needs the code.

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    Json,
};
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::warn;
use txnd_engine::{health, Monitor};

use crate::app::MonitorState;

const AUTH_HEADER: &str = "x-authentication";

/// GET /monitor
///
/// 403 on a wrong `x-authentication` header, 500 when no snapshot can be
/// read, otherwise the verdict status with the snapshot checks.
pub async fn monitor_handler(
    State(state): State<Arc<MonitorState>>,
    headers: HeaderMap,
) -> (StatusCode, Json<Value>) {
    let presented = headers.get(AUTH_HEADER).and_then(|v| v.to_str().ok());
    if !health::authorize(presented, state.authentication.as_deref()) {
        warn!("monitor request with wrong authentication header");
        return (
            StatusCode::FORBIDDEN,
            Json(json!({"status": 403, "message": "Forbidden"})),
        );
    }

    let Some(path) = state.monitor_file.as_deref() else {
        return unavailable("monitoring is disabled".to_string());
    };
    let snapshot = match Monitor::read(path) {
        Ok(snapshot) => snapshot,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "monitor snapshot unreadable");
            return unavailable(format!("snapshot unreadable: {e}"));
        }
    };

    let verdict = health::evaluate(&snapshot, Utc::now());
    let code = StatusCode::from_u16(verdict.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (
        code,
        Json(json!({
            "status": verdict.status,
            "message": verdict.message,
            "checks": snapshot,
        })),
    )
}

fn unavailable(message: String) -> (StatusCode, Json<Value>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"status": 500, "message": message})),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use chrono::Duration;
    use txnd_engine::monitor::SNAPSHOT_TIME_FORMAT;
    use txnd_engine::{Check, Snapshot};

    fn check(result: Value) -> Check {
        Check {
            result,
            message: String::new(),
        }
    }

    fn snapshot(runnable: u64) -> Snapshot {
        let now = Utc::now();
        let stamp = |at: chrono::DateTime<Utc>| json!(at.format(SNAPSHOT_TIME_FORMAT).to_string());
        Snapshot {
            database: check(json!(true)),
            recurring: check(json!(0)),
            last_update: check(stamp(now)),
            runnable: check(json!(runnable)),
            last_successful: check(stamp(now - Duration::minutes(5))),
        }
    }

    fn state(dir: &tempfile::TempDir, snapshot: Option<&Snapshot>, secret: Option<&str>) -> Arc<MonitorState> {
        let path = dir.path().join("txnd.status");
        if let Some(snapshot) = snapshot {
            std::fs::write(&path, serde_json::to_vec(snapshot).unwrap()).unwrap();
        }
        Arc::new(MonitorState {
            monitor_file: Some(path),
            authentication: secret.map(str::to_string),
        })
    }

    fn with_auth(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(AUTH_HEADER, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[tokio::test]
    async fn healthy_snapshot_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(&dir, Some(&snapshot(2)), None);

        let (code, Json(body)) = monitor_handler(State(state), HeaderMap::new()).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["message"], "OK");
        assert_eq!(body["checks"]["runnable"]["result"], 2);
    }

    #[tokio::test]
    async fn backlog_is_reported_as_warning() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(&dir, Some(&snapshot(10_000)), None);

        let (code, Json(body)) = monitor_handler(State(state), HeaderMap::new()).await;
        assert_eq!(code, StatusCode::BAD_REQUEST);
        assert_eq!(body["status"], 400);
        assert!(body["message"].as_str().unwrap().starts_with("check_runnable"));
    }

    #[tokio::test]
    async fn wrong_secret_is_forbidden() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(&dir, Some(&snapshot(0)), Some("s3cret"));

        let (code, _) = monitor_handler(State(state.clone()), HeaderMap::new()).await;
        assert_eq!(code, StatusCode::FORBIDDEN);
        let (code, _) = monitor_handler(State(state.clone()), with_auth("nope")).await;
        assert_eq!(code, StatusCode::FORBIDDEN);
        let (code, _) = monitor_handler(State(state), with_auth("s3cret")).await;
        assert_eq!(code, StatusCode::OK);
    }

    #[tokio::test]
    async fn missing_snapshot_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(&dir, None, None);

        let (code, Json(body)) = monitor_handler(State(state), HeaderMap::new()).await;
        assert_eq!(code, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body["message"].as_str().unwrap().contains("unreadable"));
    }

    #[tokio::test]
    async fn disabled_monitor_is_an_error() {
        let state = Arc::new(MonitorState {
            monitor_file: None,
            authentication: None,
        });
        let (code, _) = monitor_handler(State(state), HeaderMap::new()).await;
        assert_eq!(code, StatusCode::INTERNAL_SERVER_ERROR);
    }
}
