//! Loopback HTTP control surface: `/health` and `/shutdown`, 404 for everything else.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct ControlState {
    pub pid: u32,
    /// Cleared once the child has been signaled or has exited.
    pub child_alive: Arc<AtomicBool>,
    pub shutdown: CancellationToken,
}

pub fn router(state: ControlState) -> Router {
    Router::new()
        .route("/health", get(health).fallback(not_found))
        .route("/shutdown", post(shutdown).fallback(not_found))
        .fallback(not_found)
        .with_state(state)
}

async fn health(State(state): State<ControlState>) -> Json<Value> {
    Json(json!({
        "ok": true,
        "pid": state.pid,
        "childAlive": state.child_alive.load(Ordering::SeqCst),
    }))
}

async fn shutdown(State(state): State<ControlState>) -> Json<Value> {
    tracing::info!(pid = state.pid, "shutdown requested");
    state.shutdown.cancel();
    Json(json!({ "ok": true }))
}

async fn not_found() -> StatusCode {
    StatusCode::NOT_FOUND
}

/// Binds the control endpoint on loopback. A port that is already taken is logged and
/// skipped; the child keeps running without a control surface.
pub async fn serve(port: u16, state: ControlState, stop: CancellationToken) -> Option<JoinHandle<()>> {
    let listener = match TcpListener::bind(("127.0.0.1", port)).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::warn!(port, "control port unavailable, continuing without it: {}", e);
            return None;
        }
    };
    tracing::info!(port, "control endpoint listening");
    let app = router(state);
    Some(tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move { stop.cancelled().await })
            .await;
        if let Err(e) = result {
            tracing::warn!("control endpoint failed: {}", e);
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{Method, Request};
    use tower::ServiceExt;

    fn state() -> ControlState {
        ControlState {
            pid: 4242,
            child_alive: Arc::new(AtomicBool::new(true)),
            shutdown: CancellationToken::new(),
        }
    }

    async fn call(app: Router, method: Method, uri: &str) -> (StatusCode, Option<Value>) {
        let response = app
            .oneshot(Request::builder().method(method).uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).ok())
    }

    #[tokio::test]
    async fn health_reports_child_pid_and_liveness() {
        let state = state();
        let (status, body) = call(router(state.clone()), Method::GET, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, Some(json!({"ok": true, "pid": 4242, "childAlive": true})));

        state.child_alive.store(false, Ordering::SeqCst);
        let (_, body) = call(router(state), Method::GET, "/health").await;
        assert_eq!(body.unwrap()["childAlive"], json!(false));
    }

    #[tokio::test]
    async fn shutdown_acknowledges_and_fires_token() {
        let state = state();
        let (status, body) = call(router(state.clone()), Method::POST, "/shutdown").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, Some(json!({"ok": true})));
        assert!(state.shutdown.is_cancelled());
    }

    #[tokio::test]
    async fn other_paths_and_methods_are_not_found() {
        let state = state();
        for (method, uri) in [
            (Method::GET, "/shutdown"),
            (Method::POST, "/health"),
            (Method::GET, "/"),
            (Method::DELETE, "/session"),
        ] {
            let (status, _) = call(router(state.clone()), method.clone(), uri).await;
            assert_eq!(status, StatusCode::NOT_FOUND, "{method} {uri}");
        }
        assert!(!state.shutdown.is_cancelled());
    }

    #[tokio::test]
    async fn occupied_port_is_not_fatal() {
        let holder = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = holder.local_addr().unwrap().port();
        assert!(serve(port, state(), CancellationToken::new()).await.is_none());
    }
}
