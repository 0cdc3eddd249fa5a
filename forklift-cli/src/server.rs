// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! HTTP front door of the worker.
//!
//! `/run/{name}` (and anything below it) is handed to the lambda manager
//! verbatim; the rest are small admin endpoints.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Body,
    extract::{Path, Request, State},
    http::{Response, StatusCode},
    response::IntoResponse,
    routing::{any, get},
    Json, Router,
};
use tower_http::trace::TraceLayer;
use tracing::Instrument;

use forklift_core::LambdaManager;

use crate::metrics;

pub fn router(manager: Arc<LambdaManager>) -> Router {
    Router::new()
        .route("/run/{name}", any(run_root))
        .route("/run/{name}/{*rest}", any(run_nested))
        .route("/pid", get(pid))
        .route("/status", get(status))
        .route("/stats", get(stats))
        .route("/debug", get(debug))
        .route("/metrics", get(prometheus_metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(manager)
}

/// Serve until `shutdown` resolves.
pub async fn serve(
    manager: Arc<LambdaManager>,
    port: u16,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "Worker listening");

    axum::serve(listener, router(manager))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn run_root(
    State(manager): State<Arc<LambdaManager>>,
    Path(name): Path<String>,
    req: Request,
) -> Response<Body> {
    invoke(manager, name, req).await
}

async fn run_nested(
    State(manager): State<Arc<LambdaManager>>,
    Path((name, _rest)): Path<(String, String)>,
    req: Request,
) -> Response<Body> {
    invoke(manager, name, req).await
}

async fn invoke(manager: Arc<LambdaManager>, name: String, req: Request) -> Response<Body> {
    let request_id = uuid::Uuid::new_v4();
    let span = tracing::info_span!("invoke", request_id = %request_id, function = %name);

    async move {
        let start = Instant::now();
        let (parts, body) = req.into_parts();
        let body = match axum::body::to_bytes(body, usize::MAX).await {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!(error = %e, "Could not read request body");
                return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
            }
        };

        let resp = manager
            .invoke(&name, axum::http::Request::from_parts(parts, body))
            .await;
        let elapsed = start.elapsed();
        metrics::record_invocation(&name, resp.status().as_u16(), elapsed.as_secs_f64());
        tracing::debug!(status = %resp.status(), elapsed_ms = elapsed.as_millis() as u64, "Invocation done");

        resp.map(Body::from)
    }
    .instrument(span)
    .await
}

async fn pid() -> String {
    std::process::id().to_string()
}

async fn status() -> &'static str {
    "ready\n"
}

async fn stats(State(manager): State<Arc<LambdaManager>>) -> impl IntoResponse {
    Json(manager.stats())
}

async fn debug(State(manager): State<Arc<LambdaManager>>) -> String {
    manager.debug_string().await
}

async fn prometheus_metrics() -> String {
    metrics::render()
}

#[cfg(test)]
mod tests {
    use super::*;
    use forklift_core::sandbox::mock::MockPool;
    use forklift_core::{ConfigFormat, ConfigLoader};
    use tower::ServiceExt;

    async fn test_router(dir: &std::path::Path) -> (Router, Arc<LambdaManager>) {
        let registry = dir.join("registry");
        std::fs::create_dir_all(&registry).unwrap();
        std::fs::write(registry.join("echo.py"), "def f(event):\n    return event\n").unwrap();

        let json = serde_json::json!({
            "worker_dir": dir.join("worker"),
            "sock_base_path": dir.join("base"),
            "registry": registry,
            "mem_pool_mb": 2048,
        });
        let conf = ConfigLoader::load_string(&json.to_string(), ConfigFormat::Json).unwrap();
        let manager = Arc::new(
            LambdaManager::with_pool(Arc::new(conf), Arc::new(MockPool::new(2048)))
                .await
                .unwrap(),
        );
        (router(manager.clone()), manager)
    }

    async fn body_text(resp: Response<Body>) -> String {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_run_and_admin_routes() {
        let dir = tempfile::TempDir::new().unwrap();
        let (app, manager) = test_router(dir.path()).await;

        let resp = app
            .clone()
            .oneshot(
                axum::http::Request::post("/run/echo")
                    .body(Body::from("hello"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_text(resp).await, "hello");

        let resp = app
            .clone()
            .oneshot(
                axum::http::Request::post("/run/echo/nested/path")
                    .body(Body::from("again"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(body_text(resp).await, "again");

        let resp = app
            .clone()
            .oneshot(axum::http::Request::get("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(body_text(resp).await, "ready\n");

        let resp = app
            .clone()
            .oneshot(axum::http::Request::get("/pid").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(body_text(resp).await, std::process::id().to_string());

        let resp = app
            .clone()
            .oneshot(axum::http::Request::get("/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let stats: serde_json::Value = serde_json::from_str(&body_text(resp).await).unwrap();
        assert_eq!(stats["functions"]["echo"]["invocations"], 2);

        let resp = app
            .oneshot(axum::http::Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert!(body_text(resp).await.contains("forklift_invocations_total"));

        manager.cleanup().await;
    }
}
