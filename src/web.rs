use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::registry::CameraCore;
use crate::types::CameraIndex;

/// Read-only diagnostics over the camera core
pub fn create_web_router(core: Arc<CameraCore>) -> Router {
    Router::new()
        .route("/api/cameras", get(list_cameras))
        .route("/api/cameras/:index", get(get_camera))
        .route("/api/internet", get(internet_status))
        .layer(CorsLayer::permissive())
        .with_state(core)
}

pub async fn start_web_server(
    port: u16,
    core: Arc<CameraCore>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let app = create_web_router(core);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
    info!("🌐 diagnostics listening on port {}", port);
    axum::serve(listener, app).await?;
    Ok(())
}

async fn list_cameras(State(core): State<Arc<CameraCore>>) -> impl IntoResponse {
    let cameras = core.cameras();
    Json(json!({
        "code": 200,
        "message": "OK",
        "data": {
            "count": cameras.len(),
            "cameras": cameras,
        }
    }))
}

async fn get_camera(
    Path(index): Path<usize>,
    State(core): State<Arc<CameraCore>>,
) -> Response {
    match core.camera_status(CameraIndex(index)) {
        Ok(status) => Json(json!({
            "code": 200,
            "message": "OK",
            "data": status,
        }))
        .into_response(),
        Err(e) => (
            StatusCode::NOT_FOUND,
            Json(json!({
                "code": 404,
                "message": e.to_string(),
            })),
        )
            .into_response(),
    }
}

async fn internet_status(State(core): State<Arc<CameraCore>>) -> impl IntoResponse {
    Json(json!({
        "code": 200,
        "message": "OK",
        "data": { "available": core.internet_available() }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{LoggingAdapter, NoopEvents};
    use crate::config::{AppConfig, CameraConfig, CameraProtocol};
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    fn core() -> Arc<CameraCore> {
        let config = AppConfig {
            cameras: vec![
                CameraConfig::new(0, "10.0.0.1", CameraProtocol::Onvif),
                CameraConfig::new(1, "10.0.0.2", CameraProtocol::Http),
            ],
            ..AppConfig::default()
        };
        CameraCore::new(&config, Arc::new(LoggingAdapter), Arc::new(NoopEvents)).unwrap()
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn lists_every_camera() {
        let core = core();
        let (status, body) = get_json(create_web_router(core.clone()), "/api/cameras").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["count"], 2);
        assert_eq!(body["data"]["cameras"][1]["protocol"], "http");
        core.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_camera_is_not_found() {
        let core = core();
        let (status, body) = get_json(create_web_router(core.clone()), "/api/cameras/7").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["message"], "unknown camera cam07");

        let (status, body) = get_json(create_web_router(core.clone()), "/api/cameras/0").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["streams"][0]["state"], "OFF");
        core.shutdown().await;
    }

    #[tokio::test]
    async fn internet_starts_unavailable() {
        let core = core();
        let (_, body) = get_json(create_web_router(core.clone()), "/api/internet").await;
        assert_eq!(body["data"]["available"], false);
        core.shutdown().await;
    }
}
