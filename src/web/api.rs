//! Axum routes and handlers for the host API.

use crate::web::channel::HostRequest;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use tokio::sync::mpsc::Sender;
use tokio::sync::oneshot;

pub type AppState = Sender<HostRequest>;

#[derive(Debug, Deserialize)]
pub struct GcodeCommandRequest {
    pub command: String,
}

#[derive(Debug, Deserialize)]
pub struct ObjectsQuery {
    /// Comma separated object names.
    #[serde(default)]
    pub objects: String,
}

/// Helper to create a JSON error response with a message and status code
fn json_error(message: &str, status: StatusCode) -> axum::response::Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

pub fn create_router(host_tx: AppState) -> Router {
    Router::new()
        .route("/api/v1/gcode", post(execute_gcode))
        .route("/api/v1/objects/query", get(query_objects))
        .route("/api/v1/objects/list", get(list_objects))
        .with_state(host_tx)
}

/// Send a request to the host task and wait for its answer.
async fn ask<T>(host_tx: &AppState, build: impl FnOnce(oneshot::Sender<T>) -> HostRequest) -> Option<T> {
    let (resp_tx, resp_rx) = oneshot::channel();
    host_tx.send(build(resp_tx)).await.ok()?;
    resp_rx.await.ok()
}

async fn execute_gcode(
    State(host_tx): State<AppState>,
    Json(payload): Json<GcodeCommandRequest>,
) -> axum::response::Response {
    let reply = ask(&host_tx, |respond_to| HostRequest::ExecuteGcode {
        command: payload.command,
        respond_to,
    })
    .await;
    match reply {
        Some(Ok(result)) => (StatusCode::OK, Json(serde_json::json!({ "result": result }))).into_response(),
        Some(Err(message)) => json_error(&message, StatusCode::CONFLICT),
        None => json_error("Internal error", StatusCode::INTERNAL_SERVER_ERROR),
    }
}

async fn query_objects(
    State(host_tx): State<AppState>,
    Query(query): Query<ObjectsQuery>,
) -> axum::response::Response {
    let objects: Vec<String> = query
        .objects
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect();
    match ask(&host_tx, |respond_to| HostRequest::QueryObjects { objects, respond_to }).await {
        Some(status) => (StatusCode::OK, Json(serde_json::json!({ "status": status }))).into_response(),
        None => json_error("Internal error", StatusCode::INTERNAL_SERVER_ERROR),
    }
}

async fn list_objects(State(host_tx): State<AppState>) -> axum::response::Response {
    match ask(&host_tx, |respond_to| HostRequest::ListObjects { respond_to }).await {
        Some(objects) => (StatusCode::OK, Json(serde_json::json!({ "objects": objects }))).into_response(),
        None => json_error("Internal error", StatusCode::INTERNAL_SERVER_ERROR),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::util::ServiceExt;

    #[tokio::test]
    async fn test_gcode_error_maps_to_conflict() {
        let (host_tx, mut host_rx) = tokio::sync::mpsc::channel(4);
        tokio::spawn(async move {
            while let Some(request) = host_rx.recv().await {
                if let HostRequest::ExecuteGcode { respond_to, .. } = request {
                    let _ = respond_to.send(Err("Command not defined for this heater".to_string()));
                }
            }
        });
        let request = Request::builder()
            .method("POST")
            .uri("/api/v1/gcode")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"command":"INO_FIRMWARE_VERSION HEATER=heater_bed"}"#))
            .unwrap();
        let response = create_router(host_tx).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], "Command not defined for this heater");
    }

    #[tokio::test]
    async fn test_host_gone_is_internal_error() {
        let (host_tx, host_rx) = tokio::sync::mpsc::channel(4);
        drop(host_rx);
        let request = Request::builder()
            .uri("/api/v1/objects/list")
            .body(Body::empty())
            .unwrap();
        let response = create_router(host_tx).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
