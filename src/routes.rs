use axum::{
    extract::{multipart::MultipartError, DefaultBodyLimit, Multipart, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::{
    api::Transport,
    error::{ApiError, ValidationError},
    models::{DesignRecord, FieldSpec, WorkflowKind},
    preview::PreviewStore,
    workflow::{WorkflowController, WorkflowSnapshot},
};

#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<RwLock<HashMap<Uuid, Arc<WorkflowController>>>>,
    pub transport: Arc<dyn Transport>,
    pub previews: PreviewStore,
    pub request_timeout: Duration,
    pub session_ttl: Duration,
}

pub fn router(state: AppState, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/api/workflows", get(list_workflows))
        .route("/api/sessions", post(create_session))
        .route("/api/sessions/:id", get(get_session).delete(delete_session))
        .route("/api/sessions/:id/file", post(select_file))
        .route("/api/sessions/:id/fields", put(set_field))
        .route("/api/sessions/:id/submit", post(submit))
        .route("/api/designs", get(list_designs))
        .route("/previews/:id", get(get_preview))
        .layer(
            ServiceBuilder::new()
                .layer(DefaultBodyLimit::max(max_upload_bytes))
                .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any)),
        )
        .with_state(state)
}

#[derive(Debug)]
pub enum AppError {
    NotFound,
    Validation(ValidationError),
    BadRequest(String),
    Upstream(ApiError),
}

impl From<ValidationError> for AppError {
    fn from(e: ValidationError) -> Self {
        AppError::Validation(e)
    }
}

impl From<MultipartError> for AppError {
    fn from(e: MultipartError) -> Self {
        AppError::BadRequest(e.body_text())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::NotFound => (StatusCode::NOT_FOUND, "Session not found".to_string()),
            AppError::Validation(e) => (StatusCode::UNPROCESSABLE_ENTITY, e.to_string()),
            AppError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            AppError::Upstream(e @ ApiError::Timeout(_)) => (StatusCode::GATEWAY_TIMEOUT, e.to_string()),
            AppError::Upstream(e) => (StatusCode::BAD_GATEWAY, e.to_string()),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

fn session(state: &AppState, id: &Uuid) -> Result<Arc<WorkflowController>, AppError> {
    state.sessions.read().get(id).cloned().ok_or(AppError::NotFound)
}

#[derive(Serialize)]
pub struct WorkflowCatalog {
    pub kind: WorkflowKind,
    pub fields: &'static [FieldSpec],
}

pub async fn list_workflows() -> Json<Vec<WorkflowCatalog>> {
    Json(WorkflowKind::ALL.iter().map(|&kind| WorkflowCatalog { kind, fields: kind.fields() }).collect())
}

#[derive(Debug, Deserialize)]
pub struct CreateSession {
    pub kind: WorkflowKind,
}

#[derive(Serialize)]
pub struct SessionView {
    pub id: Uuid,
    pub state: WorkflowSnapshot,
}

pub async fn create_session(State(state): State<AppState>, Json(body): Json<CreateSession>) -> (StatusCode, Json<SessionView>) {
    let id = Uuid::new_v4();
    let controller = Arc::new(WorkflowController::new(
        body.kind,
        state.transport.clone(),
        state.previews.clone(),
        state.request_timeout,
    ));
    state.sessions.write().insert(id, controller.clone());
    tracing::info!(%id, kind = ?body.kind, "🎯 Session created");

    if body.kind == WorkflowKind::FloorPlan {
        let styles_for = controller.clone();
        tokio::spawn(async move {
            // Failure is already logged; the form keeps its default style.
            let _ = styles_for.load_styles().await;
        });
    }

    (StatusCode::CREATED, Json(SessionView { id, state: controller.snapshot() }))
}

pub async fn get_session(Path(id): Path<Uuid>, State(state): State<AppState>) -> Result<Json<WorkflowSnapshot>, AppError> {
    Ok(Json(session(&state, &id)?.snapshot()))
}

pub async fn delete_session(Path(id): Path<Uuid>, State(state): State<AppState>) -> Result<StatusCode, AppError> {
    let controller = state.sessions.write().remove(&id).ok_or(AppError::NotFound)?;
    controller.close();
    tracing::info!(%id, previews = state.previews.len(), "Session closed");
    Ok(StatusCode::NO_CONTENT)
}

pub async fn select_file(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<WorkflowSnapshot>, AppError> {
    let controller = session(&state, &id)?;
    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some("image") {
            continue;
        }
        let name = field.file_name().unwrap_or("upload").to_string();
        let bytes = field.bytes().await?;
        controller.select_file(name, bytes)?;
        return Ok(Json(controller.snapshot()));
    }
    Err(ValidationError::MissingFile.into())
}

#[derive(Debug, Deserialize)]
pub struct SetField {
    pub name: String,
    pub value: String,
}

pub async fn set_field(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
    Json(body): Json<SetField>,
) -> Result<Json<WorkflowSnapshot>, AppError> {
    let controller = session(&state, &id)?;
    controller.set_field(&body.name, body.value)?;
    Ok(Json(controller.snapshot()))
}

#[derive(Debug, Default, Deserialize)]
pub struct SubmitParams {
    /// Hold the response until the submission settles instead of returning 202.
    #[serde(default)]
    pub wait: bool,
}

pub async fn submit(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
    Query(params): Query<SubmitParams>,
) -> Result<Response, AppError> {
    let controller = session(&state, &id)?;
    if params.wait {
        let outcome = controller.submit().await?;
        tracing::info!(%id, ?outcome, "Submission settled");
        return Ok(Json(controller.snapshot()).into_response());
    }
    let request_id = controller.spawn_submit()?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "request_id": request_id }))).into_response())
}

/// Stored floor plan designs, in the order the service returns them.
pub async fn list_designs(State(state): State<AppState>) -> Result<Json<Vec<DesignRecord>>, AppError> {
    let designs = tokio::time::timeout(state.request_timeout, state.transport.list_designs())
        .await
        .map_err(|_| ApiError::Timeout(state.request_timeout))
        .and_then(|r| r)
        .map_err(|e| {
            tracing::warn!("⚠️ Failed to load designs: {}", e);
            AppError::Upstream(e)
        })?;
    Ok(Json(designs))
}

/// Closes and removes every session idle since before `now - session_ttl`.
pub fn expire_idle_sessions(state: &AppState, now: DateTime<Utc>) -> usize {
    let Some(cutoff) = chrono::Duration::from_std(state.session_ttl).ok().and_then(|ttl| now.checked_sub_signed(ttl))
    else {
        return 0;
    };

    let expired: Vec<(Uuid, Arc<WorkflowController>)> = {
        let mut sessions = state.sessions.write();
        let ids: Vec<Uuid> = sessions.iter().filter(|(_, c)| c.idle_since(cutoff)).map(|(id, _)| *id).collect();
        ids.into_iter().filter_map(|id| sessions.remove(&id).map(|c| (id, c))).collect()
    };
    for (id, controller) in &expired {
        controller.close();
        tracing::info!(%id, "⏳ Session expired");
    }
    expired.len()
}

pub fn spawn_session_sweeper(state: AppState, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let removed = expire_idle_sessions(&state, Utc::now());
            if removed > 0 {
                tracing::info!(removed, sessions = state.sessions.read().len(), "Idle sessions swept");
            }
            if state.sessions.read().is_empty() && !state.previews.is_empty() {
                tracing::warn!(previews = state.previews.len(), "Previews left without any session");
            }
        }
    })
}

pub async fn get_preview(Path(id): Path<Uuid>, State(state): State<AppState>) -> Response {
    match state.previews.get(&id) {
        Some(preview) => ([(header::CONTENT_TYPE, preview.mime)], preview.bytes).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{api::{serve_stub, ApiClient}, models::TEST_PNG};
    use axum::{body::Body, http::Request};
    use pretty_assertions::assert_eq;
    use serde_json::Value;
    use tower::ServiceExt;

    const BOUNDARY: &str = "interior-pilot-test-boundary";

    fn state(api_base: &str, session_ttl: Duration) -> AppState {
        AppState {
            sessions: Arc::default(),
            transport: Arc::new(ApiClient::new(api_base)),
            previews: PreviewStore::default(),
            request_timeout: Duration::from_secs(5),
            session_ttl,
        }
    }

    fn app(api_base: &str) -> Router {
        router(state(api_base, Duration::from_secs(1800)), 1024 * 1024)
    }

    async fn call(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() { Value::Null } else { serde_json::from_slice(&bytes).unwrap() };
        (status, body)
    }

    fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn empty_request(method: &str, uri: &str) -> Request<Body> {
        Request::builder().method(method).uri(uri).body(Body::empty()).unwrap()
    }

    fn file_request(uri: &str, file_name: &str, bytes: &[u8]) -> Request<Body> {
        let mut body = format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"image\"; filename=\"{file_name}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
        )
        .into_bytes();
        body.extend_from_slice(bytes);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, format!("multipart/form-data; boundary={BOUNDARY}"))
            .body(Body::from(body))
            .unwrap()
    }

    async fn create(app: &Router, kind: &str) -> String {
        let (status, body) = call(app, json_request("POST", "/api/sessions", json!({ "kind": kind }))).await;
        assert_eq!(status, StatusCode::CREATED);
        body["id"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn catalog_lists_all_workflows() {
        let app = app("http://127.0.0.1:9");
        let (status, body) = call(&app, empty_request("GET", "/api/workflows")).await;
        assert_eq!(status, StatusCode::OK);
        let kinds: Vec<&str> = body.as_array().unwrap().iter().map(|w| w["kind"].as_str().unwrap()).collect();
        assert_eq!(kinds, vec!["layout", "room_design", "floor_plan"]);
    }

    #[tokio::test]
    async fn submit_without_file_is_unprocessable() {
        let app = app("http://127.0.0.1:9");
        let id = create(&app, "layout").await;

        let (status, body) = call(&app, empty_request("POST", &format!("/api/sessions/{id}/submit"))).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"], "Please select an image");

        let (_, snapshot) = call(&app, empty_request("GET", &format!("/api/sessions/{id}"))).await;
        assert_eq!(snapshot["phase"], "idle");
    }

    #[tokio::test]
    async fn unknown_session_and_field_are_reported() {
        let app = app("http://127.0.0.1:9");
        let (status, _) = call(&app, empty_request("GET", &format!("/api/sessions/{}", Uuid::new_v4()))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let id = create(&app, "layout").await;
        let (status, body) = call(
            &app,
            json_request("PUT", &format!("/api/sessions/{id}/fields"), json!({ "name": "theme", "value": "x" })),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"], "Unknown field: theme");
    }

    #[tokio::test]
    async fn waiting_submit_reports_upload_failure() {
        let service = Router::new().route(
            "/api/upload-image/",
            axum::routing::post(|| async { (StatusCode::PAYLOAD_TOO_LARGE, Json(json!({ "error": "file too large" }))) }),
        );
        let app = app(&serve_stub(service).await);
        let id = create(&app, "layout").await;
        call(&app, file_request(&format!("/api/sessions/{id}/file"), "huge.png", TEST_PNG)).await;
        call(
            &app,
            json_request("PUT", &format!("/api/sessions/{id}/fields"), json!({ "name": "prompt", "value": "loft" })),
        )
        .await;

        let (status, snapshot) = call(&app, empty_request("POST", &format!("/api/sessions/{id}/submit?wait=true"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(snapshot["phase"], "failed");
        assert!(snapshot["error"].as_str().unwrap().contains("file too large"));
        assert_eq!(snapshot["result"], Value::Null);
    }

    #[tokio::test]
    async fn layout_session_runs_end_to_end() {
        let service = Router::new()
            .route(
                "/api/upload-image/",
                axum::routing::post(|| async { Json(json!({ "url": "https://x/y.png", "message": "Image uploaded successfully" })) }),
            )
            .route(
                "/api/generate-3d-layout/",
                axum::routing::post(|| async {
                    Json(json!({ "message": "ok", "image_urls": ["https://x/out1.png", "https://x/out2.png"] }))
                }),
            );
        let app = app(&serve_stub(service).await);
        let id = create(&app, "layout").await;

        let (status, snapshot) = call(&app, file_request(&format!("/api/sessions/{id}/file"), "plan.png", TEST_PNG)).await;
        assert_eq!(status, StatusCode::OK);
        let preview_url = snapshot["preview_url"].as_str().unwrap().to_string();

        let preview = app.clone().oneshot(empty_request("GET", &preview_url)).await.unwrap();
        assert_eq!(preview.status(), StatusCode::OK);
        assert_eq!(preview.headers()[header::CONTENT_TYPE], "image/png");

        let (status, _) = call(
            &app,
            json_request("PUT", &format!("/api/sessions/{id}/fields"), json!({ "name": "prompt", "value": "open plan" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = call(&app, empty_request("POST", &format!("/api/sessions/{id}/submit"))).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["request_id"], 1);

        let mut snapshot = Value::Null;
        for _ in 0..200 {
            snapshot = call(&app, empty_request("GET", &format!("/api/sessions/{id}"))).await.1;
            if snapshot["phase"] == "succeeded" || snapshot["phase"] == "failed" {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(snapshot["phase"], "succeeded");
        assert_eq!(snapshot["result"]["images"], json!(["https://x/out1.png", "https://x/out2.png"]));
        assert_eq!(snapshot["error"], Value::Null);

        let (status, _) = call(&app, empty_request("DELETE", &format!("/api/sessions/{id}"))).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let gone = app.clone().oneshot(empty_request("GET", &preview_url)).await.unwrap();
        assert_eq!(gone.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn designs_are_proxied_from_the_service() {
        let service = Router::new().route(
            "/designs/",
            get(|| async {
                Json(json!([{ "id": 1, "generated_image": "/media/designs/one.png", "status": "completed" }]))
            }),
        );
        let base = serve_stub(service).await;
        let app = app(&base);

        let (status, body) = call(&app, empty_request("GET", "/api/designs")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["generated_image"], format!("{base}/media/designs/one.png"));
        assert_eq!(body[0]["status"], "completed");
    }

    #[tokio::test]
    async fn designs_failure_is_a_bad_gateway() {
        let service = Router::new().route(
            "/designs/",
            get(|| async { (StatusCode::SERVICE_UNAVAILABLE, Json(json!({ "error": "database offline" }))) }),
        );
        let app = app(&serve_stub(service).await);

        let (status, body) = call(&app, empty_request("GET", "/api/designs")).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["error"], "database offline");
    }

    #[tokio::test]
    async fn idle_sessions_expire_and_release_previews() {
        let state = state("http://127.0.0.1:9", Duration::from_secs(1800));
        let app = router(state.clone(), 1024 * 1024);
        let id = create(&app, "layout").await;
        let (_, snapshot) = call(&app, file_request(&format!("/api/sessions/{id}/file"), "plan.png", TEST_PNG)).await;
        let preview_url = snapshot["preview_url"].as_str().unwrap().to_string();

        assert_eq!(expire_idle_sessions(&state, Utc::now()), 0);
        assert_eq!(state.sessions.read().len(), 1);

        assert_eq!(expire_idle_sessions(&state, Utc::now() + chrono::Duration::hours(1)), 1);
        assert!(state.sessions.read().is_empty());
        assert!(state.previews.is_empty());

        let (status, _) = call(&app, empty_request("GET", &format!("/api/sessions/{id}"))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let gone = app.clone().oneshot(empty_request("GET", &preview_url)).await.unwrap();
        assert_eq!(gone.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn sweeper_removes_abandoned_sessions() {
        let state = state("http://127.0.0.1:9", Duration::ZERO);
        let app = router(state.clone(), 1024 * 1024);
        create(&app, "layout").await;
        create(&app, "room_design").await;

        let sweeper = spawn_session_sweeper(state.clone(), Duration::from_millis(10));
        for _ in 0..200 {
            if state.sessions.read().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        sweeper.abort();
        assert!(state.sessions.read().is_empty());
    }
}
