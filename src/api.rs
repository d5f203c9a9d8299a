use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::coordinator::RunCoordinator;
use crate::errors::OrchestratorError;
use crate::models::{JobStatus, LaneReport, PodLog};
use crate::trigger::StageSignal;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub coordinator: RunCoordinator,
}

pub type SharedState = Arc<AppState>;

// ── Request / response payload types ──────────────────────────────────

#[derive(Deserialize)]
pub struct RunRequest {
    #[serde(default)]
    pub prompt: String,
    #[serde(default = "default_num_agents")]
    pub num_agents: i64,
}

fn default_num_agents() -> i64 {
    1
}

#[derive(Deserialize)]
pub struct FailRequest {
    #[serde(default = "default_fail_reason")]
    pub reason: String,
}

fn default_fail_reason() -> String {
    "marked failed by operator".to_string()
}

#[derive(Serialize)]
pub struct StatusResponse {
    pub run_id: String,
    pub lanes: Vec<LaneReport>,
    pub jobs: Vec<JobStatus>,
}

#[derive(Serialize)]
pub struct ResultsResponse {
    pub job_name: String,
    pub logs: Vec<PodLog>,
}

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Internal(String),
}

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        let message = err.to_string();
        if !err.is_client_error() {
            error!(error = %format!("{:#}", anyhow::Error::from(err)), "Request failed");
            return ApiError::Internal(message);
        }
        match err {
            OrchestratorError::Validation(_) => ApiError::BadRequest(message),
            OrchestratorError::StageConflict { .. } => ApiError::Conflict(message),
            OrchestratorError::UnknownLane { .. } => ApiError::NotFound(message),
            _ => ApiError::Internal(message),
        }
    }
}

/// Malformed or mistyped JSON bodies get the same 400 shape as validation errors.
impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(OrchestratorError::validation(rejection.body_text()).to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

// ── Router ────────────────────────────────────────────────────────────

fn routes() -> Router<SharedState> {
    Router::new()
        .route("/run", post(submit_run))
        .route("/status/{run_id}", get(get_status))
        .route("/results/{job_name}", get(get_results))
        .route("/trigger", post(trigger))
        .route("/runs/{run_id}/lanes/{agent_id}/fail", post(fail_lane))
        .route("/runs/{run_id}/lanes/{agent_id}/history", get(lane_history))
        .route("/healthz", get(health_check))
}

/// All routes, served at the root and again under `/api` for the front door.
pub fn api_router() -> Router<SharedState> {
    Router::new().merge(routes()).nest("/api", routes())
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

async fn submit_run(
    State(state): State<SharedState>,
    payload: Result<Json<RunRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(req) = payload?;
    let num_agents = u32::try_from(req.num_agents.max(0)).unwrap_or(u32::MAX);
    let receipt = state
        .coordinator
        .submit_run(&req.prompt, num_agents)
        .await?;
    Ok(Json(receipt))
}

async fn get_status(
    State(state): State<SharedState>,
    Path(run_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let lanes = state.coordinator.get_status(&run_id).await?;
    let jobs = if lanes.is_empty() {
        Vec::new()
    } else {
        state
            .coordinator
            .aggregator()
            .list_jobs(&run_id)
            .await
            .unwrap_or_else(|e| {
                warn!(run_id = %run_id, error = %e, "Failed to list jobs");
                Vec::new()
            })
    };
    Ok(Json(StatusResponse { run_id, lanes, jobs }))
}

async fn get_results(
    State(state): State<SharedState>,
    Path(job_name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let logs = state.coordinator.aggregator().fetch_logs(&job_name).await?;
    Ok(Json(ResultsResponse { job_name, logs }))
}

async fn trigger(
    State(state): State<SharedState>,
    payload: Result<Json<StageSignal>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(signal) = payload?;
    let result = state
        .coordinator
        .advance_stage(&signal.run_id, signal.agent_id, signal.stage)
        .await?;
    Ok(Json(result))
}

async fn fail_lane(
    State(state): State<SharedState>,
    Path((run_id, agent_id)): Path<(String, u32)>,
    payload: Result<Json<FailRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(req) = payload?;
    let lane = state
        .coordinator
        .mark_failed(&run_id, agent_id, &req.reason)
        .await?;
    Ok(Json(lane))
}

async fn lane_history(
    State(state): State<SharedState>,
    Path((run_id, agent_id)): Path<(String, u32)>,
) -> Result<impl IntoResponse, ApiError> {
    let history = state.coordinator.lane_history(&run_id, agent_id).await?;
    if history.is_empty() {
        return Err(OrchestratorError::UnknownLane { run_id, agent_id }.into());
    }
    Ok(Json(history))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FanoutConfig;
    use crate::coordinator::CoordinatorSettings;
    use crate::jobs::JobSpecBuilder;
    use crate::store::{DbHandle, StateDb};
    use crate::substrate::InMemoryBackend;
    use crate::workspace::WorkspaceManager;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_app(dir: &std::path::Path) -> Router {
        test_app_with_backend(dir).0
    }

    fn test_app_with_backend(dir: &std::path::Path) -> (Router, Arc<InMemoryBackend>) {
        let mut config = FanoutConfig::default();
        config.storage.output_base = dir.to_path_buf();
        let backend = Arc::new(InMemoryBackend::new());
        let coordinator = RunCoordinator::new(
            CoordinatorSettings::from_config(&config),
            WorkspaceManager::new(dir),
            JobSpecBuilder::from_config(&config, |_| None),
            backend.clone(),
            DbHandle::new(StateDb::new_in_memory().unwrap()),
        );
        let app = api_router().with_state(Arc::new(AppState { coordinator }));
        (app, backend)
    }

    async fn body_json<T: serde::de::DeserializeOwned>(body: Body) -> T {
        let bytes = body.collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder()
            .method("GET")
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_check_at_root_and_api() {
        let dir = tempfile::tempdir().unwrap();
        for uri in ["/healthz", "/api/healthz"] {
            let response = test_app(dir.path()).oneshot(get(uri)).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            let body: serde_json::Value = body_json(response.into_body()).await;
            assert_eq!(body["status"], "ok");
        }
    }

    #[tokio::test]
    async fn test_submit_run_returns_job_names() {
        let dir = tempfile::tempdir().unwrap();
        let response = test_app(dir.path())
            .oneshot(post_json(
                "/api/run",
                serde_json::json!({"prompt": "write a poem", "num_agents": 2}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body: serde_json::Value = body_json(response.into_body()).await;
        let run_id = body["run_id"].as_str().unwrap();
        assert_eq!(run_id.len(), 8);
        let names = body["job_names"].as_array().unwrap();
        assert_eq!(names.len(), 2);
        assert_eq!(names[0], format!("fanout-{}-0-worker", run_id));
    }

    #[tokio::test]
    async fn test_submit_run_validation_errors_are_400() {
        let dir = tempfile::tempdir().unwrap();
        for body in [
            serde_json::json!({"prompt": "", "num_agents": 1}),
            serde_json::json!({"prompt": "x", "num_agents": 0}),
            serde_json::json!({"prompt": "x", "num_agents": -3}),
            serde_json::json!({"prompt": "x", "num_agents": 11}),
            serde_json::json!({"num_agents": 2}),
        ] {
            let response = test_app(dir.path())
                .oneshot(post_json("/run", body))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
            let body: serde_json::Value = body_json(response.into_body()).await;
            assert!(body["error"].as_str().unwrap().contains("Invalid request"));
        }
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_mistyped_bodies_are_400_with_json_error() {
        let dir = tempfile::tempdir().unwrap();
        let requests = [
            post_json("/run", serde_json::json!({"prompt": "x", "num_agents": "two"})),
            post_json("/api/run", serde_json::json!({"prompt": 5})),
            post_json("/trigger", serde_json::json!({"run_id": "ab12cd34", "stage": "worker"})),
            post_json("/trigger", serde_json::json!({"run_id": "ab12cd34", "agent_id": 0, "stage": "merger"})),
            Request::builder()
                .method("POST")
                .uri("/run")
                .header("content-type", "application/json")
                .body(Body::from("{not json"))
                .unwrap(),
        ];
        for request in requests {
            let response = test_app(dir.path()).oneshot(request).await.unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
            let body: serde_json::Value = body_json(response.into_body()).await;
            assert!(body["error"].as_str().unwrap().starts_with("Invalid request"), "{}", body);
        }
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_run_status_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let response = test_app(dir.path())
            .oneshot(get("/status/deadbeef"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(body["run_id"], "deadbeef");
        assert!(body["lanes"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_results_for_unknown_job_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let response = test_app(dir.path())
            .oneshot(get("/api/results/fanout-x-0-worker"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(body["job_name"], "fanout-x-0-worker");
        assert!(body["logs"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_trigger_status_codes() {
        let dir = tempfile::tempdir().unwrap();
        let (app, backend) = test_app_with_backend(dir.path());

        let response = app
            .clone()
            .oneshot(post_json(
                "/run",
                serde_json::json!({"prompt": "task", "num_agents": 1}),
            ))
            .await
            .unwrap();
        let body: serde_json::Value = body_json(response.into_body()).await;
        let run_id = body["run_id"].as_str().unwrap().to_string();

        let signal = |stage: &str, agent: u32| {
            post_json(
                "/trigger",
                serde_json::json!({"run_id": run_id, "agent_id": agent, "stage": stage}),
            )
        };

        let response = app.clone().oneshot(signal("worker", 0)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(body["outcome"], "accepted");
        assert_eq!(body["lane"]["stage"], "worker");
        assert_eq!(body["lane"]["status"], "done");

        // duplicate
        let response = app.clone().oneshot(signal("worker", 0)).await.unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        // the reviewer starts once the worker job has exited
        backend
            .set_state(&format!("fanout-{}-0-worker", run_id), crate::models::JobState::Completed)
            .unwrap();
        let response = app
            .clone()
            .oneshot(get(&format!("/status/{}", run_id)))
            .await
            .unwrap();
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(body["lanes"][0]["stage"], "reviewer");
        assert_eq!(body["lanes"][0]["status"], "running");

        // unknown lane
        let response = app.clone().oneshot(signal("worker", 5)).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .clone()
            .oneshot(get(&format!("/runs/{}/lanes/0/history", run_id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let history: Vec<serde_json::Value> = body_json(response.into_body()).await;
        assert_eq!(history.len(), 3);
    }

    #[tokio::test]
    async fn test_fail_lane_endpoint() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(dir.path());
        let response = app
            .clone()
            .oneshot(post_json(
                "/api/run",
                serde_json::json!({"prompt": "task"}),
            ))
            .await
            .unwrap();
        let body: serde_json::Value = body_json(response.into_body()).await;
        let run_id = body["run_id"].as_str().unwrap().to_string();

        let uri = format!("/api/runs/{}/lanes/0/fail", run_id);
        let response = app
            .clone()
            .oneshot(post_json(&uri, serde_json::json!({"reason": "stuck"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let lane: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(lane["status"], "failed");
        assert_eq!(lane["reason"], "stuck");

        let response = app
            .oneshot(post_json(&uri, serde_json::json!({"reason": "again"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }
}
