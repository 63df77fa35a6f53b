// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The scheduler process's dashboard HTTP surface: `GET /`, `GET /api/state`,
//! `GET /health`, `POST /api/job_action`, `GET /files`. See spec §4.5.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::error::DashboardError;
use crate::state::{DashboardSignal, SchedulerState};

/// Shared state handed to every dashboard route handler.
pub struct DashboardState {
    pub scheduler: Arc<SchedulerState>,
    pub title: String,
}

/// Builds the dashboard's axum router.
#[must_use]
pub fn router(state: Arc<DashboardState>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/state", get(api_state))
        .route("/health", get(health))
        .route("/api/job_action", post(job_action))
        .route("/files", get(proxy_files))
        .with_state(state)
}

async fn index(State(state): State<Arc<DashboardState>>) -> Html<String> {
    Html(format!(
        "<!doctype html><html><head><title>{title}</title></head><body>\
         <h1>{title}</h1><p>Dashboard state is served from <code>/api/state</code>.</p>\
         </body></html>",
        title = state.title
    ))
}

#[derive(Debug, Serialize)]
struct StateResponse {
    title: String,
    hosts: Vec<String>,
    jobs: Vec<crate::model::JobView>,
    last_update_epoch: f64,
    /// User-visible messages enqueued by signal handling (spec §4.1/§7: "they
    /// should surface in the dashboard UI"), most recent last.
    messages: Vec<String>,
}

async fn api_state(State(state): State<Arc<DashboardState>>) -> Json<StateResponse> {
    let response = state.scheduler.with_both_locks(|experiments, hosts| StateResponse {
        title: state.title.clone(),
        hosts: hosts.active().iter().map(|h| h.name().to_string()).collect(),
        jobs: experiments
            .active()
            .iter()
            .flat_map(|experiment| experiment.jobs().into_iter().map(super::model::Job::view))
            .collect(),
        last_update_epoch: epoch_now(),
        messages: state.scheduler.recent_messages(),
    });
    Json(response)
}

fn epoch_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs_f64()
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    ok: bool,
    title: String,
}

async fn health(State(state): State<Arc<DashboardState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        ok: true,
        title: state.title.clone(),
    })
}

#[derive(Debug, Deserialize)]
struct JobActionRequest {
    action: Option<String>,
    experiment: Option<String>,
    host: Option<String>,
    job_id: Option<String>,
    pid: Option<i64>,
    signal: Option<String>,
}

#[derive(Debug, Serialize)]
struct JobActionResponse {
    ok: bool,
    received: serde_json::Value,
    server_epoch: f64,
}

const VALID_SIGNALS: [&str; 5] = ["TERM", "INT", "QUIT", "KILL", "RESET"];

async fn job_action(
    State(state): State<Arc<DashboardState>>,
    body: Option<Json<JobActionRequest>>,
) -> Result<Json<JobActionResponse>, DashboardError> {
    let Json(req) = body.ok_or_else(|| DashboardError::BadRequest("missing request body".to_string()))?;

    let experiment = req
        .experiment
        .ok_or_else(|| DashboardError::BadRequest("missing experiment".to_string()))?;
    let host = req.host.ok_or_else(|| DashboardError::BadRequest("missing host".to_string()))?;
    let job_id = req.job_id.ok_or_else(|| DashboardError::BadRequest("missing job_id".to_string()))?;
    let pid = req.pid.ok_or_else(|| DashboardError::BadRequest("missing pid".to_string()))?;
    let signal = req.signal.ok_or_else(|| DashboardError::BadRequest("missing signal".to_string()))?;

    if !VALID_SIGNALS.contains(&signal.as_str()) {
        return Err(DashboardError::BadRequest("invalid signal".to_string()));
    }

    let received = serde_json::json!({
        "action": req.action,
        "experiment": experiment,
        "host": host,
        "job_id": job_id,
        "pid": pid,
        "signal": signal,
    });

    state.scheduler.submit_signal(DashboardSignal {
        experiment,
        job_id,
        host,
        pid,
        signal,
    });

    Ok(Json(JobActionResponse {
        ok: true,
        received,
        server_epoch: epoch_now(),
    }))
}

#[derive(Debug, Deserialize)]
struct FilesProxyQuery {
    host: Option<String>,
    path: Option<String>,
}

const PROXY_TIMEOUT: Duration = Duration::from_secs(10);

async fn proxy_files(Query(query): Query<FilesProxyQuery>) -> Result<Response, DashboardError> {
    let host = query
        .host
        .filter(|h| !h.is_empty())
        .ok_or_else(|| DashboardError::BadRequest("missing host or path".to_string()))?;
    let raw_path = query
        .path
        .filter(|p| !p.is_empty())
        .ok_or_else(|| DashboardError::BadRequest("missing host or path".to_string()))?;

    if !std::path::Path::new(&raw_path).is_absolute() {
        return Err(DashboardError::BadRequest("path must be absolute".to_string()));
    }

    let worker_url = format!("http://{host}/files?path={}", urlencoding::encode(&raw_path));

    let client = reqwest::Client::builder()
        .timeout(PROXY_TIMEOUT)
        .build()
        .expect("reqwest client with static config should always build");

    let upstream = client
        .get(&worker_url)
        .send()
        .await
        .map_err(|_| DashboardError::UpstreamUnreachable("upstream worker unreachable".to_string()))?;

    let status = StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let content_type = upstream
        .headers()
        .get(header::CONTENT_TYPE)
        .cloned()
        .unwrap_or_else(|| header::HeaderValue::from_static("text/plain"));

    let stream = upstream.bytes_stream();
    let body = Body::from_stream(stream);

    let mut response = Response::new(body);
    *response.status_mut() = status;
    response.headers_mut().insert(header::CONTENT_TYPE, content_type);
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tower::ServiceExt;

    fn test_state() -> Arc<DashboardState> {
        Arc::new(DashboardState {
            scheduler: Arc::new(SchedulerState::new()),
            title: "Scheduler Dashboard test:9200".to_string(),
        })
    }

    #[tokio::test]
    async fn health_returns_ok_true() {
        let app = router(test_state());
        let response = app
            .oneshot(axum::http::Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn api_state_reflects_empty_scheduler() {
        let app = router(test_state());
        let response = app
            .oneshot(axum::http::Request::builder().uri("/api/state").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert!(value["hosts"].as_array().unwrap().is_empty());
        assert!(value["jobs"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn job_action_rejects_missing_fields() {
        let app = router(test_state());
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/api/job_action")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn job_action_rejects_invalid_signal() {
        let app = router(test_state());
        let body = serde_json::json!({
            "action": "signal",
            "experiment": "e1",
            "host": "h1",
            "job_id": "j1",
            "pid": 42,
            "signal": "BOGUS",
        });
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/api/job_action")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn job_action_enqueues_valid_signal() {
        let state = test_state();
        let scheduler = state.scheduler.clone();
        let app = router(state);
        let body = serde_json::json!({
            "action": "signal",
            "experiment": "e1",
            "host": "h1",
            "job_id": "j1",
            "pid": 42,
            "signal": "TERM",
        });
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/api/job_action")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let mut rx = scheduler.take_signal_receiver().expect("receiver still available");
        let signal = rx.try_recv().expect("signal should have been enqueued");
        assert_eq!(signal.job_id, "j1");
        assert_eq!(signal.signal, "TERM");
    }

    #[tokio::test]
    async fn proxy_files_rejects_missing_args() {
        let app = router(test_state());
        let response = app
            .oneshot(axum::http::Request::builder().uri("/files").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn proxy_files_rejects_relative_path() {
        let app = router(test_state());
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/files?host=h1:9101&path=relative")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
