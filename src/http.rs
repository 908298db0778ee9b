//! HTTP facade — thin REST+SSE surface over the store, scheduler, and bus.
//!
//! Handlers translate between JSON and the core's operations; no scheduling
//! logic lives here. The SSE streams use bounded broadcast buffers and can
//! never back-pressure producers — a lagging client just resubscribes.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::Stream;
use serde::Deserialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::Arc;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use crate::engine::Orchestrator;
use crate::store::models::{
    ProjectCreate, SessionStatus, TaskCreate, TaskPatch, TaskStatus,
};

type App = Arc<Orchestrator>;

pub fn router(orchestrator: App) -> Router {
    Router::new()
        .route("/api/tasks", get(list_tasks).post(create_task))
        .route("/api/tasks/reorder", post(reorder_tasks))
        .route("/api/tasks/:id", get(get_task).patch(patch_task))
        .route("/api/tasks/:id/status", post(set_task_status))
        .route("/api/tasks/:id/cancel", post(cancel_task))
        .route(
            "/api/tasks/:id/comments",
            get(list_comments).post(create_comment),
        )
        .route("/api/sessions/:id", get(get_session))
        .route("/api/sessions/:id/output", get(stream_session_output))
        .route("/api/status", get(system_status))
        .route("/api/events/stream", get(stream_events))
        .route("/api/heartbeat/trigger", post(trigger_heartbeat))
        .route("/api/projects", get(list_projects).post(create_project))
        .with_state(orchestrator)
}

/// User-facing error: short code plus message, mapped to an HTTP status.
struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn not_found(what: &str) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            code: "not_found",
            message: format!("{what} not found"),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "bad_request",
            message: message.into(),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "internal",
            message: e.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({"code": self.code, "message": self.message});
        (self.status, Json(body)).into_response()
    }
}

#[derive(Deserialize)]
struct ListTasksQuery {
    status: Option<String>,
}

async fn list_tasks(
    State(app): State<App>,
    Query(query): Query<ListTasksQuery>,
) -> Result<Json<Value>, ApiError> {
    let status = match query.status.as_deref() {
        Some(s) => Some(
            TaskStatus::parse(s).ok_or_else(|| ApiError::bad_request(format!("invalid status: {s}")))?,
        ),
        None => None,
    };
    let tasks = app.store.list_tasks(status).await?;
    Ok(Json(json!(tasks)))
}

async fn create_task(
    State(app): State<App>,
    Json(create): Json<TaskCreate>,
) -> Result<Json<Value>, ApiError> {
    if create.title.trim().is_empty() {
        return Err(ApiError::bad_request("title must not be empty"));
    }
    let task = app.store.create_task(create).await?;
    app.bus
        .emit(
            "task.created",
            "task",
            Some(&task.uuid),
            json!({"task_id": task.id, "title": task.title, "priority": task.priority}),
        )
        .await?;
    Ok(Json(json!(task)))
}

async fn get_task(
    State(app): State<App>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    let task = app
        .store
        .get_task(id)
        .await?
        .ok_or_else(|| ApiError::not_found("task"))?;
    Ok(Json(json!(task)))
}

async fn patch_task(
    State(app): State<App>,
    Path(id): Path<i64>,
    Json(patch): Json<TaskPatch>,
) -> Result<Json<Value>, ApiError> {
    let task = app
        .store
        .update_task(id, patch)
        .await?
        .ok_or_else(|| ApiError::not_found("task"))?;
    app.bus
        .emit(
            "task.updated",
            "task",
            Some(&task.uuid),
            json!({"task_id": id}),
        )
        .await?;
    Ok(Json(json!(task)))
}

#[derive(Deserialize)]
struct StatusChange {
    status: String,
}

async fn set_task_status(
    State(app): State<App>,
    Path(id): Path<i64>,
    Json(body): Json<StatusChange>,
) -> Result<Json<Value>, ApiError> {
    let status = TaskStatus::parse(&body.status)
        .ok_or_else(|| ApiError::bad_request(format!("invalid status: {}", body.status)))?;

    let patch = TaskPatch {
        status: Some(status),
        completed_at: Some(status.is_terminal().then(chrono::Utc::now)),
        active_session_id: (!matches!(status, TaskStatus::Executing)).then_some(None),
        ..Default::default()
    };
    let task = app
        .store
        .update_task(id, patch)
        .await?
        .ok_or_else(|| ApiError::not_found("task"))?;
    app.bus
        .emit(
            &format!("task.{}", status.as_str()),
            "task",
            Some(&task.uuid),
            json!({"task_id": id, "manual": true}),
        )
        .await?;
    Ok(Json(json!(task)))
}

async fn cancel_task(
    State(app): State<App>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    let cancelled = app.scheduler.cancel_task(id).await?;
    if !cancelled {
        return Err(ApiError::not_found("task"));
    }
    let task = app
        .store
        .get_task(id)
        .await?
        .ok_or_else(|| ApiError::not_found("task"))?;
    Ok(Json(json!(task)))
}

#[derive(Deserialize)]
struct ReorderItem {
    id: i64,
    position: i64,
}

async fn reorder_tasks(
    State(app): State<App>,
    Json(items): Json<Vec<ReorderItem>>,
) -> Result<Json<Value>, ApiError> {
    let positions: Vec<(i64, i64)> = items.iter().map(|i| (i.id, i.position)).collect();
    app.store.reorder_tasks(&positions).await?;
    Ok(Json(json!({"reordered": positions.len()})))
}

async fn list_comments(
    State(app): State<App>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    let comments = app.store.list_comments(id).await?;
    Ok(Json(json!(comments)))
}

#[derive(Deserialize)]
struct CommentBody {
    content: String,
    #[serde(default = "default_author")]
    author: String,
}

fn default_author() -> String {
    "user".to_string()
}

async fn create_comment(
    State(app): State<App>,
    Path(id): Path<i64>,
    Json(body): Json<CommentBody>,
) -> Result<Json<Value>, ApiError> {
    let task = app
        .store
        .get_task(id)
        .await?
        .ok_or_else(|| ApiError::not_found("task"))?;
    let comment = app
        .store
        .create_comment(id, &body.content, &body.author)
        .await?;
    app.bus
        .emit(
            "comment.created",
            "task",
            Some(&task.uuid),
            json!({"task_id": id, "author": body.author}),
        )
        .await?;
    Ok(Json(json!(comment)))
}

async fn get_session(
    State(app): State<App>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    let session = app
        .store
        .get_session(id)
        .await?
        .ok_or_else(|| ApiError::not_found("session"))?;
    Ok(Json(json!(session)))
}

/// Tail the session's captured stdout as SSE chunks: replay what is
/// already on disk, then follow appends until the session goes terminal.
async fn stream_session_output(
    State(app): State<App>,
    Path(id): Path<i64>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    let session = app
        .store
        .get_session(id)
        .await?
        .ok_or_else(|| ApiError::not_found("session"))?;
    let path = std::path::PathBuf::from(&session.stdout_path);

    let stream = futures::stream::unfold((app, path, 0u64, 0u8), move |(app, path, pos, idle)| async move {
        loop {
            let len = tokio::fs::metadata(&path).await.map(|m| m.len()).unwrap_or(0);
            if len > pos {
                let chunk = read_from(&path, pos).await;
                let next = pos + chunk.len() as u64;
                let event = SseEvent::default()
                    .event("output")
                    .data(String::from_utf8_lossy(&chunk).to_string());
                return Some((Ok(event), (app, path, next, 0)));
            }

            let live = app
                .store
                .get_session(id)
                .await
                .ok()
                .flatten()
                .map(|s| s.status.is_live())
                .unwrap_or(false);
            if !live {
                // Two empty polls after termination, then end the stream.
                if idle >= 1 {
                    return None;
                }
                return read_idle(app, path, pos, idle + 1).await;
            }
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        }
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

async fn read_idle(
    app: App,
    path: std::path::PathBuf,
    pos: u64,
    idle: u8,
) -> Option<(Result<SseEvent, Infallible>, (App, std::path::PathBuf, u64, u8))> {
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    let event = SseEvent::default().event("ping").data("");
    Some((Ok(event), (app, path, pos, idle)))
}

async fn read_from(path: &std::path::Path, pos: u64) -> Vec<u8> {
    use tokio::io::{AsyncReadExt, AsyncSeekExt};
    let Ok(mut file) = tokio::fs::File::open(path).await else {
        return Vec::new();
    };
    if file.seek(std::io::SeekFrom::Start(pos)).await.is_err() {
        return Vec::new();
    }
    let mut buf = Vec::new();
    let _ = file.read_to_end(&mut buf).await;
    buf
}

async fn system_status(State(app): State<App>) -> Result<Json<Value>, ApiError> {
    let tasks = app.store.list_tasks(None).await?;
    let mut counts = serde_json::Map::new();
    for task in &tasks {
        let entry = counts
            .entry(task.status.as_str().to_string())
            .or_insert(json!(0));
        *entry = json!(entry.as_i64().unwrap_or(0) + 1);
    }

    let running = app
        .store
        .list_sessions(None, Some(SessionStatus::Running))
        .await?
        .len();
    let rate_limit = app.store.get_rate_limit().await?;

    Ok(Json(json!({
        "tasks_by_status": counts,
        "total_tasks": tasks.len(),
        "running_sessions": running,
        "rate_limit": rate_limit,
    })))
}

/// Mirror the event bus as SSE. Lagged clients miss events and re-sync by
/// re-querying.
async fn stream_events(
    State(app): State<App>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let rx = app.bus.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|result| match result {
        Ok(event) => {
            let data = serde_json::to_string(&event).unwrap_or_default();
            Some(Ok(SseEvent::default().event(event.event_type.clone()).data(data)))
        }
        // Lagged: drop silently, client re-syncs on the next event.
        Err(_) => None,
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn trigger_heartbeat(State(app): State<App>) -> Result<Json<Value>, ApiError> {
    let diag = app.heartbeat.trigger().await;
    Ok(Json(diag))
}

async fn list_projects(State(app): State<App>) -> Result<Json<Value>, ApiError> {
    let projects = app.store.list_projects().await?;
    Ok(Json(json!(projects)))
}

async fn create_project(
    State(app): State<App>,
    Json(create): Json<ProjectCreate>,
) -> Result<Json<Value>, ApiError> {
    if create.name.trim().is_empty() {
        return Err(ApiError::bad_request("name must not be empty"));
    }
    let project = app.store.create_project(create).await?;
    Ok(Json(json!(project)))
}
