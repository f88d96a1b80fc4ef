use std::convert::Infallible;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::stream::{self, Stream};
use serde::Deserialize;
use serde_json::json;

use crate::agent_engine::event_bus::TaskEvent;
use crate::errors::PilotError;
use crate::scheduler::manager::TaskScheduler;
use crate::scheduler::task::{TaskOptions, TaskView};

#[derive(Debug, Deserialize)]
pub struct CreateTaskRequest {
    pub prompt: String,
    #[serde(flatten)]
    pub options: TaskOptions,
}

#[derive(Debug, Default, Deserialize)]
pub struct ConfirmRequest {
    #[serde(default)]
    pub response: Option<String>,
}

/// `PilotError` rendered as a JSON error body.
pub struct ApiError(PilotError);

impl From<PilotError> for ApiError {
    fn from(e: PilotError) -> Self {
        Self(e)
    }
}

pub fn status_for(error: &PilotError) -> StatusCode {
    match error {
        PilotError::Conflict(_) => StatusCode::CONFLICT,
        PilotError::NotFound(_) => StatusCode::NOT_FOUND,
        PilotError::InvalidInput(_) | PilotError::Config(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            tracing::error!(error = %self.0, "request failed");
        }
        let body = json!({ "error": self.0.to_string(), "hint": self.0.hint() });
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

pub fn router(scheduler: TaskScheduler) -> Router {
    Router::new()
        .route("/tasks", post(create_task))
        .route("/tasks/{id}", get(get_task))
        .route("/tasks/{id}/events", get(task_events))
        .route("/tasks/{id}/confirm", post(confirm_task))
        .route("/tasks/{id}/stop", post(stop_task))
        .with_state(scheduler)
}

async fn create_task(
    State(scheduler): State<TaskScheduler>,
    Json(request): Json<CreateTaskRequest>,
) -> ApiResult<(StatusCode, Json<TaskView>)> {
    let view = scheduler.create_task(&request.prompt, request.options)?;
    Ok((StatusCode::CREATED, Json(view)))
}

async fn get_task(State(scheduler): State<TaskScheduler>, Path(id): Path<String>) -> ApiResult<Json<TaskView>> {
    Ok(Json(scheduler.get_task(&id)?))
}

async fn confirm_task(
    State(scheduler): State<TaskScheduler>,
    Path(id): Path<String>,
    body: Option<Json<ConfirmRequest>>,
) -> ApiResult<Json<TaskView>> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    Ok(Json(scheduler.confirm_task(&id, request.response).await?))
}

async fn stop_task(State(scheduler): State<TaskScheduler>, Path(id): Path<String>) -> ApiResult<Json<TaskView>> {
    Ok(Json(scheduler.stop_task(&id).await?))
}

/// Replays the task's recent events, then streams live ones until a terminal
/// status goes out.
async fn task_events(
    State(scheduler): State<TaskScheduler>,
    Path(id): Path<String>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let subscription = scheduler.subscribe(&id)?;
    tracing::debug!(task_id = %id, "event stream opened");
    let events = stream::unfold(subscription, |mut subscription| async move {
        let event = subscription.next().await?;
        Some((Ok(to_sse(&event)), subscription))
    });
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

fn to_sse(event: &TaskEvent) -> Event {
    let data = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    Event::default().event(event.message.kind()).data(data)
}
