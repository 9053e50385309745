//! API request handlers.

use std::convert::Infallible;
use std::time::Duration;

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use tokio_stream::{Stream, StreamExt};
use tracing::{info, instrument, warn};

use crate::container::ExecOutput;
use crate::error::EngineError;
use crate::resource::{RegisterResourceRequest, Resource};
use crate::stream::{LifecycleEvent, log_events, progress_stream};

use super::error::{ApiError, ApiResult};
use super::state::AppState;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    /// `docker` or `podman`.
    pub runtime: String,
    /// Version reported by the runtime, absent when it is unreachable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime_version: Option<String>,
}

/// Health check endpoint.
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let runtime = state.controller.runtime();
    let runtime_version = match runtime.health_check().await {
        Ok(version) => Some(version.trim().to_string()),
        Err(e) => {
            warn!("Container runtime health check failed: {}", e);
            None
        }
    };

    Json(HealthResponse {
        status: if runtime_version.is_some() { "ok" } else { "degraded" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        runtime: runtime.runtime_type().to_string(),
        runtime_version,
    })
}

/// `?follow=true` on start/restart.
#[derive(Debug, Default, Deserialize)]
pub struct FollowQuery {
    #[serde(default)]
    pub follow: bool,
}

/// `?purge_volume=true` on destroy.
#[derive(Debug, Default, Deserialize)]
pub struct DestroyQuery {
    #[serde(default)]
    pub purge_volume: bool,
}

/// `?tail=N` on the log stream.
#[derive(Debug, Default, Deserialize)]
pub struct LogsQuery {
    pub tail: Option<u32>,
}

/// Body of an exec request.
#[derive(Debug, Deserialize)]
pub struct ExecRequest {
    /// Program and arguments, run without a shell.
    pub command: Vec<String>,
}

fn event_stream<S>(events: S) -> Sse<impl Stream<Item = Result<Event, Infallible>>>
where
    S: Stream<Item = LifecycleEvent> + Send + 'static,
{
    let stream = events.map(|event| {
        let data = match serde_json::to_string(&event) {
            Ok(data) => data,
            Err(err) => {
                warn!("Failed to serialize lifecycle event: {:?}", err);
                r#"{"type":"error","message":"event_serialization_failed"}"#.to_string()
            }
        };
        Ok::<_, Infallible>(Event::default().data(data))
    });

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keepalive"),
    )
}

fn progress_response(state: &AppState, id: String) -> Response {
    let controller = &state.controller;
    event_stream(progress_stream(
        controller.repository().clone(),
        controller.runtime().clone(),
        id,
        state.stream.clone(),
    ))
    .into_response()
}

/// Register a resource and start it.
#[instrument(skip(state, request), fields(resource_id = %request.id))]
pub async fn create_resource(
    State(state): State<AppState>,
    Json(request): Json<RegisterResourceRequest>,
) -> ApiResult<(StatusCode, Json<Resource>)> {
    let resource = state.controller.register(request).await?;
    let resource = state.controller.start(&resource.id).await?;
    info!(resource_id = %resource.id, kind = %resource.kind, "Created resource");
    Ok((StatusCode::ACCEPTED, Json(resource)))
}

/// Read a resource record.
#[instrument(skip(state))]
pub async fn get_resource(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Resource>> {
    Ok(Json(state.controller.get(&id).await?))
}

/// Start a resource; with `follow` the response is its progress stream.
#[instrument(skip(state))]
pub async fn start_resource(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<FollowQuery>,
) -> ApiResult<Response> {
    let resource = state.controller.start(&id).await?;
    if query.follow {
        return Ok(progress_response(&state, id));
    }
    Ok((StatusCode::ACCEPTED, Json(resource)).into_response())
}

/// Restart a running resource; with `follow` the response is its progress stream.
#[instrument(skip(state))]
pub async fn restart_resource(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<FollowQuery>,
) -> ApiResult<Response> {
    let resource = state.controller.restart(&id).await?;
    if query.follow {
        return Ok(progress_response(&state, id));
    }
    Ok((StatusCode::ACCEPTED, Json(resource)).into_response())
}

#[instrument(skip(state))]
pub async fn stop_resource(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Resource>> {
    Ok(Json(state.controller.stop(&id).await?))
}

#[instrument(skip(state))]
pub async fn destroy_resource(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<DestroyQuery>,
) -> ApiResult<Json<Resource>> {
    let resource = state.controller.destroy(&id, query.purge_volume).await?;
    info!(resource_id = %id, purge_volume = query.purge_volume, "Destroyed resource");
    Ok(Json(resource))
}

/// Record activity so the idle reaper leaves the resource alone.
#[instrument(skip(state))]
pub async fn touch_resource(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.controller.touch(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Run a command in a RUNNING resource's container and return its output.
#[instrument(skip(state, request))]
pub async fn exec_resource(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<ExecRequest>,
) -> ApiResult<Json<ExecOutput>> {
    if request.command.first().is_none_or(|program| program.trim().is_empty()) {
        return Err(ApiError::bad_request("command must name a program"));
    }

    let output = state.controller.exec(&id, &request.command).await?;
    info!(resource_id = %id, exit_code = output.exit_code, "Executed command");
    Ok(Json(output))
}

/// Follow the resource's container output.
#[instrument(skip(state))]
pub async fn resource_logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> ApiResult<Response> {
    let resource = state.controller.get(&id).await?;
    let Some(container_ref) = resource.container_ref else {
        return Err(EngineError::ContainerMissing(id).into());
    };

    let tail = query.tail.unwrap_or(state.stream.log_tail);
    Ok(event_stream(log_events(state.controller.runtime().clone(), container_ref, tail)).into_response())
}

/// Progress stream for a resource without triggering anything.
#[instrument(skip(state))]
pub async fn resource_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    state.controller.get(&id).await?;
    Ok(progress_response(&state, id))
}
