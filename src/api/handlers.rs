//! HTTP handlers: browser SSE streams plus read-only queries.

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::{
    body::{Body, Bytes},
    extract::{Path, Query, State},
    http::{header, Response, StatusCode},
    Json,
};
use futures::{stream, Stream, StreamExt};
use log::{debug, error};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::event::{LogQuery, StoredEvent};
use crate::sse::{SseHub, CONNECTED_FRAME};
use crate::tunnel::{TunnelFilters, TunnelInstance};

use super::error::{ApiError, ApiResult};
use super::state::AppState;

/// Liveness probe, including how many upstream subscriptions are held.
///
/// GET /api/health
pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "connected_agents": state.supervisor.connection_count(),
    }))
}

/// Open (or replace) the upstream subscription for an agent.
///
/// POST /api/agents/{agent_id}/connect
pub async fn connect_agent(
    State(state): State<AppState>,
    Path(agent_id): Path<i64>,
) -> ApiResult<Json<serde_json::Value>> {
    let agent = state
        .agents
        .get(agent_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("agent not found: {agent_id}")))?;

    state.supervisor.connect(&agent).await?;
    Ok(Json(json!({"status": "connected"})))
}

/// Drop an agent's upstream subscription and record it OFFLINE.
///
/// POST /api/agents/{agent_id}/disconnect
pub async fn disconnect_agent(
    State(state): State<AppState>,
    Path(agent_id): Path<i64>,
) -> ApiResult<Json<serde_json::Value>> {
    if state.agents.get(agent_id).await?.is_none() {
        return Err(ApiError::not_found(format!("agent not found: {agent_id}")));
    }

    state.supervisor.disconnect(agent_id);
    state.agents.mark_offline(agent_id).await?;
    Ok(Json(json!({"status": "disconnected"})))
}

/// Per-instance browser event stream.
///
/// GET /api/sse/tunnel/{instance_id}
pub async fn tunnel_stream(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
) -> Result<Response<Body>, StatusCode> {
    let client_id = Uuid::new_v4().to_string();
    let rx = state.hub.attach(&client_id);
    state.hub.subscribe(&client_id, &instance_id);
    debug!("browser {client_id} streaming instance {instance_id}");

    build_sse_response(state.hub.clone(), client_id, rx)
}

/// Global browser event stream.
///
/// GET /api/sse/global
pub async fn global_stream(State(state): State<AppState>) -> Result<Response<Body>, StatusCode> {
    let client_id = Uuid::new_v4().to_string();
    let rx = state.hub.attach(&client_id);
    debug!("browser {client_id} streaming global events");

    build_sse_response(state.hub.clone(), client_id, rx)
}

/// List tunnels, optionally filtered.
///
/// GET /api/tunnels
pub async fn list_tunnels(
    State(state): State<AppState>,
    Query(filters): Query<TunnelFilters>,
) -> ApiResult<Json<Vec<TunnelInstance>>> {
    let tunnels = state.tunnels.list(&filters).await?;
    Ok(Json(tunnels))
}

#[derive(Debug, Deserialize)]
pub struct RecentQuery {
    #[serde(default = "default_recent_limit")]
    pub limit: i64,
}

fn default_recent_limit() -> i64 {
    100
}

/// Most recent raw events for one agent.
///
/// GET /api/agents/{agent_id}/events
pub async fn agent_events(
    State(state): State<AppState>,
    Path(agent_id): Path<i64>,
    Query(query): Query<RecentQuery>,
) -> ApiResult<Json<Vec<StoredEvent>>> {
    if state.agents.get(agent_id).await?.is_none() {
        return Err(ApiError::not_found(format!("agent not found: {agent_id}")));
    }
    let events = state
        .events
        .recent_for(agent_id, query.limit.clamp(1, 1000))
        .await?;
    Ok(Json(events))
}

/// Paged log lines for one agent.
///
/// GET /api/agents/{agent_id}/logs
pub async fn agent_logs(
    State(state): State<AppState>,
    Path(agent_id): Path<i64>,
    Query(query): Query<LogQuery>,
) -> ApiResult<Json<Vec<StoredEvent>>> {
    if state.agents.get(agent_id).await?.is_none() {
        return Err(ApiError::not_found(format!("agent not found: {agent_id}")));
    }
    let logs = state.events.logs_for(agent_id, &query).await?;
    Ok(Json(logs))
}

/// Build an SSE response whose body is fed by a hub sink. The first frame is
/// the literal connected handshake; dropping the body detaches the client.
fn build_sse_response(
    hub: Arc<SseHub>,
    client_id: String,
    rx: mpsc::Receiver<String>,
) -> Result<Response<Body>, StatusCode> {
    let connected = stream::once(async {
        Ok::<_, Infallible>(Bytes::from_static(CONNECTED_FRAME.as_bytes()))
    });
    let events = ClientEventStream { hub, client_id, rx };
    let body = Body::from_stream(connected.chain(events));

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .header("X-Accel-Buffering", "no") // Disable nginx buffering if present
        .body(body)
        .map_err(|err| {
            error!("failed to build SSE response: {err:?}");
            StatusCode::INTERNAL_SERVER_ERROR
        })
}

/// Frame stream for one browser client. Detaches from the hub when the
/// response body is dropped, so the hub notices disconnects no later than
/// its next publish.
struct ClientEventStream {
    hub: Arc<SseHub>,
    client_id: String,
    rx: mpsc::Receiver<String>,
}

impl Stream for ClientEventStream {
    type Item = Result<Bytes, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx
            .poll_recv(cx)
            .map(|frame| frame.map(|frame| Ok(Bytes::from(frame))))
    }
}

impl Drop for ClientEventStream {
    fn drop(&mut self) {
        self.hub.detach(&self.client_id);
    }
}
