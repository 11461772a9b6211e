use anyhow::Result;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::dispatcher::{AiEvent, DispatchResult, EventDispatcher};
use crate::memory::store::MemoryStore;
use crate::roles::RoleStore;

pub struct ServerState {
    pub dispatcher: Arc<EventDispatcher>,
    pub roles: Arc<RoleStore>,
    pub memory: Arc<MemoryStore>,
}

#[derive(Debug, Serialize)]
pub struct AiStatusResponse {
    pub role_id: String,
    pub role_name: String,
    pub proactive_enabled: bool,
    pub memory_summary_count: u32,
    pub has_core_memory: bool,
    pub short_term_count: usize,
}

pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ai/event", post(handle_event))
        .route("/ai/status/:role_id", get(handle_status))
        .with_state(state)
}

pub async fn run(state: Arc<ServerState>, bind_addr: &str) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    tracing::info!("Listening on {}", bind_addr);
    axum::serve(listener, router(state)).await?;
    Ok(())
}

/// Drain scheduler-originated events into the dispatcher. Dispatch errors
/// are logged; the bridge itself only stops when the channel closes.
pub fn spawn_event_bridge(
    dispatcher: Arc<EventDispatcher>,
    events: flume::Receiver<AiEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Ok(event) = events.recv_async().await {
            let role_id = event.role_id.clone();
            match dispatcher.dispatch(event).await {
                Ok(DispatchResult::Handled(response)) if response.success => {
                    tracing::debug!(
                        "Background event for '{}' handled (action '{}')",
                        role_id,
                        response.action
                    );
                }
                Ok(DispatchResult::Handled(response)) => {
                    tracing::warn!(
                        "Background event for '{}' failed: {}",
                        role_id,
                        response.error.as_deref().unwrap_or("unknown")
                    );
                }
                Ok(DispatchResult::RoleNotFound) => {
                    tracing::warn!("Background event for unknown role '{}'", role_id);
                }
                Err(error) => {
                    tracing::error!("Background event for '{}' errored: {}", role_id, error);
                }
            }
        }
        tracing::info!("Event bridge stopped");
    })
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

pub async fn handle_event(
    State(state): State<Arc<ServerState>>,
    Json(event): Json<AiEvent>,
) -> Response {
    match state.dispatcher.dispatch(event).await {
        Ok(DispatchResult::Handled(response)) => Json(response).into_response(),
        Ok(DispatchResult::RoleNotFound) => (
            StatusCode::NOT_FOUND,
            Json(json!({"success": false, "error": "Role not found"})),
        )
            .into_response(),
        Err(error) => {
            tracing::error!("Event dispatch errored: {}", error);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"success": false, "error": error.to_string()})),
            )
                .into_response()
        }
    }
}

pub async fn handle_status(
    State(state): State<Arc<ServerState>>,
    Path(role_id): Path<String>,
) -> Result<Json<AiStatusResponse>, StatusCode> {
    let role = state
        .roles
        .load(&role_id)
        .map_err(|error| {
            tracing::error!("Role load failed for '{}': {}", role_id, error);
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .ok_or(StatusCode::NOT_FOUND)?;

    let memory_summary_count = state
        .memory
        .message_count_since_summary(&role.id)
        .unwrap_or(0);
    let has_core_memory = state
        .memory
        .get_core_memory(&role.id)
        .map(|core| !core.is_empty())
        .unwrap_or(false);
    let short_term_count = state.memory.short_term_len(&role.id).unwrap_or(0);

    Ok(Json(AiStatusResponse {
        role_id: role.id.clone(),
        role_name: role.name,
        proactive_enabled: role.proactive_config.enabled,
        memory_summary_count,
        has_core_memory,
        short_term_count,
    }))
}
