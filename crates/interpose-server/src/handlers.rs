//! API route handlers.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, info};

use interpose_core::SessionEvent;
use interpose_proxy::system_proxy::{self, SetupResult, SystemProxyConfig};

use crate::error::{ApiError, Result};
use crate::models::{
    CreateSessionQuery, CreateSessionResponse, HandledResponse, InterceptRequest,
    InterceptResponse, SessionsResponse,
};
use crate::state::AppState;

const MAX_SESSION_ID_LEN: usize = 64;

/// Session ids become request id prefixes, so keep them to a safe alphabet.
fn validate_session_id(id: &str) -> Result<()> {
    let valid = !id.is_empty()
        && id.len() <= MAX_SESSION_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(ApiError::BadRequest(format!("invalid session id '{}'", id)))
    }
}

/// GET /api/sessions - List sessions.
pub async fn list_sessions(State(state): State<AppState>) -> Json<SessionsResponse> {
    Json(SessionsResponse {
        sessions: state.registry.sessions(),
    })
}

/// POST /api/sessions/{id} - Create (or look up) a session.
pub async fn create_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<CreateSessionQuery>,
) -> Result<Json<CreateSessionResponse>> {
    validate_session_id(&id)?;

    // Binding, CA loading and the port scan all block.
    let registry = Arc::clone(&state.registry);
    let session = id.clone();
    let port = blocking(move || {
        let port = match query.port {
            Some(start) => registry.create_session_from(&session, start)?,
            None => registry.create_session(&session)?,
        };
        Ok(port)
    })
    .await?;
    info!(session = %id, port, "Session ready");

    Ok(Json(CreateSessionResponse { id, port }))
}

/// DELETE /api/sessions/{id} - Stop a session. Unknown ids are a no-op.
pub async fn stop_session(State(state): State<AppState>, Path(id): Path<String>) -> StatusCode {
    if !state.registry.stop_session(&id) {
        debug!(session = %id, "Stop requested for unknown session");
    }
    StatusCode::NO_CONTENT
}

/// DELETE /api/sessions - Stop every session.
pub async fn stop_all(State(state): State<AppState>) -> StatusCode {
    state.registry.stop_all();
    StatusCode::NO_CONTENT
}

/// PUT /api/sessions/{id}/intercept - Toggle intercept-hold.
pub async fn set_intercept(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<InterceptRequest>,
) -> Json<InterceptResponse> {
    Json(InterceptResponse {
        found: state.registry.set_intercept(&id, req.enabled),
    })
}

/// POST /api/requests/{id}/forward - Release a held request.
pub async fn forward_request(
    State(state): State<AppState>,
    Path(request_id): Path<String>,
) -> Json<HandledResponse> {
    Json(HandledResponse {
        handled: state.registry.forward_request(&request_id),
    })
}

/// POST /api/requests/{id}/drop - Drop a held request.
pub async fn drop_request(
    State(state): State<AppState>,
    Path(request_id): Path<String>,
) -> Json<HandledResponse> {
    Json(HandledResponse {
        handled: state.registry.drop_request(&request_id),
    })
}

/// Runs `f` on the blocking pool.
async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
}

/// POST /api/system-proxy/test - Check that a proxy is reachable.
pub async fn test_system_proxy(Json(config): Json<SystemProxyConfig>) -> Result<Json<SetupResult>> {
    blocking(move || Ok(Json(system_proxy::test(&config)))).await
}

/// PUT /api/system-proxy - Point the OS proxy at a session.
pub async fn set_system_proxy(Json(config): Json<SystemProxyConfig>) -> Result<Json<SetupResult>> {
    blocking(move || Ok(Json(system_proxy::set(&config)))).await
}

/// DELETE /api/system-proxy - Turn the OS proxy off.
pub async fn clear_system_proxy() -> Result<Json<SetupResult>> {
    blocking(|| Ok(Json(system_proxy::clear()))).await
}

/// Converts an event into an SSE frame named after the event.
pub(crate) fn sse_event(envelope: &SessionEvent) -> Option<Event> {
    let mut payload = envelope.event.payload_json();
    if let serde_json::Value::Object(map) = &mut payload {
        map.insert(
            "sessionId".to_string(),
            serde_json::Value::String(envelope.session_id.clone()),
        );
    }
    Event::default()
        .event(envelope.event.name())
        .json_data(payload)
        .ok()
}

/// GET /api/events - Server-sent event stream of every `proxy:*` event.
pub async fn stream_events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
    let stream = BroadcastStream::new(state.events.subscribe()).filter_map(|item| match item {
        Ok(envelope) => sse_event(&envelope).map(Ok),
        Err(BroadcastStreamRecvError::Lagged(skipped)) => {
            debug!(skipped, "Event stream client lagging, events skipped");
            None
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}
