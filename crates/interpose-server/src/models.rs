//! Request and response bodies for the control API.

use serde::{Deserialize, Serialize};

use interpose_proxy::SessionInfo;

/// Response body for GET /api/sessions.
#[derive(Debug, Serialize)]
pub struct SessionsResponse {
    pub sessions: Vec<SessionInfo>,
}

/// Query for POST /api/sessions/{id}.
#[derive(Debug, Default, Deserialize)]
pub struct CreateSessionQuery {
    /// First port to try instead of the registry's base port.
    pub port: Option<u16>,
}

/// Response body for POST /api/sessions/{id}.
#[derive(Debug, Serialize)]
pub struct CreateSessionResponse {
    pub id: String,
    pub port: u16,
}

/// Request body for PUT /api/sessions/{id}/intercept.
#[derive(Debug, Deserialize)]
pub struct InterceptRequest {
    pub enabled: bool,
}

/// Response body for PUT /api/sessions/{id}/intercept.
#[derive(Debug, Serialize)]
pub struct InterceptResponse {
    pub found: bool,
}

/// Response body for the forward/drop endpoints.
#[derive(Debug, Serialize)]
pub struct HandledResponse {
    pub handled: bool,
}
