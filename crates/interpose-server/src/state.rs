//! Application state for the control server.

use std::sync::Arc;

use interpose_core::BroadcastSink;
use interpose_proxy::SessionRegistry;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Every proxy session.
    pub registry: Arc<SessionRegistry>,
    /// Event fan-out the sessions emit into; SSE clients subscribe here.
    pub events: BroadcastSink,
}

impl AppState {
    pub fn new(registry: Arc<SessionRegistry>, events: BroadcastSink) -> Self {
        Self { registry, events }
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("registry", &self.registry)
            .field("subscribers", &self.events.receiver_count())
            .finish()
    }
}
