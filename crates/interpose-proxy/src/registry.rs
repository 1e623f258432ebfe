//! Named proxy sessions sharing one event sink.

use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

use interpose_core::{find_available_port, EventSink, DEFAULT_BASE_PORT};

use crate::engine::{EngineConfig, ProxyEngine};
use crate::error::{ProxyError, Result};

/// Registry configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// First port tried for a new session.
    pub base_port: u16,
    /// Applied to every engine the registry creates.
    pub engine: EngineConfig,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            base_port: DEFAULT_BASE_PORT,
            engine: EngineConfig::default(),
        }
    }
}

impl RegistryConfig {
    pub fn with_base_port(mut self, port: u16) -> Self {
        self.base_port = port;
        self
    }

    pub fn with_engine(mut self, engine: EngineConfig) -> Self {
        self.engine = engine;
        self
    }
}

/// Snapshot of one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    pub port: Option<u16>,
    pub listening: bool,
    pub intercept: bool,
    pub held: Vec<String>,
    pub in_flight: usize,
}

/// Owns one [`ProxyEngine`] per session id.
pub struct SessionRegistry {
    config: RegistryConfig,
    sink: Arc<dyn EventSink>,
    sessions: RwLock<BTreeMap<String, Arc<ProxyEngine>>>,
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("config", &self.config)
            .field("sessions", &self.sessions.read().keys().collect::<Vec<_>>())
            .finish()
    }
}

impl SessionRegistry {
    pub fn new(config: RegistryConfig, sink: Arc<dyn EventSink>) -> Self {
        Self {
            config,
            sink,
            sessions: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Starts a session on the first free port at or above the base port.
    ///
    /// Returns the existing port if `id` is already registered.
    pub fn create_session(&self, id: &str) -> Result<u16> {
        self.create_session_from(id, self.config.base_port)
    }

    /// Like [`create_session`](Self::create_session) with an explicit first port.
    pub fn create_session_from(&self, id: &str, start_port: u16) -> Result<u16> {
        // Held for the whole creation so concurrent calls for one id bind once.
        let mut sessions = self.sessions.write();
        if let Some(port) = sessions.get(id).and_then(|engine| engine.port()) {
            return Ok(port);
        }

        let engine = Arc::new(ProxyEngine::new(
            id,
            self.config.engine.clone(),
            Arc::clone(&self.sink),
        ));

        let mut candidate = start_port;
        let port = loop {
            let port = find_available_port(candidate)?;
            match engine.start(port) {
                Ok(port) => break port,
                // Someone grabbed it between the probe and the bind.
                Err(ProxyError::Io(e)) if e.kind() == io::ErrorKind::AddrInUse && port < u16::MAX => {
                    tracing::debug!(session = id, port, "Port taken before bind, retrying");
                    candidate = port + 1;
                }
                Err(e) => return Err(e),
            }
        };

        sessions.insert(id.to_string(), engine);
        tracing::info!(session = id, port, "Session created");
        Ok(port)
    }

    /// Stops and removes a session. Returns false if it did not exist.
    pub fn stop_session(&self, id: &str) -> bool {
        let removed = self.sessions.write().remove(id);
        match removed {
            Some(engine) => {
                engine.stop();
                tracing::info!(session = id, "Session stopped");
                true
            }
            None => false,
        }
    }

    /// Stops every session and empties the registry.
    pub fn stop_all(&self) {
        let drained = std::mem::take(&mut *self.sessions.write());
        for engine in drained.values() {
            engine.stop();
        }
        if !drained.is_empty() {
            tracing::info!(count = drained.len(), "All sessions stopped");
        }
    }

    /// Like [`stop_all`](Self::stop_all), but waits for every listener to close.
    pub async fn shutdown(&self) {
        let drained = std::mem::take(&mut *self.sessions.write());
        for engine in drained.values() {
            engine.shutdown().await;
        }
    }

    /// Toggles intercept-hold for a session. Returns false for unknown ids.
    pub fn set_intercept(&self, id: &str, enabled: bool) -> bool {
        match self.sessions.read().get(id) {
            Some(engine) => {
                engine.set_intercept(enabled);
                true
            }
            None => false,
        }
    }

    /// Releases a held request in whichever session holds it.
    pub fn forward_request(&self, request_id: &str) -> bool {
        self.sessions
            .read()
            .values()
            .any(|engine| engine.forward_request(request_id))
    }

    /// Drops a held request in whichever session holds it.
    pub fn drop_request(&self, request_id: &str) -> bool {
        self.sessions
            .read()
            .values()
            .any(|engine| engine.drop_request(request_id))
    }

    pub fn get(&self, id: &str) -> Option<Arc<ProxyEngine>> {
        self.sessions.read().get(id).cloned()
    }

    pub fn session_port(&self, id: &str) -> Option<u16> {
        self.sessions.read().get(id).and_then(|engine| engine.port())
    }

    /// Snapshot of all sessions, ordered by id.
    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.sessions
            .read()
            .iter()
            .map(|(id, engine)| SessionInfo {
                id: id.clone(),
                port: engine.port(),
                listening: engine.is_listening(),
                intercept: engine.intercept_enabled(),
                held: engine.held_requests(),
                in_flight: engine.in_flight(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}

impl Drop for SessionRegistry {
    fn drop(&mut self) {
        self.stop_all();
    }
}
