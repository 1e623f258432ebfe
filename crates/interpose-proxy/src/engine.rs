//! One intercepting proxy listener, bound to one session.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use hudsucker::rustls::crypto::aws_lc_rs::default_provider;
use hudsucker::Proxy;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use interpose_core::{EventSink, ProxyEvent};

use crate::ca::{CaManager, CaManagerError};
use crate::error::{ProxyError, Result};
use crate::handler::CaptureHandler;
use crate::intercept::{HeldRequest, InterceptConfig, InterceptDecision, InterceptGate};

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Interface to listen on.
    pub host: IpAddr,
    /// Directory holding the interception root. `None` uses the platform data dir.
    pub ca_dir: Option<PathBuf>,
    pub intercept: InterceptConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ca_dir: None,
            intercept: InterceptConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn with_host(mut self, host: IpAddr) -> Self {
        self.host = host;
        self
    }

    pub fn with_ca_dir(mut self, ca_dir: impl Into<PathBuf>) -> Self {
        self.ca_dir = Some(ca_dir.into());
        self
    }

    pub fn with_intercept(mut self, intercept: InterceptConfig) -> Self {
        self.intercept = intercept;
        self
    }

    pub fn ca_manager(&self) -> std::result::Result<CaManager, CaManagerError> {
        match &self.ca_dir {
            Some(dir) => Ok(CaManager::new(dir)),
            None => CaManager::with_default_dir(),
        }
    }
}

/// State shared between an engine and the handlers serving its connections.
pub(crate) struct EngineShared {
    session_id: String,
    sink: Arc<dyn EventSink>,
    gate: InterceptGate,
    accepting: AtomicBool,
    next_id: AtomicU64,
    /// Exchanges still allowed to emit. Cleared on stop.
    in_flight: Mutex<HashSet<String>>,
}

impl EngineShared {
    fn new(session_id: String, sink: Arc<dyn EventSink>, intercept: InterceptConfig) -> Self {
        Self {
            session_id,
            sink,
            gate: InterceptGate::new(intercept),
            accepting: AtomicBool::new(false),
            next_id: AtomicU64::new(0),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub(crate) fn session_id(&self) -> &str {
        &self.session_id
    }

    pub(crate) fn gate(&self) -> &InterceptGate {
        &self.gate
    }

    /// Allocates and tracks a request id, or `None` once the engine is stopped.
    pub(crate) fn begin_exchange(&self) -> Option<String> {
        let mut in_flight = self.in_flight.lock();
        if !self.accepting.load(Ordering::SeqCst) {
            return None;
        }
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("{}-{}", self.session_id, n);
        in_flight.insert(id.clone());
        Some(id)
    }

    /// Parks a tracked exchange. `None` means the engine stopped underneath it.
    pub(crate) fn hold(&self, request_id: &str) -> Option<HeldRequest> {
        let in_flight = self.in_flight.lock();
        in_flight
            .contains(request_id)
            .then(|| self.gate.hold(request_id))
    }

    /// Forwards events to the sink unless their exchange has been abandoned.
    pub(crate) fn emit(&self, events: impl IntoIterator<Item = ProxyEvent>) {
        let in_flight = self.in_flight.lock();
        for event in events {
            if in_flight.contains(event.request_id()) {
                self.sink.emit(&self.session_id, event);
            }
        }
    }

    /// Stops tracking an exchange after its last event.
    pub(crate) fn finish(&self, request_id: &str) {
        self.in_flight.lock().remove(request_id);
    }

    fn abandon_all(&self) -> usize {
        let mut in_flight = self.in_flight.lock();
        self.accepting.store(false, Ordering::SeqCst);
        let abandoned = in_flight.len();
        in_flight.clear();
        abandoned
    }

    fn in_flight_count(&self) -> usize {
        self.in_flight.lock().len()
    }
}

struct RunningProxy {
    port: u16,
    shutdown_tx: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

/// Intercepting proxy for a single session.
///
/// Request ids take the form `<session_id>-<n>`.
pub struct ProxyEngine {
    shared: Arc<EngineShared>,
    config: EngineConfig,
    running: Mutex<Option<RunningProxy>>,
}

impl std::fmt::Debug for ProxyEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyEngine")
            .field("session_id", &self.shared.session_id)
            .field("port", &self.port())
            .field("config", &self.config)
            .finish()
    }
}

impl ProxyEngine {
    pub fn new(
        session_id: impl Into<String>,
        config: EngineConfig,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let shared = EngineShared::new(session_id.into(), sink, config.intercept.clone());
        Self {
            shared: Arc::new(shared),
            config,
            running: Mutex::new(None),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.shared.session_id
    }

    /// Starts listening on `port` (0 picks an ephemeral port).
    ///
    /// Returns the bound port. Calling this on a running engine returns the
    /// current port without rebinding. Must be called from within a tokio
    /// runtime.
    pub fn start(&self, port: u16) -> Result<u16> {
        let mut running = self.running.lock();
        if let Some(current) = running.as_ref() {
            return Ok(current.port);
        }

        if tokio::runtime::Handle::try_current().is_err() {
            return Err(ProxyError::Proxy(
                "proxy engine must be started inside a tokio runtime".into(),
            ));
        }

        let authority = self.config.ca_manager()?.ensure_ca()?;

        let listener = std::net::TcpListener::bind(SocketAddr::new(self.config.host, port))?;
        listener.set_nonblocking(true)?;
        let listener = tokio::net::TcpListener::from_std(listener)?;
        let port = listener.local_addr()?.port();

        let proxy = Proxy::builder()
            .with_listener(listener)
            .with_ca(authority)
            .with_rustls_connector(default_provider())
            .with_http_handler(CaptureHandler::new(Arc::clone(&self.shared)))
            .build()
            .map_err(|e| ProxyError::Proxy(e.to_string()))?;

        let (shutdown_tx, mut shutdown_rx) = broadcast::channel::<()>(1);
        let session_id = self.shared.session_id.clone();

        self.shared.accepting.store(true, Ordering::SeqCst);
        let handle = tokio::spawn(async move {
            tokio::select! {
                result = proxy.start() => {
                    if let Err(e) = result {
                        tracing::error!(session = %session_id, "Proxy error: {}", e);
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::debug!(session = %session_id, "Proxy shutdown signal received");
                }
            }
        });

        tracing::info!(session = %self.shared.session_id, port, "Proxy engine started");
        *running = Some(RunningProxy {
            port,
            shutdown_tx,
            handle,
        });
        Ok(port)
    }

    /// Stops listening. In-flight exchanges are abandoned without further events
    /// and held requests are dropped. No-op when idle.
    pub fn stop(&self) {
        drop(self.halt());
    }

    /// Like [`stop`](Self::stop), but waits until the listener is closed.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.halt() {
            let _ = handle.await;
        }
    }

    fn halt(&self) -> Option<JoinHandle<()>> {
        let running = self.running.lock().take()?;

        let abandoned = self.shared.abandon_all();
        let released = self.shared.gate.release_all();
        let _ = running.shutdown_tx.send(());

        tracing::info!(
            session = %self.shared.session_id,
            port = running.port,
            abandoned,
            released,
            "Proxy engine stopped"
        );
        Some(running.handle)
    }

    pub fn is_listening(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Bound port while listening.
    pub fn port(&self) -> Option<u16> {
        self.running.lock().as_ref().map(|r| r.port)
    }

    /// Exchanges that have started but not yet emitted their last event.
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight_count()
    }

    /// Applies to requests captured from now on.
    pub fn set_intercept(&self, enabled: bool) {
        self.shared.gate.set_enabled(enabled);
        tracing::info!(session = %self.shared.session_id, enabled, "Intercept toggled");
    }

    pub fn intercept_enabled(&self) -> bool {
        self.shared.gate.is_enabled()
    }

    /// Releases a held request to the origin. False if this engine is not holding it.
    pub fn forward_request(&self, request_id: &str) -> bool {
        self.shared
            .gate
            .resolve(request_id, InterceptDecision::Forward)
    }

    /// Answers a held request locally. False if this engine is not holding it.
    pub fn drop_request(&self, request_id: &str) -> bool {
        self.shared.gate.resolve(request_id, InterceptDecision::Drop)
    }

    pub fn held_requests(&self) -> Vec<String> {
        self.shared.gate.held_ids()
    }
}

impl Drop for ProxyEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use interpose_core::{CollectingSink, RequestBodyEvent};
    use tempfile::TempDir;

    fn engine(dir: &TempDir) -> (ProxyEngine, Arc<CollectingSink>) {
        let sink = Arc::new(CollectingSink::new());
        let config = EngineConfig::default().with_ca_dir(dir.path());
        (ProxyEngine::new("main", config, sink.clone()), sink)
    }

    fn body_event(id: &str) -> ProxyEvent {
        ProxyEvent::RequestBody(RequestBodyEvent {
            id: id.into(),
            body: "x".into(),
        })
    }

    #[test]
    fn config_builders() {
        let config = EngineConfig::default()
            .with_host(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
            .with_ca_dir("/tmp/ca")
            .with_intercept(InterceptConfig::default().with_drop_status(451));
        assert_eq!(config.host, IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        assert_eq!(config.ca_dir, Some(PathBuf::from("/tmp/ca")));
        assert_eq!(config.intercept.drop_status, 451);
    }

    #[test]
    fn start_outside_runtime_fails() {
        let dir = TempDir::new().unwrap();
        let (engine, _) = engine(&dir);
        assert!(matches!(engine.start(0), Err(ProxyError::Proxy(_))));
        assert!(!engine.is_listening());
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let (engine, _) = engine(&dir);

        let port = engine.start(0).unwrap();
        assert_ne!(port, 0);
        assert!(engine.is_listening());
        assert_eq!(engine.start(0).unwrap(), port);
        assert_eq!(engine.port(), Some(port));

        engine.shutdown().await;
        assert!(!engine.is_listening());
        assert_eq!(engine.port(), None);
    }

    #[tokio::test]
    async fn occupied_port_is_an_io_error() {
        let dir = TempDir::new().unwrap();
        let (engine, _) = engine(&dir);
        let held = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = held.local_addr().unwrap().port();

        assert!(matches!(engine.start(port), Err(ProxyError::Io(_))));
        assert!(!engine.is_listening());
    }

    #[tokio::test]
    async fn stop_when_idle_is_a_noop() {
        let dir = TempDir::new().unwrap();
        let (engine, _) = engine(&dir);
        engine.stop();
        engine.shutdown().await;
        assert!(!engine.is_listening());
    }

    #[tokio::test]
    async fn port_is_released_after_shutdown() {
        let dir = TempDir::new().unwrap();
        let (engine, _) = engine(&dir);
        let port = engine.start(0).unwrap();
        engine.shutdown().await;

        assert!(std::net::TcpListener::bind(("127.0.0.1", port)).is_ok());
    }

    #[tokio::test]
    async fn request_ids_are_sequential_per_session() {
        let dir = TempDir::new().unwrap();
        let (engine, _) = engine(&dir);
        assert_eq!(engine.shared.begin_exchange(), None);

        engine.start(0).unwrap();
        assert_eq!(engine.shared.begin_exchange().as_deref(), Some("main-1"));
        assert_eq!(engine.shared.begin_exchange().as_deref(), Some("main-2"));
        assert_eq!(engine.in_flight(), 2);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn stop_silences_in_flight_exchanges() {
        let dir = TempDir::new().unwrap();
        let (engine, sink) = engine(&dir);
        engine.start(0).unwrap();

        let id = engine.shared.begin_exchange().unwrap();
        engine.shared.emit(Some(body_event(&id)));
        assert_eq!(sink.len(), 1);

        engine.shutdown().await;
        assert_eq!(engine.in_flight(), 0);
        engine.shared.emit(Some(body_event(&id)));
        assert_eq!(sink.len(), 1);
    }

    #[tokio::test]
    async fn finished_exchange_emits_nothing_more() {
        let dir = TempDir::new().unwrap();
        let (engine, sink) = engine(&dir);
        engine.start(0).unwrap();

        let id = engine.shared.begin_exchange().unwrap();
        engine.shared.finish(&id);
        engine.shared.emit(Some(body_event(&id)));
        assert!(sink.is_empty());
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn stop_drops_held_requests() {
        let dir = TempDir::new().unwrap();
        let (engine, _) = engine(&dir);
        engine.start(0).unwrap();
        engine.set_intercept(true);

        let id = engine.shared.begin_exchange().unwrap();
        let held = engine.shared.hold(&id).unwrap();
        assert_eq!(engine.held_requests(), vec![id.clone()]);

        engine.stop();
        assert_eq!(held.decision().await, InterceptDecision::Drop);
        assert!(engine.shared.hold(&id).is_none());
        assert!(!engine.forward_request(&id));
    }

    #[tokio::test]
    async fn forward_and_drop_resolve_held_requests() {
        let dir = TempDir::new().unwrap();
        let (engine, _) = engine(&dir);
        engine.start(0).unwrap();

        let a = engine.shared.begin_exchange().unwrap();
        let b = engine.shared.begin_exchange().unwrap();
        let held_a = engine.shared.hold(&a).unwrap();
        let held_b = engine.shared.hold(&b).unwrap();

        assert!(engine.forward_request(&a));
        assert!(engine.drop_request(&b));
        assert!(!engine.drop_request("main-99"));
        assert_eq!(held_a.decision().await, InterceptDecision::Forward);
        assert_eq!(held_b.decision().await, InterceptDecision::Drop);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn restart_keeps_counting() {
        let dir = TempDir::new().unwrap();
        let (engine, _) = engine(&dir);

        engine.start(0).unwrap();
        let first = engine.shared.begin_exchange().unwrap();
        engine.shutdown().await;

        engine.start(0).unwrap();
        let second = engine.shared.begin_exchange().unwrap();
        assert_ne!(first, second);
        assert_eq!(second, "main-2");
        engine.shutdown().await;
    }
}
