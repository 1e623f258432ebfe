//! Interpose Server - local HTTP control surface.
//!
//! Exposes the session registry, intercept decisions and OS proxy settings
//! over a small JSON API, and streams captured traffic as server-sent events.
//!
//! ## Endpoints
//!
//! - `GET /api/sessions` - List sessions
//! - `POST /api/sessions/{id}` - Create a session, returns its port
//! - `DELETE /api/sessions/{id}` - Stop a session
//! - `DELETE /api/sessions` - Stop every session
//! - `PUT /api/sessions/{id}/intercept` - Toggle intercept-hold
//! - `POST /api/requests/{id}/forward` - Release a held request
//! - `POST /api/requests/{id}/drop` - Drop a held request
//! - `POST /api/system-proxy/test` - Check a proxy address is reachable
//! - `PUT /api/system-proxy` - Point the OS proxy at a session
//! - `DELETE /api/system-proxy` - Turn the OS proxy off
//! - `GET /api/events` - `proxy:*` events as server-sent events
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use interpose_core::BroadcastSink;
//! use interpose_proxy::{RegistryConfig, SessionRegistry};
//! use interpose_server::{AppState, Server, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let events = BroadcastSink::default();
//!     let registry = SessionRegistry::new(RegistryConfig::default(), Arc::new(events.clone()));
//!     let state = AppState::new(Arc::new(registry), events);
//!     Server::new(ServerConfig::default(), state).unwrap().run().await.unwrap();
//! }
//! ```

pub mod error;
mod handlers;
pub mod models;
pub mod state;

use std::future::Future;
use std::net::SocketAddr;

use axum::routing::{delete, get, post, put};
use axum::Router;
use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

pub use error::{ApiError, Result};
pub use state::AppState;

/// Default control port.
pub const DEFAULT_PORT: u16 = 48081;

/// Default server host (localhost only for security).
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Host to bind to (default: 127.0.0.1).
    pub host: String,
    /// Port to bind to (default: 48081).
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
        }
    }
}

impl ServerConfig {
    /// Sets the port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Sets the host.
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }
}

/// Server error types.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Failed to bind to address.
    #[error("failed to bind to {0}: {1}")]
    BindError(SocketAddr, std::io::Error),

    /// Server runtime error.
    #[error("server error: {0}")]
    Runtime(String),
}

/// Builds the API router.
pub fn router(state: AppState) -> Router {
    // Browser-based viewers connect from arbitrary local origins.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route(
            "/api/sessions",
            get(handlers::list_sessions).delete(handlers::stop_all),
        )
        .route(
            "/api/sessions/{id}",
            post(handlers::create_session).delete(handlers::stop_session),
        )
        .route("/api/sessions/{id}/intercept", put(handlers::set_intercept))
        .route("/api/requests/{id}/forward", post(handlers::forward_request))
        .route("/api/requests/{id}/drop", post(handlers::drop_request))
        .route("/api/system-proxy/test", post(handlers::test_system_proxy))
        .route(
            "/api/system-proxy",
            put(handlers::set_system_proxy).delete(handlers::clear_system_proxy),
        )
        .route("/api/events", get(handlers::stream_events))
        .layer(cors)
        .with_state(state)
}

/// The HTTP control server.
pub struct Server {
    router: Router,
    addr: SocketAddr,
}

impl Server {
    /// Creates a new server with the given configuration and state.
    pub fn new(config: ServerConfig, state: AppState) -> std::result::Result<Self, ServerError> {
        let addr = format!("{}:{}", config.host, config.port)
            .parse()
            .map_err(|e| ServerError::Runtime(format!("invalid address: {}", e)))?;

        Ok(Self {
            router: router(state),
            addr,
        })
    }

    /// Returns the server address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Runs the server until the process exits.
    pub async fn run(self) -> std::result::Result<(), ServerError> {
        self.run_until(std::future::pending()).await
    }

    /// Runs the server until `shutdown` resolves.
    pub async fn run_until<F>(self, shutdown: F) -> std::result::Result<(), ServerError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = self.bind()?;
        info!("Control server listening on {}", self.addr);

        axum::serve(listener, self.router)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| ServerError::Runtime(e.to_string()))
    }

    fn bind(&self) -> std::result::Result<tokio::net::TcpListener, ServerError> {
        let domain = if self.addr.is_ipv6() {
            Domain::IPV6
        } else {
            Domain::IPV4
        };
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
            .map_err(|e| ServerError::BindError(self.addr, e))?;

        // Allow address reuse (helps with TIME_WAIT/CLOSE_WAIT sockets)
        socket
            .set_reuse_address(true)
            .map_err(|e| ServerError::BindError(self.addr, e))?;
        socket
            .bind(&self.addr.into())
            .map_err(|e| ServerError::BindError(self.addr, e))?;
        socket
            .listen(128)
            .map_err(|e| ServerError::BindError(self.addr, e))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| ServerError::BindError(self.addr, e))?;

        let std_listener: std::net::TcpListener = socket.into();
        tokio::net::TcpListener::from_std(std_listener)
            .map_err(|e| ServerError::BindError(self.addr, e))
    }

    /// Returns the router for testing.
    pub fn router(&self) -> Router {
        self.router.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use interpose_core::{BroadcastSink, ProxyEvent, RequestBodyEvent, SessionEvent};
    use interpose_proxy::{EngineConfig, RegistryConfig, SessionRegistry};
    use serde_json::json;
    use tempfile::TempDir;
    use tower::ServiceExt;

    struct TestApp {
        router: Router,
        state: AppState,
        _dir: TempDir,
    }

    fn create_test_app() -> TestApp {
        let dir = TempDir::new().unwrap();
        let base_port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let events = BroadcastSink::new(16);
        let config = RegistryConfig::default()
            .with_base_port(base_port)
            .with_engine(EngineConfig::default().with_ca_dir(dir.path()));
        let registry = SessionRegistry::new(config, Arc::new(events.clone()));
        let state = AppState::new(Arc::new(registry), events);

        TestApp {
            router: router(state.clone()),
            state,
            _dir: dir,
        }
    }

    async fn send(
        app: &TestApp,
        method: &str,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                builder = builder.header("content-type", "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };

        let response = app
            .router
            .clone()
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    #[test]
    fn default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 48081);
        assert_eq!(config.with_port(9000).port, 9000);
    }

    #[test]
    fn invalid_host_is_rejected() {
        let app = create_test_app();
        let config = ServerConfig::default().with_host("not a host");
        assert!(Server::new(config, app.state).is_err());
    }

    #[tokio::test]
    async fn test_create_and_list_sessions() {
        let app = create_test_app();

        let (status, json) = send(&app, "POST", "/api/sessions/main", None).await;
        assert_eq!(status, StatusCode::OK);
        let port = json["port"].as_u64().unwrap();
        assert_eq!(json["id"], "main");

        // Same id, same port.
        let (_, again) = send(&app, "POST", "/api/sessions/main", None).await;
        assert_eq!(again["port"].as_u64().unwrap(), port);

        let (status, json) = send(&app, "GET", "/api/sessions", None).await;
        assert_eq!(status, StatusCode::OK);
        let sessions = json["sessions"].as_array().unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0]["id"], "main");
        assert_eq!(sessions[0]["listening"], true);
        assert_eq!(sessions[0]["inFlight"], 0);

        app.state.registry.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_creates_run_off_the_worker() {
        let app = create_test_app();

        let (a, b) = tokio::join!(
            send(&app, "POST", "/api/sessions/shared", None),
            send(&app, "POST", "/api/sessions/shared", None)
        );
        assert_eq!(a.0, StatusCode::OK);
        assert_eq!(a.1["port"], b.1["port"]);

        // The engine started on the blocking pool is serving on the runtime.
        let port = a.1["port"].as_u64().unwrap() as u16;
        assert!(tokio::net::TcpStream::connect(("127.0.0.1", port)).await.is_ok());
        assert_eq!(app.state.registry.len(), 1);

        app.state.registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_session_id() {
        let app = create_test_app();
        let (status, json) = send(&app, "POST", "/api/sessions/bad%20id", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["code"], "bad_request");
    }

    #[tokio::test]
    async fn test_port_exhaustion() {
        let app = create_test_app();
        let _held = std::net::TcpListener::bind(("127.0.0.1", u16::MAX));

        let (status, json) = send(&app, "POST", "/api/sessions/s?port=65535", None).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json["code"], "port_allocation_failed");
    }

    #[tokio::test]
    async fn test_stop_session_is_idempotent() {
        let app = create_test_app();
        send(&app, "POST", "/api/sessions/s", None).await;

        let (status, _) = send(&app, "DELETE", "/api/sessions/s", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = send(&app, "DELETE", "/api/sessions/s", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(app.state.registry.is_empty());
    }

    #[tokio::test]
    async fn test_stop_all() {
        let app = create_test_app();
        send(&app, "POST", "/api/sessions/a", None).await;
        send(&app, "POST", "/api/sessions/b", None).await;

        let (status, _) = send(&app, "DELETE", "/api/sessions", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(app.state.registry.is_empty());
    }

    #[tokio::test]
    async fn test_set_intercept() {
        let app = create_test_app();
        send(&app, "POST", "/api/sessions/s", None).await;

        let (status, json) = send(
            &app,
            "PUT",
            "/api/sessions/s/intercept",
            Some(json!({"enabled": true})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["found"], true);

        let (status, json) = send(
            &app,
            "PUT",
            "/api/sessions/ghost/intercept",
            Some(json!({"enabled": true})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["found"], false);

        app.state.registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_forward_and_drop_unknown() {
        let app = create_test_app();

        let (status, json) = send(&app, "POST", "/api/requests/s-1/forward", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["handled"], false);

        let (_, json) = send(&app, "POST", "/api/requests/s-1/drop", None).await;
        assert_eq!(json["handled"], false);
    }

    #[tokio::test]
    async fn test_system_proxy_test_endpoint() {
        let app = create_test_app();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let (status, json) = send(
            &app,
            "POST",
            "/api/system-proxy/test",
            Some(json!({"host": "127.0.0.1", "port": port})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["success"], true);
        assert_eq!(json["needsAdmin"], false);
    }

    #[tokio::test]
    async fn test_events_stream_headers() {
        let app = create_test_app();
        let response = app
            .router
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/events")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["content-type"], "text/event-stream");
        assert_eq!(app.state.events.receiver_count(), 1);
    }

    #[test]
    fn sse_event_carries_session_id() {
        let envelope = SessionEvent {
            session_id: "tab".into(),
            event: ProxyEvent::RequestBody(RequestBodyEvent {
                id: "tab-4".into(),
                body: "a=1".into(),
            }),
        };
        assert!(handlers::sse_event(&envelope).is_some());
    }
}
