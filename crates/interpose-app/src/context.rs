//! Application context.
//!
//! Owns every long-lived piece of the application. Nothing here is global:
//! the binary builds one context and hands clones of its parts to the
//! control server.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use interpose_core::BroadcastSink;
use interpose_proxy::system_proxy::{self, SetupResult, SystemProxyConfig};
use interpose_proxy::{EngineConfig, InterceptConfig, RegistryConfig, SessionRegistry};
use interpose_server::AppState;

use crate::config::AppConfig;
use crate::controller::Controller;
use crate::error::Result;
use crate::launcher::EditorLauncher;

/// Shared application state.
#[derive(Debug)]
pub struct AppContext {
    config: AppConfig,
    events: BroadcastSink,
    registry: Arc<SessionRegistry>,
    controller: Controller,
    system_proxy_set: AtomicBool,
}

impl AppContext {
    /// Builds the registry and controller from `config`.
    ///
    /// No session is started; call [`Controller::start`] for that.
    pub fn init(config: AppConfig) -> Result<Self> {
        let mut intercept = InterceptConfig::default();
        if let Some(timeout) = config.hold_timeout {
            intercept = intercept.with_hold_timeout(timeout);
        }

        let mut engine = EngineConfig::default().with_intercept(intercept);
        if let Some(dir) = &config.ca_dir {
            engine = engine.with_ca_dir(dir);
        }

        // Generate the CA up front so a broken data directory fails here
        // rather than on the first session.
        let ca = engine.ca_manager().map_err(interpose_proxy::ProxyError::from)?;
        ca.ensure_ca().map_err(interpose_proxy::ProxyError::from)?;
        tracing::info!("CA certificate: {:?}", ca.cert_path());

        let events = BroadcastSink::default();
        let registry = Arc::new(SessionRegistry::new(
            RegistryConfig::default()
                .with_base_port(config.proxy_port)
                .with_engine(engine),
            Arc::new(events.clone()),
        ));

        let launcher = config.editor.clone().map(EditorLauncher::new);
        let controller = Controller::new(Arc::clone(&registry), launcher, config.intercept);

        Ok(Self {
            config,
            events,
            registry,
            controller,
            system_proxy_set: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn events(&self) -> &BroadcastSink {
        &self.events
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn controller(&self) -> &Controller {
        &self.controller
    }

    /// State for the control server, sharing this context's registry and sink.
    pub fn server_state(&self) -> AppState {
        AppState::new(Arc::clone(&self.registry), self.events.clone())
    }

    /// Points the OS proxy at `port`. It is reset again on [`shutdown`](Self::shutdown).
    pub fn set_system_proxy(&self, port: u16) -> SetupResult {
        let result = system_proxy::set(&SystemProxyConfig::new("127.0.0.1", port));
        if result.success {
            self.system_proxy_set.store(true, Ordering::SeqCst);
        }
        result
    }

    /// Stops all sessions, terminates launched editors and resets the OS proxy.
    pub async fn shutdown(&self) {
        self.controller.stop();
        self.registry.shutdown().await;

        if self.system_proxy_set.swap(false, Ordering::SeqCst) {
            let result = system_proxy::clear();
            if !result.success {
                tracing::warn!("Failed to reset system proxy: {}", result.message);
            }
        }
        tracing::info!("Shutdown complete");
    }
}
