//! Interpose Proxy - multi-session TLS-intercepting HTTP proxy.
//!
//! Each session runs its own [`ProxyEngine`] on its own port. Every exchange
//! that passes through an engine is reported to a shared
//! [`EventSink`](interpose_core::EventSink) as four events: request,
//! request body, response and decoded response body.
//!
//! ## Architecture
//!
//! ```text
//!                       SessionRegistry
//!                 ┌───────────┼───────────┐
//!            ProxyEngine  ProxyEngine  ProxyEngine      (one port each)
//!                 │
//!           CaptureHandler ──► InterceptGate ──► origin
//!                 │                 │
//!                 │          forward / drop
//!                 ▼
//!             EventSink  (shared by all sessions)
//! ```
//!
//! HTTPS is intercepted with leaf certificates signed by a local root managed
//! by [`CaManager`]. Peer resets and abrupt disconnects are filtered out by
//! [`is_expected_noise`] before anything is logged or emitted.

mod ca;
mod engine;
mod error;
mod handler;
pub mod intercept;
pub mod noise;
mod registry;
pub mod system_proxy;

pub use ca::{CaManager, CaManagerError};
pub use engine::{EngineConfig, ProxyEngine};
pub use error::{ProxyError, Result};
pub use intercept::{HeldRequest, InterceptConfig, InterceptDecision, InterceptGate};
pub use noise::is_expected_noise;
pub use registry::{RegistryConfig, SessionInfo, SessionRegistry};
pub use system_proxy::{SetupResult, SystemProxyConfig};

/// Session started by the single-session `start`/`stop` controls.
pub const DEFAULT_SESSION_ID: &str = "default";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_session_id() {
        assert_eq!(DEFAULT_SESSION_ID, "default");
    }
}
