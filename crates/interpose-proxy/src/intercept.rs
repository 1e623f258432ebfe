//! Intercept hold: pausing captured requests until an operator decides.
//!
//! ```text
//! Intercepted ──(gate off)──────────────► Forwarded
//!      │
//!      └─(gate on)─► Held ──forward──► Forwarded
//!                      └────drop─────► Dropped
//! ```
//!
//! The gate is sampled once when a request is captured, so toggling it never
//! affects requests that are already on their way.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

/// What happens to a held request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterceptDecision {
    /// Send the request to the origin unmodified.
    Forward,
    /// Answer the client locally; the origin never sees the request.
    Drop,
}

/// Intercept behaviour for one engine.
#[derive(Debug, Clone)]
pub struct InterceptConfig {
    /// How long a request may stay held. `None` waits indefinitely.
    pub hold_timeout: Option<Duration>,
    /// Applied when `hold_timeout` elapses.
    pub timeout_decision: InterceptDecision,
    /// Status returned to the client for a dropped request.
    pub drop_status: u16,
}

impl Default for InterceptConfig {
    fn default() -> Self {
        Self {
            hold_timeout: None,
            timeout_decision: InterceptDecision::Forward,
            drop_status: 403,
        }
    }
}

impl InterceptConfig {
    pub fn with_hold_timeout(mut self, timeout: Duration) -> Self {
        self.hold_timeout = Some(timeout);
        self
    }

    pub fn with_timeout_decision(mut self, decision: InterceptDecision) -> Self {
        self.timeout_decision = decision;
        self
    }

    pub fn with_drop_status(mut self, status: u16) -> Self {
        self.drop_status = status;
        self
    }
}

type Pending = Arc<Mutex<HashMap<String, oneshot::Sender<InterceptDecision>>>>;

/// Holds requests for an engine and routes operator decisions to them.
#[derive(Debug)]
pub struct InterceptGate {
    enabled: AtomicBool,
    pending: Pending,
    config: InterceptConfig,
}

impl InterceptGate {
    pub fn new(config: InterceptConfig) -> Self {
        Self {
            enabled: AtomicBool::new(false),
            pending: Arc::new(Mutex::new(HashMap::new())),
            config,
        }
    }

    pub fn config(&self) -> &InterceptConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Parks `request_id` until [`resolve`](Self::resolve) is called for it.
    pub fn hold(&self, request_id: &str) -> HeldRequest {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(request_id.to_string(), tx);
        tracing::debug!(id = request_id, "Holding request");

        HeldRequest {
            request_id: request_id.to_string(),
            rx: Some(rx),
            pending: Arc::clone(&self.pending),
            timeout: self.config.hold_timeout,
            timeout_decision: self.config.timeout_decision,
        }
    }

    /// Delivers `decision` to a held request. Returns false for unknown ids.
    pub fn resolve(&self, request_id: &str, decision: InterceptDecision) -> bool {
        let Some(tx) = self.pending.lock().remove(request_id) else {
            return false;
        };
        // The receiver may already be gone if the client hung up; the id was
        // still ours.
        let _ = tx.send(decision);
        tracing::debug!(id = request_id, ?decision, "Resolved held request");
        true
    }

    /// Drops every held request. Returns how many there were.
    pub fn release_all(&self) -> usize {
        let drained: Vec<_> = self.pending.lock().drain().collect();
        drained.len()
    }

    /// Ids currently held, sorted.
    pub fn held_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.pending.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn held_count(&self) -> usize {
        self.pending.lock().len()
    }
}

/// A request waiting for its decision.
#[derive(Debug)]
pub struct HeldRequest {
    request_id: String,
    rx: Option<oneshot::Receiver<InterceptDecision>>,
    pending: Pending,
    timeout: Option<Duration>,
    timeout_decision: InterceptDecision,
}

impl HeldRequest {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Waits for the operator. A released gate counts as `Drop`.
    pub async fn decision(mut self) -> InterceptDecision {
        let Some(rx) = self.rx.take() else {
            return InterceptDecision::Drop;
        };

        match self.timeout {
            None => rx.await.unwrap_or(InterceptDecision::Drop),
            Some(timeout) => match tokio::time::timeout(timeout, rx).await {
                Ok(decision) => decision.unwrap_or(InterceptDecision::Drop),
                Err(_) => {
                    tracing::debug!(
                        id = %self.request_id,
                        decision = ?self.timeout_decision,
                        "Hold timed out"
                    );
                    self.timeout_decision
                }
            },
        }
    }
}

impl Drop for HeldRequest {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.request_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config = InterceptConfig::default();
        assert_eq!(config.hold_timeout, None);
        assert_eq!(config.timeout_decision, InterceptDecision::Forward);
        assert_eq!(config.drop_status, 403);
    }

    #[test]
    fn gate_starts_disabled() {
        let gate = InterceptGate::new(InterceptConfig::default());
        assert!(!gate.is_enabled());
        gate.set_enabled(true);
        assert!(gate.is_enabled());
    }

    #[tokio::test]
    async fn forward_reaches_holder() {
        let gate = InterceptGate::new(InterceptConfig::default());
        let held = gate.hold("s-1");
        assert_eq!(gate.held_ids(), vec!["s-1"]);

        assert!(gate.resolve("s-1", InterceptDecision::Forward));
        assert_eq!(held.decision().await, InterceptDecision::Forward);
        assert_eq!(gate.held_count(), 0);
    }

    #[test]
    fn drop_reaches_holder() {
        let gate = InterceptGate::new(InterceptConfig::default());
        let held = gate.hold("s-2");
        assert!(gate.resolve("s-2", InterceptDecision::Drop));
        assert_eq!(
            tokio_test::block_on(held.decision()),
            InterceptDecision::Drop
        );
    }

    #[test]
    fn unknown_id_is_not_handled() {
        let gate = InterceptGate::new(InterceptConfig::default());
        assert!(!gate.resolve("nope", InterceptDecision::Forward));
    }

    #[test]
    fn resolve_is_one_shot() {
        let gate = InterceptGate::new(InterceptConfig::default());
        let _held = gate.hold("s-3");
        assert!(gate.resolve("s-3", InterceptDecision::Forward));
        assert!(!gate.resolve("s-3", InterceptDecision::Drop));
    }

    #[tokio::test]
    async fn release_all_drops_everything() {
        let gate = InterceptGate::new(InterceptConfig::default());
        let a = gate.hold("a-1");
        let b = gate.hold("a-2");

        assert_eq!(gate.release_all(), 2);
        assert!(gate.held_ids().is_empty());
        assert_eq!(a.decision().await, InterceptDecision::Drop);
        assert_eq!(b.decision().await, InterceptDecision::Drop);
    }

    #[tokio::test]
    async fn timeout_applies_configured_decision() {
        let config = InterceptConfig::default()
            .with_hold_timeout(Duration::from_millis(20))
            .with_timeout_decision(InterceptDecision::Drop);
        let gate = InterceptGate::new(config);

        let held = gate.hold("t-1");
        assert_eq!(held.decision().await, InterceptDecision::Drop);
        // The timed-out request is no longer resolvable.
        assert!(!gate.resolve("t-1", InterceptDecision::Forward));
    }

    #[test]
    fn abandoned_hold_unregisters() {
        let gate = InterceptGate::new(InterceptConfig::default());
        drop(gate.hold("gone-1"));
        assert_eq!(gate.held_count(), 0);
    }

    #[test]
    fn decision_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&InterceptDecision::Forward).unwrap(),
            "\"forward\""
        );
    }
}
