//! Event shapes pushed to observers, and the sinks that receive them.

use std::fmt;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::capture::Headers;

/// Current time as Unix milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// `proxy:request` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestEvent {
    pub id: String,
    pub method: String,
    pub url: String,
    pub headers: Headers,
    pub timestamp: i64,
}

/// `proxy:request-body` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestBodyEvent {
    pub id: String,
    pub body: String,
}

/// `proxy:response` payload. `status_code` is 0 when the origin never answered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEvent {
    pub id: String,
    pub url: String,
    pub status_code: u16,
    pub headers: Headers,
    pub timestamp: i64,
}

/// `proxy:response-body` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseBodyEvent {
    pub id: String,
    /// Decoded text, base64 for binary payloads, or a bracketed placeholder.
    pub body: String,
    /// Human readable size of the body as received on the wire.
    pub size: String,
    pub is_binary: bool,
    pub content_type: String,
}

/// One observable step of an exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload")]
pub enum ProxyEvent {
    #[serde(rename = "proxy:request")]
    Request(RequestEvent),
    #[serde(rename = "proxy:request-body")]
    RequestBody(RequestBodyEvent),
    #[serde(rename = "proxy:response")]
    Response(ResponseEvent),
    #[serde(rename = "proxy:response-body")]
    ResponseBody(ResponseBodyEvent),
}

impl ProxyEvent {
    /// Wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            ProxyEvent::Request(_) => "proxy:request",
            ProxyEvent::RequestBody(_) => "proxy:request-body",
            ProxyEvent::Response(_) => "proxy:response",
            ProxyEvent::ResponseBody(_) => "proxy:response-body",
        }
    }

    /// Id of the exchange this event belongs to.
    pub fn request_id(&self) -> &str {
        match self {
            ProxyEvent::Request(e) => &e.id,
            ProxyEvent::RequestBody(e) => &e.id,
            ProxyEvent::Response(e) => &e.id,
            ProxyEvent::ResponseBody(e) => &e.id,
        }
    }

    /// Payload as a JSON value.
    pub fn payload_json(&self) -> serde_json::Value {
        let value = match self {
            ProxyEvent::Request(e) => serde_json::to_value(e),
            ProxyEvent::RequestBody(e) => serde_json::to_value(e),
            ProxyEvent::Response(e) => serde_json::to_value(e),
            ProxyEvent::ResponseBody(e) => serde_json::to_value(e),
        };
        value.unwrap_or(serde_json::Value::Null)
    }
}

impl fmt::Display for ProxyEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.name(), self.request_id())
    }
}

/// An event tagged with the session that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEvent {
    pub session_id: String,
    pub event: ProxyEvent,
}

/// Receives events from every running engine.
///
/// Implementations must tolerate concurrent calls from many engines and must
/// not block; a slow consumer should lose events rather than stall traffic.
pub trait EventSink: Send + Sync {
    fn emit(&self, session_id: &str, event: ProxyEvent);
}

/// Fans events out over a tokio broadcast channel.
///
/// Receivers that fall behind by more than the channel capacity miss the
/// oldest events. Emitting with no receivers is not an error.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<SessionEvent>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for BroadcastSink {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventSink for BroadcastSink {
    fn emit(&self, session_id: &str, event: ProxyEvent) {
        let _ = self.tx.send(SessionEvent {
            session_id: session_id.to_string(),
            event,
        });
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct CollectingSink {
    events: Mutex<Vec<SessionEvent>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything collected so far.
    pub fn events(&self) -> Vec<SessionEvent> {
        self.events.lock().clone()
    }

    /// Events of one exchange, in emission order.
    pub fn for_request(&self, request_id: &str) -> Vec<ProxyEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.event.request_id() == request_id)
            .map(|e| e.event.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventSink for CollectingSink {
    fn emit(&self, session_id: &str, event: ProxyEvent) {
        self.events.lock().push(SessionEvent {
            session_id: session_id.to_string(),
            event,
        });
    }
}

/// Writes each event to the log at debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, session_id: &str, event: ProxyEvent) {
        match &event {
            ProxyEvent::Request(e) => {
                tracing::debug!(session = session_id, id = %e.id, method = %e.method, url = %e.url, "proxy:request")
            }
            ProxyEvent::RequestBody(e) => {
                tracing::debug!(session = session_id, id = %e.id, len = e.body.len(), "proxy:request-body")
            }
            ProxyEvent::Response(e) => {
                tracing::debug!(session = session_id, id = %e.id, status = e.status_code, "proxy:response")
            }
            ProxyEvent::ResponseBody(e) => {
                tracing::debug!(session = session_id, id = %e.id, size = %e.size, binary = e.is_binary, "proxy:response-body")
            }
        }
    }
}
