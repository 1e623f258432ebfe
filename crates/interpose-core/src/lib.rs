//! Interpose Core - capture primitives shared by the proxy engine.
//!
//! This crate holds the pieces of the interception pipeline that do not touch
//! a socket:
//!
//! - [`port`] finds a free listening port for a new session
//! - [`decode`] turns a captured response body into previewable text
//! - [`capture`] accumulates body chunks and orders the per-exchange events
//! - [`events`] defines the four `proxy:*` event shapes and the [`EventSink`]
//!   they are pushed into
//!
//! ## Pipeline
//!
//! ```text
//! request line ──► proxy:request
//!   body chunks ──► BodyAccumulator ──► proxy:request-body
//! response head ──► proxy:response
//!   body chunks ──► BodyAccumulator ──► decode_body ──► proxy:response-body
//! ```

pub mod capture;
pub mod decode;
pub mod error;
pub mod events;
pub mod port;

pub use capture::{header_map, BodyAccumulator, Exchange, ExchangePhase, Headers};
pub use decode::{decode_body, format_size, DecodeResult, BINARY_SNIFF_LEN};
pub use error::{PortError, Result};
pub use events::{
    now_millis, BroadcastSink, CollectingSink, EventSink, ProxyEvent, RequestBodyEvent,
    RequestEvent, ResponseBodyEvent, ResponseEvent, SessionEvent, TracingSink,
};
pub use port::{find_available_port, DEFAULT_BASE_PORT};
