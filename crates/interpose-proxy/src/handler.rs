//! Capture hooks plugged into hudsucker.
//!
//! hudsucker clones the handler for every request it proxies, so the
//! [`Exchange`] for a request lives on the clone between `handle_request` and
//! `handle_response`. The response body is tapped while it streams to the
//! client and decoded once the last frame has passed.

use std::error::Error as StdError;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use http::header::{self, HeaderValue};
use http::{Method, Request, Response, StatusCode};
use http_body::{Body as HttpBody, Frame, SizeHint};
use http_body_util::{BodyExt, Full};
use hudsucker::{Body, HttpContext, HttpHandler, RequestOrResponse};

use interpose_core::{header_map, Exchange, Headers};

use crate::engine::EngineShared;
use crate::intercept::InterceptDecision;
use crate::noise::is_expected_noise;

const DROPPED_BODY: &str = "Request dropped by Interpose";

fn bytes_to_body(bytes: Bytes) -> Body {
    Body::from(Full::new(bytes))
}

fn status_response(status: StatusCode, body: Body) -> Response<Body> {
    let mut res = Response::new(body);
    *res.status_mut() = status;
    res
}

/// HTTP handler that reports every exchange to the engine's sink.
pub(crate) struct CaptureHandler {
    shared: Arc<EngineShared>,
    exchange: Option<Exchange>,
}

impl CaptureHandler {
    pub(crate) fn new(shared: Arc<EngineShared>) -> Self {
        Self {
            shared,
            exchange: None,
        }
    }

    /// Answers a dropped request locally and closes its exchange.
    fn dropped(&self, mut exchange: Exchange) -> Response<Body> {
        let status = StatusCode::from_u16(self.shared.gate().config().drop_status)
            .unwrap_or(StatusCode::FORBIDDEN);
        let content_type = "text/plain; charset=utf-8";

        let mut headers = Headers::new();
        headers.insert(header::CONTENT_TYPE.as_str().to_string(), content_type.to_string());
        self.shared.emit(exchange.response_event(status.as_u16(), headers));
        exchange.append_response_chunk(Bytes::from_static(DROPPED_BODY.as_bytes()));
        self.shared.emit(exchange.finish_response());
        self.shared.finish(exchange.request_id());

        tracing::info!(
            session = self.shared.session_id(),
            id = exchange.request_id(),
            url = exchange.url(),
            "Dropped held request"
        );

        let body = bytes_to_body(Bytes::from_static(DROPPED_BODY.as_bytes()));
        let mut res = status_response(status, body);
        res.headers_mut()
            .insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
        res
    }
}

impl Clone for CaptureHandler {
    /// Each clone serves a fresh request, so the exchange is not carried over.
    fn clone(&self) -> Self {
        Self::new(Arc::clone(&self.shared))
    }
}

impl std::fmt::Debug for CaptureHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureHandler")
            .field("session_id", &self.shared.session_id())
            .field("exchange", &self.exchange.as_ref().map(Exchange::request_id))
            .finish()
    }
}

impl HttpHandler for CaptureHandler {
    async fn handle_request(
        &mut self,
        _ctx: &HttpContext,
        req: Request<Body>,
    ) -> RequestOrResponse {
        // CONNECT is answered by hudsucker, which then intercepts the tunnel.
        // Upgrades never reach handle_response, so they are not captured.
        if req.method() == Method::CONNECT || req.headers().contains_key(header::UPGRADE) {
            return RequestOrResponse::Request(req);
        }

        let Some(request_id) = self.shared.begin_exchange() else {
            return RequestOrResponse::Request(req);
        };
        // Sampled once at capture: toggling later never affects this exchange.
        let intercept = self.shared.gate().is_enabled();

        let mut exchange = Exchange::new(
            request_id,
            req.method().as_str(),
            reconstruct_url(&req),
            header_map(req.headers()),
        );
        self.shared.emit(exchange.request_event());

        let (parts, body) = req.into_parts();
        let mut body = Box::pin(body);
        while let Some(frame) = body.frame().await {
            match frame {
                Ok(frame) => {
                    if let Ok(data) = frame.into_data() {
                        exchange.append_request_chunk(data);
                    }
                }
                Err(e) => {
                    if !is_expected_noise(&e) {
                        tracing::warn!(
                            session = self.shared.session_id(),
                            id = exchange.request_id(),
                            "Failed to read request body: {}",
                            e
                        );
                    }
                    self.shared.finish(exchange.request_id());
                    return RequestOrResponse::Response(status_response(
                        StatusCode::BAD_REQUEST,
                        Body::empty(),
                    ));
                }
            }
        }

        let collected = match exchange.finish_request() {
            Some((collected, event)) => {
                self.shared.emit(event);
                collected
            }
            None => Bytes::new(),
        };
        let req = Request::from_parts(parts, bytes_to_body(collected));

        if intercept {
            let decision = match self.shared.hold(exchange.request_id()) {
                Some(held) => {
                    tracing::info!(
                        session = self.shared.session_id(),
                        id = exchange.request_id(),
                        url = exchange.url(),
                        "Holding request for intercept"
                    );
                    held.decision().await
                }
                None => InterceptDecision::Drop,
            };
            if decision == InterceptDecision::Drop {
                return RequestOrResponse::Response(self.dropped(exchange));
            }
        }

        self.exchange = Some(exchange);
        RequestOrResponse::Request(req)
    }

    async fn handle_response(&mut self, _ctx: &HttpContext, res: Response<Body>) -> Response<Body> {
        let Some(mut exchange) = self.exchange.take() else {
            return res;
        };

        self.shared
            .emit(exchange.response_event(res.status().as_u16(), header_map(res.headers())));

        if res.body().is_end_stream() {
            self.shared.emit(exchange.finish_response());
            self.shared.finish(exchange.request_id());
            return res;
        }

        let (parts, body) = res.into_parts();
        let tap = TapBody {
            inner: Box::pin(body),
            capture: Some(ResponseCapture {
                exchange,
                shared: Arc::clone(&self.shared),
            }),
        };
        Response::from_parts(parts, Body::from(tap.boxed()))
    }

    async fn handle_error(
        &mut self,
        _ctx: &HttpContext,
        err: hyper_util::client::legacy::Error,
    ) -> Response<Body> {
        let exchange = self.exchange.take();

        if is_expected_noise(&err) {
            if let Some(exchange) = exchange {
                self.shared.finish(exchange.request_id());
            }
            return status_response(StatusCode::BAD_GATEWAY, Body::empty());
        }

        let message = error_chain(&err);
        match exchange {
            Some(mut exchange) => {
                tracing::error!(
                    session = self.shared.session_id(),
                    id = exchange.request_id(),
                    url = exchange.url(),
                    "Upstream request failed: {}",
                    message
                );
                let events = exchange.fail(&format!("[Upstream request failed: {}]", message));
                self.shared.emit(events);
                self.shared.finish(exchange.request_id());
            }
            None => {
                tracing::error!(
                    session = self.shared.session_id(),
                    "Upstream request failed: {}",
                    message
                );
            }
        }

        status_response(
            StatusCode::GATEWAY_TIMEOUT,
            bytes_to_body(Bytes::from(format!("Upstream request failed: {}", message))),
        )
    }
}

struct ResponseCapture {
    exchange: Exchange,
    shared: Arc<EngineShared>,
}

/// Passes response frames through unchanged while keeping a copy.
struct TapBody {
    inner: Pin<Box<Body>>,
    capture: Option<ResponseCapture>,
}

impl HttpBody for TapBody {
    type Data = Bytes;
    type Error = hudsucker::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        let polled = this.inner.as_mut().poll_frame(cx);

        match &polled {
            Poll::Ready(Some(Ok(frame))) => {
                if let (Some(data), Some(capture)) = (frame.data_ref(), this.capture.as_mut()) {
                    capture.exchange.append_response_chunk(data.clone());
                }
            }
            Poll::Ready(Some(Err(e))) => {
                if let Some(capture) = this.capture.take() {
                    if !is_expected_noise(e) {
                        tracing::warn!(
                            session = capture.shared.session_id(),
                            id = capture.exchange.request_id(),
                            "Response body stream failed: {}",
                            e
                        );
                    }
                    capture.shared.finish(capture.exchange.request_id());
                }
            }
            Poll::Ready(None) => {
                if let Some(mut capture) = this.capture.take() {
                    capture.shared.emit(capture.exchange.finish_response());
                    capture.shared.finish(capture.exchange.request_id());
                    tracing::debug!(
                        session = capture.shared.session_id(),
                        id = capture.exchange.request_id(),
                        elapsed_ms = capture.exchange.elapsed().as_millis() as u64,
                        "Exchange complete"
                    );
                }
            }
            Poll::Pending => {}
        }

        polled
    }

    fn is_end_stream(&self) -> bool {
        // Stay open until the final poll so the body event is emitted.
        self.capture.is_none() && self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl Drop for TapBody {
    fn drop(&mut self) {
        // Client went away before the end of the body.
        if let Some(capture) = self.capture.take() {
            capture.shared.finish(capture.exchange.request_id());
        }
    }
}

/// Rebuilds `scheme://host/path?query` for a proxied request.
///
/// The host comes from the `Host` header when present, falling back to the URI
/// authority (HTTP/2 and absolute-form requests). Default ports are omitted.
pub(crate) fn reconstruct_url<B>(req: &Request<B>) -> String {
    let uri = req.uri();
    let scheme = uri.scheme_str().unwrap_or("http");

    let host = req
        .headers()
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .map(str::to_string)
        .or_else(|| uri.authority().map(|a| a.as_str().to_string()))
        .unwrap_or_default();

    let host = match (scheme, host.rsplit_once(':')) {
        ("https", Some((name, "443"))) | ("http", Some((name, "80"))) => name.to_string(),
        _ => host,
    };

    let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
    format!("{}://{}{}", scheme, host, path)
}

/// Joins an error with its sources, skipping repeated messages.
fn error_chain(err: &(dyn StdError + 'static)) -> String {
    let mut parts = vec![err.to_string()];
    let mut source = err.source();
    while let Some(e) = source {
        let message = e.to_string();
        if !parts.contains(&message) {
            parts.push(message);
        }
        source = e.source();
    }
    parts.join(": ")
}
