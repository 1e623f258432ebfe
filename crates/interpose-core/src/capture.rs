//! Per-exchange capture state.
//!
//! An [`Exchange`] is the record of one intercepted request/response pair. It
//! owns two [`BodyAccumulator`]s and hands out the four `proxy:*` events in a
//! fixed order. Each event can be produced at most once; asking for one out of
//! order yields `None`.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use http::header::{CONTENT_ENCODING, CONTENT_TYPE};
use http::HeaderMap;

use crate::decode::{decode_body, format_size};
use crate::events::{
    now_millis, ProxyEvent, RequestBodyEvent, RequestEvent, ResponseBodyEvent, ResponseEvent,
};

/// Header snapshot: lower-case name to value, repeated headers joined by `", "`.
pub type Headers = BTreeMap<String, String>;

/// Snapshots an `http::HeaderMap` into [`Headers`].
pub fn header_map(headers: &HeaderMap) -> Headers {
    let mut out = Headers::new();
    for (name, value) in headers {
        let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
        out.entry(name.as_str().to_string())
            .and_modify(|existing: &mut String| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert(value);
    }
    out
}

/// Collects streamed body chunks in arrival order.
#[derive(Debug, Default)]
pub struct BodyAccumulator {
    chunks: Vec<Bytes>,
    len: usize,
}

impl BodyAccumulator {
    /// Creates an empty accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one chunk.
    pub fn append(&mut self, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }
        self.len += chunk.len();
        self.chunks.push(chunk);
    }

    /// Total number of bytes appended so far.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Concatenates everything appended and resets the accumulator.
    pub fn finalize(&mut self) -> Bytes {
        let chunks = std::mem::take(&mut self.chunks);
        self.len = 0;
        match chunks.len() {
            0 => Bytes::new(),
            1 => chunks.into_iter().next().unwrap_or_default(),
            _ => {
                let total = chunks.iter().map(Bytes::len).sum();
                let mut buf = BytesMut::with_capacity(total);
                for chunk in chunks {
                    buf.extend_from_slice(&chunk);
                }
                buf.freeze()
            }
        }
    }
}

/// How far an exchange has got through its event sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ExchangePhase {
    /// Created, nothing emitted yet.
    Created,
    /// `proxy:request` emitted.
    Requested,
    /// Request body finished (event emitted only if the body was non-empty).
    RequestBodySent,
    /// `proxy:response` emitted.
    Responded,
    /// `proxy:response-body` emitted; terminal.
    Completed,
}

/// One captured request/response pair.
#[derive(Debug)]
pub struct Exchange {
    request_id: String,
    method: String,
    url: String,
    request_headers: Headers,
    request_body: BodyAccumulator,
    status_code: u16,
    response_headers: Headers,
    response_body: BodyAccumulator,
    phase: ExchangePhase,
    started: Instant,
}

impl Exchange {
    /// Creates an exchange at request-line time.
    pub fn new(
        request_id: impl Into<String>,
        method: impl Into<String>,
        url: impl Into<String>,
        request_headers: Headers,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            method: method.into(),
            url: url.into(),
            request_headers,
            request_body: BodyAccumulator::new(),
            status_code: 0,
            response_headers: Headers::new(),
            response_body: BodyAccumulator::new(),
            phase: ExchangePhase::Created,
            started: Instant::now(),
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn phase(&self) -> ExchangePhase {
        self.phase
    }

    pub fn status_code(&self) -> u16 {
        self.status_code
    }

    /// Time since the request line was seen.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// The `proxy:request` event.
    pub fn request_event(&mut self) -> Option<ProxyEvent> {
        if self.phase != ExchangePhase::Created {
            return None;
        }
        self.phase = ExchangePhase::Requested;
        Some(ProxyEvent::Request(RequestEvent {
            id: self.request_id.clone(),
            method: self.method.clone(),
            url: self.url.clone(),
            headers: self.request_headers.clone(),
            timestamp: now_millis(),
        }))
    }

    pub fn append_request_chunk(&mut self, chunk: Bytes) {
        if self.phase == ExchangePhase::Requested {
            self.request_body.append(chunk);
        }
    }

    /// Ends the request body.
    ///
    /// Returns the collected body and, if it was non-empty, the
    /// `proxy:request-body` event. `None` once the request side is closed.
    pub fn finish_request(&mut self) -> Option<(Bytes, Option<ProxyEvent>)> {
        if self.phase != ExchangePhase::Requested {
            return None;
        }
        self.phase = ExchangePhase::RequestBodySent;
        let body = self.request_body.finalize();
        let event = (!body.is_empty()).then(|| {
            ProxyEvent::RequestBody(RequestBodyEvent {
                id: self.request_id.clone(),
                body: String::from_utf8_lossy(&body).into_owned(),
            })
        });
        Some((body, event))
    }

    /// The `proxy:response` event. A status of 0 means no response head arrived.
    pub fn response_event(&mut self, status_code: u16, headers: Headers) -> Option<ProxyEvent> {
        if self.phase >= ExchangePhase::Responded || self.phase == ExchangePhase::Created {
            return None;
        }
        self.phase = ExchangePhase::Responded;
        self.status_code = status_code;
        self.response_headers = headers;
        Some(ProxyEvent::Response(ResponseEvent {
            id: self.request_id.clone(),
            url: self.url.clone(),
            status_code,
            headers: self.response_headers.clone(),
            timestamp: now_millis(),
        }))
    }

    pub fn append_response_chunk(&mut self, chunk: Bytes) {
        if self.phase == ExchangePhase::Responded {
            self.response_body.append(chunk);
        }
    }

    /// Bytes of response body captured so far.
    pub fn response_len(&self) -> usize {
        self.response_body.len()
    }

    /// Ends the response body, decodes it and returns `proxy:response-body`.
    pub fn finish_response(&mut self) -> Option<ProxyEvent> {
        if self.phase != ExchangePhase::Responded {
            return None;
        }
        self.phase = ExchangePhase::Completed;

        let body = self.response_body.finalize();
        let decoded = decode_body(
            &body,
            self.response_headers
                .get(CONTENT_ENCODING.as_str())
                .map(String::as_str),
        );
        if let Some(diagnostic) = &decoded.diagnostic {
            tracing::debug!(id = %self.request_id, %diagnostic, "Response body shown as placeholder");
        }

        Some(ProxyEvent::ResponseBody(ResponseBodyEvent {
            id: self.request_id.clone(),
            body: decoded.text,
            size: format_size(body.len()),
            is_binary: decoded.is_binary,
            content_type: self
                .response_headers
                .get(CONTENT_TYPE.as_str())
                .cloned()
                .unwrap_or_default(),
        }))
    }

    /// Closes the exchange after the origin could not be reached.
    ///
    /// Produces whatever is still owed: a `proxy:response` with status 0 and a
    /// `proxy:response-body` carrying `message`.
    pub fn fail(&mut self, message: &str) -> Vec<ProxyEvent> {
        let mut events = Vec::with_capacity(2);
        if self.phase == ExchangePhase::Requested {
            if let Some((_, Some(event))) = self.finish_request() {
                events.push(event);
            }
        }
        if let Some(event) = self.response_event(0, Headers::new()) {
            events.push(event);
        }
        if self.phase == ExchangePhase::Responded {
            self.phase = ExchangePhase::Completed;
            self.response_body = BodyAccumulator::new();
            events.push(ProxyEvent::ResponseBody(ResponseBodyEvent {
                id: self.request_id.clone(),
                body: message.to_string(),
                size: format_size(0),
                is_binary: false,
                content_type: String::new(),
            }));
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn exchange() -> Exchange {
        let mut headers = Headers::new();
        headers.insert("host".into(), "example.com".into());
        Exchange::new("s-1", "GET", "https://example.com/", headers)
    }

    fn names(events: &[ProxyEvent]) -> Vec<&'static str> {
        events.iter().map(ProxyEvent::name).collect()
    }

    #[test]
    fn accumulator_keeps_arrival_order() {
        let mut acc = BodyAccumulator::new();
        acc.append(Bytes::from_static(b"hel"));
        acc.append(Bytes::new());
        acc.append(Bytes::from_static(b"lo "));
        acc.append(Bytes::from_static(b"world"));

        assert_eq!(acc.len(), 11);
        assert_eq!(acc.finalize(), Bytes::from_static(b"hello world"));
        assert!(acc.is_empty());
        assert_eq!(acc.finalize(), Bytes::new());
    }

    #[test]
    fn header_map_joins_repeats() {
        let mut map = HeaderMap::new();
        map.append("Accept", HeaderValue::from_static("text/html"));
        map.append("accept", HeaderValue::from_static("application/json"));
        map.insert("X-Single", HeaderValue::from_static("1"));

        let headers = header_map(&map);
        assert_eq!(headers["accept"], "text/html, application/json");
        assert_eq!(headers["x-single"], "1");
    }

    #[test]
    fn full_sequence_in_order() {
        let mut ex = exchange();
        let mut events = Vec::new();

        events.extend(ex.request_event());
        ex.append_request_chunk(Bytes::from_static(b"a=1"));
        let (body, event) = ex.finish_request().unwrap();
        assert_eq!(body, Bytes::from_static(b"a=1"));
        events.extend(event);

        let mut resp = Headers::new();
        resp.insert("content-type".into(), "text/html".into());
        events.extend(ex.response_event(200, resp));
        ex.append_response_chunk(Bytes::from_static(b"<html>"));
        ex.append_response_chunk(Bytes::from_static(b"</html>"));
        events.extend(ex.finish_response());

        assert_eq!(
            names(&events),
            [
                "proxy:request",
                "proxy:request-body",
                "proxy:response",
                "proxy:response-body"
            ]
        );
        match &events[3] {
            ProxyEvent::ResponseBody(body) => {
                assert_eq!(body.body, "<html></html>");
                assert_eq!(body.size, "13 B");
                assert_eq!(body.content_type, "text/html");
                assert!(!body.is_binary);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(ex.phase(), ExchangePhase::Completed);
    }

    #[test]
    fn empty_request_body_emits_no_event() {
        let mut ex = exchange();
        ex.request_event().unwrap();
        let (body, event) = ex.finish_request().unwrap();
        assert!(body.is_empty());
        assert!(event.is_none());
        assert!(ex.response_event(204, Headers::new()).is_some());
    }

    #[test]
    fn events_are_never_repeated() {
        let mut ex = exchange();
        assert!(ex.request_event().is_some());
        assert!(ex.request_event().is_none());
        assert!(ex.finish_request().is_some());
        assert!(ex.finish_request().is_none());
        assert!(ex.response_event(200, Headers::new()).is_some());
        assert!(ex.response_event(200, Headers::new()).is_none());
        assert!(ex.finish_response().is_some());
        assert!(ex.finish_response().is_none());
    }

    #[test]
    fn response_before_request_is_refused() {
        let mut ex = exchange();
        assert!(ex.response_event(200, Headers::new()).is_none());
        assert!(ex.finish_response().is_none());
    }

    #[test]
    fn late_chunks_are_ignored() {
        let mut ex = exchange();
        ex.request_event();
        ex.finish_request();
        ex.append_request_chunk(Bytes::from_static(b"late"));
        ex.response_event(200, Headers::new());
        ex.append_response_chunk(Bytes::from_static(b"ok"));
        ex.finish_response();
        ex.append_response_chunk(Bytes::from_static(b"late"));
        assert_eq!(ex.response_len(), 0);
    }

    #[test]
    fn response_body_is_decoded_by_header() {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        use std::io::Write;

        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(b"compressed text").unwrap();
        let gz = enc.finish().unwrap();

        let mut ex = exchange();
        ex.request_event();
        ex.finish_request();
        let mut resp = Headers::new();
        resp.insert("content-encoding".into(), "gzip".into());
        ex.response_event(200, resp);
        ex.append_response_chunk(Bytes::from(gz.clone()));

        match ex.finish_response() {
            Some(ProxyEvent::ResponseBody(body)) => {
                assert_eq!(body.body, "compressed text");
                assert_eq!(body.size, format_size(gz.len()));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn fail_closes_with_status_zero() {
        let mut ex = exchange();
        ex.request_event();
        ex.append_request_chunk(Bytes::from_static(b"payload"));

        let events = ex.fail("[Upstream error: connection refused]");
        assert_eq!(
            names(&events),
            ["proxy:request-body", "proxy:response", "proxy:response-body"]
        );
        match &events[1] {
            ProxyEvent::Response(resp) => assert_eq!(resp.status_code, 0),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(ex.phase(), ExchangePhase::Completed);
        assert!(ex.fail("again").is_empty());
    }
}
