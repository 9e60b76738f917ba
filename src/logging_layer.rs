//! Request/response tracing for the relay's HTTP front.
//!
//! Built on `tower_http::trace::TraceLayer`. Every request gets a span with a
//! `request_id` (taken from `x-request-id` or generated), so the relay's own
//! events (prefix classification, length enforcement) correlate with the
//! request that caused them. Header dumps are debug-only and redacted.

use std::fmt;
use std::time::Duration;

use http::HeaderMap;
use tower_http::classify::{ServerErrorsAsFailures, ServerErrorsFailureClass, SharedClassifier};
use tower_http::trace::{
    DefaultOnBodyChunk, DefaultOnEos, MakeSpan, OnFailure, OnRequest, OnResponse, TraceLayer,
};
use tracing::{Level, Span, debug, info, warn};
use uuid::Uuid;

use crate::proxy_service::FIRST_CHUNK_LENGTH_HEADER;

/// Headers whose values never reach the logs.
const SENSITIVE_HEADERS: &[&str] = &[
    "authorization",
    "cookie",
    "proxy-authorization",
    "set-cookie",
    "x-api-key",
    "x-auth-token",
];

const MAX_HEADERS_TO_LOG: usize = 50;
const MAX_VALUE_LEN: usize = 1024;

/// The relay's tracing layer.
pub type RelayTraceLayer = TraceLayer<
    SharedClassifier<ServerErrorsAsFailures>,
    CorrelationMakeSpan,
    OnRequestLogger,
    OnResponseLogger,
    DefaultOnBodyChunk,
    DefaultOnEos,
    OnFailureLogger,
>;

/// Build the tracing layer used in front of [`RelayService`](crate::proxy_service::RelayService).
pub fn logging_layer() -> RelayTraceLayer {
    TraceLayer::new_for_http()
        .make_span_with(CorrelationMakeSpan)
        .on_request(OnRequestLogger)
        .on_response(OnResponseLogger)
        .on_failure(OnFailureLogger)
}

/// Span factory keyed by request id.
#[derive(Clone, Debug)]
pub struct CorrelationMakeSpan;

impl<B> MakeSpan<B> for CorrelationMakeSpan {
    fn make_span(&mut self, request: &http::Request<B>) -> Span {
        let request_id = request_id(request.headers());
        tracing::info_span!(
            "request",
            method = %request.method(),
            path = %request.uri().path(),
            version = ?request.version(),
            request_id = %request_id,
        )
    }
}

/// `x-request-id` if present and printable, else a fresh v4 UUID.
fn request_id(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

#[derive(Clone, Debug)]
pub struct OnRequestLogger;

impl<B> OnRequest<B> for OnRequestLogger {
    fn on_request(&mut self, request: &http::Request<B>, _span: &Span) {
        info!(
            method = %request.method(),
            uri = %request.uri(),
            direction = "inbound",
            "Request received"
        );

        if tracing::enabled!(Level::DEBUG) {
            debug!(headers = ?SanitizedHeaders(request.headers()), "Request headers");
        }
    }
}

#[derive(Clone, Debug)]
pub struct OnResponseLogger;

impl<B> OnResponse<B> for OnResponseLogger {
    fn on_response(self, response: &http::Response<B>, latency: Duration, _span: &Span) {
        let first_chunk_length = response
            .headers()
            .get(FIRST_CHUNK_LENGTH_HEADER)
            .and_then(|v| v.to_str().ok());
        info!(
            status = response.status().as_u16(),
            latency_ms = latency.as_millis(),
            first_chunk_length,
            direction = "outbound",
            "Response head sent"
        );

        if tracing::enabled!(Level::DEBUG) {
            debug!(headers = ?SanitizedHeaders(response.headers()), "Response headers");
        }
    }
}

/// Logs 5xx responses and body failures (aborted relays).
#[derive(Clone, Debug)]
pub struct OnFailureLogger;

impl OnFailure<ServerErrorsFailureClass> for OnFailureLogger {
    fn on_failure(&mut self, failure: ServerErrorsFailureClass, latency: Duration, _span: &Span) {
        warn!(
            classification = %failure,
            latency_ms = latency.as_millis(),
            direction = "error",
            "Request failed"
        );
    }
}

/// Debug view of a header map with sensitive values replaced.
pub struct SanitizedHeaders<'a>(pub &'a HeaderMap);

impl fmt::Debug for SanitizedHeaders<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();

        for (idx, (name, value)) in self.0.iter().enumerate() {
            if idx >= MAX_HEADERS_TO_LOG {
                map.entry(&"...", &format!("({} more headers)", self.0.len() - idx));
                break;
            }

            let name = name.as_str();
            if SENSITIVE_HEADERS
                .iter()
                .any(|sensitive| name.eq_ignore_ascii_case(sensitive))
            {
                map.entry(&name, &"[REDACTED]");
                continue;
            }

            match value.to_str() {
                Ok(v) if v.len() <= MAX_VALUE_LEN => {
                    map.entry(&name, &v);
                }
                Ok(v) => {
                    // Header values are ASCII here, so any byte index is a char boundary.
                    map.entry(&name, &format!("{}... ({} bytes)", &v[..MAX_VALUE_LEN], v.len()));
                }
                Err(_) => {
                    map.entry(&name, &format!("<binary: {} bytes>", value.len()));
                }
            }
        }

        map.finish()
    }
}
