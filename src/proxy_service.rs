//! HTTP front of the relay.
//!
//! # Request Flow
//!
//! ```text
//! Request ──► select_strategy()
//!                 │
//!        None ────┼──────────────► 404 {"error":"Not Found"}
//!                 │
//!           Some(strategy)
//!                 │
//!                 ▼
//!       Upstream::fetch() ──► TimeoutBody ──► ByteSource
//!                                               │
//!               ┌───────────────────────────────┴──────────────┐
//!               │                                              │
//!       Strategy::Duplicate                             Strategy::Splice
//!   tee, inspect duplicate,                    inspect prefix, splice prefix
//!   forward primary as-is                    + remainder, FixedLengthBody
//!               │                                              │
//!               └──────────────► x-first-chunk-length ◄────────┘
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use http::HeaderValue;
use http_body_util::BodyExt;
use http_body_util::combinators::UnsyncBoxBody;
use hyper::{Request, Response, header};
use tokio_util::sync::CancellationToken;
use tower::Service;
use tracing::{debug, info};

use crate::config::RelayConfig;
use crate::error::{RelayError, RelayResult};
use crate::gate::{InspectionSink, TracingSink};
use crate::length::{FixedLengthBody, declared_length};
use crate::reconstruct::{Strategy, relay};
use crate::routing::{not_found, select_strategy};
use crate::source::ByteSource;
use crate::timeout::{TimeoutBody, TimeoutConfig};
use crate::upstream::Upstream;

/// Response header carrying the length of the inspected prefix read.
pub const FIRST_CHUNK_LENGTH_HEADER: &str = "x-first-chunk-length";

/// Body type of every response produced by [`RelayService`].
pub type UnifiedBody = UnsyncBoxBody<Bytes, RelayError>;

/// Tower service that fetches the upstream response, inspects its prefix
/// and relays the full body.
#[derive(Clone)]
pub struct RelayService {
    upstream: Arc<dyn Upstream>,
    sink: Arc<dyn InspectionSink>,
    config: Arc<RelayConfig>,
    cancel_token: Option<CancellationToken>,
}

impl RelayService {
    /// Create a service that logs inspected prefixes through [`TracingSink`].
    pub fn new(upstream: Arc<dyn Upstream>, config: RelayConfig) -> Self {
        Self {
            upstream,
            sink: Arc::new(TracingSink::default()),
            config: Arc::new(config),
            cancel_token: None,
        }
    }

    /// Replace the logging collaborator.
    pub fn with_sink(mut self, sink: Arc<dyn InspectionSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Attach a token whose cancellation ends every in-flight response body
    /// and releases its upstream.
    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel_token = Some(token);
        self
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Route, fetch, inspect and relay one request.
    ///
    /// The request body is never read.
    ///
    /// # Errors
    ///
    /// Anything that fails before the response head exists: the upstream
    /// fetch, the prefix read, or (for the splice strategy) a missing or
    /// unparsable upstream `content-length`.
    pub async fn handle_request<B>(&self, req: Request<B>) -> RelayResult<Response<UnifiedBody>> {
        let Some(strategy) = select_strategy(&req) else {
            debug!(path = %req.uri().path(), "No route for path");
            return Ok(not_found().map(|body| {
                body.map_err(|never: std::convert::Infallible| match never {})
                    .boxed_unsync()
            }));
        };
        drop(req);

        let upstream_res = self.upstream.fetch().await?;
        let (mut parts, body) = upstream_res.into_parts();

        // Resolve the declared length before touching the body so a bad
        // header never costs a prefix read.
        let declared = match strategy {
            Strategy::Splice => Some(declared_length(
                &parts.headers,
                self.config.missing_length_as_zero,
            )?),
            Strategy::Duplicate => None,
        };

        let body = TimeoutBody::new(body, TimeoutConfig::from(self.config.as_ref()));
        let source = ByteSource::new(body);

        let relayed = relay(strategy, source, &self.config, self.sink.as_ref()).await?;
        let prefix_len = relayed.prefix_len;
        let classification = relayed.classification;

        let mut out = relayed.body;
        let cancel_token = self.cancel_token.as_ref().map(CancellationToken::child_token);
        if let Some(token) = &cancel_token {
            out = out.with_cancel_token(token.clone());
        }

        let body: UnifiedBody = match declared {
            Some(declared) => {
                parts.headers.remove(header::TRANSFER_ENCODING);
                parts
                    .headers
                    .insert(header::CONTENT_LENGTH, HeaderValue::from(declared));
                let mut fixed = FixedLengthBody::new(out, declared);
                if let Some(token) = cancel_token {
                    fixed = fixed.with_cancel_token(token);
                }
                fixed.boxed_unsync()
            }
            None => out.boxed_unsync(),
        };

        parts
            .headers
            .insert(FIRST_CHUNK_LENGTH_HEADER, HeaderValue::from(prefix_len));

        info!(
            strategy = %strategy,
            status = %parts.status,
            prefix_len,
            classification = %classification,
            declared = ?declared,
            "Relaying upstream response"
        );

        Ok(Response::from_parts(parts, body))
    }
}

impl<B> Service<Request<B>> for RelayService
where
    B: Send + 'static,
{
    type Response = Response<UnifiedBody>;
    type Error = RelayError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        let service = self.clone();
        Box::pin(async move { service.handle_request(req).await })
    }
}
