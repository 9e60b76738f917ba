//! Upstream transport: where the relayed response comes from.
//!
//! The relay only needs a response head and a body of [`Bytes`] frames.
//! [`Upstream`] abstracts that so the service can be driven by a real HTTP
//! client ([`HttpUpstream`]) or by an in-memory source in tests.

use std::error::Error as StdError;
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::Uri;
use http_body_util::{BodyExt, Empty};
use hyper::{Method, Request, Response};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::{Client, connect::HttpConnector};
use hyper_util::rt::TokioExecutor;
use tracing::{debug, warn};

use crate::config::RelayConfig;
use crate::error::{BoxError, RelayError, RelayResult};
use crate::source::SourceBody;

/// Source of the response to relay.
///
/// Each call performs one fetch. Failures are returned as-is; the relay
/// never retries.
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn fetch(&self) -> RelayResult<Response<SourceBody>>;
}

/// Fetches a fixed URL over HTTP/1.1 or HTTP/2, with TLS for `https`.
#[derive(Clone)]
pub struct HttpUpstream {
    client: Client<HttpsConnector<HttpConnector>, Empty<Bytes>>,
    url: Uri,
}

impl HttpUpstream {
    /// Build a pooled client for `url`.
    ///
    /// # Errors
    ///
    /// - `InvalidUri` if `url` is not an absolute http(s) URI.
    /// - `Connection` if the TLS crypto provider cannot be installed.
    pub fn new(url: &str, config: &RelayConfig) -> RelayResult<Self> {
        let url: Uri = url
            .parse()
            .map_err(|e| RelayError::InvalidUri(format!("{url}: {e}")))?;
        match url.scheme_str() {
            Some("http") | Some("https") if url.host().is_some() => {}
            _ => {
                return Err(RelayError::InvalidUri(format!(
                    "{url}: expected an absolute http(s) URL"
                )));
            }
        }

        static RUSTLS_INIT: OnceLock<Result<(), ()>> = OnceLock::new();
        let init_result = RUSTLS_INIT.get_or_init(|| {
            rustls::crypto::ring::default_provider()
                .install_default()
                .map_err(|_| ())
        });
        if init_result.is_err() {
            return Err(RelayError::Connection(
                "Failed to install rustls crypto provider".into(),
            ));
        }

        let mut http_connector = HttpConnector::new();
        http_connector.set_nodelay(config.tcp_nodelay);
        http_connector.enforce_http(false);

        let https_connector = match HttpsConnectorBuilder::new().with_native_roots() {
            Ok(builder) => builder,
            Err(e) => {
                // Plain http upstreams still work; https ones will fail verification.
                warn!(error = %e, "No native TLS roots found, https upstreams will be rejected");
                let tls = rustls::ClientConfig::builder()
                    .with_root_certificates(rustls::RootCertStore::empty())
                    .with_no_client_auth();
                HttpsConnectorBuilder::new().with_tls_config(tls)
            }
        }
        .https_or_http()
        .enable_http1()
        .enable_http2()
        .wrap_connector(http_connector);

        let client = Client::builder(TokioExecutor::new())
            .http2_keep_alive_while_idle(true)
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .pool_idle_timeout(Duration::from_secs(90))
            .build(https_connector);

        Ok(Self { client, url })
    }

    pub fn url(&self) -> &Uri {
        &self.url
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn fetch(&self) -> RelayResult<Response<SourceBody>> {
        let request = Request::builder()
            .method(Method::GET)
            .uri(self.url.clone())
            .body(Empty::<Bytes>::new())
            .map_err(|e| RelayError::InvalidUri(format!("Failed to build request: {e}")))?;

        let response = self.client.request(request).await.map_err(map_hyper_error)?;

        debug!(
            url = %self.url,
            status = %response.status(),
            content_length = ?response.headers().get(http::header::CONTENT_LENGTH),
            "Upstream responded"
        );

        Ok(response.map(|body| body.map_err(|e| -> BoxError { Box::new(e) }).boxed_unsync()))
    }
}

/// Classify a client error by walking its source chain.
///
/// - Connection refused -> `RelayError::ConnectionRefused` (502)
/// - Timeout -> `RelayError::Timeout` (504)
/// - Anything else -> `RelayError::Connection` (502)
fn map_hyper_error(e: hyper_util::client::legacy::Error) -> RelayError {
    let mut message = e.to_string();
    let mut source: Option<&(dyn StdError + 'static)> = e.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    let lower = message.to_lowercase();

    if lower.contains("connection refused") {
        warn!(error = %message, "Upstream connection refused");
        return RelayError::ConnectionRefused(message);
    }
    if lower.contains("timeout") || lower.contains("timed out") {
        warn!(error = %message, "Upstream timeout");
        return RelayError::Timeout(message);
    }

    warn!(error = %message, connect = e.is_connect(), "Upstream request failed");
    RelayError::Connection(message)
}
