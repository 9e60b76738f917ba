//! Error types for the peek relay.

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Response, StatusCode};
use thiserror::Error;

/// Boxed error used at the seams where foreign body errors enter the relay.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors that can occur while peeking at and relaying a body.
///
/// Stream-level variants (`SourceRead`, `ShortBody`, `Timeout`) are usually
/// yielded from a body's `poll_frame` after the response head has already
/// been sent. Returning them as a body error makes hyper abort the transfer
/// instead of closing it cleanly.
#[derive(Error, Debug)]
pub enum RelayError {
    /// The underlying byte source failed mid-read. Never retried.
    #[error("Source read failed: {0}")]
    SourceRead(String),

    /// Duplication was requested after bytes had been pulled from the source.
    #[error("Source duplicated too late: {consumed} bytes already consumed")]
    DuplicationTooLate { consumed: u64 },

    /// The wrapped stream ended before the declared length was reached.
    #[error("Short body: received {received} of {declared} declared bytes")]
    ShortBody { declared: u64, received: u64 },

    /// A minimum-fill read asked for more bytes than the buffer can hold.
    #[error("Invalid read request: min_bytes {min_bytes} exceeds buffer capacity {capacity}")]
    InvalidReadRequest { min_bytes: usize, capacity: usize },

    /// The upstream response carried no content-length.
    #[error("Upstream response has no content-length")]
    MissingContentLength,

    /// The upstream content-length could not be parsed.
    #[error("Invalid content-length: {0}")]
    InvalidContentLength(String),

    /// Invalid URI or target
    #[error("Invalid URI: {0}")]
    InvalidUri(String),

    /// Connection error to upstream
    #[error("Connection error: {0}")]
    Connection(String),

    /// Connection refused by upstream
    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    /// Chunk or total stream deadline expired
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Rejected configuration value
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl RelayError {
    /// Recover a `RelayError` from a boxed error, or classify it as a source failure.
    pub fn from_boxed(err: BoxError) -> Self {
        match err.downcast::<RelayError>() {
            Ok(relay) => *relay,
            Err(other) => RelayError::SourceRead(other.to_string()),
        }
    }

    /// HTTP status for errors that happen before the response head is sent.
    pub fn status(&self) -> StatusCode {
        match self {
            RelayError::SourceRead(_)
            | RelayError::ShortBody { .. }
            | RelayError::MissingContentLength
            | RelayError::InvalidContentLength(_)
            | RelayError::Connection(_)
            | RelayError::ConnectionRefused(_) => StatusCode::BAD_GATEWAY,
            RelayError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            RelayError::InvalidUri(_) => StatusCode::BAD_REQUEST,
            RelayError::DuplicationTooLate { .. }
            | RelayError::InvalidReadRequest { .. }
            | RelayError::InvalidConfig(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Convert error to a plain-text HTTP response.
    pub fn to_response(&self) -> Response<Full<Bytes>> {
        let status = self.status();
        let message = match status {
            StatusCode::BAD_GATEWAY => "502 Bad Gateway\n\nUpstream response could not be relayed.",
            StatusCode::GATEWAY_TIMEOUT => {
                "504 Gateway Timeout\n\nUpstream server did not respond in time."
            }
            StatusCode::BAD_REQUEST => "400 Bad Request\n\nInvalid request URI.",
            _ => "500 Internal Server Error",
        };

        Response::builder()
            .status(status)
            .header("Content-Type", "text/plain")
            .body(Full::new(Bytes::from(message)))
            .unwrap_or_else(|_| {
                let mut resp = Response::new(Full::new(Bytes::from("500 Internal Server Error")));
                *resp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                resp
            })
    }
}

/// Result type alias for relay operations.
pub type RelayResult<T> = Result<T, RelayError>;
