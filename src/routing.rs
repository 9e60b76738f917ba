//! Request routing: pick a reconstruction strategy from the request path.
//!
//! | Path      | Strategy                |
//! |-----------|-------------------------|
//! | `/clone`  | [`Strategy::Duplicate`] |
//! | `/stream` | [`Strategy::Splice`]    |
//! | other     | `404 {"error":"Not Found"}` |
//!
//! Matching is header-only and never touches the request body. Paths are
//! normalized first so `//clone` and `/stream/` route the same as their
//! canonical forms.

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Request, Response, StatusCode, header};

use crate::reconstruct::Strategy;

/// Strategy for `req`, or `None` when the path is not served.
pub fn select_strategy<B>(req: &Request<B>) -> Option<Strategy> {
    strategy_for_path(req.uri().path())
}

/// Strategy for a raw request path.
pub fn strategy_for_path(path: &str) -> Option<Strategy> {
    match normalize_path(path).as_str() {
        "/clone" => Some(Strategy::Duplicate),
        "/stream" => Some(Strategy::Splice),
        _ => None,
    }
}

/// JSON `404 Not Found` for unrouted paths.
pub fn not_found() -> Response<Full<Bytes>> {
    let body = serde_json::json!({ "error": "Not Found" }).to_string();
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = StatusCode::NOT_FOUND;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/json"),
    );
    response
}

/// Collapse repeated slashes and drop a trailing slash (keeping "/").
fn normalize_path(path: &str) -> String {
    let mut result = String::with_capacity(path.len());
    let mut prev_slash = false;
    for ch in path.chars() {
        if ch == '/' {
            if !prev_slash {
                result.push('/');
            }
            prev_slash = true;
        } else {
            result.push(ch);
            prev_slash = false;
        }
    }
    if result.len() > 1 && result.ends_with('/') {
        result.pop();
    }
    result
}
