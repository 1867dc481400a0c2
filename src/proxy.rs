//! Reverse proxy: streams a request from the control plane to the in-container agent at a
//! resolved `(sandbox_id, port)` endpoint.

use std::sync::LazyLock;

use bytes::Bytes;
use futures::Stream;
use http::{HeaderMap, HeaderName, Method, StatusCode};
use regex::Regex;
use thiserror::Error;

/// Headers that are meaningful only for a single network hop and must never be forwarded.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Headers that carry credentials meant for the control plane, not the sandbox.
const SENSITIVE_HEADERS: &[&str] = &["authorization", "cookie"];

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("upstream connection failed: {0}")]
    UpstreamUnreachable(String),

    #[error("websocket upgrade is not supported by the proxy")]
    WebsocketUnsupported,
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::UpstreamUnreachable(_) => StatusCode::BAD_GATEWAY,
            ProxyError::WebsocketUnsupported => StatusCode::BAD_REQUEST,
        }
    }
}

/// Strip hop-by-hop and sensitive headers before forwarding in either direction.
pub fn filter_forwarded_headers(headers: &HeaderMap) -> HeaderMap {
    let mut filtered = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers.iter() {
        if name == http::header::HOST {
            continue;
        }
        let lower = name.as_str().to_ascii_lowercase();
        if HOP_BY_HOP_HEADERS.contains(&lower.as_str()) || SENSITIVE_HEADERS.contains(&lower.as_str()) {
            continue;
        }
        filtered.append(name.clone(), value.clone());
    }
    filtered
}

/// Whether `headers` request a WebSocket upgrade, which this version of the proxy refuses.
pub fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(http::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}

/// Build the upstream URL for a proxied request: `http://<endpoint>/<rest>?<query>`.
pub fn build_upstream_url(endpoint: &str, rest: &str, query: Option<&str>) -> String {
    let rest = rest.trim_start_matches('/');
    match query {
        Some(query) if !query.is_empty() => format!("http://{endpoint}/{rest}?{query}"),
        _ => format!("http://{endpoint}/{rest}"),
    }
}

/// A proxied request, stripped of headers and carrying a streaming body.
pub struct ProxyRequest<B> {
    pub method: Method,
    pub headers: HeaderMap,
    pub body: B,
}

/// Stream `request` to `upstream_url` via `client`, returning the upstream response with
/// hop-by-hop and sensitive headers stripped and the body forwarded without buffering.
pub async fn forward<S>(
    client: &reqwest::Client,
    upstream_url: &str,
    request: ProxyRequest<S>,
) -> Result<(StatusCode, HeaderMap, reqwest::Response), ProxyError>
where
    S: Stream<Item = Result<Bytes, std::io::Error>> + Send + Sync + 'static,
{
    if is_websocket_upgrade(&request.headers) {
        return Err(ProxyError::WebsocketUnsupported);
    }

    let method = reqwest::Method::from_bytes(request.method.as_str().as_bytes())
        .map_err(|err| ProxyError::UpstreamUnreachable(err.to_string()))?;

    let body = reqwest::Body::wrap_stream(request.body);
    let mut builder = client.request(method, upstream_url).body(body);
    for (name, value) in filter_forwarded_headers(&request.headers).iter() {
        builder = builder.header(name, value);
    }

    let response = builder
        .send()
        .await
        .map_err(|err| ProxyError::UpstreamUnreachable(err.to_string()))?;

    let status = StatusCode::from_u16(response.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let headers = filter_forwarded_headers(response.headers());
    Ok((status, headers, response))
}

static AUTH_EXEMPT_PROXY_PATH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:/v1)?/sandboxes/[^/]+/proxy/(\d+)(?:/|$)").expect("static regex is valid")
});

/// Whether `path` matches the proxy-route auth exemption: `/sandboxes/{id}/proxy/{port}[/…]`
/// (optionally `/v1`-prefixed) with a purely numeric port and no `..` traversal segments.
///
/// This middleware contract is owned by an external collaborator, but the grammar itself is
/// anchored to this core's one proxy route, so it is tested here as a pure matcher.
pub fn is_auth_exempt_proxy_path(path: &str) -> bool {
    if path.contains("..") {
        return false;
    }
    AUTH_EXEMPT_PROXY_PATH.is_match(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    #[test]
    fn strips_hop_by_hop_and_sensitive_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(http::header::AUTHORIZATION, HeaderValue::from_static("secret"));
        headers.insert(http::header::COOKIE, HeaderValue::from_static("session=1"));
        headers.insert(http::header::CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.insert(http::header::HOST, HeaderValue::from_static("example.com"));
        headers.insert(HeaderName::from_static("x-request-id"), HeaderValue::from_static("abc"));

        let filtered = filter_forwarded_headers(&headers);
        assert!(!filtered.contains_key(http::header::AUTHORIZATION));
        assert!(!filtered.contains_key(http::header::COOKIE));
        assert!(!filtered.contains_key(http::header::CONNECTION));
        assert!(!filtered.contains_key(http::header::HOST));
        assert!(filtered.contains_key("x-request-id"));
    }

    #[test]
    fn detects_websocket_upgrade() {
        let mut headers = HeaderMap::new();
        headers.insert(http::header::UPGRADE, HeaderValue::from_static("websocket"));
        assert!(is_websocket_upgrade(&headers));

        let headers = HeaderMap::new();
        assert!(!is_websocket_upgrade(&headers));
    }

    #[test]
    fn builds_upstream_url_with_query() {
        let url = build_upstream_url("10.0.0.1:9000", "anything", Some("x=1"));
        assert_eq!(url, "http://10.0.0.1:9000/anything?x=1");
    }

    #[test]
    fn builds_upstream_url_without_query() {
        let url = build_upstream_url("10.0.0.1:9000", "/anything", None);
        assert_eq!(url, "http://10.0.0.1:9000/anything");
    }

    #[test]
    fn proxy_path_exemption_matrix() {
        assert!(is_auth_exempt_proxy_path("/sandboxes/sb-1/proxy/9000"));
        assert!(is_auth_exempt_proxy_path("/sandboxes/sb-1/proxy/9000/anything"));
        assert!(is_auth_exempt_proxy_path("/v1/sandboxes/sb-1/proxy/9000"));
        assert!(!is_auth_exempt_proxy_path("/proxy/sandboxes/sb-1/9000"));
        assert!(!is_auth_exempt_proxy_path("/sandboxes/sb-1/proxy/9000/../etc/passwd"));
        assert!(!is_auth_exempt_proxy_path("/sandboxes/sb-1/proxy/abc"));
    }
}
