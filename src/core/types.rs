//! # Core Types Module
//!
//! The request and response values that flow between the HTTP server, the dispatcher
//! and policy handlers.
//!
//! - [`IncomingRequest`] is the protocol-neutral view of an inbound request.
//! - [`GatewayResponse`] is what a terminating policy hands back to the server.
//! - [`AuthContext`] describes the user an authentication policy attached to a request.

use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, Uri, Version};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;
use uuid::Uuid;

/// Represents an incoming request before it is routed
#[derive(Debug, Clone)]
pub struct IncomingRequest {
    /// Per-request id; the trace id unless the client sent `x-request-id`
    pub id: String,

    /// HTTP method
    pub method: Method,

    /// Original request target
    pub uri: Uri,

    /// HTTP version
    pub version: Version,

    /// Request headers
    pub headers: HeaderMap,

    /// Request body
    pub body: Bytes,

    /// Peer address of the client connection
    pub remote_addr: SocketAddr,

    /// Whether the connection presented a client certificate that was verified
    pub client_cert_verified: bool,

    /// When the server finished reading the body
    pub received_at: Instant,
}

impl IncomingRequest {
    /// Wrap a buffered request; `id` is a fresh UUID
    pub fn new(
        method: Method,
        uri: Uri,
        version: Version,
        headers: HeaderMap,
        body: impl Into<Bytes>,
        remote_addr: SocketAddr,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            method,
            uri,
            version,
            headers,
            body: body.into(),
            remote_addr,
            client_cert_verified: false,
            received_at: Instant::now(),
        }
    }

    /// Mark whether the TLS layer verified a client certificate
    pub fn with_client_cert_verified(mut self, verified: bool) -> Self {
        self.client_cert_verified = verified;
        self
    }

    /// Path component only
    pub fn path(&self) -> &str {
        self.uri.path()
    }

    /// Get the path and query as sent by the client
    pub fn url(&self) -> &str {
        self.uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or_else(|| self.uri.path())
    }

    /// Raw query string
    pub fn query(&self) -> Option<&str> {
        self.uri.query()
    }

    /// Header value, if present and valid UTF-8
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(name)
            .and_then(|value| value.to_str().ok())
    }

    /// Host the request was addressed to, lowercased and without port
    ///
    /// The `Host` header wins; HTTP/2 requests carry the authority in the URI instead.
    pub fn host(&self) -> Option<String> {
        let raw = self
            .header("host")
            .or_else(|| self.uri.authority().map(|a| a.as_str()))?;
        let host = strip_port(raw.trim());
        if host.is_empty() {
            None
        } else {
            Some(host.to_ascii_lowercase())
        }
    }

    /// Decoded query parameters (last value wins for repeated keys)
    pub fn query_params(&self) -> HashMap<String, String> {
        let mut params = HashMap::new();

        if let Some(query) = self.query() {
            for pair in query.split('&').filter(|p| !p.is_empty()) {
                let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
                if let (Ok(key), Ok(value)) = (urlencoding::decode(key), urlencoding::decode(value)) {
                    params.insert(key.into_owned(), value.into_owned());
                }
            }
        }

        params
    }
}

/// Remove a trailing `:port` from a host, keeping bracketed IPv6 literals intact
fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        return match rest.find(']') {
            Some(end) => &host[..end + 2],
            None => host,
        };
    }
    match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    }
}

/// Authentication context attached by an authentication policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthContext {
    /// Id the authenticating policy assigned
    pub user_id: String,

    /// Authentication method used (e.g. `key-auth`)
    pub auth_method: String,

    /// Additional claims exposed to expressions as `user.<claim>`
    pub claims: HashMap<String, serde_json::Value>,
}

impl AuthContext {
    pub fn new<S: Into<String>>(user_id: S, auth_method: S) -> Self {
        Self {
            user_id: user_id.into(),
            auth_method: auth_method.into(),
            claims: HashMap::new(),
        }
    }
}

/// Response produced by a terminating policy
#[derive(Debug, Clone)]
pub struct GatewayResponse {
    /// HTTP status code
    pub status: StatusCode,

    /// Response headers
    pub headers: HeaderMap,

    /// Response body
    pub body: Bytes,
}

impl GatewayResponse {
    /// Create a new response
    pub fn new(status: StatusCode, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers,
            body: body.into(),
        }
    }

    /// Plain-text body
    pub fn text<S: Into<String>>(status: StatusCode, text: S) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("text/plain; charset=utf-8"));
        Self::new(status, headers, text.into())
    }

    /// JSON body with `content-type: application/json`
    pub fn json<T: Serialize>(status: StatusCode, data: &T) -> Result<Self, serde_json::Error> {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        let body = serde_json::to_vec(data)?;
        Ok(Self::new(status, headers, body))
    }

    /// Body interpreted as UTF-8 (lossy)
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

impl IntoResponse for GatewayResponse {
    fn into_response(self) -> Response {
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_with_host(host: Option<&str>) -> IncomingRequest {
        let mut headers = HeaderMap::new();
        if let Some(host) = host {
            headers.insert("host", host.parse().unwrap());
        }
        IncomingRequest::new(
            Method::GET,
            "/api/users?q=hello%20world&flag".parse().unwrap(),
            Version::HTTP_11,
            headers,
            Bytes::new(),
            "127.0.0.1:8080".parse().unwrap(),
        )
    }

    #[test]
    fn test_incoming_request_creation() {
        let request = request_with_host(None);
        assert_eq!(request.method, Method::GET);
        assert_eq!(request.path(), "/api/users");
        assert_eq!(request.url(), "/api/users?q=hello%20world&flag");
        assert!(!request.id.is_empty());
        assert!(!request.client_cert_verified);
    }

    #[test]
    fn test_host_normalization() {
        assert_eq!(request_with_host(Some("Sub.Acme.com:8080")).host().as_deref(), Some("sub.acme.com"));
        assert_eq!(request_with_host(Some("[::1]:443")).host().as_deref(), Some("[::1]"));
        assert_eq!(request_with_host(None).host(), None);
    }

    #[test]
    fn test_query_params() {
        let params = request_with_host(None).query_params();
        assert_eq!(params.get("q"), Some(&"hello world".to_string()));
        assert_eq!(params.get("flag"), Some(&String::new()));
    }

    #[test]
    fn test_gateway_response() {
        let response = GatewayResponse::text(StatusCode::OK, "Hello, World!");
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.body_text(), "Hello, World!");
    }
}
