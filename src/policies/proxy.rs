//! # Proxy Policy
//!
//! Forwards the request to a named service endpoint and responds with whatever the
//! upstream returns. Services with several `urls` are used round-robin.
//!
//! ```yaml
//! serviceEndpoints:
//!   backend:
//!     urls: ["http://10.0.0.1:3000", "http://10.0.0.2:3000"]
//! pipelines:
//!   api:
//!     policies:
//!       - proxy:
//!           - action:
//!               serviceEndpoint: backend
//!               changeOrigin: true
//!               timeout: 10s
//! ```

use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, warn};
use url::Url;

use super::{parse_params, PolicyHandler, PolicyOutcome};
use crate::config_error;
use crate::core::config::GatewayConfig;
use crate::core::context::RequestContext;
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::GatewayResponse;
use crate::observability::metrics::UPSTREAM_REQUESTS_TOTAL;
use crate::routing::matcher::WILDCARD_PARAM;

/// Headers that describe a single connection and are never forwarded
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ProxyConfig {
    /// Name of an entry in `serviceEndpoints`
    pub service_endpoint: String,

    /// Send the upstream's host in the Host header instead of the client's
    #[serde(default)]
    pub change_origin: bool,

    /// Forward only the part of the path matched by a trailing `*`
    #[serde(default)]
    pub strip_path: bool,

    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

#[derive(Debug)]
pub struct ProxyPolicy {
    config: ProxyConfig,
    targets: Vec<Url>,
    next: AtomicUsize,
    client: reqwest::Client,
}

impl ProxyPolicy {
    pub fn new(config: ProxyConfig, targets: Vec<Url>) -> GatewayResult<Self> {
        if targets.is_empty() {
            return Err(config_error!(
                "serviceEndpoint '{}' has no urls",
                config.service_endpoint
            ));
        }

        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| config_error!("Failed to create proxy HTTP client: {}", e))?;

        Ok(Self {
            config,
            targets,
            next: AtomicUsize::new(0),
            client,
        })
    }

    fn next_target(&self) -> &Url {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.targets.len();
        &self.targets[index]
    }

    /// Build the upstream URL from the target base and the request path/query
    fn upstream_url(&self, target: &Url, ctx: &RequestContext) -> String {
        let path = match (self.config.strip_path, ctx.params.get(WILDCARD_PARAM)) {
            (true, Some(rest)) => format!("/{}", rest.trim_start_matches('/')),
            _ => ctx.request.path().to_string(),
        };

        let base = target.as_str().trim_end_matches('/');
        match ctx.request.query() {
            Some(query) => format!("{}{}?{}", base, path, query),
            None => format!("{}{}", base, path),
        }
    }

    fn upstream_headers(&self, target: &Url, ctx: &RequestContext) -> reqwest::header::HeaderMap {
        let mut headers = reqwest::header::HeaderMap::new();

        for (name, value) in ctx.request.headers.iter() {
            let name = name.as_str();
            if HOP_BY_HOP.contains(&name) || (name == "host" && self.config.change_origin) {
                continue;
            }
            if let (Ok(name), Ok(value)) = (
                reqwest::header::HeaderName::from_bytes(name.as_bytes()),
                reqwest::header::HeaderValue::from_bytes(value.as_bytes()),
            ) {
                headers.append(name, value);
            }
        }

        if self.config.change_origin {
            let host = match (target.host_str(), target.port()) {
                (Some(host), Some(port)) => Some(format!("{}:{}", host, port)),
                (Some(host), None) => Some(host.to_string()),
                _ => None,
            };
            if let Some(Ok(value)) = host.map(|h| reqwest::header::HeaderValue::from_str(&h)) {
                headers.insert(reqwest::header::HOST, value);
            }
        }

        let client_ip = ctx.request.remote_addr.ip().to_string();
        let forwarded_for = match ctx.request.header("x-forwarded-for") {
            Some(existing) => format!("{}, {}", existing, client_ip),
            None => client_ip,
        };
        if let Ok(value) = reqwest::header::HeaderValue::from_str(&forwarded_for) {
            headers.insert("x-forwarded-for", value);
        }
        if let Ok(value) = reqwest::header::HeaderValue::from_str(&ctx.trace_id) {
            headers.insert("x-request-id", value);
        }

        headers
    }
}

#[async_trait]
impl PolicyHandler for ProxyPolicy {
    fn name(&self) -> &str {
        "proxy"
    }

    async fn handle(&self, ctx: &mut RequestContext) -> GatewayResult<PolicyOutcome> {
        let target = self.next_target();
        let url = self.upstream_url(target, ctx);
        let service = self.config.service_endpoint.as_str();

        let method = reqwest::Method::from_bytes(ctx.request.method.as_str().as_bytes())
            .map_err(|e| GatewayError::internal(format!("Unsupported method: {}", e)))?;

        debug!(trace_id = %ctx.trace_id, service = %service, url = %url, "Proxying request");

        let request = self
            .client
            .request(method, &url)
            .headers(self.upstream_headers(target, ctx))
            .body(ctx.request.body.clone());

        let started = Instant::now();
        let response = match timeout(self.config.timeout, request.send()).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                warn!(trace_id = %ctx.trace_id, service = %service, error = %e, "Upstream request failed");
                metrics::counter!(UPSTREAM_REQUESTS_TOTAL, "service" => service.to_string(), "outcome" => "error")
                    .increment(1);
                if e.is_timeout() {
                    return Err(GatewayError::Timeout {
                        timeout_ms: self.config.timeout.as_millis() as u64,
                    });
                }
                return Err(GatewayError::upstream_unavailable(service.to_string(), e.to_string()));
            }
            Err(_) => {
                warn!(trace_id = %ctx.trace_id, service = %service, "Upstream request timed out");
                metrics::counter!(UPSTREAM_REQUESTS_TOTAL, "service" => service.to_string(), "outcome" => "timeout")
                    .increment(1);
                return Err(GatewayError::Timeout {
                    timeout_ms: self.config.timeout.as_millis() as u64,
                });
            }
        };

        let status = StatusCode::from_u16(response.status().as_u16())
            .map_err(|e| GatewayError::upstream_unavailable(service.to_string(), e.to_string()))?;

        let mut headers = HeaderMap::new();
        for (name, value) in response.headers().iter() {
            if HOP_BY_HOP.contains(&name.as_str()) || name.as_str() == "content-length" {
                continue;
            }
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_str().as_bytes()),
                HeaderValue::from_bytes(value.as_bytes()),
            ) {
                headers.append(name, value);
            }
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| GatewayError::upstream_unavailable(service.to_string(), e.to_string()))?;

        debug!(
            trace_id = %ctx.trace_id,
            service = %service,
            status = status.as_u16(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Upstream responded"
        );
        metrics::counter!(UPSTREAM_REQUESTS_TOTAL, "service" => service.to_string(), "outcome" => "ok")
            .increment(1);

        Ok(PolicyOutcome::Respond(GatewayResponse::new(status, headers, body)))
    }
}

/// Resolves `serviceEndpoint` against the gateway configuration at compile time
pub fn create(params: &Map<String, Value>, gateway: &GatewayConfig) -> GatewayResult<Arc<dyn PolicyHandler>> {
    let config: ProxyConfig = parse_params("proxy", params)?;

    let service = gateway
        .service_endpoints
        .get(&config.service_endpoint)
        .ok_or_else(|| config_error!("proxy references unknown serviceEndpoint '{}'", config.service_endpoint))?;

    let targets = service
        .all_urls()
        .into_iter()
        .map(|raw| {
            Url::parse(raw).map_err(|e| {
                config_error!(
                    "serviceEndpoint '{}' has invalid url '{}': {}",
                    config.service_endpoint,
                    raw,
                    e
                )
            })
        })
        .collect::<GatewayResult<Vec<_>>>()?;

    Ok(Arc::new(ProxyPolicy::new(config, targets)?))
}
