//! # Rate Limit Policy
//!
//! Fixed-window request counting per key. Counters live in the handler, so each pipeline
//! step has its own limits and a reload starts every window afresh.
//!
//! ```yaml
//! - rate-limit:
//!     - action:
//!         max: 100
//!         window: 1m
//!         rateLimitBy: "header:x-api-key"
//! ```

use async_trait::async_trait;
use axum::http::{HeaderValue, StatusCode};
use dashmap::DashMap;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use super::{parse_params, PolicyHandler, PolicyOutcome};
use crate::config_error;
use crate::core::config::GatewayConfig;
use crate::core::context::RequestContext;
use crate::core::error::GatewayResult;
use crate::core::types::GatewayResponse;
use crate::observability::metrics::RATE_LIMITED_TOTAL;

/// Windows are pruned once this many keys are tracked
const PRUNE_THRESHOLD: usize = 10_000;

/// Configuration for the rate-limit action
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RateLimitConfig {
    /// Maximum requests per window
    pub max: u64,

    #[serde(default = "default_window", with = "humantime_serde")]
    pub window: Duration,

    /// `ip`, `host`, `user`, `global` or `header:<name>`
    #[serde(default = "default_rate_limit_by")]
    pub rate_limit_by: String,

    #[serde(default = "default_message")]
    pub message: String,
}

fn default_window() -> Duration {
    Duration::from_secs(60)
}

fn default_rate_limit_by() -> String {
    "ip".to_string()
}

fn default_message() -> String {
    "Too many requests, please try again later.".to_string()
}

/// What requests are counted together
#[derive(Debug, Clone, PartialEq)]
pub enum RateLimitKey {
    Ip,
    Host,
    User,
    Global,
    Header(String),
}

impl RateLimitKey {
    pub fn parse(value: &str) -> GatewayResult<Self> {
        match value.trim() {
            "ip" => Ok(Self::Ip),
            "host" => Ok(Self::Host),
            "user" => Ok(Self::User),
            "global" => Ok(Self::Global),
            other => match other.strip_prefix("header:") {
                Some(name) if !name.trim().is_empty() => {
                    Ok(Self::Header(name.trim().to_ascii_lowercase()))
                }
                _ => Err(config_error!(
                    "Invalid rate-limit rateLimitBy '{}' (expected ip, host, user, global or header:<name>)",
                    value
                )),
            },
        }
    }

    /// Key for a request; anonymous users fall back to the client IP
    fn extract(&self, ctx: &RequestContext) -> String {
        let ip = || format!("ip:{}", ctx.request.remote_addr.ip());
        match self {
            Self::Ip => ip(),
            Self::Host => format!("host:{}", ctx.request.host().unwrap_or_default()),
            Self::User => ctx
                .user
                .as_ref()
                .map(|user| format!("user:{}", user.user_id))
                .unwrap_or_else(ip),
            Self::Global => "global".to_string(),
            Self::Header(name) => format!("header:{}", ctx.request.header(name).unwrap_or_default()),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct WindowState {
    started: Instant,
    count: u64,
}

/// Decision for one request
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: u64,
    pub reset_after: Duration,
}

/// Fixed-window counter store
#[derive(Debug)]
pub struct FixedWindowLimiter {
    max: u64,
    window: Duration,
    windows: DashMap<String, WindowState>,
}

impl FixedWindowLimiter {
    pub fn new(max: u64, window: Duration) -> Self {
        Self {
            max,
            window,
            windows: DashMap::new(),
        }
    }

    pub fn check(&self, key: &str) -> RateLimitDecision {
        self.check_at(key, Instant::now())
    }

    fn check_at(&self, key: &str, now: Instant) -> RateLimitDecision {
        if self.windows.len() > PRUNE_THRESHOLD {
            let window = self.window;
            self.windows
                .retain(|_, state| now.duration_since(state.started) < window);
        }

        let mut state = self.windows.entry(key.to_string()).or_insert(WindowState {
            started: now,
            count: 0,
        });

        if now.duration_since(state.started) >= self.window {
            state.started = now;
            state.count = 0;
        }

        let reset_after = self.window.saturating_sub(now.duration_since(state.started));
        if state.count >= self.max {
            return RateLimitDecision {
                allowed: false,
                remaining: 0,
                reset_after,
            };
        }

        state.count += 1;
        RateLimitDecision {
            allowed: true,
            remaining: self.max - state.count,
            reset_after,
        }
    }
}

#[derive(Debug)]
pub struct RateLimitPolicy {
    config: RateLimitConfig,
    key: RateLimitKey,
    limiter: FixedWindowLimiter,
}

impl RateLimitPolicy {
    pub fn new(config: RateLimitConfig) -> GatewayResult<Self> {
        if config.window.is_zero() {
            return Err(config_error!("rate-limit window must be greater than zero"));
        }
        let key = RateLimitKey::parse(&config.rate_limit_by)?;
        let limiter = FixedWindowLimiter::new(config.max, config.window);
        Ok(Self { config, key, limiter })
    }
}

#[async_trait]
impl PolicyHandler for RateLimitPolicy {
    fn name(&self) -> &str {
        "rate-limit"
    }

    async fn handle(&self, ctx: &mut RequestContext) -> GatewayResult<PolicyOutcome> {
        let key = self.key.extract(ctx);
        let decision = self.limiter.check(&key);

        if decision.allowed {
            ctx.set_var("rateLimitRemaining", Value::from(decision.remaining));
            return Ok(PolicyOutcome::Continue);
        }

        debug!(
            trace_id = %ctx.trace_id,
            key = %key,
            limit = self.config.max,
            "Rate limit exceeded"
        );

        let reason = format!(
            "Rate limit exceeded: {} requests per {}",
            self.config.max,
            humantime::format_duration(self.config.window)
        );
        metrics::counter!(RATE_LIMITED_TOTAL).increment(1);

        let mut response = GatewayResponse::text(StatusCode::TOO_MANY_REQUESTS, self.config.message.clone());
        let retry_after = decision.reset_after.as_secs().max(1);
        response.headers.insert("retry-after", HeaderValue::from(retry_after));
        response.headers.insert("x-ratelimit-limit", HeaderValue::from(self.config.max));
        response.headers.insert("x-ratelimit-remaining", HeaderValue::from(0u64));
        if let Ok(reason) = HeaderValue::from_str(&reason) {
            response.headers.insert("x-ratelimit-reason", reason);
        }

        Ok(PolicyOutcome::Respond(response))
    }
}

pub fn create(params: &Map<String, Value>, _gateway: &GatewayConfig) -> GatewayResult<Arc<dyn PolicyHandler>> {
    let config: RateLimitConfig = parse_params("rate-limit", params)?;
    Ok(Arc::new(RateLimitPolicy::new(config)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::IncomingRequest;
    use crate::routing::test_support::endpoint_rule;
    use axum::http::{HeaderMap, Method, Version};
    use bytes::Bytes;
    use serde_json::json;
    use std::collections::HashMap;

    fn context() -> RequestContext {
        let request = IncomingRequest::new(
            Method::GET,
            "/limited".parse().unwrap(),
            Version::HTTP_11,
            HeaderMap::new(),
            Bytes::new(),
            "10.0.0.9:5000".parse().unwrap(),
        );
        RequestContext::new(request, endpoint_rule("api", &[]), HashMap::new())
    }

    #[test]
    fn test_fixed_window() {
        let limiter = FixedWindowLimiter::new(2, Duration::from_secs(10));
        let start = Instant::now();

        assert!(limiter.check_at("a", start).allowed);
        let second = limiter.check_at("a", start);
        assert!(second.allowed);
        assert_eq!(second.remaining, 0);
        assert!(!limiter.check_at("a", start).allowed);
        assert!(limiter.check_at("b", start).allowed);

        assert!(limiter.check_at("a", start + Duration::from_secs(11)).allowed);
    }

    #[test]
    fn test_rate_limit_key_parse() {
        assert_eq!(RateLimitKey::parse("ip").unwrap(), RateLimitKey::Ip);
        assert_eq!(
            RateLimitKey::parse("header:X-Api-Key").unwrap(),
            RateLimitKey::Header("x-api-key".to_string())
        );
        assert!(RateLimitKey::parse("header:").is_err());
        assert!(RateLimitKey::parse("cookie").is_err());
    }

    #[test]
    fn test_factory_validation() {
        let config = GatewayConfig::default();

        let params = json!({"max": 5, "window": "30s"});
        assert!(create(params.as_object().unwrap(), &config).is_ok());

        for params in [json!({}), json!({"max": "many"}), json!({"max": 1, "window": 0}), json!({"max": 1, "burst": 2})] {
            let err = create(params.as_object().unwrap(), &config).unwrap_err();
            assert!(err.is_configuration(), "expected configuration error for {}", params);
        }
    }

    #[tokio::test]
    async fn test_exceeded_response_headers() {
        let params = json!({"max": 1, "window": "1m", "message": "slow down"});
        let handler = create(params.as_object().unwrap(), &GatewayConfig::default()).unwrap();

        let mut first = context();
        assert!(matches!(handler.handle(&mut first).await.unwrap(), PolicyOutcome::Continue));

        let mut second = context();
        let response = match handler.handle(&mut second).await.unwrap() {
            PolicyOutcome::Respond(response) => response,
            PolicyOutcome::Continue => panic!("second request should be limited"),
        };
        assert_eq!(response.status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.body_text(), "slow down");
        assert_eq!(response.headers["x-ratelimit-limit"], "1");
        assert_eq!(response.headers["x-ratelimit-remaining"], "0");
        assert_eq!(
            response.headers["x-ratelimit-reason"],
            "Rate limit exceeded: 1 requests per 1m"
        );
    }
}
