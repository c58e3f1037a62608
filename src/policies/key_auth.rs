//! # Key Auth Policy
//!
//! Authenticates requests by API key. The key is read from a header (optionally after a
//! scheme such as `apikey <key>`) or from a query parameter, and looked up in the
//! configured `keys` table. A match attaches the user to the request context.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use super::{parse_params, PolicyHandler, PolicyOutcome};
use crate::config_error;
use crate::core::config::GatewayConfig;
use crate::core::context::RequestContext;
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::AuthContext;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct KeyAuthConfig {
    /// API key to user id
    pub keys: HashMap<String, String>,

    #[serde(default = "default_header")]
    pub header: String,

    #[serde(default = "default_scheme")]
    pub header_scheme: String,

    /// Read the whole header value as the key
    #[serde(default)]
    pub disable_headers_scheme: bool,

    /// Query parameter checked when the header is absent
    #[serde(default)]
    pub query_param: Option<String>,

    /// Continue anonymously instead of rejecting
    #[serde(default)]
    pub pass_through: bool,
}

fn default_header() -> String {
    "apikey".to_string()
}

fn default_scheme() -> String {
    "apikey".to_string()
}

#[derive(Debug)]
pub struct KeyAuthPolicy {
    config: KeyAuthConfig,
}

impl KeyAuthPolicy {
    fn extract_key(&self, ctx: &RequestContext) -> Option<String> {
        if let Some(value) = ctx.request.header(&self.config.header) {
            let value = value.trim();
            if self.config.disable_headers_scheme {
                return Some(value.to_string());
            }
            return match value.split_once(' ') {
                Some((scheme, key)) if scheme.eq_ignore_ascii_case(&self.config.header_scheme) => {
                    Some(key.trim().to_string())
                }
                _ => Some(value.to_string()),
            };
        }

        self.config
            .query_param
            .as_ref()
            .and_then(|param| ctx.request.query_params().remove(param))
    }
}

#[async_trait]
impl PolicyHandler for KeyAuthPolicy {
    fn name(&self) -> &str {
        "key-auth"
    }

    async fn handle(&self, ctx: &mut RequestContext) -> GatewayResult<PolicyOutcome> {
        let failure = match self.extract_key(ctx) {
            Some(key) => match self.config.keys.get(&key) {
                Some(user_id) => {
                    debug!(trace_id = %ctx.trace_id, user_id = %user_id, "API key accepted");
                    ctx.set_user(AuthContext::new(user_id.as_str(), "key-auth"));
                    return Ok(PolicyOutcome::Continue);
                }
                None => "invalid API key",
            },
            None => "missing API key",
        };

        if self.config.pass_through {
            debug!(trace_id = %ctx.trace_id, reason = failure, "Continuing anonymously");
            return Ok(PolicyOutcome::Continue);
        }

        Err(GatewayError::auth(failure))
    }
}

pub fn create(params: &Map<String, Value>, _gateway: &GatewayConfig) -> GatewayResult<Arc<dyn PolicyHandler>> {
    let mut config: KeyAuthConfig = parse_params("key-auth", params)?;
    if config.keys.is_empty() {
        return Err(config_error!("key-auth requires at least one entry in 'keys'"));
    }
    config.header = config.header.to_ascii_lowercase();
    Ok(Arc::new(KeyAuthPolicy { config }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::IncomingRequest;
    use crate::routing::test_support::endpoint_rule;
    use axum::http::{HeaderMap, Method, Version};
    use bytes::Bytes;
    use serde_json::json;

    fn context(uri: &str, header: Option<(&'static str, &str)>) -> RequestContext {
        let mut headers = HeaderMap::new();
        if let Some((name, value)) = header {
            headers.insert(name, value.parse().unwrap());
        }
        let request = IncomingRequest::new(
            Method::GET,
            uri.parse().unwrap(),
            Version::HTTP_11,
            headers,
            Bytes::new(),
            "127.0.0.1:1".parse().unwrap(),
        );
        RequestContext::new(request, endpoint_rule("api", &[]), HashMap::new())
    }

    fn handler(extra: Value) -> Arc<dyn PolicyHandler> {
        let mut params = json!({"keys": {"secret-1": "alice"}});
        if let (Some(params), Some(extra)) = (params.as_object_mut(), extra.as_object()) {
            params.extend(extra.clone());
        }
        create(params.as_object().unwrap(), &GatewayConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_valid_key_attaches_user() {
        let handler = handler(json!({}));

        let mut ctx = context("/", Some(("apikey", "apikey secret-1")));
        assert!(matches!(handler.handle(&mut ctx).await.unwrap(), PolicyOutcome::Continue));
        assert_eq!(ctx.user.as_ref().unwrap().user_id, "alice");

        let mut ctx = context("/", Some(("apikey", "secret-1")));
        handler.handle(&mut ctx).await.unwrap();
        assert!(ctx.is_authenticated());
    }

    #[tokio::test]
    async fn test_invalid_or_missing_key() {
        let handler = handler(json!({}));

        let mut ctx = context("/", Some(("apikey", "wrong")));
        let err = handler.handle(&mut ctx).await.unwrap_err();
        assert!(matches!(err, GatewayError::Authentication { .. }));

        let mut ctx = context("/", None);
        assert!(handler.handle(&mut ctx).await.is_err());
        assert!(!ctx.is_authenticated());
    }

    #[tokio::test]
    async fn test_query_param_and_pass_through() {
        let handler = handler(json!({"queryParam": "key", "passThrough": true}));

        let mut ctx = context("/?key=secret-1", None);
        handler.handle(&mut ctx).await.unwrap();
        assert!(ctx.is_authenticated());

        let mut ctx = context("/", None);
        assert!(matches!(handler.handle(&mut ctx).await.unwrap(), PolicyOutcome::Continue));
        assert!(!ctx.is_authenticated());
    }

    #[test]
    fn test_keys_required() {
        let params = json!({"keys": {}});
        assert!(create(params.as_object().unwrap(), &GatewayConfig::default()).is_err());
    }
}
