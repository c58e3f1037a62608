//! Headers policy: adds templated headers to the request before it is proxied
//!
//! ```yaml
//! - headers:
//!     - action:
//!         headersPrefix: "x-gw-"
//!         forwardHeaders:
//!           user: "${user.id}"
//!           endpoint: "${apiEndpoint.name}"
//! ```

use async_trait::async_trait;
use axum::http::{HeaderName, HeaderValue};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use super::template::Template;
use super::{parse_params, PolicyHandler, PolicyOutcome};
use crate::config_error;
use crate::core::config::GatewayConfig;
use crate::core::context::RequestContext;
use crate::core::error::GatewayResult;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct HeadersConfig {
    #[serde(default)]
    pub headers_prefix: String,

    pub forward_headers: BTreeMap<String, String>,
}

#[derive(Debug)]
pub struct HeadersPolicy {
    headers: Vec<(HeaderName, Template)>,
}

#[async_trait]
impl PolicyHandler for HeadersPolicy {
    fn name(&self) -> &str {
        "headers"
    }

    async fn handle(&self, ctx: &mut RequestContext) -> GatewayResult<PolicyOutcome> {
        for (name, template) in &self.headers {
            let rendered = template.render(ctx);
            match HeaderValue::from_str(&rendered) {
                Ok(value) => {
                    ctx.request.headers.insert(name.clone(), value);
                }
                Err(_) => {
                    debug!(trace_id = %ctx.trace_id, header = %name, "Skipping header with invalid value");
                }
            }
        }
        Ok(PolicyOutcome::Continue)
    }
}

pub fn create(params: &Map<String, Value>, _gateway: &GatewayConfig) -> GatewayResult<Arc<dyn PolicyHandler>> {
    let config: HeadersConfig = parse_params("headers", params)?;

    let headers = config
        .forward_headers
        .iter()
        .map(|(name, template)| {
            let full_name = format!("{}{}", config.headers_prefix, name);
            let header = HeaderName::from_bytes(full_name.to_ascii_lowercase().as_bytes())
                .map_err(|_| config_error!("Invalid header name '{}'", full_name))?;
            Ok((header, Template::parse(template)?))
        })
        .collect::<GatewayResult<Vec<_>>>()?;

    Ok(Arc::new(HeadersPolicy { headers }))
}
