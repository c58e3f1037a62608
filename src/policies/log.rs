//! Log policy: writes a templated message through `tracing` and continues

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::info;

use super::template::Template;
use super::{parse_params, PolicyHandler, PolicyOutcome};
use crate::core::config::GatewayConfig;
use crate::core::context::RequestContext;
use crate::core::error::GatewayResult;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogConfig {
    /// Message with `${req.path}` style placeholders
    pub message: String,
}

#[derive(Debug)]
pub struct LogPolicy {
    template: Template,
}

impl LogPolicy {
    pub fn render(&self, ctx: &RequestContext) -> String {
        self.template.render(ctx)
    }
}

#[async_trait]
impl PolicyHandler for LogPolicy {
    fn name(&self) -> &str {
        "log"
    }

    async fn handle(&self, ctx: &mut RequestContext) -> GatewayResult<PolicyOutcome> {
        info!(
            trace_id = %ctx.trace_id,
            api_endpoint = %ctx.endpoint.api_endpoint_name,
            "{}",
            self.render(ctx)
        );
        Ok(PolicyOutcome::Continue)
    }
}

pub fn create(params: &Map<String, Value>, _gateway: &GatewayConfig) -> GatewayResult<Arc<dyn PolicyHandler>> {
    let config: LogConfig = parse_params("log", params)?;
    Ok(Arc::new(LogPolicy {
        template: Template::parse(&config.message)?,
    }))
}
