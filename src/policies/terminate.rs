//! Terminate policy: answers the request immediately with a fixed status and message

use async_trait::async_trait;
use axum::http::StatusCode;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::sync::Arc;

use super::{parse_params, PolicyHandler, PolicyOutcome};
use crate::config_error;
use crate::core::config::GatewayConfig;
use crate::core::context::RequestContext;
use crate::core::error::GatewayResult;
use crate::core::types::GatewayResponse;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TerminateConfig {
    #[serde(default = "default_status_code")]
    pub status_code: u16,

    #[serde(default = "default_message")]
    pub message: String,
}

fn default_status_code() -> u16 {
    400
}

fn default_message() -> String {
    "Terminated".to_string()
}

#[derive(Debug)]
pub struct TerminatePolicy {
    status: StatusCode,
    message: String,
}

#[async_trait]
impl PolicyHandler for TerminatePolicy {
    fn name(&self) -> &str {
        "terminate"
    }

    async fn handle(&self, _ctx: &mut RequestContext) -> GatewayResult<PolicyOutcome> {
        Ok(PolicyOutcome::Respond(GatewayResponse::text(
            self.status,
            self.message.clone(),
        )))
    }
}

pub fn create(params: &Map<String, Value>, _gateway: &GatewayConfig) -> GatewayResult<Arc<dyn PolicyHandler>> {
    let config: TerminateConfig = parse_params("terminate", params)?;
    let status = StatusCode::from_u16(config.status_code)
        .map_err(|_| config_error!("Invalid terminate statusCode {}", config.status_code))?;

    Ok(Arc::new(TerminatePolicy {
        status,
        message: config.message,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults_and_validation() {
        let config = GatewayConfig::default();
        assert!(create(&Map::new(), &config).is_ok());

        let params = json!({"statusCode": 1000});
        assert!(create(params.as_object().unwrap(), &config).unwrap_err().is_configuration());

        let params = json!({"status": 401});
        assert!(create(params.as_object().unwrap(), &config).unwrap_err().is_configuration());
    }
}
