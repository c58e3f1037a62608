//! # Policies
//!
//! The [`PolicyRegistry`] and the built-in policy actions. Each built-in module exposes a
//! `create` factory that validates the action parameters and returns a handler.

pub mod headers;
pub mod key_auth;
pub mod log;
pub mod proxy;
pub mod rate_limit;
pub mod registry;
pub mod template;
pub mod terminate;

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::config_error;
use crate::core::error::GatewayResult;

pub use registry::{PolicyFactory, PolicyHandler, PolicyOutcome, PolicyRegistry, CORE_NAMESPACE};

/// Register every built-in action under the core namespace
pub fn register_builtin(registry: &PolicyRegistry) {
    let core = Some(CORE_NAMESPACE);
    registry.register("proxy", Arc::new(proxy::create), core);
    registry.register("rate-limit", Arc::new(rate_limit::create), core);
    registry.register("terminate", Arc::new(terminate::create), core);
    registry.register("log", Arc::new(log::create), core);
    registry.register("headers", Arc::new(headers::create), core);
    registry.register("key-auth", Arc::new(key_auth::create), core);
}

/// Deserialize action parameters into a typed config struct
pub(crate) fn parse_params<T: DeserializeOwned>(action: &str, params: &Map<String, Value>) -> GatewayResult<T> {
    serde_json::from_value(Value::Object(params.clone()))
        .map_err(|e| config_error!("Invalid {} configuration: {}", action, e))
}
