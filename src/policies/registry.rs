//! # Policy Registry
//!
//! Maps action names to factories. Factories run once per pipeline step while a
//! configuration is compiled; the handlers they return run once per request.
//!
//! Inside a policy block named `P`, an action name `a` resolves to the first registered
//! of `P.a`, `core.a` and `a`.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config_error;
use crate::core::config::GatewayConfig;
use crate::core::context::RequestContext;
use crate::core::error::GatewayResult;
use crate::core::types::GatewayResponse;

/// Namespace built-in policies are registered under
pub const CORE_NAMESPACE: &str = "core";

/// What a handler decided for the request
///
/// Failures are returned as `Err` and end the pipeline with that error.
#[derive(Debug)]
pub enum PolicyOutcome {
    /// Run the next step
    Continue,
    /// Stop the pipeline and send this response
    Respond(GatewayResponse),
}

/// Request-time behavior of one pipeline step
#[async_trait]
pub trait PolicyHandler: Send + Sync + fmt::Debug {
    /// Action name used in logs and metrics
    fn name(&self) -> &str;

    async fn handle(&self, ctx: &mut RequestContext) -> GatewayResult<PolicyOutcome>;
}

/// Builds a handler from action parameters and the full gateway configuration
///
/// May be re-run on every reload, so implementations must not assume they run once.
pub trait PolicyFactory: Send + Sync {
    fn create(
        &self,
        params: &Map<String, Value>,
        gateway: &GatewayConfig,
    ) -> GatewayResult<Arc<dyn PolicyHandler>>;
}

impl<F> PolicyFactory for F
where
    F: Fn(&Map<String, Value>, &GatewayConfig) -> GatewayResult<Arc<dyn PolicyHandler>> + Send + Sync,
{
    fn create(
        &self,
        params: &Map<String, Value>,
        gateway: &GatewayConfig,
    ) -> GatewayResult<Arc<dyn PolicyHandler>> {
        self(params, gateway)
    }
}

/// Registry of policy factories keyed by namespaced action name
pub struct PolicyRegistry {
    factories: RwLock<HashMap<String, Arc<dyn PolicyFactory>>>,
}

impl PolicyRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            factories: RwLock::new(HashMap::new()),
        }
    }

    /// Create a registry with the built-in policies under the core namespace
    pub fn with_builtin() -> Self {
        let registry = Self::new();
        super::register_builtin(&registry);
        registry
    }

    fn qualify(name: &str, namespace: Option<&str>) -> String {
        match namespace {
            Some(namespace) => format!("{}.{}", namespace, name),
            None => name.to_string(),
        }
    }

    /// Register a factory, optionally inside a namespace
    pub fn register<S: AsRef<str>>(&self, name: S, factory: Arc<dyn PolicyFactory>, namespace: Option<&str>) {
        let key = Self::qualify(name.as_ref(), namespace);
        let mut factories = self.factories.write();
        if factories.insert(key.clone(), factory).is_some() {
            warn!(action = %key, "Policy registration replaced an existing one");
        } else {
            debug!(action = %key, "Registered policy action");
        }
    }

    /// Resolve an action used inside a policy block, returning the qualified name
    pub fn resolve(&self, name: &str, namespace: Option<&str>) -> Option<(String, Arc<dyn PolicyFactory>)> {
        let factories = self.factories.read();

        let mut candidates = Vec::with_capacity(3);
        if let Some(namespace) = namespace {
            candidates.push(Self::qualify(name, Some(namespace)));
        }
        candidates.push(Self::qualify(name, Some(CORE_NAMESPACE)));
        candidates.push(name.to_string());

        candidates
            .into_iter()
            .find_map(|key| factories.get(&key).cloned().map(|factory| (key, factory)))
    }

    /// Resolve and run the factory for an action
    pub fn create(
        &self,
        name: &str,
        namespace: Option<&str>,
        params: &Map<String, Value>,
        gateway: &GatewayConfig,
    ) -> GatewayResult<Arc<dyn PolicyHandler>> {
        let (qualified, factory) = self.resolve(name, namespace).ok_or_else(|| match namespace {
            Some(namespace) => config_error!("Unknown action '{}' in policy '{}'", name, namespace),
            None => config_error!("Unknown action '{}'", name),
        })?;

        debug!(action = %qualified, "Creating policy handler");
        factory.create(params, gateway)
    }

    /// Registered qualified names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.read().keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for PolicyRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

impl fmt::Debug for PolicyRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicyRegistry")
            .field("actions", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Tagged(&'static str);

    #[async_trait]
    impl PolicyHandler for Tagged {
        fn name(&self) -> &str {
            self.0
        }

        async fn handle(&self, _ctx: &mut RequestContext) -> GatewayResult<PolicyOutcome> {
            Ok(PolicyOutcome::Continue)
        }
    }

    fn factory(tag: &'static str) -> Arc<dyn PolicyFactory> {
        Arc::new(move |_: &Map<String, Value>, _: &GatewayConfig| {
            Ok(Arc::new(Tagged(tag)) as Arc<dyn PolicyHandler>)
        })
    }

    #[test]
    fn test_resolution_order() {
        let registry = PolicyRegistry::new();
        registry.register("check", factory("bare"), None);
        registry.register("check", factory("core"), Some(CORE_NAMESPACE));
        registry.register("check", factory("scoped"), Some("acme"));

        let config = GatewayConfig::default();
        let params = Map::new();

        let handler = registry.create("check", Some("acme"), &params, &config).unwrap();
        assert_eq!(handler.name(), "scoped");

        let handler = registry.create("check", Some("other"), &params, &config).unwrap();
        assert_eq!(handler.name(), "core");

        let (qualified, _) = registry.resolve("check", None).unwrap();
        assert_eq!(qualified, "core.check");
    }

    #[test]
    fn test_bare_registration_is_last_resort() {
        let registry = PolicyRegistry::new();
        registry.register("plugin", factory("bare"), None);
        let (qualified, _) = registry.resolve("plugin", Some("acme")).unwrap();
        assert_eq!(qualified, "plugin");
    }

    #[test]
    fn test_unknown_action_is_configuration_error() {
        let registry = PolicyRegistry::new();
        let err = registry
            .create("missing", Some("auth"), &Map::new(), &GatewayConfig::default())
            .unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("Unknown action 'missing' in policy 'auth'"));
    }

    #[test]
    fn test_builtin_policies_registered() {
        let names = PolicyRegistry::with_builtin().names();
        for name in ["proxy", "rate-limit", "terminate", "log", "headers", "key-auth"] {
            assert!(names.contains(&format!("{}.{}", CORE_NAMESPACE, name)), "missing {}", name);
        }
    }
}
