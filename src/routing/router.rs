//! # Router Module
//!
//! Compiles `apiEndpoints` and `pipelines` into a [`RouteTable`] and matches requests
//! against it.
//!
//! ## Host groups
//! Rules are grouped by host:
//! - literal hosts are looked up in a hash map
//! - glob and regex hosts are tried in declaration order
//! - rules without a host (or with `*`) form the wildcard group, tried last
//!
//! Within a group, the first rule in declaration order whose path and method match wins.
//! If a group has no such rule the next candidate group is tried.

use axum::http::Method;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::matcher::{HostPattern, MethodFilter, PathMatcher};
use crate::config_error;
use crate::core::config::{ApiEndpointDefinition, ApiEndpointEntry, GatewayConfig, NamedMap, PipelineDefinition};
use crate::core::error::{GatewayError, GatewayResult};
use crate::pipeline::{CompiledPipeline, PipelineCompiler};

/// One host/path/method pattern bound to a pipeline
pub struct EndpointRule {
    /// Name of the `apiEndpoints` entry this rule came from
    pub api_endpoint_name: String,
    pub host: HostPattern,
    pub path: PathMatcher,
    pub methods: MethodFilter,
    /// Opaque metadata for policies
    pub scopes: Vec<String>,
    /// `None` when no pipeline lists the endpoint
    pub pipeline: Option<Arc<CompiledPipeline>>,
}

impl EndpointRule {
    pub fn new<S: Into<String>>(
        api_endpoint_name: S,
        host: HostPattern,
        path: PathMatcher,
        methods: MethodFilter,
        scopes: Vec<String>,
    ) -> Self {
        Self {
            api_endpoint_name: api_endpoint_name.into(),
            host,
            path,
            methods,
            scopes,
            pipeline: None,
        }
    }

    pub fn with_pipeline(mut self, pipeline: Option<Arc<CompiledPipeline>>) -> Self {
        self.pipeline = pipeline;
        self
    }

    /// Compile one endpoint definition
    pub fn from_definition(name: &str, definition: &ApiEndpointDefinition) -> GatewayResult<Self> {
        let host = HostPattern::from_definition(definition.host.as_deref(), definition.host_regex.as_deref())?;
        let path = PathMatcher::from_definition(
            definition.paths.as_ref().map(|paths| paths.to_vec()),
            definition.path_regex.as_deref(),
        )?;
        let methods = match &definition.methods {
            Some(methods) => MethodFilter::parse(&methods.to_vec())?,
            None => MethodFilter::Any,
        };
        let scopes = definition
            .scopes
            .as_ref()
            .map(|scopes| scopes.to_vec())
            .unwrap_or_default();

        Ok(Self::new(name, host, path, methods, scopes))
    }

    /// Match path and method, returning extracted path parameters
    pub fn matches(&self, method: &Method, path: &str) -> Option<HashMap<String, String>> {
        if !self.methods.allows(method) {
            return None;
        }
        self.path.matches(path)
    }

    pub fn is_routable(&self) -> bool {
        self.pipeline.is_some()
    }
}

impl fmt::Debug for EndpointRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointRule")
            .field("api_endpoint_name", &self.api_endpoint_name)
            .field("host", &self.host.group_key())
            .field("path", &self.path)
            .field("methods", &self.methods)
            .field("pipeline", &self.pipeline.as_ref().map(|p| p.name()))
            .finish()
    }
}

/// A matched rule and the path parameters it extracted
#[derive(Debug, Clone)]
pub struct RouteMatch {
    pub rule: Arc<EndpointRule>,
    pub params: HashMap<String, String>,
}

#[derive(Debug)]
struct HostGroup {
    pattern: HostPattern,
    rules: Vec<Arc<EndpointRule>>,
}

/// Immutable routing structure built from configuration
#[derive(Debug, Default)]
pub struct RouteTable {
    exact: HashMap<String, Vec<Arc<EndpointRule>>>,
    patterns: Vec<HostGroup>,
    wildcard: Vec<Arc<EndpointRule>>,
    pipelines: Vec<Arc<CompiledPipeline>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a rule to the end of its host group
    pub fn add_rule(&mut self, rule: Arc<EndpointRule>) {
        match &rule.host {
            HostPattern::Any => self.wildcard.push(rule),
            HostPattern::Exact(host) => self.exact.entry(host.clone()).or_default().push(rule),
            pattern => {
                let key = pattern.group_key();
                match self.patterns.iter_mut().find(|group| group.pattern.group_key() == key) {
                    Some(group) => group.rules.push(rule),
                    None => {
                        let pattern = rule.host.clone();
                        self.patterns.push(HostGroup {
                            pattern,
                            rules: vec![rule],
                        });
                    }
                }
            }
        }
    }

    /// Find the first routable rule for a request
    ///
    /// `host` must already be lowercased and stripped of its port.
    pub fn match_request(&self, host: Option<&str>, method: &Method, path: &str) -> Option<RouteMatch> {
        let exact = host.and_then(|host| self.exact.get(host)).map(Vec::as_slice);
        let patterns = self
            .patterns
            .iter()
            .filter(|group| group.pattern.matches(host))
            .map(|group| group.rules.as_slice());

        exact
            .into_iter()
            .chain(patterns)
            .chain(std::iter::once(self.wildcard.as_slice()))
            .find_map(|rules| Self::match_group(rules, method, path))
    }

    fn match_group(rules: &[Arc<EndpointRule>], method: &Method, path: &str) -> Option<RouteMatch> {
        rules
            .iter()
            .filter(|rule| rule.is_routable())
            .find_map(|rule| {
                rule.matches(method, path).map(|params| RouteMatch {
                    rule: Arc::clone(rule),
                    params,
                })
            })
    }

    /// All rules: exact groups (unordered), then pattern groups, then wildcard
    pub fn rules(&self) -> impl Iterator<Item = &Arc<EndpointRule>> {
        self.exact
            .values()
            .flatten()
            .chain(self.patterns.iter().flat_map(|group| group.rules.iter()))
            .chain(self.wildcard.iter())
    }

    pub fn len(&self) -> usize {
        self.rules().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Compiled pipelines in declaration order
    pub fn pipelines(&self) -> &[Arc<CompiledPipeline>] {
        &self.pipelines
    }

    pub fn pipeline(&self, name: &str) -> Option<&Arc<CompiledPipeline>> {
        self.pipelines.iter().find(|p| p.name() == name)
    }
}

/// Builds route tables from configuration
#[derive(Debug, Clone)]
pub struct RouteTableBuilder {
    compiler: PipelineCompiler,
}

impl RouteTableBuilder {
    pub fn new(compiler: PipelineCompiler) -> Self {
        Self { compiler }
    }

    pub fn build_from_config(&self, config: &GatewayConfig) -> GatewayResult<RouteTable> {
        self.build(config.api_endpoints.as_ref(), config.pipelines.as_ref(), config)
    }

    /// Compile every pipeline once and bind it to the endpoints it lists
    pub fn build(
        &self,
        api_endpoints: Option<&NamedMap<ApiEndpointEntry>>,
        pipelines: Option<&NamedMap<PipelineDefinition>>,
        gateway: &GatewayConfig,
    ) -> GatewayResult<RouteTable> {
        let api_endpoints =
            api_endpoints.ok_or_else(|| config_error!("Missing required 'apiEndpoints' section"))?;
        let pipelines = pipelines.ok_or_else(|| config_error!("Missing required 'pipelines' section"))?;

        let mut table = RouteTable::new();
        let mut bindings: HashMap<&str, Arc<CompiledPipeline>> = HashMap::new();

        for (pipeline_name, definition) in pipelines.iter() {
            let compiled = Arc::new(self.compiler.compile(pipeline_name, definition, gateway)?);

            for endpoint in &definition.api_endpoints {
                if !api_endpoints.contains_key(endpoint) {
                    warn!(
                        pipeline = %pipeline_name,
                        api_endpoint = %endpoint,
                        "Pipeline references an undefined apiEndpoint"
                    );
                    continue;
                }
                match bindings.get(endpoint.as_str()) {
                    Some(existing) => warn!(
                        pipeline = %pipeline_name,
                        api_endpoint = %endpoint,
                        bound_to = %existing.name(),
                        "apiEndpoint is already bound to an earlier pipeline"
                    ),
                    None => {
                        bindings.insert(endpoint.as_str(), Arc::clone(&compiled));
                    }
                }
            }

            table.pipelines.push(compiled);
        }

        for (name, entry) in api_endpoints.iter() {
            let pipeline = bindings.get(name).cloned();
            if pipeline.is_none() {
                warn!(api_endpoint = %name, "apiEndpoint is not used by any pipeline");
            }

            for definition in entry.definitions() {
                let rule = EndpointRule::from_definition(name, definition)
                    .map_err(|e| match e {
                        GatewayError::Configuration { message } => {
                            config_error!("apiEndpoint '{}': {}", name, message)
                        }
                        other => other,
                    })?
                    .with_pipeline(pipeline.clone());

                debug!(api_endpoint = %name, host = %rule.host.group_key(), "Added route rule");
                table.add_rule(Arc::new(rule));
            }
        }

        info!(
            rules = table.len(),
            pipelines = table.pipelines.len(),
            "Built route table"
        );
        Ok(table)
    }
}
