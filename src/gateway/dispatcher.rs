//! # Dispatcher
//!
//! Owns the currently published [`DispatchGraph`] and serves requests against it.
//!
//! The graph is replaced by a single atomic pointer swap. Each request loads the graph
//! once at admission and keeps its `Arc` until the pipeline finishes, so a reload never
//! changes the rule or pipeline of a request that is already running.

use arc_swap::ArcSwap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::conditions::ConditionEngine;
use crate::core::config::GatewayConfig;
use crate::core::context::RequestContext;
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::{GatewayResponse, IncomingRequest};
use crate::observability::metrics::REQUESTS_TOTAL;
use crate::pipeline::{CompiledPipeline, PipelineCompiler, PipelineResult};
use crate::policies::PolicyRegistry;
use crate::routing::{RouteMatch, RouteTable, RouteTableBuilder};

/// Everything compiled from one configuration
#[derive(Debug)]
pub struct DispatchGraph {
    routes: RouteTable,
    generation: u64,
}

impl DispatchGraph {
    pub fn new(routes: RouteTable, generation: u64) -> Self {
        Self { routes, generation }
    }

    /// Graph that routes nothing; every request is a 404
    pub fn empty() -> Self {
        Self::new(RouteTable::new(), 0)
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub fn pipelines(&self) -> &[Arc<CompiledPipeline>] {
        self.routes.pipelines()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Compiles configurations into dispatch graphs
#[derive(Debug, Clone)]
pub struct DispatchGraphBuilder {
    policies: Arc<PolicyRegistry>,
    conditions: Arc<ConditionEngine>,
}

impl DispatchGraphBuilder {
    pub fn new(policies: Arc<PolicyRegistry>, conditions: Arc<ConditionEngine>) -> Self {
        Self { policies, conditions }
    }

    /// Builder with the built-in policies and conditions registered
    pub fn with_builtin() -> Self {
        Self::new(
            Arc::new(PolicyRegistry::with_builtin()),
            Arc::new(ConditionEngine::with_builtin()),
        )
    }

    pub fn policies(&self) -> &Arc<PolicyRegistry> {
        &self.policies
    }

    pub fn conditions(&self) -> &Arc<ConditionEngine> {
        &self.conditions
    }

    /// Compile a full graph; nothing is published here
    pub fn build(&self, config: &GatewayConfig, generation: u64) -> GatewayResult<DispatchGraph> {
        let compiler = PipelineCompiler::new(Arc::clone(&self.policies), Arc::clone(&self.conditions));
        let routes = RouteTableBuilder::new(compiler).build_from_config(config)?;
        Ok(DispatchGraph::new(routes, generation))
    }
}

impl Default for DispatchGraphBuilder {
    fn default() -> Self {
        Self::with_builtin()
    }
}

/// Serves requests against the published graph
pub struct Dispatcher {
    graph: ArcSwap<DispatchGraph>,
}

impl Dispatcher {
    pub fn new(graph: DispatchGraph) -> Self {
        Self {
            graph: ArcSwap::from_pointee(graph),
        }
    }

    /// Snapshot of the published graph
    pub fn current(&self) -> Arc<DispatchGraph> {
        self.graph.load_full()
    }

    pub fn generation(&self) -> u64 {
        self.graph.load().generation
    }

    /// Replace the published graph; requests already admitted keep the old one
    pub fn publish(&self, graph: DispatchGraph) {
        let generation = graph.generation;
        let rules = graph.routes.len();
        self.graph.store(Arc::new(graph));
        info!(generation, rules, "Published dispatch graph");
    }

    /// Route a request and run its pipeline
    #[instrument(skip(self, request), fields(request_id = %request.id, method = %request.method, path = %request.path()))]
    pub async fn dispatch(&self, request: IncomingRequest) -> GatewayResult<GatewayResponse> {
        let graph = self.current();
        let host = request.host();

        let Some(RouteMatch { rule, params }) =
            graph
                .routes()
                .match_request(host.as_deref(), &request.method, request.path())
        else {
            debug!(host = ?host, generation = graph.generation(), "No route matched");
            record_outcome("not_found");
            return Err(GatewayError::route_not_found(
                request.method.to_string(),
                host.unwrap_or_default(),
                request.path().to_string(),
            ));
        };

        let pipeline = rule.pipeline.clone().ok_or_else(|| {
            GatewayError::internal(format!("apiEndpoint '{}' has no pipeline", rule.api_endpoint_name))
        })?;

        debug!(
            api_endpoint = %rule.api_endpoint_name,
            pipeline = %pipeline.name(),
            generation = graph.generation(),
            "Route matched"
        );

        let mut ctx = RequestContext::new(request, rule, params);
        let result = pipeline.execute(&mut ctx).await;

        match result {
            Ok(PipelineResult::Responded(response)) => {
                record_outcome("responded");
                Ok(response)
            }
            Ok(PipelineResult::Completed) => {
                warn!(pipeline = %pipeline.name(), "Pipeline completed without a response");
                record_outcome("no_response");
                Err(GatewayError::NoResponse {
                    pipeline: pipeline.name().to_string(),
                })
            }
            Err(error) => {
                record_outcome("error");
                Err(error)
            }
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("generation", &self.generation())
            .finish()
    }
}

fn record_outcome(outcome: &'static str) {
    metrics::counter!(REQUESTS_TOTAL, "outcome" => outcome).increment(1);
}
