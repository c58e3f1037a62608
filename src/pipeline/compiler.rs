//! # Pipeline Compiler
//!
//! Turns a pipeline definition into a [`CompiledPipeline`]: an immutable, ordered list
//! of condition-guarded policy handlers. Compilation is all-or-nothing; the first bad
//! step fails the whole pipeline.
//!
//! ## Execution
//! Steps run strictly in order. A step whose condition is false is skipped. A handler
//! either lets the next step run, answers the request, or fails it. A condition that
//! fails to evaluate ends the pipeline with that error.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, instrument, warn};

use crate::conditions::{Condition, ConditionEngine};
use crate::config_error;
use crate::core::config::{GatewayConfig, PipelineDefinition};
use crate::core::context::RequestContext;
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::GatewayResponse;
use crate::observability::metrics::POLICY_EXECUTIONS_TOTAL;
use crate::policies::{PolicyHandler, PolicyOutcome, PolicyRegistry};

/// One guarded handler
pub struct PipelineStep {
    /// Policy block the step was declared in
    pub policy: String,
    /// Action name as written (or the block name when omitted)
    pub action: String,
    pub condition: Condition,
    pub handler: Arc<dyn PolicyHandler>,
}

impl fmt::Debug for PipelineStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineStep")
            .field("policy", &self.policy)
            .field("action", &self.action)
            .field("condition", &self.condition)
            .finish()
    }
}

/// How a pipeline run ended without error
#[derive(Debug)]
pub enum PipelineResult {
    /// A step answered the request
    Responded(GatewayResponse),
    /// Every step ran or was skipped and none answered
    Completed,
}

/// Executable pipeline, shared by every endpoint that lists it
#[derive(Debug)]
pub struct CompiledPipeline {
    name: String,
    steps: Vec<PipelineStep>,
}

impl CompiledPipeline {
    pub fn new<S: Into<String>>(name: S, steps: Vec<PipelineStep>) -> Self {
        Self {
            name: name.into(),
            steps,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn steps(&self) -> &[PipelineStep] {
        &self.steps
    }

    /// Run the steps against one request
    #[instrument(skip(self, ctx), fields(pipeline = %self.name, trace_id = %ctx.trace_id))]
    pub async fn execute(&self, ctx: &mut RequestContext) -> GatewayResult<PipelineResult> {
        for step in &self.steps {
            if !step.condition.evaluate(ctx)? {
                debug!(policy = %step.policy, action = %step.action, "Step skipped by condition");
                continue;
            }

            let started = Instant::now();
            let outcome = step.handler.handle(ctx).await;
            let elapsed_ms = started.elapsed().as_millis() as u64;

            let label = match &outcome {
                Ok(PolicyOutcome::Continue) => "continue",
                Ok(PolicyOutcome::Respond(_)) => "respond",
                Err(_) => "fail",
            };
            metrics::counter!(
                POLICY_EXECUTIONS_TOTAL,
                "policy" => step.policy.clone(),
                "outcome" => label
            )
            .increment(1);

            match outcome {
                Ok(PolicyOutcome::Continue) => {
                    debug!(policy = %step.policy, action = %step.action, elapsed_ms, "Step continued");
                }
                Ok(PolicyOutcome::Respond(response)) => {
                    debug!(
                        policy = %step.policy,
                        action = %step.action,
                        status = response.status.as_u16(),
                        elapsed_ms,
                        "Step responded"
                    );
                    return Ok(PipelineResult::Responded(response));
                }
                Err(error) => {
                    warn!(policy = %step.policy, action = %step.action, error = %error, "Step failed");
                    return Err(error);
                }
            }
        }

        Ok(PipelineResult::Completed)
    }
}

/// Compiles pipeline definitions using the policy and condition registries
#[derive(Debug, Clone)]
pub struct PipelineCompiler {
    policies: Arc<PolicyRegistry>,
    conditions: Arc<ConditionEngine>,
}

impl PipelineCompiler {
    pub fn new(policies: Arc<PolicyRegistry>, conditions: Arc<ConditionEngine>) -> Self {
        Self { policies, conditions }
    }

    /// Compile one pipeline; any failing step fails the pipeline
    pub fn compile(
        &self,
        name: &str,
        definition: &PipelineDefinition,
        gateway: &GatewayConfig,
    ) -> GatewayResult<CompiledPipeline> {
        let mut steps = Vec::new();

        for block in &definition.policies {
            for (policy, block_steps) in block.iter() {
                if !gateway.is_policy_allowed(policy) {
                    return Err(config_error!(
                        "Pipeline '{}' uses policy '{}' which is not listed in 'policies'",
                        name,
                        policy
                    ));
                }

                for (index, step) in block_steps.iter().enumerate() {
                    let action = step.action.name.as_deref().unwrap_or(policy);
                    let context = |e: GatewayError| {
                        config_error!(
                            "Pipeline '{}', policy '{}' step {}: {}",
                            name,
                            policy,
                            index + 1,
                            configuration_message(e)
                        )
                    };

                    let handler = self
                        .policies
                        .create(action, Some(policy), &step.action.params, gateway)
                        .map_err(context)?;
                    let condition = self
                        .conditions
                        .compile(step.condition.as_ref())
                        .map_err(context)?;

                    steps.push(PipelineStep {
                        policy: policy.to_string(),
                        action: action.to_string(),
                        condition,
                        handler,
                    });
                }
            }
        }

        debug!(pipeline = %name, steps = steps.len(), "Compiled pipeline");
        Ok(CompiledPipeline::new(name, steps))
    }
}

fn configuration_message(error: GatewayError) -> String {
    match error {
        GatewayError::Configuration { message } => message,
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::IncomingRequest;
    use crate::routing::test_support::endpoint_rule;
    use async_trait::async_trait;
    use axum::http::{HeaderMap, Method, StatusCode, Version};
    use bytes::Bytes;
    use serde_json::{json, Map, Value};
    use std::collections::HashMap;

    /// Appends its tag to `vars.trail`, then acts as configured
    #[derive(Debug)]
    struct Recorder {
        tag: String,
        outcome: String,
    }

    #[async_trait]
    impl PolicyHandler for Recorder {
        fn name(&self) -> &str {
            "record"
        }

        async fn handle(&self, ctx: &mut RequestContext) -> GatewayResult<PolicyOutcome> {
            let mut trail = ctx.var("trail").and_then(Value::as_str).unwrap_or("").to_string();
            trail.push_str(&self.tag);
            ctx.set_var("trail", Value::String(trail));

            match self.outcome.as_str() {
                "respond" => Ok(PolicyOutcome::Respond(GatewayResponse::text(StatusCode::OK, self.tag.clone()))),
                "fail" => Err(GatewayError::policy("record", "boom")),
                _ => Ok(PolicyOutcome::Continue),
            }
        }
    }

    fn record_factory(params: &Map<String, Value>, _: &GatewayConfig) -> GatewayResult<Arc<dyn PolicyHandler>> {
        let tag = params.get("tag").and_then(Value::as_str).unwrap_or("?").to_string();
        let outcome = params.get("outcome").and_then(Value::as_str).unwrap_or("continue").to_string();
        Ok(Arc::new(Recorder { tag, outcome }))
    }

    fn compiler() -> PipelineCompiler {
        let policies = PolicyRegistry::with_builtin();
        policies.register("record", Arc::new(record_factory), None);
        PipelineCompiler::new(Arc::new(policies), Arc::new(ConditionEngine::with_builtin()))
    }

    fn definition(policies: Value) -> PipelineDefinition {
        serde_json::from_value(json!({"apiEndpoints": ["api"], "policies": policies})).unwrap()
    }

    fn context(method: Method) -> RequestContext {
        let request = IncomingRequest::new(
            method,
            "/".parse().unwrap(),
            Version::HTTP_11,
            HeaderMap::new(),
            Bytes::new(),
            "127.0.0.1:1".parse().unwrap(),
        );
        RequestContext::new(request, endpoint_rule("api", &[]), HashMap::new())
    }

    fn trail(ctx: &RequestContext) -> String {
        ctx.var("trail").and_then(Value::as_str).unwrap_or("").to_string()
    }

    #[tokio::test]
    async fn test_steps_run_in_order_and_conditions_skip() {
        let pipeline = compiler()
            .compile(
                "p",
                &definition(json!([
                    {"record": [
                        {"action": {"tag": "a"}},
                        {"condition": {"name": "method", "methods": "POST"}, "action": {"tag": "b"}},
                        {"action": {"tag": "c"}}
                    ]},
                    {"record": [{"action": {"tag": "d", "outcome": "respond"}}]},
                    {"record": [{"action": {"tag": "e"}}]}
                ])),
                &GatewayConfig::default(),
            )
            .unwrap();

        assert_eq!(pipeline.steps().len(), 5);

        let mut ctx = context(Method::GET);
        let result = pipeline.execute(&mut ctx).await.unwrap();
        assert!(matches!(result, PipelineResult::Responded(ref r) if r.body_text() == "d"));
        assert_eq!(trail(&ctx), "acd");
    }

    #[tokio::test]
    async fn test_failure_stops_pipeline() {
        let pipeline = compiler()
            .compile(
                "p",
                &definition(json!([{"record": [
                    {"action": {"tag": "a", "outcome": "fail"}},
                    {"action": {"tag": "b"}}
                ]}])),
                &GatewayConfig::default(),
            )
            .unwrap();

        let mut ctx = context(Method::GET);
        let err = pipeline.execute(&mut ctx).await.unwrap_err();
        assert!(matches!(err, GatewayError::PolicyExecution { .. }));
        assert_eq!(trail(&ctx), "a");
    }

    #[tokio::test]
    async fn test_completes_without_response() {
        let pipeline = compiler()
            .compile("p", &definition(json!([{"record": [{"action": {"tag": "a"}}]}])), &GatewayConfig::default())
            .unwrap();
        let mut ctx = context(Method::GET);
        assert!(matches!(pipeline.execute(&mut ctx).await.unwrap(), PipelineResult::Completed));
    }

    #[tokio::test]
    async fn test_condition_error_terminates() {
        let pipeline = compiler()
            .compile(
                "p",
                &definition(json!([{"record": [
                    {"condition": {"name": "expression", "expression": "req.path > 1"}, "action": {"tag": "a"}}
                ]}])),
                &GatewayConfig::default(),
            )
            .unwrap();
        let mut ctx = context(Method::GET);
        let err = pipeline.execute(&mut ctx).await.unwrap_err();
        assert!(matches!(err, GatewayError::Expression { .. }));
        assert_eq!(trail(&ctx), "");
    }

    #[test]
    fn test_action_name_defaults_to_block_name() {
        let pipeline = compiler()
            .compile(
                "p",
                &definition(json!([{"terminate": [{"action": {"statusCode": 403}}]}])),
                &GatewayConfig::default(),
            )
            .unwrap();
        assert_eq!(pipeline.steps()[0].action, "terminate");
    }

    #[test]
    fn test_compile_errors() {
        let compiler = compiler();
        let config = GatewayConfig::default();

        let err = compiler
            .compile("p", &definition(json!([{"auth": [{"action": {"name": "nope"}}]}])), &config)
            .unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("Unknown action 'nope' in policy 'auth'"));

        let err = compiler
            .compile(
                "p",
                &definition(json!([{"record": [{"condition": {"name": "bogus"}, "action": {}}]}])),
                &config,
            )
            .unwrap_err();
        assert!(err.to_string().contains("Unknown condition 'bogus'"));
    }

    #[test]
    fn test_policy_whitelist() {
        let mut config = GatewayConfig::default();
        config.policies = Some(vec!["terminate".to_string()]);

        let err = compiler()
            .compile("p", &definition(json!([{"record": [{"action": {}}]}])), &config)
            .unwrap_err();
        assert!(err.to_string().contains("not listed in 'policies'"));
    }
}
