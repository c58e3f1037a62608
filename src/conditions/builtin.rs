//! # Built-in Conditions
//!
//! Each constructor deserializes its parameters into a typed struct, so unknown or
//! mistyped parameters are rejected when the pipeline is compiled.

use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

use super::expression::Expression;
use super::{Condition, ConditionConstructor, ConditionEngine, ConditionSpec};
use crate::config_error;
use crate::core::config::OneOrMany;
use crate::core::error::GatewayResult;
use crate::routing::matcher::{glob_to_regex, MethodFilter};

/// Register every built-in condition on the engine
pub fn register_builtin(engine: &ConditionEngine) {
    engine.register_constructor("always", Arc::new(AlwaysConstructor));
    engine.register_constructor("never", Arc::new(NeverConstructor));
    engine.register_constructor("allOf", Arc::new(AllOfConstructor));
    engine.register_constructor("oneOf", Arc::new(OneOfConstructor));
    engine.register_constructor("not", Arc::new(NotConstructor));
    engine.register_constructor("pathMatch", Arc::new(PathMatchConstructor));
    engine.register_constructor("pathExact", Arc::new(PathExactConstructor));
    engine.register_constructor("method", Arc::new(MethodConstructor));
    engine.register_constructor("hostMatch", Arc::new(HostMatchConstructor));
    engine.register_constructor("expression", Arc::new(ExpressionConstructor));
    engine.register_constructor("authenticated", Arc::new(AuthenticatedConstructor));
    engine.register_constructor("anonymous", Arc::new(AnonymousConstructor));
    engine.register_constructor("tlsClientAuthenticated", Arc::new(TlsClientAuthenticatedConstructor));
}

fn parse_params<T: DeserializeOwned>(spec: &ConditionSpec) -> GatewayResult<T> {
    serde_json::from_value(Value::Object(spec.params.clone()))
        .map_err(|e| config_error!("Invalid parameters for condition '{}': {}", spec.name, e))
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct NoParams {}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ConditionListParams {
    #[serde(default)]
    conditions: Vec<ConditionSpec>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct NotParams {
    condition: ConditionSpec,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct PatternParams {
    pattern: String,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct PathExactParams {
    path: String,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct MethodParams {
    methods: OneOrMany<String>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ExpressionParams {
    expression: String,
}

struct AlwaysConstructor;

impl ConditionConstructor for AlwaysConstructor {
    fn compile(&self, spec: &ConditionSpec, _engine: &ConditionEngine) -> GatewayResult<Condition> {
        parse_params::<NoParams>(spec)?;
        Ok(Condition::Always)
    }
}

struct NeverConstructor;

impl ConditionConstructor for NeverConstructor {
    fn compile(&self, spec: &ConditionSpec, _engine: &ConditionEngine) -> GatewayResult<Condition> {
        parse_params::<NoParams>(spec)?;
        Ok(Condition::Never)
    }
}

struct AllOfConstructor;

impl ConditionConstructor for AllOfConstructor {
    fn compile(&self, spec: &ConditionSpec, engine: &ConditionEngine) -> GatewayResult<Condition> {
        let params: ConditionListParams = parse_params(spec)?;
        Ok(Condition::AllOf(engine.compile_all(&params.conditions)?))
    }
}

struct OneOfConstructor;

impl ConditionConstructor for OneOfConstructor {
    fn compile(&self, spec: &ConditionSpec, engine: &ConditionEngine) -> GatewayResult<Condition> {
        let params: ConditionListParams = parse_params(spec)?;
        Ok(Condition::OneOf(engine.compile_all(&params.conditions)?))
    }
}

struct NotConstructor;

impl ConditionConstructor for NotConstructor {
    fn compile(&self, spec: &ConditionSpec, engine: &ConditionEngine) -> GatewayResult<Condition> {
        let params: NotParams = parse_params(spec)?;
        let inner = engine.compile(Some(&params.condition))?;
        Ok(Condition::Not(Box::new(inner)))
    }
}

/// Regular expression searched in the request path
struct PathMatchConstructor;

impl ConditionConstructor for PathMatchConstructor {
    fn compile(&self, spec: &ConditionSpec, _engine: &ConditionEngine) -> GatewayResult<Condition> {
        let params: PatternParams = parse_params(spec)?;
        let regex = Regex::new(&params.pattern)?;
        Ok(Condition::leaf("pathMatch", move |ctx| Ok(regex.is_match(ctx.request.path()))))
    }
}

struct PathExactConstructor;

impl ConditionConstructor for PathExactConstructor {
    fn compile(&self, spec: &ConditionSpec, _engine: &ConditionEngine) -> GatewayResult<Condition> {
        let params: PathExactParams = parse_params(spec)?;
        let path = params.path;
        Ok(Condition::leaf("pathExact", move |ctx| Ok(ctx.request.path() == path)))
    }
}

struct MethodConstructor;

impl ConditionConstructor for MethodConstructor {
    fn compile(&self, spec: &ConditionSpec, _engine: &ConditionEngine) -> GatewayResult<Condition> {
        let params: MethodParams = parse_params(spec)?;
        let filter = MethodFilter::parse(&params.methods.to_vec())?;
        Ok(Condition::leaf("method", move |ctx| Ok(filter.allows(&ctx.request.method))))
    }
}

/// Glob matched against the Host header without port; no Host never matches
struct HostMatchConstructor;

impl ConditionConstructor for HostMatchConstructor {
    fn compile(&self, spec: &ConditionSpec, _engine: &ConditionEngine) -> GatewayResult<Condition> {
        let params: PatternParams = parse_params(spec)?;
        let regex = glob_to_regex(&params.pattern, ".*")?;
        Ok(Condition::leaf("hostMatch", move |ctx| {
            Ok(ctx
                .request
                .host()
                .map(|host| regex.is_match(&host))
                .unwrap_or(false))
        }))
    }
}

struct ExpressionConstructor;

impl ConditionConstructor for ExpressionConstructor {
    fn compile(&self, spec: &ConditionSpec, _engine: &ConditionEngine) -> GatewayResult<Condition> {
        let params: ExpressionParams = parse_params(spec)?;
        let expression = Expression::compile(&params.expression)?;
        Ok(Condition::leaf("expression", move |ctx| expression.matches(ctx)))
    }
}

struct AuthenticatedConstructor;

impl ConditionConstructor for AuthenticatedConstructor {
    fn compile(&self, spec: &ConditionSpec, _engine: &ConditionEngine) -> GatewayResult<Condition> {
        parse_params::<NoParams>(spec)?;
        Ok(Condition::leaf("authenticated", |ctx| Ok(ctx.is_authenticated())))
    }
}

struct AnonymousConstructor;

impl ConditionConstructor for AnonymousConstructor {
    fn compile(&self, spec: &ConditionSpec, _engine: &ConditionEngine) -> GatewayResult<Condition> {
        parse_params::<NoParams>(spec)?;
        Ok(Condition::leaf("anonymous", |ctx| Ok(!ctx.is_authenticated())))
    }
}

struct TlsClientAuthenticatedConstructor;

impl ConditionConstructor for TlsClientAuthenticatedConstructor {
    fn compile(&self, spec: &ConditionSpec, _engine: &ConditionEngine) -> GatewayResult<Condition> {
        parse_params::<NoParams>(spec)?;
        Ok(Condition::leaf("tlsClientAuthenticated", |ctx| {
            Ok(ctx.request.client_cert_verified)
        }))
    }
}
