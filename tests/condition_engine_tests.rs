//! # Condition Engine Integration Tests
//!
//! Condition algebra over the built-in registry:
//! - `not` inverts, empty `allOf` is true, empty `oneOf` is false
//! - composites short-circuit
//! - unknown or malformed conditions fail at compile time

use axum::http::{HeaderMap, Method, Version};
use bytes::Bytes;
use policy_gateway::routing::{EndpointRule, HostPattern, MethodFilter, PathMatcher};
use policy_gateway::{ConditionEngine, ConditionSpec, IncomingRequest, RequestContext};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn context(method: Method, uri: &str, host: Option<&str>) -> RequestContext {
    let mut headers = HeaderMap::new();
    if let Some(host) = host {
        headers.insert("host", host.parse().unwrap());
    }
    let request = IncomingRequest::new(
        method,
        uri.parse().unwrap(),
        Version::HTTP_11,
        headers,
        Bytes::new(),
        "192.168.1.10:5000".parse().unwrap(),
    );
    let rule = Arc::new(EndpointRule::new(
        "api",
        HostPattern::Any,
        PathMatcher::Any,
        MethodFilter::Any,
        vec!["read".to_string()],
    ));
    RequestContext::new(request, rule, HashMap::new())
}

fn spec(value: Value) -> ConditionSpec {
    serde_json::from_value(value).unwrap()
}

fn eval(engine: &ConditionEngine, value: Value, ctx: &RequestContext) -> bool {
    engine.evaluate(Some(&spec(value)), ctx).unwrap()
}

/// Engine with a `count` leaf that records every evaluation and returns its `result`
fn counting_engine() -> (ConditionEngine, Arc<AtomicUsize>) {
    let engine = ConditionEngine::with_builtin();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    engine.register("count", None, move |_ctx, params| {
        counter.fetch_add(1, Ordering::SeqCst);
        params.get("result").and_then(Value::as_bool).unwrap_or(true)
    });
    (engine, calls)
}

#[test]
fn test_not_inverts_every_builtin_leaf() {
    let engine = ConditionEngine::with_builtin();
    let ctx = context(Method::POST, "/admin/users?x=1", Some("api.acme.com"));

    let leaves = [
        json!({"name": "always"}),
        json!({"name": "never"}),
        json!({"name": "pathExact", "path": "/admin/users"}),
        json!({"name": "pathMatch", "pattern": "^/public"}),
        json!({"name": "method", "methods": ["GET", "POST"]}),
        json!({"name": "hostMatch", "pattern": "*.acme.com"}),
        json!({"name": "expression", "expression": "req.query.x == '1'"}),
        json!({"name": "authenticated"}),
        json!({"name": "anonymous"}),
        json!({"name": "tlsClientAuthenticated"}),
    ];

    for leaf in leaves {
        let plain = eval(&engine, leaf.clone(), &ctx);
        let inverted = eval(&engine, json!({"name": "not", "condition": leaf}), &ctx);
        assert_eq!(plain, !inverted, "not() must invert {}", leaf);
    }
}

#[test]
fn test_empty_composites() {
    let engine = ConditionEngine::with_builtin();
    let ctx = context(Method::GET, "/", None);

    assert!(eval(&engine, json!({"name": "allOf", "conditions": []}), &ctx));
    assert!(!eval(&engine, json!({"name": "oneOf", "conditions": []}), &ctx));
    assert!(eval(&engine, json!({"name": "allOf"}), &ctx));
}

#[test]
fn test_all_of_short_circuits() {
    let (engine, calls) = counting_engine();
    let ctx = context(Method::GET, "/", None);

    let result = eval(
        &engine,
        json!({"name": "allOf", "conditions": [
            {"name": "count", "result": true},
            {"name": "never"},
            {"name": "count"}
        ]}),
        &ctx,
    );

    assert!(!result);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_one_of_short_circuits() {
    let (engine, calls) = counting_engine();
    let ctx = context(Method::GET, "/", None);

    let result = eval(
        &engine,
        json!({"name": "oneOf", "conditions": [
            {"name": "count", "result": false},
            {"name": "count", "result": true},
            {"name": "count"}
        ]}),
        &ctx,
    );

    assert!(result);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn test_nested_composites() {
    let engine = ConditionEngine::with_builtin();
    let ctx = context(Method::DELETE, "/orders/7", Some("shop.example.com"));

    let condition = json!({
        "name": "allOf",
        "conditions": [
            {"name": "hostMatch", "pattern": "shop.*"},
            {"name": "oneOf", "conditions": [
                {"name": "method", "methods": "GET"},
                {"name": "not", "condition": {"name": "pathMatch", "pattern": "^/public"}}
            ]},
            {"name": "expression", "expression": "apiEndpoint.name == 'api' && !user"}
        ]
    });

    assert!(eval(&engine, condition, &ctx));
}

#[test]
fn test_compile_errors() {
    let engine = ConditionEngine::with_builtin();

    let cases = [
        json!({"name": "bogus"}),
        json!({"name": "allOf", "conditions": [{"name": "bogus"}]}),
        json!({"name": "not"}),
        json!({"name": "pathMatch", "pattern": "(["}),
        json!({"name": "method", "methods": "FETCH"}),
        json!({"name": "always", "extra": true}),
        json!({"name": "expression", "expression": "req.path =="}),
    ];

    for case in cases {
        let err = engine.compile(Some(&spec(case.clone()))).unwrap_err();
        assert!(err.is_configuration(), "expected configuration error for {}", case);
    }
}

#[test]
fn test_missing_condition_is_always() {
    let engine = ConditionEngine::with_builtin();
    assert!(engine.compile(None).unwrap().is_always());
}
