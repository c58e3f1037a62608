//! Per-request execution context
//!
//! A [`RequestContext`] is created when a request matches a rule. It is owned by the task
//! serving that request and handed mutably to each pipeline step in turn.

use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::core::types::{AuthContext, IncomingRequest};
use crate::routing::EndpointRule;

/// Top-level names visible to condition expressions and log templates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeRoot {
    Req,
    User,
    ApiEndpoint,
    Vars,
}

impl ScopeRoot {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "req" => Some(Self::Req),
            "user" => Some(Self::User),
            "apiEndpoint" => Some(Self::ApiEndpoint),
            "vars" => Some(Self::Vars),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Req => "req",
            Self::User => "user",
            Self::ApiEndpoint => "apiEndpoint",
            Self::Vars => "vars",
        }
    }
}

/// State of one request while it runs through a pipeline
#[derive(Debug)]
pub struct RequestContext {
    /// The request as received
    pub request: IncomingRequest,

    /// Trace identifier propagated to logs
    pub trace_id: String,

    /// Rule the request matched
    pub endpoint: Arc<EndpointRule>,

    /// Named parameters and wildcards extracted from the path template
    pub params: HashMap<String, String>,

    /// User attached by an authentication policy
    pub user: Option<AuthContext>,

    /// Variables written by policies and read by expressions
    pub vars: Map<String, Value>,

    pub started_at: Instant,
}

impl RequestContext {
    pub fn new(
        request: IncomingRequest,
        endpoint: Arc<EndpointRule>,
        params: HashMap<String, String>,
    ) -> Self {
        let trace_id = request
            .header("x-request-id")
            .map(str::to_string)
            .unwrap_or_else(|| request.id.clone());

        Self {
            request,
            trace_id,
            endpoint,
            params,
            user: None,
            vars: Map::new(),
            started_at: Instant::now(),
        }
    }

    /// Attach an authenticated user
    pub fn set_user(&mut self, user: AuthContext) {
        self.user = Some(user);
    }

    pub fn is_authenticated(&self) -> bool {
        self.user.is_some()
    }

    pub fn set_var<S: Into<String>>(&mut self, name: S, value: Value) {
        self.vars.insert(name.into(), value);
    }

    pub fn var(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Resolve a field path such as `req.headers.user-agent`; missing fields are `null`
    pub fn lookup(&self, root: ScopeRoot, path: &[String]) -> Value {
        let Some((first, rest)) = path.split_first() else {
            return self.root_value(root);
        };

        match root {
            ScopeRoot::Req => self.request_field(first, rest),
            ScopeRoot::User => match &self.user {
                Some(user) => match first.as_str() {
                    "id" => descend(Value::String(user.user_id.clone()), rest),
                    "authMethod" => descend(Value::String(user.auth_method.clone()), rest),
                    claim => user
                        .claims
                        .get(claim)
                        .map(|value| descend(value.clone(), rest))
                        .unwrap_or(Value::Null),
                },
                None => Value::Null,
            },
            ScopeRoot::ApiEndpoint => match first.as_str() {
                "name" => descend(Value::String(self.endpoint.api_endpoint_name.clone()), rest),
                "scopes" => descend(string_array(&self.endpoint.scopes), rest),
                _ => Value::Null,
            },
            ScopeRoot::Vars => self
                .vars
                .get(first)
                .map(|value| descend(value.clone(), rest))
                .unwrap_or(Value::Null),
        }
    }

    fn request_field(&self, field: &str, rest: &[String]) -> Value {
        let request = &self.request;
        match field {
            "method" => descend(Value::String(request.method.as_str().to_string()), rest),
            "path" => descend(Value::String(request.path().to_string()), rest),
            "url" => descend(Value::String(request.url().to_string()), rest),
            "host" => request
                .host()
                .map(|host| descend(Value::String(host), rest))
                .unwrap_or(Value::Null),
            "ip" => descend(Value::String(request.remote_addr.ip().to_string()), rest),
            "headers" => match rest.split_first() {
                Some((name, tail)) => request
                    .header(&name.to_ascii_lowercase())
                    .map(|value| descend(Value::String(value.to_string()), tail))
                    .unwrap_or(Value::Null),
                None => self.headers_value(),
            },
            "query" => {
                let query = request.query_params();
                match rest.split_first() {
                    Some((name, tail)) => query
                        .get(name.as_str())
                        .map(|value| descend(Value::String(value.clone()), tail))
                        .unwrap_or(Value::Null),
                    None => string_object(&query),
                }
            }
            "params" => match rest.split_first() {
                Some((name, tail)) => self
                    .params
                    .get(name.as_str())
                    .map(|value| descend(Value::String(value.clone()), tail))
                    .unwrap_or(Value::Null),
                None => string_object(&self.params),
            },
            _ => Value::Null,
        }
    }

    fn root_value(&self, root: ScopeRoot) -> Value {
        match root {
            ScopeRoot::Req => {
                let mut req = Map::new();
                for field in ["method", "path", "url", "host", "ip", "headers", "query", "params"] {
                    req.insert(field.to_string(), self.request_field(field, &[]));
                }
                Value::Object(req)
            }
            ScopeRoot::User => match &self.user {
                Some(user) => {
                    let mut map: Map<String, Value> = user
                        .claims
                        .iter()
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect();
                    map.insert("id".to_string(), Value::String(user.user_id.clone()));
                    map.insert("authMethod".to_string(), Value::String(user.auth_method.clone()));
                    Value::Object(map)
                }
                None => Value::Null,
            },
            ScopeRoot::ApiEndpoint => {
                let mut map = Map::new();
                map.insert(
                    "name".to_string(),
                    Value::String(self.endpoint.api_endpoint_name.clone()),
                );
                map.insert("scopes".to_string(), string_array(&self.endpoint.scopes));
                Value::Object(map)
            }
            ScopeRoot::Vars => Value::Object(self.vars.clone()),
        }
    }

    fn headers_value(&self) -> Value {
        let mut map = Map::new();
        for (name, value) in self.request.headers.iter() {
            if let Ok(value) = value.to_str() {
                map.insert(name.as_str().to_string(), Value::String(value.to_string()));
            }
        }
        Value::Object(map)
    }
}

fn descend(value: Value, path: &[String]) -> Value {
    let mut current = value;
    for segment in path {
        current = match current {
            Value::Object(mut map) => map.remove(segment).unwrap_or(Value::Null),
            Value::Array(mut items) => match segment.parse::<usize>() {
                Ok(index) if index < items.len() => items.swap_remove(index),
                _ => Value::Null,
            },
            _ => Value::Null,
        };
    }
    current
}

fn string_array(items: &[String]) -> Value {
    Value::Array(items.iter().cloned().map(Value::String).collect())
}

fn string_object(items: &HashMap<String, String>) -> Value {
    Value::Object(
        items
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::test_support::endpoint_rule;
    use axum::http::{HeaderMap, Method, Version};
    use bytes::Bytes;
    use serde_json::json;

    fn context() -> RequestContext {
        let mut headers = HeaderMap::new();
        headers.insert("host", "api.acme.com:8080".parse().unwrap());
        headers.insert("user-agent", "curl/8.0".parse().unwrap());
        let request = IncomingRequest::new(
            Method::POST,
            "/users/42?verbose=1".parse().unwrap(),
            Version::HTTP_11,
            headers,
            Bytes::new(),
            "10.0.0.7:5555".parse().unwrap(),
        );
        let mut params = HashMap::new();
        params.insert("id".to_string(), "42".to_string());
        RequestContext::new(request, endpoint_rule("users", &["read"]), params)
    }

    fn path(segments: &[&str]) -> Vec<String> {
        segments.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_request_fields() {
        let ctx = context();
        assert_eq!(ctx.lookup(ScopeRoot::Req, &path(&["method"])), json!("POST"));
        assert_eq!(ctx.lookup(ScopeRoot::Req, &path(&["path"])), json!("/users/42"));
        assert_eq!(ctx.lookup(ScopeRoot::Req, &path(&["host"])), json!("api.acme.com"));
        assert_eq!(ctx.lookup(ScopeRoot::Req, &path(&["ip"])), json!("10.0.0.7"));
        assert_eq!(ctx.lookup(ScopeRoot::Req, &path(&["headers", "User-Agent"])), json!("curl/8.0"));
        assert_eq!(ctx.lookup(ScopeRoot::Req, &path(&["query", "verbose"])), json!("1"));
        assert_eq!(ctx.lookup(ScopeRoot::Req, &path(&["params", "id"])), json!("42"));
        assert_eq!(ctx.lookup(ScopeRoot::Req, &path(&["nope"])), Value::Null);
    }

    #[test]
    fn test_user_and_vars() {
        let mut ctx = context();
        assert_eq!(ctx.lookup(ScopeRoot::User, &path(&["id"])), Value::Null);

        let mut user = AuthContext::new("alice", "key-auth");
        user.claims.insert("tier".to_string(), json!({"level": 3}));
        ctx.set_user(user);
        ctx.set_var("attempts", json!([1, 2]));

        assert_eq!(ctx.lookup(ScopeRoot::User, &path(&["id"])), json!("alice"));
        assert_eq!(ctx.lookup(ScopeRoot::User, &path(&["tier", "level"])), json!(3));
        assert_eq!(ctx.lookup(ScopeRoot::Vars, &path(&["attempts", "1"])), json!(2));
        assert_eq!(ctx.lookup(ScopeRoot::Vars, &path(&["missing"])), Value::Null);
    }

    #[test]
    fn test_endpoint_fields() {
        let ctx = context();
        assert_eq!(ctx.lookup(ScopeRoot::ApiEndpoint, &path(&["name"])), json!("users"));
        assert_eq!(ctx.lookup(ScopeRoot::ApiEndpoint, &path(&["scopes"])), json!(["read"]));
        assert_eq!(ctx.lookup(ScopeRoot::ApiEndpoint, &[])["name"], json!("users"));
    }

    #[test]
    fn test_trace_id_prefers_request_header() {
        let ctx = context();
        assert_eq!(ctx.trace_id, ctx.request.id);

        let mut headers = HeaderMap::new();
        headers.insert("x-request-id", "upstream-trace-7".parse().unwrap());
        let request = IncomingRequest::new(
            Method::GET,
            "/users/42".parse().unwrap(),
            Version::HTTP_11,
            headers,
            Bytes::new(),
            "10.0.0.7:5555".parse().unwrap(),
        );
        let ctx = RequestContext::new(request, endpoint_rule("users", &[]), HashMap::new());
        assert_eq!(ctx.trace_id, "upstream-trace-7");
        assert_ne!(ctx.trace_id, ctx.request.id);
    }
}
