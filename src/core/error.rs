//! # Error Handling Module
//!
//! Every error the gateway produces, built with `thiserror`, and the status code each
//! one maps to when it ends a request.
//!
//! ## Error Taxonomy
//!
//! The gateway distinguishes three families of errors:
//! - **Configuration errors** are found while compiling configuration into a dispatch graph.
//!   They abort startup, and they reject a hot reload while the previous graph keeps serving.
//! - **Route-not-found** is a per-request outcome mapped to `404`. It is an expected result
//!   and is logged at `debug` only.
//! - **Policy execution errors** are raised by a pipeline step while handling one request.
//!   They stop that request's pipeline and nothing else.
//!
//! All fallible gateway operations return [`GatewayResult<T>`] and propagate with `?`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Result alias for compilation, reload and dispatch
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Gateway error; `Display` text is the `message` of the JSON error envelope
#[derive(Debug, Error, Clone)]
pub enum GatewayError {
    /// Invalid or incomplete configuration (missing sections, unknown actions or
    /// conditions, invalid parameters, bad patterns)
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// No host/path/method combination matched the request
    #[error("No route matches {method} {host}{path}")]
    RouteNotFound {
        method: String,
        host: String,
        path: String,
    },

    /// A policy handler failed while processing a request
    #[error("Policy '{policy}' failed: {message}")]
    PolicyExecution { policy: String, message: String },

    /// A condition expression could not be evaluated against a request
    #[error("Expression evaluation failed: {message}")]
    Expression { message: String },

    /// A pipeline ran to completion without any step producing a response
    #[error("Pipeline '{pipeline}' completed without producing a response")]
    NoResponse { pipeline: String },

    /// Authentication failures (missing or unknown credentials)
    #[error("Authentication failed: {reason}")]
    Authentication { reason: String },

    /// A proxied service endpoint could not be reached
    #[error("Upstream unavailable: {service} - {reason}")]
    UpstreamUnavailable { service: String, reason: String },

    /// Upstream did not answer within the proxy timeout
    #[error("Request timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// TLS setup or certificate selection errors
    #[error("TLS error: {message}")]
    Tls { message: String },

    #[error("I/O error: {message}")]
    Io { message: String },

    #[error("Internal server error: {message}")]
    Internal { message: String },
}

impl GatewayError {
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a route-not-found error for the given request coordinates
    pub fn route_not_found<S: Into<String>>(method: S, host: S, path: S) -> Self {
        Self::RouteNotFound {
            method: method.into(),
            host: host.into(),
            path: path.into(),
        }
    }

    /// Create a policy execution error
    pub fn policy<P: Into<String>, M: Into<String>>(policy: P, message: M) -> Self {
        Self::PolicyExecution {
            policy: policy.into(),
            message: message.into(),
        }
    }

    /// Create an expression evaluation error
    pub fn expression<S: Into<String>>(message: S) -> Self {
        Self::Expression {
            message: message.into(),
        }
    }

    pub fn auth<S: Into<String>>(reason: S) -> Self {
        Self::Authentication {
            reason: reason.into(),
        }
    }

    pub fn upstream_unavailable<S: Into<String>>(service: S, reason: S) -> Self {
        Self::UpstreamUnavailable {
            service: service.into(),
            reason: reason.into(),
        }
    }

    pub fn tls<S: Into<String>>(message: S) -> Self {
        Self::Tls {
            message: message.into(),
        }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether this error came from configuration compilation
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration { .. })
    }

    /// Status sent to the client when this error ends a request
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Configuration { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::RouteNotFound { .. } => StatusCode::NOT_FOUND,
            Self::PolicyExecution { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Expression { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::NoResponse { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Authentication { .. } => StatusCode::UNAUTHORIZED,
            Self::UpstreamUnavailable { .. } => StatusCode::BAD_GATEWAY,
            Self::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::Tls { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Io { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// `type` field of the error envelope
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Configuration { .. } => "configuration_error",
            Self::RouteNotFound { .. } => "not_found",
            Self::PolicyExecution { .. } => "policy_execution_error",
            Self::Expression { .. } => "expression_error",
            Self::NoResponse { .. } => "no_response",
            Self::Authentication { .. } => "authentication_error",
            Self::UpstreamUnavailable { .. } => "upstream_unavailable",
            Self::Timeout { .. } => "timeout",
            Self::Tls { .. } => "tls_error",
            Self::Io { .. } => "io_error",
            Self::Internal { .. } => "internal_error",
        }
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
        }
    }
}

/// Regex compilation only happens while building configuration
impl From<regex::Error> for GatewayError {
    fn from(err: regex::Error) -> Self {
        Self::Configuration {
            message: format!("Invalid regular expression: {}", err),
        }
    }
}

/// Converts errors into the JSON error envelope returned to clients
impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        let error_response = json!({
            "error": {
                "code": status.as_u16(),
                "message": self.to_string(),
                "type": self.error_type(),
            }
        });

        (status, Json(error_response)).into_response()
    }
}

/// Shorthand for `GatewayError::config(format!(...))`
///
/// Usage: `config_error!("Unknown action '{}' in pipeline '{}'", action, pipeline)`
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::core::error::GatewayError::config(format!($($arg)*))
    };
}
