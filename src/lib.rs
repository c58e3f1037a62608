//! # Policy Gateway
//!
//! A declarative API gateway. Requests are matched to `apiEndpoints` by host, path and
//! method, then run through the pipeline bound to that endpoint: an ordered list of
//! policies, each step guarded by an optional condition.
//!
//! ## Data flow
//! ```text
//! GatewayConfig ─▶ RouteTableBuilder ─▶ DispatchGraph ─▶ Dispatcher ◀── requests
//!                   (PipelineCompiler,                      ▲
//!                    PolicyRegistry,                        │ publish
//!                    ConditionEngine)               HotReloadManager ◀── file changes
//! ```
//!
//! Configuration is compiled eagerly: unknown actions, unknown conditions, bad
//! parameters and invalid patterns are found before a graph is published, never while
//! serving.

/// Error types, configuration, request/response types and the per-request context
pub mod core;

/// Condition registry, built-in conditions and the expression language
pub mod conditions;

/// Policy registry and built-in policies
pub mod policies;

/// Pipeline compilation and execution
pub mod pipeline;

/// Host/path/method matching and the route table
pub mod routing;

/// Dispatcher, hot reload, HTTP server and SNI certificate selection
pub mod gateway;

/// Logging setup and metric names
pub mod observability;

pub use crate::core::config::GatewayConfig;
pub use crate::core::context::RequestContext;
pub use crate::core::error::{GatewayError, GatewayResult};
pub use crate::core::types::{GatewayResponse, IncomingRequest};

pub use conditions::{Condition, ConditionEngine, ConditionSpec};
pub use gateway::{DispatchGraph, DispatchGraphBuilder, Dispatcher, FileConfigSource, GatewayServer, HotReloadManager};
pub use pipeline::{CompiledPipeline, PipelineCompiler};
pub use policies::{PolicyHandler, PolicyOutcome, PolicyRegistry};
pub use routing::{RouteTable, RouteTableBuilder};
