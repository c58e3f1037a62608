//! # Condition Engine
//!
//! Conditions guard pipeline steps. Configuration describes them as
//! [`ConditionSpec`] values (`{name, ...params}`); the [`ConditionEngine`] compiles each
//! spec once into a [`Condition`] tree that is evaluated per request without any name
//! lookups.
//!
//! ## Built-in conditions
//! - leaves: `always`, `never`, `pathMatch`, `pathExact`, `method`, `hostMatch`,
//!   `expression`, `authenticated`, `anonymous`, `tlsClientAuthenticated`
//! - composites: `allOf`, `oneOf`, `not`

pub mod builtin;
pub mod engine;
pub mod expression;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

use crate::core::context::RequestContext;
use crate::core::error::GatewayResult;

pub use engine::{ConditionConstructor, ConditionEngine, ConditionSchema, ParamType};
pub use expression::Expression;

/// Declarative condition: a registered name plus its parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionSpec {
    pub name: String,

    #[serde(flatten)]
    pub params: Map<String, Value>,
}

impl ConditionSpec {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            params: Map::new(),
        }
    }

    pub fn with_param<S: Into<String>>(mut self, key: S, value: Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }
}

/// Request predicate produced by a leaf constructor
pub type LeafPredicate = Arc<dyn Fn(&RequestContext) -> GatewayResult<bool> + Send + Sync>;

/// Compiled condition tree
#[derive(Clone)]
pub enum Condition {
    Always,
    Never,
    AllOf(Vec<Condition>),
    OneOf(Vec<Condition>),
    Not(Box<Condition>),
    Leaf { name: String, predicate: LeafPredicate },
}

impl Condition {
    pub fn leaf<S, F>(name: S, predicate: F) -> Self
    where
        S: Into<String>,
        F: Fn(&RequestContext) -> GatewayResult<bool> + Send + Sync + 'static,
    {
        Self::Leaf {
            name: name.into(),
            predicate: Arc::new(predicate),
        }
    }

    /// Evaluate against a request; composites short-circuit
    pub fn evaluate(&self, ctx: &RequestContext) -> GatewayResult<bool> {
        match self {
            Condition::Always => Ok(true),
            Condition::Never => Ok(false),
            Condition::AllOf(conditions) => {
                for condition in conditions {
                    if !condition.evaluate(ctx)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Condition::OneOf(conditions) => {
                for condition in conditions {
                    if condition.evaluate(ctx)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Condition::Not(inner) => Ok(!inner.evaluate(ctx)?),
            Condition::Leaf { predicate, .. } => predicate(ctx),
        }
    }

    pub fn is_always(&self) -> bool {
        matches!(self, Condition::Always)
    }
}

impl fmt::Debug for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::Always => write!(f, "Always"),
            Condition::Never => write!(f, "Never"),
            Condition::AllOf(conditions) => f.debug_tuple("AllOf").field(conditions).finish(),
            Condition::OneOf(conditions) => f.debug_tuple("OneOf").field(conditions).finish(),
            Condition::Not(inner) => f.debug_tuple("Not").field(inner).finish(),
            Condition::Leaf { name, .. } => f.debug_struct("Leaf").field("name", name).finish(),
        }
    }
}
